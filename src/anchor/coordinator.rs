//! # Anchor coordinator
//!
//! Drives one anchoring request through
//! `Pending -> {Success | Retrying -> Pending | Failed}`.
//!
//! Attempts are capped by [`RetryPolicy::max_attempts`]; after failed
//! attempt `n` (when another attempt remains) the coordinator sleeps
//! `base_delay * 2^n`. Cancellation is honored during an in-flight call and
//! during the backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::{AnchorClient, AnchorRequest, AnchorResponse};
use crate::domain::AnchorReceipt;
use crate::error::AnchorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnchorState {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl AnchorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnchorState::Success | AnchorState::Failed)
    }
}

/// Outcome of one attestation attempt, or of a whole retry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorResult {
    pub success: bool,
    pub tx_id: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
}

impl AnchorResult {
    pub fn succeeded(resp: AnchorResponse) -> Self {
        Self {
            success: true,
            tx_id: Some(resp.adapter_tx_id),
            tx_hash: resp.tx_hash,
            block_number: resp.block_number,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_id: None,
            tx_hash: None,
            block_number: None,
            error: Some(error.into()),
        }
    }

    /// Receipt to attach to a digest; `None` unless this was a success.
    pub fn receipt(&self) -> Option<AnchorReceipt> {
        match (self.success, &self.tx_id) {
            (true, Some(tx_id)) => Some(AnchorReceipt {
                tx_id: tx_id.clone(),
                tx_hash: self.tx_hash.clone(),
                block_number: self.block_number,
                anchored_at: Utc::now(),
            }),
            _ => None,
        }
    }
}

/// Final report of [`AnchorCoordinator::anchor_with_retry`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnchorReport {
    pub state: AnchorState,
    pub result: AnchorResult,
    pub attempts: u32,
    /// Backoff delays actually waited, in order.
    #[serde(rename = "delays_secs", serialize_with = "as_secs")]
    pub delays: Vec<Duration>,
}

impl AnchorReport {
    pub fn is_success(&self) -> bool {
        self.state == AnchorState::Success
    }
}

fn as_secs<S: serde::Serializer>(delays: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(delays.iter().map(Duration::as_secs_f64))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `base_delay * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Reachability of the attestation service, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorServiceStatus {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct AnchorCoordinator {
    client: Arc<dyn AnchorClient>,
    policy: RetryPolicy,
    uri_base: Option<String>,
}

impl AnchorCoordinator {
    pub fn new(client: Arc<dyn AnchorClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            uri_base: None,
        }
    }

    /// Public base URL under which exported digests are served; included in
    /// requests as `uri`.
    pub fn with_uri_base(mut self, uri_base: Option<String>) -> Self {
        self.uri_base = uri_base;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn request(&self, site_id: &str, day: NaiveDate, merkle_root: &str) -> AnchorRequest {
        AnchorRequest::new(site_id, day, merkle_root, self.uri_base.as_deref())
    }

    /// Single attempt, no retry.
    pub async fn anchor(&self, site_id: &str, day: NaiveDate, merkle_root: &str) -> AnchorResult {
        let request = self.request(site_id, day, merkle_root);
        match self.client.submit(&request).await {
            Ok(resp) => AnchorResult::succeeded(resp),
            Err(e) => AnchorResult::failed(e.to_string()),
        }
    }

    /// Retrying anchor. Never returns an error: exhaustion and cancellation
    /// both end in [`AnchorState::Failed`] with the reason in the result.
    pub async fn anchor_with_retry(
        &self,
        site_id: &str,
        day: NaiveDate,
        merkle_root: &str,
        cancel: &CancellationToken,
    ) -> AnchorReport {
        let request = self.request(site_id, day, merkle_root);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delays = Vec::new();
        let mut attempts = 0;
        let mut last_error = AnchorError::Cancelled;

        while attempts < max_attempts {
            if cancel.is_cancelled() {
                break;
            }
            attempts += 1;
            info!(site_id, %day, attempt = attempts, state = %AnchorState::Pending, "anchor attempt");

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(AnchorError::Cancelled),
                r = self.client.submit(&request) => r,
            };

            match outcome {
                Ok(resp) => {
                    info!(
                        site_id,
                        %day,
                        attempt = attempts,
                        tx_id = %resp.adapter_tx_id,
                        state = %AnchorState::Success,
                        "digest anchored"
                    );
                    return AnchorReport {
                        state: AnchorState::Success,
                        result: AnchorResult::succeeded(resp),
                        attempts,
                        delays,
                    };
                }
                Err(AnchorError::Cancelled) => {
                    last_error = AnchorError::Cancelled;
                    break;
                }
                Err(e) => {
                    last_error = e;
                }
            }

            if attempts < max_attempts {
                let delay = self.policy.delay_after(attempts);
                warn!(
                    site_id,
                    %day,
                    attempt = attempts,
                    delay_s = delay.as_secs_f64(),
                    error = %last_error,
                    state = %AnchorState::Retrying,
                    "anchor attempt failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        last_error = AnchorError::Cancelled;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delays.push(delay);
            }
        }

        let message = match last_error {
            AnchorError::Cancelled => format!("anchoring cancelled after {attempts} attempt(s)"),
            e => format!("anchoring failed after {attempts} attempt(s): {e}"),
        };
        warn!(site_id, %day, attempts, state = %AnchorState::Failed, error = %message, "anchoring gave up");
        AnchorReport {
            state: AnchorState::Failed,
            result: AnchorResult::failed(message),
            attempts,
            delays,
        }
    }

    /// Health probe of the attestation service.
    pub async fn status(&self) -> AnchorServiceStatus {
        match self.client.health().await {
            Ok(()) => AnchorServiceStatus {
                reachable: true,
                error: None,
            },
            Err(e) => AnchorServiceStatus {
                reachable: false,
                error: Some(e.to_string()),
            },
        }
    }
}
