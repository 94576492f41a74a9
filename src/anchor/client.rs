use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use ring::hmac;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AnchorError;

pub const API_KEY_HEADER: &str = "x-app-key";
pub const SIGNATURE_HEADER: &str = "x-app-sig";

/// Body of `POST /v1/anchor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRequest {
    pub topic: String,
    /// `0x`-prefixed Merkle root.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl AnchorRequest {
    pub fn new(site_id: &str, day: NaiveDate, merkle_root: &str, uri_base: Option<&str>) -> Self {
        let hash = if merkle_root.starts_with("0x") {
            merkle_root.to_string()
        } else {
            format!("0x{merkle_root}")
        };
        Self {
            topic: topic_for(site_id, day),
            hash,
            uri: uri_base.map(|base| {
                format!(
                    "{}/api/v1/sites/{site_id}/days/{day}/digest",
                    base.trim_end_matches('/')
                )
            }),
        }
    }
}

/// `IOT:{site_id}:{day}`.
pub fn topic_for(site_id: &str, day: NaiveDate) -> String {
    format!("IOT:{site_id}:{day}")
}

/// Success body of `POST /v1/anchor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorResponse {
    pub adapter_tx_id: String,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
}

/// Lowercase hex HMAC-SHA256 of `body`.
pub fn sign_body(shared_secret: &[u8], body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, shared_secret);
    hex::encode(hmac::sign(&key, body).as_ref())
}

/// External attestation service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnchorClient: Send + Sync {
    /// One attestation call. No retries at this level.
    async fn submit(&self, request: &AnchorRequest) -> Result<AnchorResponse, AnchorError>;

    /// `Ok` when the service answers its health probe with 2xx.
    async fn health(&self) -> Result<(), AnchorError>;
}

/// reqwest adapter for the attestation HTTP API.
#[derive(Clone)]
pub struct HttpAnchorClient {
    base_url: String,
    api_key: Option<String>,
    shared_secret: Option<String>,
    client: reqwest::Client,
}

impl HttpAnchorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("solar-attest/", env!("CARGO_PKG_VERSION"))),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            shared_secret: None,
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_shared_secret(mut self, shared_secret: Option<String>) -> Self {
        self.shared_secret = shared_secret;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Best-effort error text from a non-2xx body: `error` or `message` if the
/// body is JSON, otherwise the raw text.
fn error_message(body: &str, status: reqwest::StatusCode) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<String>,
        message: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(msg), ..
        })
        | Ok(ErrorBody {
            message: Some(msg), ..
        }) => msg,
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}

#[async_trait]
impl AnchorClient for HttpAnchorClient {
    async fn submit(&self, request: &AnchorRequest) -> Result<AnchorResponse, AnchorError> {
        let body = serde_json::to_vec(request).map_err(|e| AnchorError::Decode(e.to_string()))?;

        let mut builder = self
            .client
            .post(format!("{}/v1/anchor", self.base_url))
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        if let Some(secret) = &self.shared_secret {
            builder = builder.header(SIGNATURE_HEADER, sign_body(secret.as_bytes(), &body));
        }

        debug!(topic = %request.topic, hash = %request.hash, "submitting anchor request");
        let resp = builder
            .body(body)
            .send()
            .await
            .map_err(|e| AnchorError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AnchorError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(AnchorError::Rejected {
                status: status.as_u16(),
                message: error_message(&text, status),
            });
        }

        serde_json::from_str(&text).map_err(|e| AnchorError::Decode(e.to_string()))
    }

    async fn health(&self) -> Result<(), AnchorError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| AnchorError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(AnchorError::Rejected {
                status: status.as_u16(),
                message: error_message(&text, status),
            })
        }
    }
}
