//! End-to-end runs of the digest pipeline over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use solar_attest::anchor::{AnchorCoordinator, HttpAnchorClient, RetryPolicy};
use solar_attest::config::Config;
use solar_attest::controller::AppState;
use solar_attest::digest::{parse_csv, verify_export, DigestArtifact};
use solar_attest::error::{DigestError, PipelineError};
use solar_attest::repo::{MemoryStore, TelemetryStore};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(export_dir: &std::path::Path) -> Config {
    let toml = format!(
        r#"
        [server]
        host = "127.0.0.1"
        port = 0

        [simulation]
        seed = 42
        interval_minutes = 15

        [export]
        dir = '{}'

        [[sites]]
        id = "site-alpha"
        latitude = 45.07
        longitude = 7.69
        capacity_dc_kw = 1200.0
        capacity_ac_kw = 1000.0
        tilt_deg = 30.0
        azimuth_deg = 180.0
        module_count = 3000
        inverter_efficiency = 0.97
        emission_factor_kg_per_kwh = 0.4
        curtailment_probability = 0.05

        [[sites]]
        id = "site-beta"
        latitude = 37.39
        longitude = -5.98
        capacity_dc_kw = 500.0
        capacity_ac_kw = 400.0
        tilt_deg = 20.0
        azimuth_deg = 170.0
        module_count = 1250
        inverter_efficiency = 0.96
        emission_factor_kg_per_kwh = 0.2
        "#,
        export_dir.display()
    );
    Config::from_toml_str(&toml).unwrap()
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 21).unwrap()
}

fn fast_coordinator(server: &MockServer) -> AnchorCoordinator {
    let client = HttpAnchorClient::new(server.uri(), Duration::from_secs(2)).unwrap();
    AnchorCoordinator::new(
        Arc::new(client),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
        },
    )
}

#[tokio::test]
async fn test_process_day_is_reproducible_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let first = AppState::from_parts(config(dir.path()), Arc::new(MemoryStore::new()), None);
    let second = AppState::from_parts(config(dir.path()), Arc::new(MemoryStore::new()), None);

    let a = first.pipeline.process_day("site-alpha", day(), false, &cancel).await.unwrap();
    let b = second.pipeline.process_day("site-alpha", day(), false, &cancel).await.unwrap();

    assert_eq!(a.rows, 96);
    assert_eq!(a.merkle_root, b.merkle_root);
    assert_eq!(a.energy_kwh, b.energy_kwh);
    assert!(a.energy_kwh > 0.0);
    assert!(a.anchor.is_none());

    // Regenerating over existing rows is an idempotent upsert.
    let again = first.pipeline.process_day("site-alpha", day(), false, &cancel).await.unwrap();
    assert_eq!(again.merkle_root, a.merkle_root);
    assert_eq!(first.pipeline.hourly("site-alpha", day()).await.unwrap().len(), 24);
}

#[tokio::test]
async fn test_tampered_row_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::from_parts(config(dir.path()), store.clone(), None);
    let cancel = CancellationToken::new();

    state.pipeline.process_day("site-alpha", day(), false, &cancel).await.unwrap();
    assert!(state.pipeline.verify_day("site-alpha", day()).await.unwrap().is_valid());

    let noon = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
    assert!(store.tamper("site-alpha", noon, |r| r.ac_energy_kwh += 1.0));

    let report = state.pipeline.verify_day("site-alpha", day()).await.unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.tampered_rows, vec![noon]);
    // The stored hashes themselves are untouched.
    assert!(report.root_matches);
}

#[tokio::test]
async fn test_exported_files_verify_offline() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::from_parts(config(dir.path()), Arc::new(MemoryStore::new()), None);

    let outcome = state
        .pipeline
        .process_day("site-beta", day(), false, &CancellationToken::new())
        .await
        .unwrap();
    let paths = outcome.export.unwrap();

    let artifact: DigestArtifact =
        serde_json::from_str(&std::fs::read_to_string(&paths.json).unwrap()).unwrap();
    assert_eq!(artifact.merkle_root, format!("0x{}", outcome.merkle_root));
    assert_eq!(artifact.interval, "15m");
    assert_eq!(artifact.hash_algo, "sha256");

    let csv = std::fs::read_to_string(&paths.csv).unwrap();
    let rows = parse_csv(&csv).unwrap();
    assert_eq!(rows.len(), 96);
    assert!(verify_export(&artifact, &rows).unwrap().is_valid());

    let mut edited = rows.clone();
    edited[60].ac_power_kw += 10.0;
    let report = verify_export(&artifact, &edited).unwrap();
    assert_eq!(report.tampered_rows, vec![edited[60].timestamp_utc]);
}

#[tokio::test]
async fn test_run_day_anchors_every_site() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/anchor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "adapterTxId": "tx-9" })))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::from_parts(
        config(dir.path()),
        store.clone(),
        Some(fast_coordinator(&server)),
    );

    let report = state
        .pipeline
        .run_day(day(), true, &CancellationToken::new())
        .await;
    assert!(report.is_clean());
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.succeeded[0].site_id, "site-alpha");
    assert!(report
        .succeeded
        .iter()
        .all(|o| o.anchor.as_ref().is_some_and(|a| a.is_success())));

    let digest = store.digest("site-beta", day()).await.unwrap().unwrap();
    assert_eq!(digest.anchor.unwrap().tx_id, "tx-9");
    assert!(store.unanchored_digests(10).await.unwrap().is_empty());

    // A second anchor of the same day is refused.
    let err = state
        .pipeline
        .anchor_day("site-beta", day(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Digest(DigestError::AlreadyAnchored { .. })
    ));
}

#[tokio::test]
async fn test_failed_anchor_is_retried_by_anchor_pending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/anchor"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/anchor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "adapterTxId": "late" })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::from_parts(
        config(dir.path()),
        store.clone(),
        Some(fast_coordinator(&server)),
    );
    let cancel = CancellationToken::new();

    let outcome = state
        .pipeline
        .process_day("site-alpha", day(), true, &cancel)
        .await
        .unwrap();
    assert!(!outcome.anchor.unwrap().is_success());
    assert_eq!(store.unanchored_digests(10).await.unwrap().len(), 1);

    let pending = state.pipeline.anchor_pending(10, &cancel).await.unwrap();
    assert_eq!(pending.reports.len(), 1);
    assert!(pending.reports[0].is_success());
    assert!(pending.failed.is_empty());
    assert!(store.unanchored_digests(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backfill_range() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::from_parts(config(dir.path()), Arc::new(MemoryStore::new()), None);
    let cancel = CancellationToken::new();
    let from = NaiveDate::from_ymd_opt(2024, 6, 19).unwrap();

    let outcomes = state
        .pipeline
        .backfill("site-beta", from, day(), &cancel)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].day, from);
    assert_ne!(outcomes[0].merkle_root, outcomes[1].merkle_root);

    assert!(matches!(
        state.pipeline.backfill("site-beta", day(), from, &cancel).await,
        Err(PipelineError::InvalidRange { .. })
    ));
    assert!(matches!(
        state.pipeline.backfill("nowhere", from, day(), &cancel).await,
        Err(PipelineError::UnknownSite(_))
    ));
}
