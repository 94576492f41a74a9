use chrono::NaiveDate;
use thiserror::Error;

/// Malformed configuration, surfaced before any simulation runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid site '{site_id}': {errors}")]
    InvalidSite {
        site_id: String,
        errors: validator::ValidationErrors,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Digest construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("no telemetry for site '{site_id}' on {day}")]
    DataAbsent { site_id: String, day: NaiveDate },
    #[error("cannot build a Merkle root from zero hashes")]
    EmptyLeafSet,
    #[error("digest for site '{site_id}' on {day} is already anchored")]
    AlreadyAnchored { site_id: String, day: NaiveDate },
}

impl DigestError {
    /// True for the "nothing to digest" family of errors.
    pub fn is_data_absent(&self) -> bool {
        matches!(self, DigestError::DataAbsent { .. } | DigestError::EmptyLeafSet)
    }
}

/// Failures of a single attestation call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnchorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("attestation service returned {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected attestation response: {0}")]
    Decode(String),
    #[error("anchoring cancelled")]
    Cancelled,
}

/// Errors from the pipeline operations in [`crate::controller`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown site '{0}'")]
    UnknownSite(String),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error("stored digest root {stored} differs from recomputed root {computed}")]
    IntegrityMismatch { stored: String, computed: String },
    #[error("anchoring is not configured")]
    AnchorUnavailable,
    #[error("invalid day range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
    #[error("operation cancelled")]
    Cancelled,
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("export failed: {0}")]
    Export(#[from] std::io::Error),
    #[error("task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn is_data_absent(&self) -> bool {
        matches!(self, PipelineError::Digest(e) if e.is_data_absent())
    }
}
