//! # Anchor Module
//!
//! Submission of daily Merkle roots to the external attestation service.
//!
//! - [`client`]: the [`AnchorClient`] seam and its reqwest implementation,
//!   with API-key and HMAC-SHA256 request signing
//! - [`coordinator`]: retry with exponential backoff and cancellation

pub mod client;
pub mod coordinator;

pub use client::{
    sign_body, topic_for, AnchorClient, AnchorRequest, AnchorResponse, HttpAnchorClient,
    API_KEY_HEADER, SIGNATURE_HEADER,
};
pub use coordinator::{
    AnchorCoordinator, AnchorReport, AnchorResult, AnchorServiceStatus, AnchorState, RetryPolicy,
};
