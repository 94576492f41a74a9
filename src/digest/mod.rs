//! # Digest Module
//!
//! Hourly/daily aggregation, Merkle roots over row hashes, exportable
//! artifacts and integrity verification.

pub mod aggregation;
pub mod artifact;
pub mod merkle;
pub mod verify;

pub use aggregation::{hour_start, AggregationEngine, DailyTotals};
pub use artifact::{
    parse_csv, records_to_csv, CsvRow, DigestArtifact, ARTIFACT_VERSION, CSV_HEADER, HASH_ALGO,
};
pub use merkle::{merkle_root, MerkleDigestBuilder};
pub use verify::{verify_export, verify_records, VerificationReport};
