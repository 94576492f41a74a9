//! # solar-attest
//!
//! Deterministic telemetry simulation for grid-connected solar plants and
//! tamper-evident daily digests.
//!
//! The pipeline runs leaves-first:
//!
//! - [`simulation`]: seeded RNG, solar geometry, power conversion, outage and
//!   curtailment policy, canonical row hashing, one-day generation loop
//! - [`digest`]: hourly/daily aggregation, Merkle root, exportable artifacts,
//!   integrity verification
//! - [`anchor`]: HTTP attestation client and the retrying coordinator
//! - [`controller`]: the explicit application context tying the stages to a
//!   [`repo::TelemetryStore`]

pub mod anchor;
pub mod api;
pub mod config;
pub mod controller;
pub mod digest;
pub mod domain;
pub mod error;
pub mod logging;
pub mod repo;
pub mod simulation;
