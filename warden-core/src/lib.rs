//! # Warden Core Library
//!
//! Governance layer for automated security remediation: policy evaluation,
//! approval workflow, idempotent and circuit-broken execution, bounded
//! request intake and a signed, hash-linked audit chain.

pub mod audit;
pub mod error;
pub mod execution;
pub mod models;
pub mod policy;
pub mod queue;
pub mod server;
pub mod services;
pub mod workflow;

pub use error::{RemediationError, RemediationResult};
