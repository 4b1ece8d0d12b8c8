//! Tamper-evident audit log

pub mod chain;
pub mod signer;

pub use chain::{
    ensure_extends, hash_entry, hash_payload, verify_chain, write_jsonl, AuditChain, AuditSink,
    ChainVerification, MemoryAuditSink, SequenceConflict,
};
pub use signer::{AuditSigner, AuditVerifier};
