//! Tamper-evident custody trail.

pub mod chain;
pub mod ledger;
pub mod metrics;
pub mod record;

use thiserror::Error;

use crate::ports::PortError;

pub use chain::{
    build_signed_entry, canonical_json, sha256_hex, verify_signed_entry, CustodySignedEntry,
    SigningKey, GENESIS, SIGNING_KEY_SECRET,
};
pub use ledger::{
    AppendReceipt, ChainVerification, CustodyLedger, IntegrityFailure, DEFAULT_LEDGER_FILE,
};
pub use metrics::{derive_stats, GovernanceStats, HeatmapRow, DEFAULT_HISTORY_WINDOW};
pub use record::{
    ApplyResultRecord, GitProvenanceRecord, LedgerEvent, LedgerRecord, PolicyVerdictRecord,
    RollbackResultRecord, ValidateResultRecord,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage: {0}")]
    Port(#[from] PortError),

    #[error("ledger record encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("signing key: {0}")]
    Key(String),
}
