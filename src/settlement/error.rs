use thiserror::Error;

use crate::invoice::StoreError;
use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
