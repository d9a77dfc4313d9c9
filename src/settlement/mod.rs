//! Settlement engine: on-chain payment detection and accounting.
//!
//! One asynchronous session per network consumes the ledger's live event
//! stream and turns it into invoice state changes. A periodic sweep
//! backs the live path: it re-establishes dead sessions and re-derives
//! confirmation counts for everything still pending, so a missed event
//! is never a lost payment, only a delayed one.
//!
//! Consistency story: there is no transaction spanning the ledger, the
//! wallet view and the invoice store. Instead every effectful step is
//! idempotent (payments dedupe on outpoint, confirmation counts are
//! recomputed rather than accumulated) and reconciliation runs liberally
//! (per block, per poll tick, on reconnect).

pub mod engine;
pub mod error;
pub mod poll;
pub mod receive;
pub mod reconcile;
pub mod session;

pub use engine::{NetworkStatus, SettlementEngine, ShutdownSignal};
pub use error::EngineError;
pub use session::{SessionRegistry, SessionState};

use std::sync::Arc;

use crate::core_types::NetworkId;
use crate::events::EventBus;
use crate::invoice::InvoiceStore;
use crate::ledger::LedgerClient;
use crate::payjoin::PayjoinLockTable;
use crate::wallet::WalletView;

/// Everything one network's settlement logic needs, bundled.
pub struct NetworkContext {
    pub network: NetworkId,
    pub client: Arc<dyn LedgerClient>,
    pub wallet: WalletView,
    pub store: Arc<dyn InvoiceStore>,
    pub locks: Arc<dyn PayjoinLockTable>,
    pub bus: EventBus,
    /// Confirmation count past which payments stop being re-checked.
    pub max_tracked_confirmations: i32,
}

impl NetworkContext {
    pub fn new(
        network: NetworkId,
        client: Arc<dyn LedgerClient>,
        wallet: WalletView,
        store: Arc<dyn InvoiceStore>,
        locks: Arc<dyn PayjoinLockTable>,
        bus: EventBus,
        max_tracked_confirmations: i32,
    ) -> Self {
        Self {
            network,
            client,
            wallet,
            store,
            locks,
            bus,
            max_tracked_confirmations,
        }
    }
}
