//! chainpay: on-chain payment detection and settlement for a
//! self-hosted payment gateway.
//!
//! The crate watches one indexing node per configured network, matches
//! incoming transaction outputs to invoices by script hash, records
//! payments idempotently by outpoint, tracks confirmations, detects
//! replacements and double spends, and resolves payjoin input
//! reservations. A periodic sweep backs the live event path so a dropped
//! connection delays settlement instead of losing it.

pub mod config;
pub mod core_types;
pub mod events;
pub mod invoice;
pub mod ledger;
pub mod logging;
pub mod payjoin;
pub mod settlement;
pub mod wallet;

pub use config::{AppConfig, NetworkConfig};
pub use core_types::{Address, InvoiceId, NetworkId, OutPoint, ScriptHash, TxId};
pub use events::{EventBus, GatewayEvent};
pub use invoice::{
    Invoice, InvoiceStatus, InvoiceStore, MemoryInvoiceStore, Payment, PaymentKind, PaymentPrompt,
    PgInvoiceStore, SpeedPolicy,
};
pub use ledger::{LedgerClient, LedgerEvent, MockLedgerClient, RemoteLedgerClient};
pub use payjoin::{MemoryLockTable, PayjoinLockTable};
pub use settlement::{EngineError, NetworkContext, SettlementEngine, ShutdownSignal};
pub use wallet::WalletView;
