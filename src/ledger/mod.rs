//! Ledger client: the gateway's view of one network's indexing node.
//!
//! Each supported network gets one client, already scoped to the wallet's
//! derivation scheme on the node side. The client exposes:
//! - a live event subscription (new blocks, new wallet transactions),
//! - transaction lookup by id,
//! - broadcast / test-mempool-accept,
//! - unspent coin queries and fresh address reservation.
//!
//! [`RemoteLedgerClient`] speaks websocket + JSON-RPC to a real node;
//! [`MockLedgerClient`] scripts all of the above for tests.

pub mod error;
pub mod mock;
pub mod remote;

pub use error::LedgerError;
pub use mock::MockLedgerClient;
pub use remote::RemoteLedgerClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::core_types::{Address, NetworkId, OutPoint, TxId};

/// Live events pushed by the indexing node.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    NewBlock { height: u64, hash: String },
    NewTransaction(TransactionNotice),
}

/// A transaction touching the tracked wallet.
#[derive(Debug, Clone)]
pub struct TransactionNotice {
    pub txid: TxId,
    /// Replace-by-fee flag.
    pub rbf: bool,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub vout: u32,
    pub value: Decimal,
    /// scriptPubKey, hex.
    pub script_pubkey: String,
    /// Decoded address when the node could decode one.
    pub address: Option<Address>,
}

/// Current view of one transaction.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub txid: TxId,
    /// -1 conflicted / not in any chain, 0 in mempool, >= 1 confirmed.
    pub confirmations: i32,
    /// Raw transaction hex, kept for rebroadcast.
    pub raw: String,
    pub rbf: bool,
}

/// Result of a broadcast or test-mempool-accept call that reached the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted,
    AlreadyInChain,
    /// Inputs already spent: replaced or double-spent.
    TransactionError,
    /// Rejected outright, e.g. a replacement with insufficient fee.
    TransactionRejected,
    /// Anything else the node said; not evidence of a conflict.
    Other(String),
}

/// One spendable output of the tracked wallet.
#[derive(Debug, Clone)]
pub struct UnspentCoin {
    pub outpoint: OutPoint,
    pub value: Decimal,
    pub script_pubkey: String,
    pub address: Address,
    pub key_path: String,
}

/// A freshly reserved receive address.
#[derive(Debug, Clone)]
pub struct ReservedAddress {
    pub address: Address,
    pub script_pubkey: String,
}

/// The subscription's event stream. The stream ending means the
/// connection is gone; the poll timer re-establishes the session.
pub type EventStream = mpsc::Receiver<LedgerEvent>;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn network(&self) -> &NetworkId;

    /// Whether the node considers itself caught up with its chain.
    /// An unsynced node reports stale confirmation counts, so sessions
    /// hold off until it catches up.
    async fn is_synced(&self) -> Result<bool, LedgerError>;

    /// Open a live event subscription covering new blocks and all
    /// transactions of the tracked derivation scheme.
    async fn subscribe_events(&self) -> Result<EventStream, LedgerError>;

    async fn get_transaction(&self, txid: &TxId)
    -> Result<Option<TransactionRecord>, LedgerError>;

    /// Broadcast a raw transaction, or only test mempool acceptance.
    async fn broadcast(
        &self,
        raw: &str,
        test_accept_only: bool,
    ) -> Result<BroadcastOutcome, LedgerError>;

    async fn get_unspent_coins(&self) -> Result<Vec<UnspentCoin>, LedgerError>;

    async fn reserve_new_address(&self) -> Result<ReservedAddress, LedgerError>;
}
