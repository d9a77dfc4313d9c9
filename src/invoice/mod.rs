//! Invoices and their payments.
//!
//! The settlement engine does not own invoice creation; it only appends
//! payments, updates their state, and rotates deposit addresses. The
//! [`InvoiceStore`] trait is the seam to whatever owns the rest of the
//! invoice lifecycle. Two implementations ship here: a PostgreSQL store
//! and an in-memory store for dev/test.

pub mod memory;
pub mod pg;

pub use memory::MemoryInvoiceStore;
pub use pg::PgInvoiceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::core_types::{Address, InvoiceId, NetworkId, OutPoint, ScriptHash, TxId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invoice not found: {0}")]
    NotFound(InvoiceId),

    #[error("Corrupt record: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    New,
    Processing,
    Settled,
    Expired,
    Invalid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::New => "New",
            InvoiceStatus::Processing => "Processing",
            InvoiceStatus::Settled => "Settled",
            InvoiceStatus::Expired => "Expired",
            InvoiceStatus::Invalid => "Invalid",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "New" => Ok(InvoiceStatus::New),
            "Processing" => Ok(InvoiceStatus::Processing),
            "Settled" => Ok(InvoiceStatus::Settled),
            "Expired" => Ok(InvoiceStatus::Expired),
            "Invalid" => Ok(InvoiceStatus::Invalid),
            other => Err(StoreError::Decode(format!("invoice status: {}", other))),
        }
    }
}

/// How many confirmations a payment needs before it counts as confirmed
/// for this invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedPolicy {
    /// Zero-conf for non-replaceable transactions.
    HighSpeed,
    /// One confirmation.
    MediumSpeed,
    /// Six confirmations.
    LowSpeed,
}

impl SpeedPolicy {
    pub fn required_confirmations(&self) -> i32 {
        match self {
            SpeedPolicy::HighSpeed => 0,
            SpeedPolicy::MediumSpeed => 1,
            SpeedPolicy::LowSpeed => 6,
        }
    }

    /// Whether a payment counts as confirmed under this policy.
    ///
    /// HighSpeed accepts a mempool transaction, but never a replaceable
    /// one: an RBF-flagged payment must see a block first.
    pub fn is_payment_confirmed(&self, payment: &Payment) -> bool {
        if !payment.accounted {
            return false;
        }
        match self {
            SpeedPolicy::HighSpeed => {
                payment.confirmations >= 1 || (payment.confirmations >= 0 && !payment.rbf)
            }
            _ => payment.confirmations >= self.required_confirmations(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedPolicy::HighSpeed => "HighSpeed",
            SpeedPolicy::MediumSpeed => "MediumSpeed",
            SpeedPolicy::LowSpeed => "LowSpeed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "HighSpeed" => Ok(SpeedPolicy::HighSpeed),
            "MediumSpeed" => Ok(SpeedPolicy::MediumSpeed),
            "LowSpeed" => Ok(SpeedPolicy::LowSpeed),
            other => Err(StoreError::Decode(format!("speed policy: {}", other))),
        }
    }
}

/// What kind of payment this outpoint represents.
///
/// Payjoin variants carry the id of their counterpart transaction and the
/// receiver-owned outpoints reserved for the cooperative spend; plain
/// payments carry nothing extra.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Plain,
    /// The payer's fallback transaction of a payjoin exchange.
    PayjoinOriginal {
        /// Txid of the cooperative proposal, once one exists.
        coinjoin_txid: Option<TxId>,
        /// Receiver inputs reserved for the cooperative transaction.
        contributed: Vec<OutPoint>,
    },
    /// The cooperative transaction of a payjoin exchange.
    PayjoinCoinjoin {
        /// Txid of the payer's fallback transaction.
        original_txid: TxId,
        /// Receiver inputs contributed to this transaction.
        contributed: Vec<OutPoint>,
    },
}

/// One matched blockchain output credited to an invoice.
///
/// Never deleted: a replaced or double-spent payment is kept with
/// `accounted = false` so history survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub outpoint: OutPoint,
    pub network: NetworkId,
    pub value: Decimal,
    /// -1 conflicted / not in any chain, 0 in mempool, >= 1 confirmed.
    pub confirmations: i32,
    /// Whether this payment currently counts toward the invoice's paid
    /// total. Flips to false when a replacement is detected.
    pub accounted: bool,
    /// Replace-by-fee flag of the paying transaction.
    pub rbf: bool,
    /// Script hash of the output that received the funds.
    pub destination: ScriptHash,
    pub kind: PaymentKind,
    pub received_at: DateTime<Utc>,
}

/// The invoice's currently active payment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPrompt {
    pub address: Address,
    pub script: ScriptHash,
    pub network: NetworkId,
    /// Amount this prompt asks for. The deposit address rotates once
    /// accounted payments cover it; a partial payment keeps the prompt.
    pub due: Decimal,
}

impl PaymentPrompt {
    /// What is still owed under this prompt, floored at zero.
    pub fn remaining_due(&self, accounted_total: Decimal) -> Decimal {
        (self.due - accounted_total).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub status: InvoiceStatus,
    pub speed_policy: SpeedPolicy,
    /// Every script this invoice has ever handed out. Old addresses stay
    /// tracked after rotation so late payments to them still match.
    pub tracked_scripts: HashSet<ScriptHash>,
    pub prompt: PaymentPrompt,
    pub payments: Vec<Payment>,
}

impl Invoice {
    pub fn new(id: InvoiceId, speed_policy: SpeedPolicy, prompt: PaymentPrompt) -> Self {
        let mut tracked_scripts = HashSet::new();
        tracked_scripts.insert(prompt.script.clone());
        Self {
            id,
            status: InvoiceStatus::New,
            speed_policy,
            tracked_scripts,
            prompt,
            payments: Vec::new(),
        }
    }

    pub fn payment(&self, outpoint: &OutPoint) -> Option<&Payment> {
        self.payments.iter().find(|p| &p.outpoint == outpoint)
    }

    pub fn recorded_outpoints(&self) -> HashSet<OutPoint> {
        self.payments.iter().map(|p| p.outpoint.clone()).collect()
    }

    /// Sum of payments currently counting toward the paid total.
    pub fn accounted_total(&self) -> Decimal {
        self.payments
            .iter()
            .filter(|p| p.accounted)
            .map(|p| p.value)
            .sum()
    }
}

/// Durable store of invoices, scoped to what the settlement engine needs.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError>;

    /// Resolve the invoice tracking a script hash, if any.
    async fn find_by_script(&self, script: &ScriptHash) -> Result<Option<Invoice>, StoreError>;

    /// Invoices on this network still awaiting payment or confirmation.
    async fn pending_invoices(&self, network: &NetworkId) -> Result<Vec<Invoice>, StoreError>;

    /// Append a payment if its outpoint is not already recorded.
    ///
    /// Returns whether the payment was newly inserted. The outpoint key
    /// is the sole deduplication criterion; this call is the at-most-once
    /// recording boundary.
    async fn append_payment(&self, id: &InvoiceId, payment: &Payment) -> Result<bool, StoreError>;

    /// Persist a batch of mutated payments, matched by outpoint.
    async fn update_payments(&self, id: &InvoiceId, payments: &[Payment])
    -> Result<(), StoreError>;

    /// Add or remove the invoice from the pending set.
    async fn set_pending(&self, id: &InvoiceId, pending: bool) -> Result<(), StoreError>;

    /// Rotate the active payment prompt to a fresh address. The previous
    /// script stays tracked.
    async fn rotate_prompt(
        &self,
        id: &InvoiceId,
        address: &Address,
        script: &ScriptHash,
    ) -> Result<(), StoreError>;
}
