//! Cross-component event bus.
//!
//! The settlement engine announces new blocks, new payments and
//! invoice-needs-update signals here; invoice status computation,
//! webhooks and checkout UI consume them. One dispatcher owns a typed
//! broadcast channel whose lifecycle is tied to the process, not a
//! global singleton: everything that wants events holds a clone of the
//! bus and subscribes explicitly.
//!
//! Slow subscribers lag and drop messages rather than blocking the
//! engine; every signal is recoverable from store state.

use tokio::sync::broadcast;

use crate::core_types::{Address, InvoiceId, NetworkId, TxId};
use crate::invoice::Payment;

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A new block was seen on a network.
    NewBlock { network: NetworkId },
    /// A transaction touching a tracked wallet was seen, whether or not
    /// it resolved to an invoice. For UI tickers and logs.
    NewOnChainTransaction { network: NetworkId, txid: TxId },
    /// An invoice's deposit address was rotated after a direct hit.
    InvoiceNewAddress {
        invoice_id: InvoiceId,
        address: Address,
        network: NetworkId,
    },
    /// A new payment was recorded for an invoice.
    ReceivedPayment {
        invoice_id: InvoiceId,
        payment: Payment,
    },
    /// Payment state changed; invoice-level totals need recomputation.
    InvoiceNeedUpdate { invoice_id: InvoiceId },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
