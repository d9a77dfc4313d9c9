//! Scriptable ledger client for tests.
//!
//! Events are pushed by the test, transaction records and broadcast
//! outcomes are preset, and every broadcast call is logged so tests can
//! assert on the test-accept flag.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::{
    BroadcastOutcome, EventStream, LedgerClient, LedgerError, LedgerEvent, ReservedAddress,
    TransactionRecord, UnspentCoin,
};
use crate::core_types::{Address, NetworkId, TxId};

pub struct MockLedgerClient {
    network: NetworkId,
    subscribers: Mutex<Vec<mpsc::Sender<LedgerEvent>>>,
    transactions: DashMap<TxId, TransactionRecord>,
    broadcast_outcomes: DashMap<String, BroadcastOutcome>,
    broadcast_log: Mutex<Vec<(String, bool)>>,
    unspent: Mutex<Vec<UnspentCoin>>,
    fail_subscribe: AtomicBool,
    synced: AtomicBool,
    reserved: AtomicU64,
}

impl MockLedgerClient {
    pub fn new(network: NetworkId) -> Self {
        Self {
            network,
            subscribers: Mutex::new(Vec::new()),
            transactions: DashMap::new(),
            broadcast_outcomes: DashMap::new(),
            broadcast_log: Mutex::new(Vec::new()),
            unspent: Mutex::new(Vec::new()),
            fail_subscribe: AtomicBool::new(false),
            synced: AtomicBool::new(true),
            reserved: AtomicU64::new(0),
        }
    }

    /// Deliver an event to every live subscription.
    pub async fn push_event(&self, event: LedgerEvent) {
        let senders: Vec<_> = self.subscribers.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn set_transaction(&self, record: TransactionRecord) {
        self.transactions.insert(record.txid.clone(), record);
    }

    pub fn remove_transaction(&self, txid: &TxId) {
        self.transactions.remove(txid);
    }

    /// Preset the outcome of broadcasting a given raw transaction.
    /// Unconfigured raws are accepted.
    pub fn set_broadcast_outcome(&self, raw: impl Into<String>, outcome: BroadcastOutcome) {
        self.broadcast_outcomes.insert(raw.into(), outcome);
    }

    /// Every `(raw, test_accept_only)` pair this client was asked to send.
    pub fn broadcast_calls(&self) -> Vec<(String, bool)> {
        self.broadcast_log.lock().unwrap().clone()
    }

    pub fn set_unspent(&self, coins: Vec<UnspentCoin>) {
        *self.unspent.lock().unwrap() = coins;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    fn network(&self) -> &NetworkId {
        &self.network
    }

    async fn is_synced(&self) -> Result<bool, LedgerError> {
        Ok(self.synced.load(Ordering::SeqCst))
    }

    async fn subscribe_events(&self) -> Result<EventStream, LedgerError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(LedgerError::Subscription("mock refuses".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn get_transaction(
        &self,
        txid: &TxId,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        Ok(self.transactions.get(txid).map(|e| e.value().clone()))
    }

    async fn broadcast(
        &self,
        raw: &str,
        test_accept_only: bool,
    ) -> Result<BroadcastOutcome, LedgerError> {
        self.broadcast_log
            .lock()
            .unwrap()
            .push((raw.to_string(), test_accept_only));
        Ok(self
            .broadcast_outcomes
            .get(raw)
            .map(|e| e.value().clone())
            .unwrap_or(BroadcastOutcome::Accepted))
    }

    async fn get_unspent_coins(&self) -> Result<Vec<UnspentCoin>, LedgerError> {
        Ok(self.unspent.lock().unwrap().clone())
    }

    async fn reserve_new_address(&self) -> Result<ReservedAddress, LedgerError> {
        let n = self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(ReservedAddress {
            address: Address::new(format!("mockaddr{}", n)),
            script_pubkey: format!("76a914{:040x}88ac", n),
        })
    }
}
