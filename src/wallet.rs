//! Per-network read model over the ledger.
//!
//! Caches the wallet's unspent coin set between events; any new activity
//! (new transaction, new block) invalidates it. Transaction lookups are
//! not cached: their confirmation counts move under us every block.

use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::core_types::{NetworkId, TxId};
use crate::ledger::{LedgerClient, LedgerError, TransactionRecord, UnspentCoin};

pub struct WalletView {
    network: NetworkId,
    client: Arc<dyn LedgerClient>,
    unspent: Mutex<Option<Arc<Vec<UnspentCoin>>>>,
}

impl WalletView {
    pub fn new(network: NetworkId, client: Arc<dyn LedgerClient>) -> Self {
        Self {
            network,
            client,
            unspent: Mutex::new(None),
        }
    }

    /// Drop the cached coin view. Called on any new wallet activity.
    pub fn invalidate(&self) {
        if self.unspent.lock().unwrap().take().is_some() {
            debug!(network = %self.network, "wallet coin view invalidated");
        }
    }

    /// The wallet's unspent coins, fetched once per invalidation.
    pub async fn unspent_coins(&self) -> Result<Arc<Vec<UnspentCoin>>, LedgerError> {
        if let Some(cached) = self.unspent.lock().unwrap().clone() {
            return Ok(cached);
        }
        let coins = Arc::new(self.client.get_unspent_coins().await?);
        *self.unspent.lock().unwrap() = Some(coins.clone());
        Ok(coins)
    }

    pub async fn get_transaction(
        &self,
        txid: &TxId,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        self.client.get_transaction(txid).await
    }
}
