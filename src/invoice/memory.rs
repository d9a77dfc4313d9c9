//! In-memory invoice store for dev and tests.
//!
//! Mirrors the PostgreSQL store's semantics exactly, in particular the
//! append-if-outpoint-absent contract.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::{Invoice, InvoiceStatus, InvoiceStore, Payment, StoreError};
use crate::core_types::{Address, InvoiceId, NetworkId, ScriptHash};

#[derive(Default)]
pub struct MemoryInvoiceStore {
    invoices: DashMap<InvoiceId, Invoice>,
    script_index: DashMap<ScriptHash, InvoiceId>,
    pending: DashSet<InvoiceId>,
}

impl MemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invoice (creation itself is outside the engine).
    pub fn insert(&self, invoice: Invoice) {
        for script in &invoice.tracked_scripts {
            self.script_index
                .insert(script.clone(), invoice.id.clone());
        }
        if matches!(
            invoice.status,
            InvoiceStatus::New | InvoiceStatus::Processing
        ) {
            self.pending.insert(invoice.id.clone());
        }
        self.invoices.insert(invoice.id.clone(), invoice);
    }

    pub fn is_pending(&self, id: &InvoiceId) -> bool {
        self.pending.contains(id)
    }
}

#[async_trait]
impl InvoiceStore for MemoryInvoiceStore {
    async fn get(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.invoices.get(id).map(|e| e.value().clone()))
    }

    async fn find_by_script(&self, script: &ScriptHash) -> Result<Option<Invoice>, StoreError> {
        let Some(id) = self.script_index.get(script).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    async fn pending_invoices(&self, network: &NetworkId) -> Result<Vec<Invoice>, StoreError> {
        let mut out = Vec::new();
        for id in self.pending.iter() {
            if let Some(invoice) = self.invoices.get(id.key())
                && invoice.prompt.network == *network
            {
                out.push(invoice.value().clone());
            }
        }
        Ok(out)
    }

    async fn append_payment(&self, id: &InvoiceId, payment: &Payment) -> Result<bool, StoreError> {
        let mut entry = self
            .invoices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if entry.payment(&payment.outpoint).is_some() {
            return Ok(false);
        }
        entry.payments.push(payment.clone());
        Ok(true)
    }

    async fn update_payments(
        &self,
        id: &InvoiceId,
        payments: &[Payment],
    ) -> Result<(), StoreError> {
        let mut entry = self
            .invoices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        for updated in payments {
            if let Some(existing) = entry
                .payments
                .iter_mut()
                .find(|p| p.outpoint == updated.outpoint)
            {
                *existing = updated.clone();
            }
        }
        Ok(())
    }

    async fn set_pending(&self, id: &InvoiceId, pending: bool) -> Result<(), StoreError> {
        if pending {
            self.pending.insert(id.clone());
        } else {
            self.pending.remove(id);
        }
        Ok(())
    }

    async fn rotate_prompt(
        &self,
        id: &InvoiceId,
        address: &Address,
        script: &ScriptHash,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .invoices
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        entry.prompt.address = address.clone();
        entry.prompt.script = script.clone();
        entry.tracked_scripts.insert(script.clone());
        self.script_index.insert(script.clone(), id.clone());
        Ok(())
    }
}
