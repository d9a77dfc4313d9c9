//! Payjoin input reservations.
//!
//! While a cooperative transaction is in flight, the receiver-owned
//! inputs it would spend are reserved so no other proposal reuses them.
//! The settlement engine does not own the table; it only signals when a
//! reservation is provably no longer needed.

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::debug;

use crate::core_types::OutPoint;

#[async_trait]
pub trait PayjoinLockTable: Send + Sync {
    /// Release reservations for these outpoints.
    ///
    /// Returns how many were actually held; releasing an absent outpoint
    /// is a no-op, which makes repeated release signals harmless.
    async fn release(&self, outpoints: &[OutPoint]) -> usize;
}

#[derive(Default)]
pub struct MemoryLockTable {
    held: DashSet<OutPoint>,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, outpoint: OutPoint) {
        self.held.insert(outpoint);
    }

    pub fn is_held(&self, outpoint: &OutPoint) -> bool {
        self.held.contains(outpoint)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl PayjoinLockTable for MemoryLockTable {
    async fn release(&self, outpoints: &[OutPoint]) -> usize {
        let mut released = 0;
        for outpoint in outpoints {
            if self.held.remove(outpoint).is_some() {
                debug!(%outpoint, "payjoin reservation released");
                released += 1;
            }
        }
        released
    }
}
