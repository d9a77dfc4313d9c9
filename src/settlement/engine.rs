//! Engine entry point: the sweep loop.
//!
//! The engine owns one [`NetworkContext`] per configured network plus the
//! session registry. Its sweep loop ticks on the poll interval and does
//! two things per network: re-establish a missing session (the only
//! reconnect mechanism in the system) and reconcile every invoice still
//! pending. Live sessions make settlement fast; the sweep makes it
//! complete.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::session::{self, SessionRegistry, SessionState};
use super::{reconcile, NetworkContext};
use crate::core_types::NetworkId;

/// Cooperative shutdown trigger shared between the engine and its tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-network health, as reported by [`SettlementEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkStatus {
    /// No session registered; next sweep tick will reconnect.
    Disconnected,
    Connecting,
    Listening,
}

impl NetworkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkStatus::Disconnected => "Disconnected",
            NetworkStatus::Connecting => "Connecting",
            NetworkStatus::Listening => "Listening",
        }
    }
}

pub struct SettlementEngine {
    contexts: Vec<Arc<NetworkContext>>,
    registry: Arc<SessionRegistry>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    sweep: Option<JoinHandle<()>>,
}

impl SettlementEngine {
    pub fn new(
        contexts: Vec<Arc<NetworkContext>>,
        poll_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            contexts,
            registry: Arc::new(SessionRegistry::new()),
            shutdown: ShutdownSignal::new(),
            poll_interval,
            shutdown_timeout,
            sweep: None,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Start the sweep loop. The first tick fires immediately, so
    /// sessions come up at startup without waiting a full interval.
    pub fn start(&mut self) {
        let contexts = self.contexts.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut shutdown_rx = shutdown.subscribe();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("sweep loop stopping");
                            return;
                        }
                        continue;
                    }
                }

                for ctx in &contexts {
                    if session::ensure_session(&registry, ctx.clone(), shutdown.subscribe()) {
                        info!(network = %ctx.network, "session spawned");
                    }
                    sweep_network(ctx).await;
                }
            }
        });
        self.sweep = Some(task);
        info!(
            networks = self.contexts.len(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "settlement engine started"
        );
    }

    /// Per-network health snapshot.
    pub fn status(&self) -> Vec<(NetworkId, NetworkStatus)> {
        let live: std::collections::HashMap<NetworkId, SessionState> =
            self.registry.states().into_iter().collect();
        self.contexts
            .iter()
            .map(|ctx| {
                let status = match live.get(&ctx.network) {
                    None => NetworkStatus::Disconnected,
                    Some(SessionState::Connecting) => NetworkStatus::Connecting,
                    Some(SessionState::Listening) => NetworkStatus::Listening,
                };
                (ctx.network.clone(), status)
            })
            .collect()
    }

    /// All networks have a listening session.
    pub fn is_healthy(&self) -> bool {
        self.status()
            .iter()
            .all(|(_, s)| *s == NetworkStatus::Listening)
    }

    /// Signal shutdown and wait for the sweep loop to drain, aborting
    /// whatever is still running once the grace period expires.
    pub async fn shutdown(&mut self) {
        self.shutdown.trigger();

        if let Some(mut task) = self.sweep.take() {
            match timeout(self.shutdown_timeout, &mut task).await {
                Ok(_) => info!("sweep loop stopped"),
                Err(_) => {
                    warn!(
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "sweep loop did not stop in time; aborting"
                    );
                    task.abort();
                }
            }
        }
        self.registry.drain();
        info!("settlement engine stopped");
    }
}

/// One reconciliation pass over everything still pending on a network.
async fn sweep_network(ctx: &NetworkContext) {
    let invoices = match ctx.store.pending_invoices(&ctx.network).await {
        Ok(invoices) => invoices,
        Err(e) => {
            warn!(network = %ctx.network, error = %e, "pending invoice query failed");
            return;
        }
    };
    if invoices.is_empty() {
        return;
    }
    debug!(
        network = %ctx.network,
        pending = invoices.len(),
        "sweeping pending invoices"
    );
    for invoice in invoices {
        if let Err(e) = reconcile::update_payment_states(ctx, &invoice.id).await {
            warn!(
                network = %ctx.network,
                invoice = %invoice.id,
                error = %e,
                "reconciliation failed; next sweep retries"
            );
        }
    }
}
