//! Per-network listening sessions.
//!
//! One session per network owns the live event subscription. Sessions are
//! registered in a [`SessionRegistry`] keyed by network; the engine's
//! sweep loop calls [`ensure_session`] every tick, which is a no-op while
//! a session is alive and re-establishes it after a disconnect. The poll
//! timer is the only retry mechanism: a session that loses its stream
//! simply ends and waits to be respawned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::EngineError;
use super::{NetworkContext, poll, receive, reconcile};
use crate::core_types::{NetworkId, OutPoint, ScriptHash};
use crate::events::GatewayEvent;
use crate::invoice::{Payment, PaymentKind};
use crate::ledger::{LedgerEvent, TransactionNotice};

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subscribed, catch-up in progress; live events not yet consumed.
    Connecting,
    /// Consuming the live event stream.
    Listening,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::Listening => "Listening",
        }
    }
}

/// Lock-free state slot shared between a session task and the registry.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn get(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Connecting,
            _ => SessionState::Listening,
        }
    }
}

struct SessionHandle {
    state: Arc<StateCell>,
    task: JoinHandle<()>,
}

/// Registry of live sessions, one slot per network.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<NetworkId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, network: &NetworkId) -> bool {
        self.sessions.contains_key(network)
    }

    /// Snapshot of every live session's state, for health reporting.
    pub fn states(&self) -> Vec<(NetworkId, SessionState)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state.get()))
            .collect()
    }

    fn remove(&self, network: &NetworkId) {
        self.sessions.remove(network);
    }

    /// Abort every session task. Used during shutdown.
    pub fn drain(&self) {
        self.sessions.retain(|network, handle| {
            debug!(network = %network, "aborting session task");
            handle.task.abort();
            false
        });
    }
}

/// Spawn a session for this network unless one is already registered.
///
/// The check-then-spawn is atomic through the map's entry API, so two
/// concurrent sweep ticks cannot double-subscribe. The spawned task waits
/// on a ready gate before it may deregister itself, closing the window
/// where an instantly-failing session could remove an entry that was not
/// inserted yet.
pub fn ensure_session(
    registry: &Arc<SessionRegistry>,
    ctx: Arc<NetworkContext>,
    shutdown: watch::Receiver<bool>,
) -> bool {
    let entry = match registry.sessions.entry(ctx.network.clone()) {
        Entry::Occupied(occupied) => {
            if !occupied.get().task.is_finished() {
                return false;
            }
            // Finished task that never got to deregister (e.g. aborted).
            occupied.remove();
            match registry.sessions.entry(ctx.network.clone()) {
                Entry::Occupied(_) => return false,
                Entry::Vacant(vacant) => vacant,
            }
        }
        Entry::Vacant(vacant) => vacant,
    };

    let state = Arc::new(StateCell::new(SessionState::Connecting));
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(session_task(
        registry.clone(),
        ctx,
        state.clone(),
        shutdown,
        ready_rx,
    ));
    entry.insert(SessionHandle { state, task });
    let _ = ready_tx.send(());
    true
}

async fn session_task(
    registry: Arc<SessionRegistry>,
    ctx: Arc<NetworkContext>,
    state: Arc<StateCell>,
    shutdown: watch::Receiver<bool>,
    ready: oneshot::Receiver<()>,
) {
    // Registry entry exists once this resolves.
    let _ = ready.await;

    if let Err(e) = run_session(&ctx, &state, shutdown).await {
        error!(network = %ctx.network, error = %e, "session ended with error");
    }
    registry.remove(&ctx.network);
    info!(network = %ctx.network, "session deregistered");
}

async fn run_session(
    ctx: &NetworkContext,
    state: &StateCell,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    // An unsynced node reports stale confirmation counts. Back off and
    // let the poll timer try again next tick.
    if !ctx.client.is_synced().await? {
        warn!(network = %ctx.network, "node not synced; deferring session");
        return Ok(());
    }

    // Subscribe before the catch-up sweep, so nothing lands in the gap
    // between "polled the wallet" and "listening for events".
    let mut events = ctx.client.subscribe_events().await?;
    info!(network = %ctx.network, "ledger subscription established");

    ctx.wallet.invalidate();
    poll::find_payments_via_polling(ctx).await?;
    for invoice in ctx.store.pending_invoices(&ctx.network).await? {
        reconcile::update_payment_states(ctx, &invoice.id).await?;
    }

    state.set(SessionState::Listening);
    info!(network = %ctx.network, "session listening");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(network = %ctx.network, "session shutting down");
                    return Ok(());
                }
            }
            event = events.recv() => {
                match event {
                    Some(LedgerEvent::NewBlock { height, .. }) => {
                        handle_new_block(ctx, height).await?;
                    }
                    Some(LedgerEvent::NewTransaction(notice)) => {
                        handle_new_transaction(ctx, notice).await?;
                    }
                    None => {
                        warn!(
                            network = %ctx.network,
                            "event stream closed; session ends, poll timer will reconnect"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// A new block arrived: every pending invoice may have moved.
pub async fn handle_new_block(ctx: &NetworkContext, height: u64) -> Result<(), EngineError> {
    debug!(network = %ctx.network, height, "new block");
    ctx.wallet.invalidate();

    for invoice in ctx.store.pending_invoices(&ctx.network).await? {
        reconcile::update_payment_states(ctx, &invoice.id).await?;
    }

    ctx.bus.publish(GatewayEvent::NewBlock {
        network: ctx.network.clone(),
    });
    Ok(())
}

/// A wallet transaction arrived: match its outputs against invoices.
pub async fn handle_new_transaction(
    ctx: &NetworkContext,
    notice: TransactionNotice,
) -> Result<(), EngineError> {
    debug!(network = %ctx.network, txid = %notice.txid, "new wallet transaction");
    ctx.wallet.invalidate();

    for output in &notice.outputs {
        let script = ScriptHash::from_script(&output.script_pubkey, &ctx.network);
        let Some(invoice) = ctx.store.find_by_script(&script).await? else {
            continue;
        };

        let outpoint = OutPoint {
            txid: notice.txid.clone(),
            vout: output.vout,
        };
        let payment = Payment {
            outpoint,
            network: ctx.network.clone(),
            value: output.value,
            confirmations: 0,
            accounted: true,
            rbf: notice.rbf,
            destination: script,
            kind: PaymentKind::Plain,
            received_at: Utc::now(),
        };
        receive::record_new_payment(ctx, &invoice.id, payment).await?;
    }

    ctx.bus.publish(GatewayEvent::NewOnChainTransaction {
        network: ctx.network.clone(),
        txid: notice.txid,
    });
    Ok(())
}
