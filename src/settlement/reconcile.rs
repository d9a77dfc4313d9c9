//! Payment state reconciliation.
//!
//! Recomputes confirmation count and double-spend status for every
//! payment of one invoice, independent of what triggered it (live block,
//! poll tick, reconnect). Must be idempotent: running it twice with no
//! new ledger activity produces no additional writes and no additional
//! notifications.

use tracing::{debug, info, warn};

use super::NetworkContext;
use super::error::EngineError;
use crate::core_types::InvoiceId;
use crate::events::GatewayEvent;
use crate::invoice::{Payment, PaymentKind};
use crate::ledger::{BroadcastOutcome, TransactionRecord};

/// Reconcile one invoice. Returns whether anything changed.
pub async fn update_payment_states(
    ctx: &NetworkContext,
    invoice_id: &InvoiceId,
) -> Result<bool, EngineError> {
    let Some(mut invoice) = ctx.store.get(invoice_id).await? else {
        return Ok(false);
    };

    let mut updated: Vec<Payment> = Vec::new();

    for payment in invoice
        .payments
        .iter_mut()
        .filter(|p| p.network == ctx.network)
    {
        let record = match ctx.wallet.get_transaction(&payment.outpoint.txid).await {
            Ok(Some(record)) => record,
            // Not yet visible to the indexer; a future event will get it.
            Ok(None) => continue,
            Err(e) => {
                warn!(
                    network = %ctx.network,
                    outpoint = %payment.outpoint,
                    error = %e,
                    "transaction lookup failed; leaving payment untouched"
                );
                continue;
            }
        };

        let before_confirmations = payment.confirmations;
        let before_accounted = payment.accounted;

        apply_record(ctx, payment, &record).await;
        release_locks_if_settled(ctx, payment, &record).await;

        if payment.confirmations != before_confirmations || payment.accounted != before_accounted {
            updated.push(payment.clone());
        }
    }

    // An invoice stays in the pending set while it has no payment yet, or
    // while any payment is still below the tracking cap.
    let network_payments: Vec<&Payment> = invoice
        .payments
        .iter()
        .filter(|p| p.network == ctx.network)
        .collect();
    let still_pending = network_payments.is_empty()
        || network_payments
            .iter()
            .any(|p| p.confirmations < ctx.max_tracked_confirmations);
    ctx.store.set_pending(&invoice.id, still_pending).await?;

    if updated.is_empty() {
        return Ok(false);
    }

    ctx.store.update_payments(&invoice.id, &updated).await?;
    ctx.bus.publish(GatewayEvent::InvoiceNeedUpdate {
        invoice_id: invoice.id.clone(),
    });
    Ok(true)
}

/// Fold the ledger's current view of the transaction into the payment.
async fn apply_record(ctx: &NetworkContext, payment: &mut Payment, record: &TransactionRecord) {
    let confirmations = record.confirmations;

    let accounted = if confirmations >= 1 {
        true
    } else {
        probe_broadcast(ctx, record).await
    };

    if payment.accounted && !accounted && confirmations >= 0 {
        // Not orphaned, yet no longer broadcastable: an RBF fee bump or a
        // double spend replaced it. A state transition, not an error.
        info!(
            network = %ctx.network,
            outpoint = %payment.outpoint,
            "replacement detected; payment no longer accounted"
        );
    }

    if accounted {
        // Confirmations never decrease while accounted, never exceed the
        // tracking cap, and stop being written once the cap was reached.
        if confirmations > payment.confirmations
            && payment.confirmations < ctx.max_tracked_confirmations
        {
            payment.confirmations = confirmations.min(ctx.max_tracked_confirmations);
        }
    } else {
        // Explicit reset on replacement or conflict: 0 or -1.
        payment.confirmations = confirmations;
    }
    payment.accounted = accounted;
}

/// Decide whether an unconfirmed transaction still counts, by asking the
/// node to (re)accept it.
///
/// A conflicted transaction (-1) gets a mempool-accept probe only; a
/// mempool transaction (0) gets a real rebroadcast. Only a definite
/// "your inputs are spent" or "replacement underpaid" answer unaccounts
/// the payment; anything ambiguous assumes no conflict.
async fn probe_broadcast(ctx: &NetworkContext, record: &TransactionRecord) -> bool {
    let test_accept_only = record.confirmations < 0;
    match ctx.client.broadcast(&record.raw, test_accept_only).await {
        Ok(BroadcastOutcome::Accepted) | Ok(BroadcastOutcome::AlreadyInChain) => true,
        Ok(BroadcastOutcome::TransactionError) | Ok(BroadcastOutcome::TransactionRejected) => false,
        Ok(BroadcastOutcome::Other(reason)) => {
            debug!(
                network = %ctx.network,
                txid = %record.txid,
                reason,
                "unrecognized broadcast rejection; assuming no conflict"
            );
            true
        }
        Err(e) => {
            warn!(
                network = %ctx.network,
                txid = %record.txid,
                error = %e,
                "rebroadcast rpc failed; assuming no conflict"
            );
            true
        }
    }
}

/// Release payjoin input reservations once the exchange has resolved.
///
/// The receiver's inputs stay reserved while the cooperative transaction
/// could still confirm. They become reusable when the payer's fallback
/// settles instead, or when both halves are provably dead.
async fn release_locks_if_settled(
    ctx: &NetworkContext,
    payment: &Payment,
    record: &TransactionRecord,
) {
    let (contributed, release) = match &payment.kind {
        PaymentKind::Plain => return,
        PaymentKind::PayjoinOriginal {
            coinjoin_txid,
            contributed,
        } => {
            let original_live = payment.accounted && record.confirmations >= 0;
            let coinjoin_broadcast = match coinjoin_txid {
                Some(txid) => matches!(
                    ctx.wallet.get_transaction(txid).await,
                    Ok(Some(r)) if r.confirmations >= 0
                ),
                None => false,
            };
            (
                contributed,
                original_live || (!payment.accounted && !coinjoin_broadcast),
            )
        }
        PaymentKind::PayjoinCoinjoin {
            original_txid,
            contributed,
        } => {
            let original_live = matches!(
                ctx.wallet.get_transaction(original_txid).await,
                Ok(Some(r)) if r.confirmations >= 0
            );
            let coinjoin_dead = record.confirmations < 0 && !payment.accounted;
            (contributed, original_live || coinjoin_dead)
        }
    };

    if !release || contributed.is_empty() {
        return;
    }

    let released = ctx.locks.release(contributed).await;
    if released > 0 {
        info!(
            network = %ctx.network,
            outpoint = %payment.outpoint,
            released,
            "payjoin exchange resolved; input reservations released"
        );
    }
}
