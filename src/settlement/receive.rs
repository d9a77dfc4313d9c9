//! The received-payment sequence, shared by the live event path and the
//! catch-up poll.

use tracing::{debug, info, warn};

use super::error::EngineError;
use super::{NetworkContext, reconcile};
use crate::core_types::{InvoiceId, ScriptHash};
use crate::events::GatewayEvent;
use crate::invoice::Payment;

/// Record a freshly observed payment and run its follow-ups.
///
/// The append dedupes on outpoint: a concurrent or replayed observation
/// of the same output degrades to a reconciliation pass. Returns whether
/// the payment was newly recorded.
pub async fn record_new_payment(
    ctx: &NetworkContext,
    invoice_id: &InvoiceId,
    payment: Payment,
) -> Result<bool, EngineError> {
    let appended = ctx.store.append_payment(invoice_id, &payment).await?;
    if !appended {
        debug!(
            network = %ctx.network,
            invoice = %invoice_id,
            outpoint = %payment.outpoint,
            "outpoint already recorded; reconciling instead"
        );
        reconcile::update_payment_states(ctx, invoice_id).await?;
        return Ok(false);
    }

    ctx.store.set_pending(invoice_id, true).await?;
    info!(
        network = %ctx.network,
        invoice = %invoice_id,
        outpoint = %payment.outpoint,
        value = %payment.value,
        "recorded new payment"
    );

    // Confirmation count and conflict status are accurate immediately,
    // not only after the next block.
    reconcile::update_payment_states(ctx, invoice_id).await?;

    rotate_prompt_if_hit(ctx, invoice_id, &payment.destination).await?;

    ctx.bus.publish(GatewayEvent::ReceivedPayment {
        invoice_id: invoice_id.clone(),
        payment,
    });
    Ok(true)
}

/// Rotate the invoice's deposit address once a direct hit on the active
/// prompt satisfies it, so the next payment request uses a fresh
/// address. A partial payment keeps the current prompt; the old script
/// stays tracked after rotation and late payments to it still match.
async fn rotate_prompt_if_hit(
    ctx: &NetworkContext,
    invoice_id: &InvoiceId,
    destination: &ScriptHash,
) -> Result<(), EngineError> {
    let Some(invoice) = ctx.store.get(invoice_id).await? else {
        return Ok(());
    };
    if invoice.prompt.script != *destination {
        return Ok(());
    }
    let remaining = invoice.prompt.remaining_due(invoice.accounted_total());
    if remaining > rust_decimal::Decimal::ZERO {
        debug!(
            network = %ctx.network,
            invoice = %invoice_id,
            remaining = %remaining,
            "prompt not yet satisfied; keeping current address"
        );
        return Ok(());
    }

    match ctx.client.reserve_new_address().await {
        Ok(reserved) => {
            let script = ScriptHash::from_script(&reserved.script_pubkey, &ctx.network);
            ctx.store
                .rotate_prompt(invoice_id, &reserved.address, &script)
                .await?;
            info!(
                network = %ctx.network,
                invoice = %invoice_id,
                address = %reserved.address,
                "deposit address rotated"
            );
            ctx.bus.publish(GatewayEvent::InvoiceNewAddress {
                invoice_id: invoice_id.clone(),
                address: reserved.address,
                network: ctx.network.clone(),
            });
        }
        Err(e) => {
            // The old address keeps working; rotation is an optimization.
            warn!(
                network = %ctx.network,
                invoice = %invoice_id,
                error = %e,
                "address rotation failed; prompt keeps current address"
            );
        }
    }
    Ok(())
}
