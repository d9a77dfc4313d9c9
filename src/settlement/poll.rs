//! Catch-up polling.
//!
//! Recovers payments that arrived while no live session was connected
//! (startup, reconnect, missed events) by diffing the wallet's unspent
//! coins against what each pending invoice already recorded. Synthesizes
//! payments exactly like the live path does, so downstream consumers
//! cannot tell the difference.

use chrono::Utc;
use tracing::info;

use super::error::EngineError;
use super::{NetworkContext, receive};
use crate::core_types::ScriptHash;
use crate::invoice::{Payment, PaymentKind};

/// Sweep unspent coins into any pending invoice that tracks them.
/// Returns the number of newly discovered payments.
pub async fn find_payments_via_polling(ctx: &NetworkContext) -> Result<u32, EngineError> {
    let invoices = ctx.store.pending_invoices(&ctx.network).await?;
    if invoices.is_empty() {
        return Ok(0);
    }

    let coins = ctx.wallet.unspent_coins().await?;
    let keyed: Vec<(ScriptHash, &crate::ledger::UnspentCoin)> = coins
        .iter()
        .map(|c| (ScriptHash::from_script(&c.script_pubkey, &ctx.network), c))
        .collect();

    let mut found = 0u32;
    for invoice in invoices {
        let recorded = invoice.recorded_outpoints();
        for (script, coin) in &keyed {
            if !invoice.tracked_scripts.contains(script) || recorded.contains(&coin.outpoint) {
                continue;
            }

            // Mirror the live path: the RBF flag comes from the paying
            // transaction, not the coin.
            let rbf = match ctx.wallet.get_transaction(&coin.outpoint.txid).await {
                Ok(Some(record)) => record.rbf,
                _ => false,
            };

            let payment = Payment {
                outpoint: coin.outpoint.clone(),
                network: ctx.network.clone(),
                value: coin.value,
                confirmations: 0,
                accounted: true,
                rbf,
                destination: script.clone(),
                kind: PaymentKind::Plain,
                received_at: Utc::now(),
            };

            if receive::record_new_payment(ctx, &invoice.id, payment).await? {
                found += 1;
            }
        }
    }

    if found > 0 {
        info!(
            network = %ctx.network,
            found,
            "catch-up poll recovered payments missed while disconnected"
        );
    }
    Ok(found)
}
