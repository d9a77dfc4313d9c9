//! End-to-end behavior of the settlement path against a scripted ledger.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use chainpay::core_types::{Address, InvoiceId, NetworkId, OutPoint, ScriptHash, TxId};
use chainpay::events::EventBus;
use chainpay::invoice::{
    Invoice, InvoiceStore, MemoryInvoiceStore, Payment, PaymentKind, PaymentPrompt, SpeedPolicy,
};
use chainpay::ledger::{
    BroadcastOutcome, LedgerEvent, MockLedgerClient, TransactionNotice, TransactionRecord,
    TxOutput, UnspentCoin,
};
use chainpay::payjoin::MemoryLockTable;
use chainpay::settlement::{
    receive, reconcile, session, NetworkContext, SettlementEngine,
};
use chainpay::settlement::poll;
use chainpay::wallet::WalletView;

const SCRIPT_A: &str = "76a914aa88ac";
const SCRIPT_B: &str = "76a914bb88ac";

struct Fixture {
    ctx: Arc<NetworkContext>,
    mock: Arc<MockLedgerClient>,
    store: Arc<MemoryInvoiceStore>,
    locks: Arc<MemoryLockTable>,
    network: NetworkId,
}

fn fixture() -> Fixture {
    let network = NetworkId::new("BTC");
    let mock = Arc::new(MockLedgerClient::new(network.clone()));
    let store = Arc::new(MemoryInvoiceStore::new());
    let locks = Arc::new(MemoryLockTable::new());
    let bus = EventBus::new(64);
    let wallet = WalletView::new(network.clone(), mock.clone());
    let ctx = Arc::new(NetworkContext::new(
        network.clone(),
        mock.clone(),
        wallet,
        store.clone(),
        locks.clone(),
        bus,
        6,
    ));
    Fixture {
        ctx,
        mock,
        store,
        locks,
        network,
    }
}

fn invoice_tracking(f: &Fixture, id: &str, script_hex: &str) -> InvoiceId {
    let script = ScriptHash::from_script(script_hex, &f.network);
    let invoice = Invoice::new(
        InvoiceId::new(id),
        SpeedPolicy::MediumSpeed,
        PaymentPrompt {
            address: Address::new(format!("addr-{}", id)),
            script,
            network: f.network.clone(),
            due: Decimal::new(100_000_000, 8),
        },
    );
    let id = invoice.id.clone();
    f.store.insert(invoice);
    id
}

fn payment_to(f: &Fixture, txid: &str, vout: u32, script_hex: &str) -> Payment {
    Payment {
        outpoint: OutPoint::new(txid, vout),
        network: f.network.clone(),
        value: Decimal::new(100_000_000, 8),
        confirmations: 0,
        accounted: true,
        rbf: false,
        destination: ScriptHash::from_script(script_hex, &f.network),
        kind: PaymentKind::Plain,
        received_at: Utc::now(),
    }
}

fn record(txid: &str, confirmations: i32, raw: &str, rbf: bool) -> TransactionRecord {
    TransactionRecord {
        txid: TxId::new(txid),
        confirmations,
        raw: raw.to_string(),
        rbf,
    }
}

#[tokio::test]
async fn test_payment_is_recorded_at_most_once() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));

    let p = payment_to(&f, "tx1", 0, SCRIPT_A);
    assert!(receive::record_new_payment(&f.ctx, &id, p.clone())
        .await
        .unwrap());
    assert!(!receive::record_new_payment(&f.ctx, &id, p).await.unwrap());

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments.len(), 1);
}

#[tokio::test]
async fn test_duplicate_transaction_delivery_is_harmless() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));

    let notice = TransactionNotice {
        txid: TxId::new("tx1"),
        rbf: false,
        outputs: vec![TxOutput {
            vout: 0,
            value: Decimal::new(100_000_000, 8),
            script_pubkey: SCRIPT_A.to_string(),
            address: None,
        }],
    };
    session::handle_new_transaction(&f.ctx, notice.clone())
        .await
        .unwrap();
    session::handle_new_transaction(&f.ctx, notice).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments.len(), 1);
}

#[tokio::test]
async fn test_reconciliation_is_idempotent() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    f.mock.set_transaction(record("tx1", 2, "raw1", false));
    assert!(reconcile::update_payment_states(&f.ctx, &id).await.unwrap());
    // No new ledger activity: no further writes.
    assert!(!reconcile::update_payment_states(&f.ctx, &id).await.unwrap());
}

#[tokio::test]
async fn test_new_block_advances_confirmations() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    f.mock.set_transaction(record("tx1", 1, "raw1", false));
    session::handle_new_block(&f.ctx, 820_001).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments[0].confirmations, 1);
    assert!(invoice.payments[0].accounted);
    assert!(SpeedPolicy::MediumSpeed.is_payment_confirmed(&invoice.payments[0]));
}

#[tokio::test]
async fn test_confirmations_never_decrease_while_accounted() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 3, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments[0].confirmations, 3);

    // A shallow reorg reports fewer confirmations; the stored count holds.
    f.mock.set_transaction(record("tx1", 1, "raw1", false));
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();
    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments[0].confirmations, 3);
    assert!(invoice.payments[0].accounted);
}

#[tokio::test]
async fn test_confirmations_clamp_at_tracking_cap() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 5, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    // Node now reports a count far past the cap; the stored value stops
    // at the cap instead of carrying the raw count.
    f.mock.set_transaction(record("tx1", 100, "raw1", false));
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments[0].confirmations, 6);
    assert!(!f.store.is_pending(&id));
}

#[tokio::test]
async fn test_invoice_leaves_pending_set_at_tracking_cap() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 1, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();
    assert!(f.store.is_pending(&id));

    f.mock.set_transaction(record("tx1", 6, "raw1", false));
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();
    assert!(!f.store.is_pending(&id));
}

#[tokio::test]
async fn test_replacement_unaccounts_but_keeps_payment() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", true));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    // Fee bump replaced tx1: still known, still unconfirmed, inputs spent.
    f.mock
        .set_broadcast_outcome("raw1", BroadcastOutcome::TransactionError);
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.payments.len(), 1);
    assert!(!invoice.payments[0].accounted);
    assert_eq!(invoice.payments[0].confirmations, 0);
    // A mempool transaction gets a real rebroadcast, not a dry run.
    let calls = f.mock.broadcast_calls();
    assert!(calls.iter().all(|(raw, test_only)| raw == "raw1" && !test_only));
}

#[tokio::test]
async fn test_conflicted_transaction_is_probed_not_rebroadcast() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    f.mock.set_transaction(record("tx1", -1, "raw1", false));
    f.mock
        .set_broadcast_outcome("raw1", BroadcastOutcome::TransactionRejected);
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert!(!invoice.payments[0].accounted);
    assert_eq!(invoice.payments[0].confirmations, -1);
    let (_, test_only) = f.mock.broadcast_calls().last().unwrap().clone();
    assert!(test_only);
}

#[tokio::test]
async fn test_ambiguous_broadcast_result_assumes_no_conflict() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    f.mock.set_broadcast_outcome(
        "raw1",
        BroadcastOutcome::Other("txn-mempool-full".to_string()),
    );
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert!(invoice.payments[0].accounted);
}

#[tokio::test]
async fn test_catch_up_poll_recovers_missed_payments() {
    let f = fixture();
    let inv_a = invoice_tracking(&f, "inv-a", SCRIPT_A);
    let inv_b = invoice_tracking(&f, "inv-b", SCRIPT_B);

    // Two payments landed while nothing was listening.
    f.mock.set_transaction(record("tx1", 1, "raw1", false));
    f.mock.set_transaction(record("tx2", 0, "raw2", false));
    f.mock.set_unspent(vec![
        UnspentCoin {
            outpoint: OutPoint::new("tx1", 0),
            value: Decimal::new(50_000_000, 8),
            script_pubkey: SCRIPT_A.to_string(),
            address: Address::new("addr-inv-a"),
            key_path: "0/1".to_string(),
        },
        UnspentCoin {
            outpoint: OutPoint::new("tx2", 1),
            value: Decimal::new(70_000_000, 8),
            script_pubkey: SCRIPT_B.to_string(),
            address: Address::new("addr-inv-b"),
            key_path: "0/2".to_string(),
        },
    ]);

    assert_eq!(poll::find_payments_via_polling(&f.ctx).await.unwrap(), 2);
    assert_eq!(
        f.store.get(&inv_a).await.unwrap().unwrap().payments.len(),
        1
    );
    assert_eq!(
        f.store.get(&inv_b).await.unwrap().unwrap().payments.len(),
        1
    );

    // Polling again discovers nothing new.
    f.ctx.wallet.invalidate();
    assert_eq!(poll::find_payments_via_polling(&f.ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn test_payjoin_locks_release_exactly_once() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    let contributed = vec![OutPoint::new("own1", 0), OutPoint::new("own2", 3)];
    for op in &contributed {
        f.locks.reserve(op.clone());
    }

    f.mock.set_transaction(record("orig", 1, "raworig", false));
    let mut p = payment_to(&f, "orig", 0, SCRIPT_A);
    p.kind = PaymentKind::PayjoinOriginal {
        coinjoin_txid: Some(TxId::new("cj")),
        contributed,
    };
    // Fallback confirmed: the cooperative spend is dead, inputs come back.
    receive::record_new_payment(&f.ctx, &id, p).await.unwrap();
    assert_eq!(f.locks.held_count(), 0);

    // Further reconciliations find nothing left to release.
    reconcile::update_payment_states(&f.ctx, &id).await.unwrap();
    assert_eq!(f.locks.held_count(), 0);
}

#[tokio::test]
async fn test_payjoin_locks_stay_held_while_exchange_is_open() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.locks.reserve(OutPoint::new("own1", 0));

    // Original replaced, but the cooperative transaction is in the
    // mempool: the reservation must hold.
    f.mock.set_transaction(record("orig", 0, "raworig", true));
    f.mock.set_transaction(record("cj", 0, "rawcj", false));
    f.mock
        .set_broadcast_outcome("raworig", BroadcastOutcome::TransactionError);

    let mut p = payment_to(&f, "orig", 0, SCRIPT_A);
    p.kind = PaymentKind::PayjoinOriginal {
        coinjoin_txid: Some(TxId::new("cj")),
        contributed: vec![OutPoint::new("own1", 0)],
    };
    receive::record_new_payment(&f.ctx, &id, p).await.unwrap();
    assert_eq!(f.locks.held_count(), 1);
}

#[tokio::test]
async fn test_direct_prompt_hit_rotates_address() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    let before = f.store.get(&id).await.unwrap().unwrap().prompt.clone();

    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_ne!(invoice.prompt.address, before.address);
    // Old script keeps matching after rotation.
    assert!(invoice.tracked_scripts.contains(&before.script));
    assert!(f
        .store
        .find_by_script(&before.script)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_partial_payment_does_not_rotate() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    let before = f.store.get(&id).await.unwrap().unwrap().prompt.clone();

    // Covers 0.4 of the 1.0 due: the prompt stays as it is.
    let mut p = payment_to(&f, "tx1", 0, SCRIPT_A);
    p.value = Decimal::new(40_000_000, 8);
    receive::record_new_payment(&f.ctx, &id, p).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.prompt, before);

    // The remainder arrives and satisfies the prompt; now it rotates.
    f.mock.set_transaction(record("tx2", 0, "raw2", false));
    let mut p = payment_to(&f, "tx2", 0, SCRIPT_A);
    p.value = Decimal::new(60_000_000, 8);
    receive::record_new_payment(&f.ctx, &id, p).await.unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_ne!(invoice.prompt.address, before.address);
    assert!(invoice.tracked_scripts.contains(&before.script));
}

#[tokio::test]
async fn test_payment_to_old_script_does_not_rotate() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx1", 0, SCRIPT_A))
        .await
        .unwrap();
    let rotated = f.store.get(&id).await.unwrap().unwrap().prompt.clone();

    // Late payment to the original (now old) script.
    f.mock.set_transaction(record("tx2", 0, "raw2", false));
    receive::record_new_payment(&f.ctx, &id, payment_to(&f, "tx2", 0, SCRIPT_A))
        .await
        .unwrap();

    let invoice = f.store.get(&id).await.unwrap().unwrap();
    assert_eq!(invoice.prompt, rotated);
    assert_eq!(invoice.payments.len(), 2);
}

#[tokio::test]
async fn test_engine_records_live_payment_end_to_end() {
    let f = fixture();
    let id = invoice_tracking(&f, "inv1", SCRIPT_A);
    f.mock.set_transaction(record("tx1", 0, "raw1", false));

    let mut engine = SettlementEngine::new(
        vec![f.ctx.clone()],
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    engine.start();

    // Wait for the session to come up.
    for _ in 0..50 {
        if f.mock.subscriber_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(f.mock.subscriber_count() > 0);

    f.mock
        .push_event(LedgerEvent::NewTransaction(TransactionNotice {
            txid: TxId::new("tx1"),
            rbf: false,
            outputs: vec![TxOutput {
                vout: 0,
                value: Decimal::new(100_000_000, 8),
                script_pubkey: SCRIPT_A.to_string(),
                address: None,
            }],
        }))
        .await;

    let mut recorded = false;
    for _ in 0..50 {
        if f.store.get(&id).await.unwrap().unwrap().payments.len() == 1 {
            recorded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recorded);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_session_defers_while_node_is_unsynced() {
    let f = fixture();
    f.mock.set_synced(false);

    let mut engine = SettlementEngine::new(
        vec![f.ctx.clone()],
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    engine.start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(f.mock.subscriber_count(), 0);

    f.mock.set_synced(true);
    let mut connected = false;
    for _ in 0..50 {
        if f.mock.subscriber_count() > 0 {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connected);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_reconnects_after_subscription_failure() {
    let f = fixture();
    f.mock.set_fail_subscribe(true);

    let mut engine = SettlementEngine::new(
        vec![f.ctx.clone()],
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    engine.start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(f.mock.subscriber_count(), 0);

    // Node comes back; the next sweep tick re-establishes the session.
    f.mock.set_fail_subscribe(false);
    let mut connected = false;
    for _ in 0..50 {
        if f.mock.subscriber_count() > 0 {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connected);

    engine.shutdown().await;
}
