use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use chainpay::config::AppConfig;
use chainpay::core_types::NetworkId;
use chainpay::events::EventBus;
use chainpay::invoice::{InvoiceStore, MemoryInvoiceStore, PgInvoiceStore};
use chainpay::ledger::RemoteLedgerClient;
use chainpay::logging::init_logging;
use chainpay::payjoin::MemoryLockTable;
use chainpay::settlement::{NetworkContext, SettlementEngine};
use chainpay::wallet::WalletView;

const GIT_HASH: &str = env!("GIT_HASH");

fn get_env() -> String {
    std::env::args()
        .nth(1)
        .unwrap_or_else(|| "dev".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _guard = init_logging(&config);

    info!(env = %env, git_hash = GIT_HASH, "chainpay starting");

    let store: Arc<dyn InvoiceStore> = match &config.postgres_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(8)
                .connect(url)
                .await?;
            info!("using postgres invoice store");
            Arc::new(PgInvoiceStore::new(pool))
        }
        None => {
            info!("no postgres_url configured; using in-memory invoice store");
            Arc::new(MemoryInvoiceStore::new())
        }
    };

    let bus = EventBus::new(config.event_bus_capacity);
    let locks = Arc::new(MemoryLockTable::new());

    let mut contexts = Vec::with_capacity(config.networks.len());
    for net in &config.networks {
        let network = NetworkId::new(net.code.clone());
        let client = Arc::new(RemoteLedgerClient::new(
            network.clone(),
            net.ws_url.clone(),
            net.rpc_url.clone(),
        ));
        let wallet = WalletView::new(network.clone(), client.clone());
        contexts.push(Arc::new(NetworkContext::new(
            network,
            client,
            wallet,
            store.clone(),
            locks.clone(),
            bus.clone(),
            net.max_tracked_confirmations,
        )));
    }

    let mut engine = SettlementEngine::new(
        contexts,
        Duration::from_secs(config.poll_interval_secs),
        Duration::from_secs(config.shutdown_timeout_secs),
    );
    engine.start();

    // Drain the bus into the log so a bare deployment still shows what
    // the engine is doing. Real consumers subscribe the same way.
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "gateway event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    error!(skipped = n, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.shutdown().await;
    info!("chainpay stopped");
    Ok(())
}
