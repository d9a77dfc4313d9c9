//! Ledger client speaking to a real indexing node.
//!
//! Events arrive over a websocket; lookups, broadcasts and address
//! reservation go over JSON-RPC. The websocket reader feeds a bounded
//! channel; when the socket dies the channel closes, the session ends,
//! and the poll timer reconnects on its next tick.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{
    BroadcastOutcome, EventStream, LedgerClient, LedgerError, LedgerEvent, ReservedAddress,
    TransactionNotice, TransactionRecord, TxOutput, UnspentCoin,
};
use crate::core_types::{Address, NetworkId, OutPoint, TxId};

pub struct RemoteLedgerClient {
    network: NetworkId,
    ws_url: String,
    rpc_url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RemoteLedgerClient {
    pub fn new(network: NetworkId, ws_url: String, rpc_url: String) -> Self {
        Self {
            network,
            ws_url,
            rpc_url,
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// JSON-RPC call whose result may be null.
    async fn call_opt<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;
        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| LedgerError::Parse(e.to_string()))?;
        if let Some(err) = body.error {
            return Err(LedgerError::Rpc(format!("{}: {}", err.code, err.message)));
        }
        Ok(body.result)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, LedgerError> {
        self.call_opt(method, params)
            .await?
            .ok_or_else(|| LedgerError::Parse(format!("{}: missing result", method)))
    }
}

#[async_trait]
impl LedgerClient for RemoteLedgerClient {
    fn network(&self) -> &NetworkId {
        &self.network
    }

    async fn is_synced(&self) -> Result<bool, LedgerError> {
        let wire: StatusWire = self.call("getstatus", serde_json::json!([])).await?;
        Ok(wire.synced)
    }

    async fn subscribe_events(&self) -> Result<EventStream, LedgerError> {
        let (ws, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| LedgerError::Subscription(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "scopes": ["newblock", "newtransaction"],
        });
        sink.send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| LedgerError::Subscription(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let network = self.network.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event.into()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(network = %network, error = %e, "ignoring unrecognized ledger frame")
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(network = %network, error = %e, "websocket error; event stream closed");
                        break;
                    }
                }
            }
            // Dropping tx ends the stream; the session exits and the
            // poll timer re-establishes it.
        });

        Ok(rx)
    }

    async fn get_transaction(
        &self,
        txid: &TxId,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        let wire: Option<TxRecordWire> = self
            .call_opt("gettransaction", serde_json::json!([txid.0]))
            .await?;
        Ok(wire.map(|w| TransactionRecord {
            txid: TxId::new(w.txid),
            confirmations: w.confirmations,
            raw: w.raw_transaction,
            rbf: w.rbf,
        }))
    }

    async fn broadcast(
        &self,
        raw: &str,
        test_accept_only: bool,
    ) -> Result<BroadcastOutcome, LedgerError> {
        let method = if test_accept_only {
            "testmempoolaccept"
        } else {
            "broadcast"
        };
        let wire: BroadcastWire = self.call(method, serde_json::json!([raw])).await?;
        Ok(map_broadcast(wire))
    }

    async fn get_unspent_coins(&self) -> Result<Vec<UnspentCoin>, LedgerError> {
        let wire: Vec<UnspentWire> = self.call("listunspent", serde_json::json!([])).await?;
        Ok(wire
            .into_iter()
            .map(|w| UnspentCoin {
                outpoint: OutPoint::new(w.txid, w.vout),
                value: w.value,
                script_pubkey: w.script_pub_key,
                address: Address::new(w.address),
                key_path: w.key_path,
            })
            .collect())
    }

    async fn reserve_new_address(&self) -> Result<ReservedAddress, LedgerError> {
        let wire: ReserveWire = self.call("reserveaddress", serde_json::json!([])).await?;
        Ok(ReservedAddress {
            address: Address::new(wire.address),
            script_pubkey: wire.script_pub_key,
        })
    }
}

fn map_broadcast(wire: BroadcastWire) -> BroadcastOutcome {
    if wire.success {
        return BroadcastOutcome::Accepted;
    }
    match wire.error_code.as_deref() {
        Some("already-in-chain") => BroadcastOutcome::AlreadyInChain,
        Some("tx-error") => BroadcastOutcome::TransactionError,
        Some("tx-rejected") => BroadcastOutcome::TransactionRejected,
        other => BroadcastOutcome::Other(other.unwrap_or("unknown").to_string()),
    }
}

// ============================================================
// Wire formats
// ============================================================

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorWire>,
}

#[derive(Deserialize)]
struct RpcErrorWire {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct StatusWire {
    #[serde(default)]
    synced: bool,
}

#[derive(Deserialize)]
struct TxRecordWire {
    txid: String,
    confirmations: i32,
    #[serde(rename = "rawTransaction")]
    raw_transaction: String,
    #[serde(default)]
    rbf: bool,
}

#[derive(Deserialize)]
struct BroadcastWire {
    success: bool,
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

#[derive(Deserialize)]
struct UnspentWire {
    txid: String,
    vout: u32,
    value: Decimal,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: String,
    address: String,
    #[serde(rename = "keyPath", default)]
    key_path: String,
}

#[derive(Deserialize)]
struct ReserveWire {
    address: String,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "newblock")]
    NewBlock { height: u64, hash: String },
    #[serde(rename = "newtransaction")]
    NewTransaction {
        txid: String,
        #[serde(default)]
        rbf: bool,
        outputs: Vec<WireOutput>,
    },
}

#[derive(Deserialize)]
struct WireOutput {
    vout: u32,
    value: Decimal,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: String,
    #[serde(default)]
    address: Option<String>,
}

impl From<WireEvent> for LedgerEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::NewBlock { height, hash } => LedgerEvent::NewBlock { height, hash },
            WireEvent::NewTransaction { txid, rbf, outputs } => {
                LedgerEvent::NewTransaction(TransactionNotice {
                    txid: TxId::new(txid),
                    rbf,
                    outputs: outputs
                        .into_iter()
                        .map(|o| TxOutput {
                            vout: o.vout,
                            value: o.value,
                            script_pubkey: o.script_pub_key,
                            address: o.address.map(Address::new),
                        })
                        .collect(),
                })
            }
        }
    }
}
