use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
