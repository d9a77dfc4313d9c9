use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Periodic sweep interval. Doubles as the reconnect backoff: a dead
    /// session is only re-established on the next tick.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// PostgreSQL connection URL for the invoice store. Absent means the
    /// in-memory store (dev/test only).
    #[serde(default)]
    pub postgres_url: Option<String>,
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Network code, e.g. "BTC".
    pub code: String,
    /// Websocket endpoint of the indexing node (event subscription).
    pub ws_url: String,
    /// JSON-RPC endpoint of the indexing node.
    pub rpc_url: String,
    /// Confirmation count past which payments stop being re-checked.
    #[serde(default = "default_max_tracked_confirmations")]
    pub max_tracked_confirmations: i32,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_max_tracked_confirmations() -> i32 {
    6
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}
