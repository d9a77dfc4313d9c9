//! Core type definitions shared across the gateway.
//!
//! Newtypes over the raw wire strings keep the domain keys from being
//! mixed up: a transaction id is not an address, an address is not a
//! script-hash lookup key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Transaction id, lowercase hex as reported by the indexing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl TxId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One specific output of one specific transaction.
///
/// The natural primary key for a payment: every payment an invoice ever
/// receives is identified by exactly one outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: TxId::new(txid),
            vout,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Network code, e.g. "BTC" or "LTC". One settlement session runs per network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub String);

impl NetworkId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Invoice id as assigned by the invoice store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub String);

impl InvoiceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receive address in the network's own encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup key for matching a transaction output to an invoice:
/// sha256 of the output script, qualified by the network code.
///
/// Qualifying by network keeps two chains with identical script bytes
/// (forks, testnets) from colliding in the invoice index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptHash(pub String);

impl ScriptHash {
    /// Derive the lookup key from a scriptPubKey (hex) and network code.
    ///
    /// Non-hex input is hashed as raw bytes so derivation stays total;
    /// a malformed script simply never matches a tracked invoice.
    pub fn from_script(script_hex: &str, network: &NetworkId) -> Self {
        let bytes = hex::decode(script_hex).unwrap_or_else(|_| script_hex.as_bytes().to_vec());
        let digest = Sha256::digest(&bytes);
        Self(format!("{}#{}", hex::encode(digest), network))
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outpoint_display() {
        let op = OutPoint::new("ab12", 3);
        assert_eq!(op.to_string(), "ab12:3");
    }

    #[test]
    fn test_outpoint_is_hashable_key() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        assert!(set.insert(OutPoint::new("aa", 0)));
        assert!(!set.insert(OutPoint::new("aa", 0)));
        assert!(set.insert(OutPoint::new("aa", 1)));
    }

    #[test]
    fn test_script_hash_is_stable() {
        let network = NetworkId::new("BTC");
        let a = ScriptHash::from_script("76a914deadbeef88ac", &network);
        let b = ScriptHash::from_script("76a914deadbeef88ac", &network);
        assert_eq!(a, b);
    }

    #[test]
    fn test_script_hash_is_network_scoped() {
        let btc = ScriptHash::from_script("76a914deadbeef88ac", &NetworkId::new("BTC"));
        let ltc = ScriptHash::from_script("76a914deadbeef88ac", &NetworkId::new("LTC"));
        assert_ne!(btc, ltc);
    }

    #[test]
    fn test_script_hash_accepts_non_hex_input() {
        let network = NetworkId::new("BTC");
        let h = ScriptHash::from_script("not-hex-at-all", &network);
        assert!(h.0.ends_with("#BTC"));
    }
}
