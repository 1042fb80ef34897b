//! Wire types exchanged with the node and with stream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;

/// A raw EVM log as returned by `eth_getLogs` / `eth_getFilterChanges`.
///
/// Position fields are `null` for pending logs, so they are optional here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: Option<String>,
    #[serde(rename = "transactionIndex", default)]
    pub transaction_index: Option<String>,
    #[serde(rename = "logIndex", default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// `(block, transactionIndex, logIndex)` of the log, or `None` if any
    /// part is missing or unparseable.
    pub fn position(&self) -> Option<Checkpoint> {
        Some(Checkpoint::new(
            parse_hex_i64(self.block_number.as_deref()?)?,
            parse_hex_i64(self.transaction_index.as_deref()?)?,
            parse_hex_i64(self.log_index.as_deref()?)?,
        ))
    }

    pub fn block(&self) -> Option<i64> {
        parse_hex_i64(self.block_number.as_deref()?)
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }
}

/// Parse an `0x`-prefixed (or bare) hex quantity.
pub fn parse_hex_i64(s: &str) -> Option<i64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    i64::from_str_radix(s, 16).ok()
}

/// Format a block number as an `0x` hex quantity.
pub fn to_hex_quantity(n: i64) -> String {
    format!("0x{n:x}")
}

/// Parameters for `eth_newFilter` / `eth_getLogs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    /// `None` means the node's default (`latest`).
    pub from_block: Option<i64>,
    pub to_block: Option<i64>,
    pub addresses: Vec<String>,
    /// Alternatives for topic0. Empty matches any event.
    pub topic0s: Vec<String>,
}

impl LogQuery {
    /// The JSON-RPC filter object.
    pub fn to_rpc_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        if let Some(from) = self.from_block {
            obj.insert("fromBlock".into(), json!(to_hex_quantity(from)));
        }
        if let Some(to) = self.to_block {
            obj.insert("toBlock".into(), json!(to_hex_quantity(to)));
        }
        match self.addresses.as_slice() {
            [] => {}
            [single] => {
                obj.insert("address".into(), json!(single));
            }
            many => {
                obj.insert("address".into(), json!(many));
            }
        }
        if !self.topic0s.is_empty() {
            obj.insert("topics".into(), json!([self.topic0s]));
        }
        Value::Object(obj)
    }
}

/// Decoded event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub address: String,
    pub block_number: i64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: i64,
    pub log_index: i64,
    /// `address:Name(type1,...)` of the matching filter.
    pub signature: String,
    /// Decoded parameters keyed by ABI name.
    pub data: Value,
}

/// One event delivered to a stream consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerEvent {
    pub stream_id: Uuid,
    pub listener_id: Uuid,
    /// Position of this event; becomes the listener's checkpoint once sent.
    pub checkpoint: Checkpoint,
    pub event: EventData,
}

/// Notice that the chain head advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHashEvent {
    pub stream_id: Uuid,
    pub block_number: i64,
    pub block_hashes: Vec<String>,
    /// The head moved more than one block since the last notice.
    pub gap_potential: bool,
    pub created: DateTime<Utc>,
}
