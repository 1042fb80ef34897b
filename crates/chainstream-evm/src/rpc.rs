//! Node access used by the stream poller.
//!
//! [`EvmRpcClient`] is the boundary the poller is written against; tests
//! substitute a scripted implementation. [`JsonRpcEvmClient`] maps it onto
//! standard `eth_*` calls over any [`RpcTransport`].

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use chainstream_core::types::{parse_hex_i64, to_hex_quantity};
use chainstream_core::{LogQuery, RawLog};

use crate::transport::{RpcTransport, TransportError};

/// Node-side change filter handle.
pub type FilterId = String;

/// The RPC calls a stream poller needs.
#[async_trait]
pub trait EvmRpcClient: Send + Sync + 'static {
    /// `eth_blockNumber`
    async fn block_number(&self) -> Result<i64, TransportError>;

    /// Hash of block `number`, or `None` if the node does not have it yet.
    async fn block_hash(&self, number: i64) -> Result<Option<String>, TransportError>;

    /// `eth_newFilter`
    async fn new_filter(&self, query: &LogQuery) -> Result<FilterId, TransportError>;

    /// `eth_getFilterChanges`
    async fn get_filter_changes(&self, id: &FilterId) -> Result<Vec<RawLog>, TransportError>;

    /// `eth_getLogs` over a bounded range.
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, TransportError>;

    /// `eth_uninstallFilter`. Best effort: nodes expire idle filters anyway.
    async fn uninstall_filter(&self, _id: &FilterId) -> Result<(), TransportError> {
        Ok(())
    }
}

/// `EvmRpcClient` backed by JSON-RPC over an [`RpcTransport`].
pub struct JsonRpcEvmClient<T> {
    transport: T,
    next_id: AtomicU64,
}

impl<T: RpcTransport> JsonRpcEvmClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn parse_quantity(method: &str, raw: &str) -> Result<i64, TransportError> {
    parse_hex_i64(raw).ok_or_else(|| TransportError::InvalidResponse {
        method: method.into(),
        reason: format!("'{raw}' is not a hex quantity"),
    })
}

#[async_trait]
impl<T: RpcTransport> EvmRpcClient for JsonRpcEvmClient<T> {
    async fn block_number(&self) -> Result<i64, TransportError> {
        let raw: String = self.transport.call(self.id(), "eth_blockNumber", vec![]).await?;
        parse_quantity("eth_blockNumber", &raw)
    }

    async fn block_hash(&self, number: i64) -> Result<Option<String>, TransportError> {
        let block: Value = self
            .transport
            .call(
                self.id(),
                "eth_getBlockByNumber",
                vec![json!(to_hex_quantity(number)), json!(false)],
            )
            .await?;
        Ok(block["hash"].as_str().map(str::to_string))
    }

    async fn new_filter(&self, query: &LogQuery) -> Result<FilterId, TransportError> {
        self.transport
            .call(self.id(), "eth_newFilter", vec![query.to_rpc_value()])
            .await
    }

    async fn get_filter_changes(&self, id: &FilterId) -> Result<Vec<RawLog>, TransportError> {
        let changes: Option<Vec<RawLog>> = self
            .transport
            .call(self.id(), "eth_getFilterChanges", vec![json!(id)])
            .await?;
        Ok(changes.unwrap_or_default())
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, TransportError> {
        let logs: Option<Vec<RawLog>> = self
            .transport
            .call(self.id(), "eth_getLogs", vec![query.to_rpc_value()])
            .await?;
        Ok(logs.unwrap_or_default())
    }

    async fn uninstall_filter(&self, id: &FilterId) -> Result<(), TransportError> {
        let _: bool = self
            .transport
            .call(self.id(), "eth_uninstallFilter", vec![json!(id)])
            .await?;
        Ok(())
    }
}
