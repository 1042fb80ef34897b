//! chainstream-evm: checkpointed EVM event streams over JSON-RPC.
//!
//! # Architecture
//!
//! ```text
//! StreamManager ── start/stop/add/remove/hwm ──► stream table
//!      │
//!      └─ per stream: StreamPoller (tokio task)
//!             ├── ListenerRegistry   (shared with the manager)
//!             ├── EvmRpcClient       (eth_newFilter / eth_getFilterChanges / eth_getLogs)
//!             ├── decoder            (ABI → JSON)
//!             └── mpsc senders       (ListenerEvent, BlockHashEvent)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainstream_core::StreamConfig;
//! use chainstream_evm::{JsonRpcEvmClient, StreamManager, RpcTransport};
//!
//! fn manager<T: RpcTransport>(transport: T) -> StreamManager<JsonRpcEvmClient<T>> {
//!     StreamManager::new(Arc::new(JsonRpcEvmClient::new(transport)), StreamConfig::default())
//! }
//! ```

pub mod decoder;
pub mod manager;
pub mod poller;
pub mod rpc;
pub mod transport;

pub use decoder::{decode_event, DecodeError};
pub use manager::{ListenerAdded, ListenerHwm, StartStreamRequest, StreamManager};
pub use poller::{PollerState, StreamOutputs, StreamPoller};
pub use rpc::{EvmRpcClient, FilterId, JsonRpcEvmClient};
pub use transport::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcTransport, TransportError};
