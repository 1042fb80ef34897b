//! chainstream-core: listener model, checkpoints and filter resolution for
//! checkpointed EVM event streams.
//!
//! # Architecture
//!
//! ```text
//! ListenerAddRequest ─► verify_options ─► Listener ─► ListenerRegistry
//!                        (ABI + address        (filters,     (per stream,
//!                         canonicalization)     checkpoint)   generation-tracked)
//! ```
//!
//! The poller and lifecycle manager that drive a registry live in
//! `chainstream-evm`.

pub mod abi;
pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod filter;
pub mod listener;
pub mod registry;
pub mod types;

pub use abi::{AbiParameter, EventFragment, MethodFragment};
pub use backoff::{Backoff, RetryPolicy};
pub use checkpoint::Checkpoint;
pub use config::{RetryConfig, StreamConfig};
pub use error::{ErrorKind, StreamError};
pub use filter::{verify_options, ResolvedFilter, ResolvedOptions, VerifiedOptions};
pub use listener::{FromBlock, Listener, ListenerAddRequest, ListenerOptions};
pub use registry::{ListenerCursor, ListenerRegistry, RegistrySnapshot};
pub use types::{BlockHashEvent, EventData, ListenerEvent, LogQuery, RawLog};
