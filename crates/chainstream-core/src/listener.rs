//! Listener model: one subscription (filters + options + start position)
//! inside a stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::StreamError;
use crate::filter::{verify_options, ResolvedFilter, ResolvedOptions};

/// Where a listener without an explicit checkpoint starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FromBlock {
    /// Genesis.
    Earliest,
    /// The chain head at the time the poller first observes it.
    #[default]
    Latest,
    Number(i64),
}

impl FromBlock {
    /// The implicit checkpoint for this start position, or `None` for
    /// `Latest`, which is only known once the head has been read.
    pub fn initial_checkpoint(&self) -> Option<Checkpoint> {
        match self {
            Self::Earliest => Some(Checkpoint::before_block(0)),
            Self::Latest => None,
            Self::Number(n) => Some(Checkpoint::before_block(*n)),
        }
    }
}

impl FromStr for FromBlock {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" | "latest" => Ok(Self::Latest),
            "earliest" => Ok(Self::Earliest),
            _ => {
                let parsed = match s.strip_prefix("0x") {
                    Some(hex) => i64::from_str_radix(hex, 16).ok(),
                    None => s.parse::<i64>().ok(),
                };
                match parsed {
                    Some(n) if n >= 0 => Ok(Self::Number(n)),
                    _ => Err(StreamError::invalid(format!(
                        "fromBlock '{s}' is not a block number, 'earliest' or 'latest'"
                    ))),
                }
            }
        }
    }
}

impl fmt::Display for FromBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Raw, unvalidated listener options as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerOptions {
    /// `"latest"`, `"earliest"` or a block number. Absent means latest.
    #[serde(default)]
    pub from_block: Option<String>,
    /// One JSON document per filter: `{"address": .., "event": {..}}`.
    #[serde(default)]
    pub filters: Vec<String>,
    /// JSON document `{"methods": [..]}`.
    #[serde(default)]
    pub options: Option<String>,
}

/// A request to add a listener to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAddRequest {
    pub stream_id: Uuid,
    pub listener_id: Uuid,
    pub name: String,
    pub options: ListenerOptions,
    /// Resume point from a previous run. Overrides `from_block`.
    pub checkpoint: Option<Checkpoint>,
}

/// A validated listener owned by a stream's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub id: Uuid,
    pub stream_id: Uuid,
    pub name: String,
    pub from_block: FromBlock,
    pub filters: Vec<ResolvedFilter>,
    pub options: ResolvedOptions,
    pub resolved_options: String,
    pub resolved_signature: String,
    /// `None` until a `latest` listener has seen the chain head.
    pub checkpoint: Option<Checkpoint>,
}

impl Listener {
    /// Validate an add request and build the listener.
    pub fn resolve(req: ListenerAddRequest) -> Result<Self, StreamError> {
        let verified = verify_options(&req.options.filters, req.options.options.as_deref())?;
        let from_block = match req.options.from_block.as_deref() {
            Some(raw) => raw.parse()?,
            None => FromBlock::Latest,
        };
        let checkpoint = req.checkpoint.or_else(|| from_block.initial_checkpoint());

        Ok(Self {
            id: req.listener_id,
            stream_id: req.stream_id,
            name: req.name,
            from_block,
            filters: verified.filters,
            options: verified.options,
            resolved_options: verified.resolved_options,
            resolved_signature: verified.resolved_signature,
            checkpoint,
        })
    }

    /// The first filter matching a log, if any.
    pub fn matching_filter(&self, address: &str, topics: &[String]) -> Option<&ResolvedFilter> {
        self.filters.iter().find(|f| f.matches(address, topics))
    }

    /// Distinct contract addresses across all filters, in filter order.
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for f in &self.filters {
            if !out.contains(&f.address) {
                out.push(f.address.clone());
            }
        }
        out
    }

    /// Distinct topic0 values across all filters, in filter order.
    pub fn topic0s(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for f in &self.filters {
            if !out.contains(&f.topic0) {
                out.push(f.topic0.clone());
            }
        }
        out
    }
}
