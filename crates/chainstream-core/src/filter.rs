//! Filter resolver: turns a listener's raw filter and options JSON into a
//! validated, canonical subscription.
//!
//! Resolution is pure: no RPC calls, no shared state. The same input (modulo
//! JSON key order and whitespace) always yields byte-identical output, so the
//! resolved signature can be used to compare listeners.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiny_keccak::{Hasher, Keccak};

use crate::abi::{EventFragment, MethodFragment};
use crate::error::StreamError;

/// A validated `address + event` filter, ready for matching raw logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFilter {
    /// Contract address, lowercase `0x`-hex.
    pub address: String,
    /// The event ABI the filter was built from.
    pub event: EventFragment,
    /// `Name(type1,...)`.
    pub event_signature: String,
    /// `address:Name(type1,...)`.
    pub signature: String,
    /// keccak256 of `event_signature`, lowercase `0x`-hex.
    pub topic0: String,
    /// Number of indexed parameters (topics after topic0).
    pub indexed_count: usize,
}

impl ResolvedFilter {
    /// Returns `true` if a log with this address and topics was emitted by
    /// the filtered event.
    ///
    /// The topic count is checked as well as topic0: events that share a
    /// signature but index different parameters (ERC-20 vs ERC-721
    /// `Transfer`) have different layouts.
    pub fn matches(&self, address: &str, topics: &[String]) -> bool {
        address.eq_ignore_ascii_case(&self.address)
            && topics.len() == self.indexed_count + 1
            && topics[0].eq_ignore_ascii_case(&self.topic0)
    }
}

/// Method ABIs supplied through a listener's `options`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<MethodFragment>,
}

/// Output of [`verify_options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedOptions {
    pub filters: Vec<ResolvedFilter>,
    pub options: ResolvedOptions,
    /// Canonical JSON of `options`.
    pub resolved_options: String,
    /// `;`-joined filter signatures, in filter order.
    pub resolved_signature: String,
}

#[derive(Deserialize)]
struct FilterDoc {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    event: Option<EventFragment>,
}

#[derive(Deserialize)]
struct OptionsDoc {
    #[serde(default)]
    methods: Option<Vec<MethodFragment>>,
}

/// Validate a listener's filters and options.
///
/// JSON syntax is checked for every filter and then the options before any
/// semantic validation, so a syntax error always wins. Options syntax errors
/// share the filters' `MalformedInput` kind.
pub fn verify_options<S: AsRef<str>>(
    filters: &[S],
    options: Option<&str>,
) -> Result<VerifiedOptions, StreamError> {
    let filter_values = filters
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            serde_json::from_str::<Value>(raw.as_ref())
                .map_err(|e| StreamError::malformed(format!("filters[{i}]"), &e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let options_value = options
        .map(|raw| {
            serde_json::from_str::<Value>(raw).map_err(|e| StreamError::malformed("options", &e))
        })
        .transpose()?;

    if filter_values.is_empty() {
        return Err(StreamError::invalid("at least one filter is required"));
    }

    let filters = filter_values
        .into_iter()
        .enumerate()
        .map(|(i, v)| resolve_filter(i, v))
        .collect::<Result<Vec<_>, _>>()?;

    let options = match options_value {
        Some(v) => resolve_options(v)?,
        None => ResolvedOptions::default(),
    };

    let resolved_options = serde_json::to_string(&options)
        .map_err(|e| StreamError::invalid(format!("options cannot be serialized: {e}")))?;
    let resolved_signature = filters
        .iter()
        .map(|f| f.signature.as_str())
        .collect::<Vec<_>>()
        .join(";");

    Ok(VerifiedOptions {
        filters,
        options,
        resolved_options,
        resolved_signature,
    })
}

fn resolve_filter(index: usize, value: Value) -> Result<ResolvedFilter, StreamError> {
    let doc: FilterDoc = serde_json::from_value(value)
        .map_err(|e| StreamError::invalid(format!("filters[{index}]: {e}")))?;

    let address = doc
        .address
        .ok_or_else(|| StreamError::invalid(format!("filters[{index}] has no address")))?;
    let address = normalize_address(&address)?;

    let event = doc
        .event
        .ok_or_else(|| StreamError::invalid(format!("filters[{index}] has no event")))?;
    let event_signature = event.canonical_signature()?;

    Ok(ResolvedFilter {
        signature: format!("{address}:{event_signature}"),
        topic0: keccak256_hex(&event_signature),
        indexed_count: event.indexed_count(),
        address,
        event,
        event_signature,
    })
}

fn resolve_options(value: Value) -> Result<ResolvedOptions, StreamError> {
    let doc: OptionsDoc = serde_json::from_value(value)
        .map_err(|e| StreamError::invalid(format!("options: {e}")))?;
    let methods = doc
        .methods
        .ok_or_else(|| StreamError::invalid("options must contain a 'methods' list"))?
        .into_iter()
        .map(MethodFragment::normalize)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResolvedOptions { methods })
}

/// Lowercase a 20-byte hex address, with or without the `0x` prefix.
pub fn normalize_address(address: &str) -> Result<String, StreamError> {
    let trimmed = address.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StreamError::invalid(format!(
            "'{address}' is not a 20-byte hex address"
        )));
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}

/// keccak256 of a signature string, lowercase `0x`-hex.
pub fn keccak256_hex(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}
