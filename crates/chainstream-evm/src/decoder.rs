//! Decodes a matched raw log into JSON using the filter's event ABI.

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use serde_json::{Map, Value};
use thiserror::Error;

use chainstream_core::abi::{canonical_type, AbiParameter};
use chainstream_core::{Checkpoint, EventData, RawLog, ResolvedFilter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: String, reason: String },

    #[error("log has no topic {index}")]
    MissingTopic { index: usize },

    #[error("unsupported ABI type '{ty}': {reason}")]
    UnsupportedType { ty: String, reason: String },

    #[error("ABI decode failed: {reason}")]
    AbiDecodeFailed { reason: String },
}

/// Build the consumer-facing event for a log matched by `filter`.
pub fn decode_event(
    filter: &ResolvedFilter,
    log: &RawLog,
    position: Checkpoint,
) -> Result<EventData, DecodeError> {
    Ok(EventData {
        address: log.address.to_ascii_lowercase(),
        block_number: position.block,
        block_hash: log.block_hash.clone().unwrap_or_default(),
        transaction_hash: log.transaction_hash.clone().unwrap_or_default(),
        transaction_index: position.transaction_index,
        log_index: position.log_index,
        signature: filter.signature.clone(),
        data: decode_params(&filter.event.inputs, &log.topics, &log.data)?,
    })
}

/// Decode event parameters: indexed ones from `topics[1..]`, the rest from
/// `data`. Unnamed parameters are keyed `argN` by declaration position.
pub fn decode_params(
    inputs: &[AbiParameter],
    topics: &[String],
    data: &str,
) -> Result<Value, DecodeError> {
    let mut out = Map::new();

    let mut topic_idx = 1;
    let mut data_params = Vec::new();
    for (pos, param) in inputs.iter().enumerate() {
        let key = if param.name.is_empty() {
            format!("arg{pos}")
        } else {
            param.name.clone()
        };
        if param.indexed {
            let topic = topics
                .get(topic_idx)
                .ok_or(DecodeError::MissingTopic { index: topic_idx })?;
            out.insert(key, decode_topic(param, topic)?);
            topic_idx += 1;
        } else {
            data_params.push((key, param));
        }
    }

    if !data_params.is_empty() {
        let types = data_params
            .iter()
            .map(|(_, p)| dyn_type(p))
            .collect::<Result<Vec<_>, _>>()?;
        let bytes = decode_hex("data", data)?;
        let decoded = DynSolType::Tuple(types)
            .abi_decode_params(&bytes)
            .map_err(|e| DecodeError::AbiDecodeFailed {
                reason: e.to_string(),
            })?;
        let values = match decoded {
            DynSolValue::Tuple(vals) => vals,
            other => vec![other],
        };
        for ((key, param), val) in data_params.into_iter().zip(values) {
            out.insert(key, to_json(val, &param.components));
        }
    }

    Ok(Value::Object(out))
}

/// Indexed value types are stored padded in the topic. Reference types
/// (string, bytes, arrays, tuples) are stored as their keccak hash, which is
/// returned as-is.
fn decode_topic(param: &AbiParameter, topic: &str) -> Result<Value, DecodeError> {
    let ty = dyn_type(param)?;
    let bytes = decode_hex("topic", topic)?;
    match ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(Value::String(format!("0x{}", hex::encode(bytes)))),
        value_type => {
            let val = value_type
                .abi_decode(&bytes)
                .map_err(|e| DecodeError::AbiDecodeFailed {
                    reason: format!("topic decode: {e}"),
                })?;
            Ok(to_json(val, &param.components))
        }
    }
}

fn dyn_type(param: &AbiParameter) -> Result<DynSolType, DecodeError> {
    let unsupported = |reason: String| DecodeError::UnsupportedType {
        ty: param.ty.clone(),
        reason,
    };
    let canonical = canonical_type(param).map_err(|e| unsupported(e.to_string()))?;
    DynSolType::parse(&canonical).map_err(|e| unsupported(e.to_string()))
}

fn decode_hex(field: &str, s: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| DecodeError::InvalidHex {
        field: field.into(),
        reason: e.to_string(),
    })
}

/// Render a decoded value: integers as decimal strings, bytes and addresses
/// as lowercase hex, tuples as objects keyed by component name.
fn to_json(val: DynSolValue, components: &[AbiParameter]) -> Value {
    match val {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..size])))
        }
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Address(a) => Value::String(format!("0x{}", hex::encode(a.as_slice()))),
        DynSolValue::Function(f) => Value::String(format!("0x{}", hex::encode(f.as_slice()))),
        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) => Value::Array(
            vals.into_iter()
                .map(|v| to_json(v, components))
                .collect(),
        ),
        DynSolValue::Tuple(vals) => {
            let mut obj = Map::new();
            for (i, v) in vals.into_iter().enumerate() {
                let field = components.get(i);
                let key = match field {
                    Some(c) if !c.name.is_empty() => c.name.clone(),
                    _ => format!("arg{i}"),
                };
                let nested = field.map(|c| c.components.as_slice()).unwrap_or(&[]);
                obj.insert(key, to_json(v, nested));
            }
            Value::Object(obj)
        }
        // Only reachable with alloy's eip712 feature enabled elsewhere in the graph.
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
