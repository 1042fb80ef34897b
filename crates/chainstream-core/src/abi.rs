//! ABI JSON fragments accepted in listener filters and options.
//!
//! These mirror the standard Ethereum ABI JSON format closely enough to
//! validate a fragment and re-serialize it with a stable field order.
//! Unknown fields are dropped on the way through.

use alloy_core::dyn_abi::DynSolType;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// A single ABI parameter (event input, function input or output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiParameter {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParameter>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub indexed: bool,
}

/// An `"type": "event"` fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFragment {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParameter>,
    #[serde(default)]
    pub anonymous: bool,
}

/// A `"type": "function"` fragment, serialized in canonical field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodFragment {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_mutability: Option<String>,
    #[serde(default)]
    pub inputs: Vec<AbiParameter>,
    #[serde(default)]
    pub outputs: Vec<AbiParameter>,
    // Pre-0.4.16 compilers emit these instead of `stateMutability`.
    #[serde(default, skip_serializing)]
    pub constant: Option<bool>,
    #[serde(default, skip_serializing)]
    pub payable: Option<bool>,
}

fn function_kind() -> String {
    "function".into()
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl EventFragment {
    /// Validate the fragment and return its canonical `Name(type1,...)` form.
    pub fn canonical_signature(&self) -> Result<String, StreamError> {
        if let Some(kind) = &self.kind {
            if kind != "event" {
                return Err(StreamError::invalid(format!(
                    "expected an event ABI fragment, got type '{kind}'"
                )));
            }
        }
        if self.name.trim().is_empty() {
            return Err(StreamError::invalid("event ABI fragment has no name"));
        }
        if self.anonymous {
            return Err(StreamError::invalid(format!(
                "anonymous event '{}' cannot be matched by topic",
                self.name
            )));
        }
        let types = canonical_types(&self.inputs)?;
        Ok(format!("{}({})", self.name, types.join(",")))
    }

    /// Number of parameters carried in topics rather than data.
    pub fn indexed_count(&self) -> usize {
        self.inputs.iter().filter(|p| p.indexed).count()
    }
}

impl MethodFragment {
    /// Validate the fragment and fold legacy mutability flags into
    /// `stateMutability`.
    pub fn normalize(mut self) -> Result<Self, StreamError> {
        if self.kind != "function" {
            return Err(StreamError::invalid(format!(
                "expected a function ABI fragment in options.methods, got type '{}'",
                self.kind
            )));
        }
        if self.name.trim().is_empty() {
            return Err(StreamError::invalid("method ABI fragment has no name"));
        }
        canonical_types(&self.inputs)?;
        canonical_types(&self.outputs)?;
        if self.state_mutability.is_none() && (self.constant.is_some() || self.payable.is_some()) {
            let mutability = if self.payable == Some(true) {
                "payable"
            } else if self.constant == Some(true) {
                "view"
            } else {
                "nonpayable"
            };
            self.state_mutability = Some(mutability.into());
        }
        Ok(self)
    }
}

/// Canonical type strings for a parameter list, in declaration order.
pub fn canonical_types(params: &[AbiParameter]) -> Result<Vec<String>, StreamError> {
    params.iter().map(canonical_type).collect()
}

/// The canonical Solidity type of one parameter.
///
/// `uint`/`int` widen to 256 bits and tuples expand from their components,
/// keeping any array suffix (`tuple[2]` → `(uint256,address)[2]`).
pub fn canonical_type(param: &AbiParameter) -> Result<String, StreamError> {
    let ty = param.ty.trim();
    if ty.is_empty() {
        return Err(StreamError::invalid(format!(
            "parameter '{}' has no type",
            param.name
        )));
    }

    let canonical = if let Some(suffix) = ty.strip_prefix("tuple") {
        if param.components.is_empty() {
            return Err(StreamError::invalid(format!(
                "tuple parameter '{}' has no components",
                param.name
            )));
        }
        format!("({}){suffix}", canonical_types(&param.components)?.join(","))
    } else {
        widen_elementary(ty)
    };

    DynSolType::parse(&canonical).map_err(|e| {
        StreamError::invalid(format!("unsupported type '{}' for '{}': {e}", param.ty, param.name))
    })?;
    Ok(canonical)
}

fn widen_elementary(ty: &str) -> String {
    let split = ty.find('[').unwrap_or(ty.len());
    let (base, suffix) = ty.split_at(split);
    let base = match base {
        "uint" => "uint256",
        "int" => "int256",
        other => other,
    };
    format!("{base}{suffix}")
}
