//! Tool manifest model and the PEP-boundary argument validator: schema
//! check plus canonical-hash of tool call arguments before anything is
//! allowed to reach an executor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codes {
    pub const ERR_TOOL_ARGS_UNKNOWN_FIELD: &str = "ERR_TOOL_ARGS_UNKNOWN_FIELD";
    pub const ERR_TOOL_ARGS_MISSING_REQUIRED: &str = "ERR_TOOL_ARGS_MISSING_REQUIRED";
    pub const ERR_TOOL_ARGS_TYPE_MISMATCH: &str = "ERR_TOOL_ARGS_TYPE_MISMATCH";
    pub const ERR_TOOL_ARGS_CANONICALIZATION_FAILED: &str = "ERR_TOOL_ARGS_CANONICALIZATION_FAILED";
    pub const ERR_TOOL_MANIFEST_UNSIGNED: &str = "ERR_TOOL_MANIFEST_UNSIGNED";
}

#[derive(Debug, Error)]
pub enum ToolArgsError {
    #[error("{code}: args must be a JSON object", code = codes::ERR_TOOL_ARGS_TYPE_MISMATCH)]
    NotAnObject,
    #[error("{code}: unknown field '{field}'", code = codes::ERR_TOOL_ARGS_UNKNOWN_FIELD)]
    UnknownField { field: String },
    #[error("{code}: missing required field '{field}'", code = codes::ERR_TOOL_ARGS_MISSING_REQUIRED)]
    MissingRequired { field: String },
    #[error(
        "{code}: field '{field}' expected {expected:?}, got {actual}",
        code = codes::ERR_TOOL_ARGS_TYPE_MISMATCH
    )]
    TypeMismatch {
        field: String,
        expected: FieldType,
        actual: &'static str,
    },
    #[error("{code}: {0}", code = codes::ERR_TOOL_ARGS_CANONICALIZATION_FAILED)]
    CanonicalizationFailed(String),
}

#[derive(Debug, Error)]
pub enum ToolManifestError {
    #[error("{code}: tool manifest must carry at least one signature", code = codes::ERR_TOOL_MANIFEST_UNSIGNED)]
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// The schema/capability/signature contract a tool declares, checked at the
/// PEP boundary before every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub tool_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub side_effect_classes: Vec<String>,
    pub data_classes_in: Vec<String>,
    pub data_classes_out: Vec<String>,
    pub network_scopes: Vec<String>,
    pub fs_scopes: Vec<String>,
    pub required_approvals: Vec<String>,
    pub schemas: HashMap<String, FieldSchema>,
    #[serde(default)]
    pub allow_extra: bool,
    pub signatures: Vec<String>,
}

impl ToolManifest {
    /// Invariant I14: a manifest's `signatures` must be non-empty.
    pub fn validate(&self) -> Result<(), ToolManifestError> {
        if self.signatures.is_empty() {
            return Err(ToolManifestError::Unsigned);
        }
        Ok(())
    }

    /// `sha256:`-prefixed canonical hash of this manifest, used as
    /// `tool_manifest_hash` on receipts.
    pub fn manifest_hash(&self) -> Result<String, helm_canon::CanonError> {
        helm_canon::canonical_hash(self)
    }
}

pub struct ValidatedArgs {
    pub canonical_bytes: Vec<u8>,
    pub args_hash: String,
}

/// Validate `args` against `manifest.schemas`, then canonicalize.
pub fn validate_args(manifest: &ToolManifest, args: &serde_json::Value) -> Result<ValidatedArgs, ToolArgsError> {
    let map = args.as_object().ok_or(ToolArgsError::NotAnObject)?;

    for (field, schema) in &manifest.schemas {
        if schema.required && !map.contains_key(field) {
            return Err(ToolArgsError::MissingRequired {
                field: field.clone(),
            });
        }
    }

    for (field, value) in map {
        let schema = manifest.schemas.get(field);
        match schema {
            None if !manifest.allow_extra => {
                return Err(ToolArgsError::UnknownField {
                    field: field.clone(),
                })
            }
            None => {}
            Some(schema) if !schema.field_type.matches(value) => {
                return Err(ToolArgsError::TypeMismatch {
                    field: field.clone(),
                    expected: schema.field_type,
                    actual: type_name(value),
                })
            }
            Some(_) => {}
        }
    }

    let canonical_bytes = helm_canon::to_jcs_bytes(args)
        .map_err(|e| ToolArgsError::CanonicalizationFailed(e.to_string()))?;
    let args_hash = helm_canon::sha256_hex(&canonical_bytes);

    Ok(ValidatedArgs {
        canonical_bytes,
        args_hash,
    })
}
