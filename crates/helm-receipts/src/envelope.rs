//! The receipt envelope: the unit of the proof DAG, and the closed set of
//! "meaningful actions" that must produce one.

use serde::{Deserialize, Serialize};

/// The closed set of action types that MUST produce a receipt. Closed by
/// construction: there is no "other" variant, so `I7` (action_type must be
/// a member of this set) holds for free once a value of this type exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    PolicyDecision,
    BoundaryDecision,
    ToolCall,
    ConnectorCall,
    SchemaValidation,
    ApprovalAction,
    BudgetDecrement,
    BudgetExhausted,
    ContainmentTransition,
    PackInstall,
    PackUpgrade,
    PackRollback,
    EffectAttempt,
    EffectDenied,
    EnvelopeBind,
    EnvelopeUnbind,
    KeyRotation,
    IncidentOpen,
    IncidentClose,
    A2aSessionOpen,
    A2aSessionClose,
    ReceiptEmissionPanic,
}

impl ActionType {
    /// `tool_name`/`tool_manifest_hash` are required (I8) exactly for these.
    pub fn requires_tool_fields(self) -> bool {
        matches!(self, ActionType::ToolCall | ActionType::ConnectorCall)
    }
}

/// Effect finality class. `E4`/`E5` are "high finality" and require an
/// approval per I7 of `spec.md` §8 and ADV-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectClass {
    E1,
    E2,
    E3,
    E4,
    E5,
}

impl EffectClass {
    pub fn is_high_finality(self) -> bool {
        matches!(self, EffectClass::E4 | EffectClass::E5)
    }
}

/// The receipt envelope. Every hash in this struct is `sha256:`-prefixed hex
/// produced by `helm-canon`; `signature` is hex-encoded Ed25519 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEnvelope {
    pub run_id: String,
    pub seq: u64,
    pub tenant_id: String,
    pub timestamp_virtual: u64,
    pub schema_version: String,
    pub policy_version: String,
    pub policy_hash: String,
    pub envelope_id: String,
    pub envelope_hash: String,
    pub jurisdiction: String,
    pub actor: String,
    pub action_type: ActionType,
    pub effect_class: EffectClass,
    pub effect_type: String,
    pub decision_id: Option<String>,
    pub intent_id: Option<String>,
    pub effect_digest_hash: Option<String>,
    pub capability_ref: Option<String>,
    pub budget_snapshot_ref: Option<String>,
    pub tool_name: Option<String>,
    pub tool_manifest_hash: Option<String>,
    pub tape_ref: Option<String>,
    pub phenotype_hash: String,
    pub parent_receipt_hashes: Vec<String>,
    pub receipt_hash: String,
    pub signature: String,
    pub payload_commitment: String,
}

impl ReceiptEnvelope {
    /// Canonical hash of this envelope with `signature` and `receipt_hash`
    /// themselves excluded — this is what gets signed.
    pub fn hashable_bytes(&self) -> Result<Vec<u8>, helm_canon::CanonError> {
        let mut value = serde_json::to_value(self).expect("ReceiptEnvelope always serializes");
        let obj = value.as_object_mut().expect("struct serializes to object");
        obj.remove("signature");
        obj.remove("receipt_hash");
        helm_canon::to_jcs_bytes(&value)
    }
}

/// `sha256(salt || canonical_payload_bytes)`, `sha256:`-prefixed hex (I13).
pub fn payload_commitment(
    salt: &[u8],
    payload: &serde_json::Value,
) -> Result<String, helm_canon::CanonError> {
    let canonical = helm_canon::to_jcs_bytes(payload)?;
    let mut combined = Vec::with_capacity(salt.len() + canonical.len());
    combined.extend_from_slice(salt);
    combined.extend_from_slice(&canonical);
    Ok(helm_canon::sha256_hex(&combined))
}

/// Verify a payload commitment (the round-trip law of `spec.md` §8).
pub fn verify_payload_commitment(
    salt: &[u8],
    payload: &serde_json::Value,
    commitment: &str,
) -> bool {
    payload_commitment(salt, payload)
        .map(|c| c == commitment)
        .unwrap_or(false)
}
