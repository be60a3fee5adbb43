//! The receipt emitter: assigns monotonic `seq`, picks DAG parents, signs,
//! and persists — or halts the run and writes a [`PanicRecord`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::envelope::{payload_commitment, ActionType, EffectClass, ReceiptEnvelope};
use crate::panic_sink::{self, PanicRecord};
use helm_trust::TrustRegistry;

pub mod codes {
    pub const ERR_TENANT_ID_MISSING: &str = "TENANT_ID_MISSING";
    pub const ERR_TENANT_MISMATCH: &str = "TENANT_ISOLATION_VIOLATION";
    pub const ERR_TIMESTAMP_NOT_MONOTONIC: &str = "ERR_TIMESTAMP_NOT_MONOTONIC";
    pub const ERR_ENVELOPE_BINDING_MISSING: &str = "ENVELOPE_NOT_BOUND";
    pub const ERR_TOOL_FIELDS_MISSING: &str = "ERR_TOOL_FIELDS_MISSING";
    pub const ERR_PARENT_UNRESOLVED: &str = "RECEIPT_CHAIN_BROKEN";
    pub const ERR_PARENT_FORKED: &str = "RECEIPT_DAG_BROKEN";
    pub const ERR_SIGNATURE_KEY_NOT_AUTHORIZED: &str = "SIGNATURE_INVALID";
    pub const ERR_RECEIPT_EMISSION_PANIC: &str = "RECEIPT_EMISSION_PANIC";
}

#[derive(Debug, Error)]
pub enum ReceiptEmitError {
    #[error("{code}: tenant_id must not be empty", code = codes::ERR_TENANT_ID_MISSING)]
    TenantEmpty,
    #[error("{code}: run already bound to tenant '{expected}', got '{actual}'", code = codes::ERR_TENANT_MISMATCH)]
    TenantMismatch { expected: String, actual: String },
    #[error("{code}: timestamp_virtual {value} precedes last recorded {last}", code = codes::ERR_TIMESTAMP_NOT_MONOTONIC)]
    TimestampNotMonotonic { value: u64, last: u64 },
    #[error("{code}: envelope_id/envelope_hash/jurisdiction are all required", code = codes::ERR_ENVELOPE_BINDING_MISSING)]
    EnvelopeBindingMissing,
    #[error("{code}: tool_name/tool_manifest_hash required for {action_type:?}", code = codes::ERR_TOOL_FIELDS_MISSING)]
    ToolFieldsMissing { action_type: ActionType },
    #[error("{code}: parent hash '{0}' does not resolve within run", code = codes::ERR_PARENT_UNRESOLVED)]
    ParentUnresolved(String),
    #[error("{code}: parent hash '{0}' already has a child (no forks)", code = codes::ERR_PARENT_FORKED)]
    ParentForked(String),
    #[error("{code}: signing key is not authorized for tenant '{tenant_id}'", code = codes::ERR_SIGNATURE_KEY_NOT_AUTHORIZED)]
    KeyNotAuthorized { tenant_id: String },
    #[error("run {run_id} is halted after a prior emission panic")]
    RunHalted { run_id: String },
    #[error("{code}: {detail}", code = codes::ERR_RECEIPT_EMISSION_PANIC)]
    EmissionPanicked { detail: String },
}

/// Everything the caller supplies about a to-be-emitted receipt, short of
/// bookkeeping the emitter itself owns (`seq`, parents, hash, signature).
pub struct ReceiptDraft {
    pub run_id: String,
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
    /// `None` lets the emitter auto-pick the run's current DAG tip(s).
    pub parent_receipt_hashes: Option<Vec<String>>,
    pub payload: serde_json::Value,
    pub payload_salt: Vec<u8>,
}

pub trait ReceiptSink: Send + Sync {
    fn write_receipt(&self, receipt: &ReceiptEnvelope) -> std::io::Result<()>;
    fn write_panic(&self, record: &PanicRecord) -> std::io::Result<PathBuf>;
}

/// Persists receipts to `<root>/02_PROOFGRAPH/receipts/<hash>.json` and the
/// panic record to `<root>/06_LOGS/receipt_emission_panic.json`.
pub struct FsReceiptSink {
    pub root: PathBuf,
}

impl FsReceiptSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ReceiptSink for FsReceiptSink {
    fn write_receipt(&self, receipt: &ReceiptEnvelope) -> std::io::Result<()> {
        let dir = self.root.join("02_PROOFGRAPH").join("receipts");
        std::fs::create_dir_all(&dir)?;
        let hash_for_filename = receipt.receipt_hash.replace(':', "_");
        let path = dir.join(format!("{hash_for_filename}.json"));
        let bytes = serde_json::to_vec_pretty(receipt).expect("ReceiptEnvelope always serializes");
        std::fs::write(path, bytes)
    }

    fn write_panic(&self, record: &PanicRecord) -> std::io::Result<PathBuf> {
        panic_sink::write_panic_record(&self.root, record)
    }
}

struct RunState {
    tenant_id: String,
    next_seq: u64,
    last_timestamp: u64,
    receipts_by_hash: HashMap<String, ReceiptEnvelope>,
    used_as_parent: HashSet<String>,
    tips: HashSet<String>,
    halted: bool,
    last_good_seq: u64,
}

impl RunState {
    fn new(tenant_id: String) -> Self {
        Self {
            tenant_id,
            next_seq: 1,
            last_timestamp: 0,
            receipts_by_hash: HashMap::new(),
            used_as_parent: HashSet::new(),
            tips: HashSet::new(),
            halted: false,
            last_good_seq: 0,
        }
    }
}

pub struct ReceiptEmitter<S: ReceiptSink> {
    sink: S,
    trust: Arc<TrustRegistry>,
    runs: Mutex<HashMap<String, RunState>>,
}

impl<S: ReceiptSink> ReceiptEmitter<S> {
    pub fn new(sink: S, trust: Arc<TrustRegistry>) -> Self {
        Self {
            sink,
            trust,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Build, chain, sign, and persist one receipt. This is the single
    /// serialization point per run (`spec.md` §5): the whole operation runs
    /// under one lock so `seq` is strictly monotonic.
    pub async fn emit(
        &self,
        draft: ReceiptDraft,
        key_id: &str,
        signing_key: &SigningKey,
    ) -> Result<ReceiptEnvelope, ReceiptEmitError> {
        if draft.tenant_id.is_empty() {
            return Err(ReceiptEmitError::TenantEmpty);
        }
        if draft.envelope_id.is_empty() || draft.envelope_hash.is_empty() || draft.jurisdiction.is_empty() {
            return Err(ReceiptEmitError::EnvelopeBindingMissing);
        }
        if draft.action_type.requires_tool_fields()
            && (draft.tool_name.is_none() || draft.tool_manifest_hash.is_none())
        {
            return Err(ReceiptEmitError::ToolFieldsMissing {
                action_type: draft.action_type,
            });
        }

        let mut runs = self.runs.lock().await;
        let state = runs
            .entry(draft.run_id.clone())
            .or_insert_with(|| RunState::new(draft.tenant_id.clone()));

        if state.halted {
            return Err(ReceiptEmitError::RunHalted {
                run_id: draft.run_id.clone(),
            });
        }
        if state.tenant_id != draft.tenant_id {
            return Err(ReceiptEmitError::TenantMismatch {
                expected: state.tenant_id.clone(),
                actual: draft.tenant_id.clone(),
            });
        }
        if draft.timestamp_virtual < state.last_timestamp {
            return Err(ReceiptEmitError::TimestampNotMonotonic {
                value: draft.timestamp_virtual,
                last: state.last_timestamp,
            });
        }

        let parents = match draft.parent_receipt_hashes.clone() {
            Some(p) => p,
            None if state.receipts_by_hash.is_empty() => vec!["genesis".to_string()],
            None => state.tips.iter().cloned().collect(),
        };
        for parent in &parents {
            if parent != "genesis" && !state.receipts_by_hash.contains_key(parent) {
                return Err(ReceiptEmitError::ParentUnresolved(parent.clone()));
            }
            if state.used_as_parent.contains(parent) {
                return Err(ReceiptEmitError::ParentForked(parent.clone()));
            }
        }

        if !self.trust.is_authorized(&draft.tenant_id, key_id).await {
            return Err(ReceiptEmitError::KeyNotAuthorized {
                tenant_id: draft.tenant_id.clone(),
            });
        }

        let seq = state.next_seq;

        let result = self.build_sign_and_write(&draft, seq, parents.clone(), signing_key);

        match result {
            Ok(receipt) => {
                state.next_seq += 1;
                state.last_timestamp = draft.timestamp_virtual;
                state.last_good_seq = seq;
                for parent in &parents {
                    state.used_as_parent.insert(parent.clone());
                    state.tips.remove(parent);
                }
                state.tips.insert(receipt.receipt_hash.clone());
                state.receipts_by_hash.insert(receipt.receipt_hash.clone(), receipt.clone());
                Ok(receipt)
            }
            Err(detail) => {
                state.halted = true;
                let record = PanicRecord {
                    timestamp: chrono::Utc::now(),
                    run_id: draft.run_id.clone(),
                    tenant_id: draft.tenant_id.clone(),
                    reason: "receipt emission failed".to_string(),
                    last_good_seq: state.last_good_seq,
                    error_detail: detail.clone(),
                };
                if let Err(io_err) = self.sink.write_panic(&record) {
                    tracing::error!(error = %io_err, "failed to write panic record itself");
                }
                tracing::error!(run_id = %draft.run_id, detail, "receipt emission panicked; run halted");
                Err(ReceiptEmitError::EmissionPanicked { detail })
            }
        }
    }

    fn build_sign_and_write(
        &self,
        draft: &ReceiptDraft,
        seq: u64,
        parents: Vec<String>,
        signing_key: &SigningKey,
    ) -> Result<ReceiptEnvelope, String> {
        let commitment = payload_commitment(&draft.payload_salt, &draft.payload)
            .map_err(|e| format!("payload canonicalization failed: {e}"))?;

        let mut receipt = ReceiptEnvelope {
            run_id: draft.run_id.clone(),
            seq,
            tenant_id: draft.tenant_id.clone(),
            timestamp_virtual: draft.timestamp_virtual,
            schema_version: draft.schema_version.clone(),
            policy_version: draft.policy_version.clone(),
            policy_hash: draft.policy_hash.clone(),
            envelope_id: draft.envelope_id.clone(),
            envelope_hash: draft.envelope_hash.clone(),
            jurisdiction: draft.jurisdiction.clone(),
            actor: draft.actor.clone(),
            action_type: draft.action_type,
            effect_class: draft.effect_class,
            effect_type: draft.effect_type.clone(),
            decision_id: draft.decision_id.clone(),
            intent_id: draft.intent_id.clone(),
            effect_digest_hash: draft.effect_digest_hash.clone(),
            capability_ref: draft.capability_ref.clone(),
            budget_snapshot_ref: draft.budget_snapshot_ref.clone(),
            tool_name: draft.tool_name.clone(),
            tool_manifest_hash: draft.tool_manifest_hash.clone(),
            tape_ref: draft.tape_ref.clone(),
            phenotype_hash: draft.phenotype_hash.clone(),
            parent_receipt_hashes: parents,
            receipt_hash: String::new(),
            signature: String::new(),
            payload_commitment: commitment,
        };

        let hashable = receipt
            .hashable_bytes()
            .map_err(|e| format!("envelope canonicalization failed: {e}"))?;
        receipt.receipt_hash = helm_canon::sha256_hex(&hashable);
        let signature = signing_key.sign(receipt.receipt_hash.as_bytes());
        receipt.signature = hex::encode(signature.to_bytes());

        self.sink
            .write_receipt(&receipt)
            .map_err(|e| format!("receipt write failed: {e}"))?;

        Ok(receipt)
    }

    pub async fn last_good_seq(&self, run_id: &str) -> Option<u64> {
        self.runs.lock().await.get(run_id).map(|s| s.last_good_seq)
    }

    pub async fn is_halted(&self, run_id: &str) -> bool {
        self.runs.lock().await.get(run_id).map(|s| s.halted).unwrap_or(false)
    }
}

/// Read a panic record back, for pre-flight checks (`spec.md` §4.14 step 1).
pub fn read_panic_record(evidence_root: &Path) -> std::io::Result<Option<PanicRecord>> {
    panic_sink::read_panic_record(evidence_root)
}
