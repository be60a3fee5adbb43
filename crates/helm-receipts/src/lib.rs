//! The receipt DAG: envelope types, the closed meaningful-actions set, the
//! emitter with its panic-sink discipline, and payload-commitment helpers.

pub mod emitter;
pub mod envelope;
pub mod panic_sink;

pub use emitter::{codes, FsReceiptSink, ReceiptDraft, ReceiptEmitError, ReceiptEmitter, ReceiptSink};
pub use envelope::{payload_commitment, verify_payload_commitment, ActionType, EffectClass, ReceiptEnvelope};
pub use panic_sink::PanicRecord;

/// Stable error codes shared across crates (chain / replay / tenant /
/// budget families from `spec.md` §7), collected here because the receipt
/// envelope is their common reference point.
pub mod shared_codes {
    pub const RECEIPT_CHAIN_BROKEN: &str = "RECEIPT_CHAIN_BROKEN";
    pub const RECEIPT_DAG_BROKEN: &str = "RECEIPT_DAG_BROKEN";
    pub const SIGNATURE_INVALID: &str = "SIGNATURE_INVALID";
    pub const PAYLOAD_COMMITMENT_MISMATCH: &str = "PAYLOAD_COMMITMENT_MISMATCH";
    pub const RECEIPT_EMISSION_PANIC: &str = "RECEIPT_EMISSION_PANIC";
    pub const REPLAY_HASH_DIVERGENCE: &str = "REPLAY_HASH_DIVERGENCE";
    pub const REPLAY_TAPE_MISS: &str = "REPLAY_TAPE_MISS";
    pub const LAMPORT_NOT_MONOTONIC: &str = "LAMPORT_NOT_MONOTONIC";
    pub const BUDGET_EXHAUSTED: &str = "BUDGET_EXHAUSTED";
    pub const CONTAINMENT_NOT_TRIGGERED: &str = "CONTAINMENT_NOT_TRIGGERED";
    pub const TENANT_ISOLATION_VIOLATION: &str = "TENANT_ISOLATION_VIOLATION";
    pub const TENANT_ID_MISSING: &str = "TENANT_ID_MISSING";
    pub const ENVELOPE_NOT_BOUND: &str = "ENVELOPE_NOT_BOUND";
    pub const ENVELOPE_NOT_ENFORCED: &str = "ENVELOPE_NOT_ENFORCED";
    pub const ENVELOPE_DENIAL_NO_RECEIPT: &str = "ENVELOPE_DENIAL_NO_RECEIPT";
    pub const POLICY_DECISION_MISSING: &str = "POLICY_DECISION_MISSING";
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use helm_trust::{TrustEvent, TrustEventType, TrustRegistry};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn draft(run_id: &str, tenant: &str, ts: u64, action: ActionType) -> ReceiptDraft {
        ReceiptDraft {
            run_id: run_id.into(),
            tenant_id: tenant.into(),
            timestamp_virtual: ts,
            schema_version: "1".into(),
            policy_version: "1".into(),
            policy_hash: "sha256:abc".into(),
            envelope_id: "env1".into(),
            envelope_hash: "sha256:envhash".into(),
            jurisdiction: "US".into(),
            actor: "agent1".into(),
            action_type: action,
            effect_class: EffectClass::E1,
            effect_type: "read".into(),
            decision_id: Some("d1".into()),
            intent_id: None,
            effect_digest_hash: None,
            capability_ref: None,
            budget_snapshot_ref: None,
            tool_name: None,
            tool_manifest_hash: None,
            tape_ref: None,
            phenotype_hash: "sha256:phen".into(),
            parent_receipt_hashes: None,
            payload: serde_json::json!({"hello": "world"}),
            payload_salt: vec![1, 2, 3],
        }
    }

    async fn setup() -> (Arc<TrustRegistry>, SigningKey, tempfile::TempDir) {
        let trust = Arc::new(TrustRegistry::new());
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        trust
            .apply(TrustEvent {
                event_type: TrustEventType::KeyAdded,
                tenant_id: "t1".into(),
                key_id: "k1".into(),
                public_key: Some(signing_key.verifying_key().to_bytes()),
                lamport: 1,
            })
            .await
            .unwrap();
        let dir = tempdir().unwrap();
        (trust, signing_key, dir)
    }

    #[tokio::test]
    async fn first_receipt_chains_to_genesis() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust);
        let r = emitter
            .emit(draft("run1", "t1", 1, ActionType::PolicyDecision), "k1", &key)
            .await
            .unwrap();
        assert_eq!(r.seq, 1);
        assert_eq!(r.parent_receipt_hashes, vec!["genesis".to_string()]);
    }

    #[tokio::test]
    async fn seq_is_strictly_monotonic_and_chains() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust);
        let r1 = emitter
            .emit(draft("run1", "t1", 1, ActionType::PolicyDecision), "k1", &key)
            .await
            .unwrap();
        let r2 = emitter
            .emit(draft("run1", "t1", 2, ActionType::EffectAttempt), "k1", &key)
            .await
            .unwrap();
        assert_eq!(r2.seq, 2);
        assert_eq!(r2.parent_receipt_hashes, vec![r1.receipt_hash.clone()]);
    }

    #[tokio::test]
    async fn tenant_mismatch_within_run_is_rejected() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust);
        emitter
            .emit(draft("run1", "t1", 1, ActionType::PolicyDecision), "k1", &key)
            .await
            .unwrap();
        let err = emitter
            .emit(draft("run1", "other-tenant", 2, ActionType::PolicyDecision), "k1", &key)
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptEmitError::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn tool_call_without_tool_fields_is_rejected() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust);
        let err = emitter
            .emit(draft("run1", "t1", 1, ActionType::ToolCall), "k1", &key)
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptEmitError::ToolFieldsMissing { .. }));
    }

    #[tokio::test]
    async fn unauthorized_key_is_rejected() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust);
        let err = emitter
            .emit(draft("run1", "t1", 1, ActionType::PolicyDecision), "unknown-key", &key)
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptEmitError::KeyNotAuthorized { .. }));
    }

    #[tokio::test]
    async fn explicit_fork_is_rejected() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust);
        let r1 = emitter
            .emit(draft("run1", "t1", 1, ActionType::PolicyDecision), "k1", &key)
            .await
            .unwrap();
        let mut d2 = draft("run1", "t1", 2, ActionType::EffectAttempt);
        d2.parent_receipt_hashes = Some(vec![r1.receipt_hash.clone()]);
        emitter.emit(d2, "k1", &key).await.unwrap();

        let mut d3 = draft("run1", "t1", 3, ActionType::EffectAttempt);
        d3.parent_receipt_hashes = Some(vec![r1.receipt_hash.clone()]);
        let err = emitter.emit(d3, "k1", &key).await.unwrap_err();
        assert!(matches!(err, ReceiptEmitError::ParentForked(_)));
    }

    #[tokio::test]
    async fn payload_commitment_round_trips() {
        let payload = serde_json::json!({"a": 1});
        let salt = b"salty".to_vec();
        let commitment = payload_commitment(&salt, &payload).unwrap();
        assert!(verify_payload_commitment(&salt, &payload, &commitment));
        assert!(!verify_payload_commitment(&salt, &serde_json::json!({"a": 2}), &commitment));
    }

    #[tokio::test]
    async fn signature_verifies_against_authorized_key() {
        let (trust, key, dir) = setup().await;
        let sink = FsReceiptSink::new(dir.path());
        let emitter = ReceiptEmitter::new(sink, trust.clone());
        let r = emitter
            .emit(draft("run1", "t1", 1, ActionType::PolicyDecision), "k1", &key)
            .await
            .unwrap();
        let sig_bytes = hex::decode(&r.signature).unwrap();
        let sig = ed25519_dalek::Signature::from_slice(&sig_bytes).unwrap();
        assert!(trust
            .verify_with_authorized_key("t1", "k1", r.receipt_hash.as_bytes(), &sig)
            .await);
    }
}
