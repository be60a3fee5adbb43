//! Wires C1-C15 into the request-processing pipeline of `spec.md` §2: rate
//! limiter → policy engine + envelope binder → tool-arg validator →
//! idempotency check → budget accountant → receipt emitter, with the
//! approval bridge and containment controller available as side entry
//! points the embedder calls when a decision needs a human or the process
//! needs to throttle itself.
//!
//! VCR tape recording is deliberately not wired into [`Kernel::admit_tool_call`]:
//! non-deterministic reads happen inside tool execution, which lives with
//! the executor outside this repo, not at the admission gate. The tape is
//! exposed so an embedder's executor can still use it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use thiserror::Error;

use helm_approval::{ApprovalBridge, ApprovalError, PendingApproval};
use helm_budget::{BudgetAccountant, BudgetError, EffectCost};
use helm_containment::{ContainmentController, ContainmentError, ContainmentState, ContainmentTransition, ContainmentTrigger};
use helm_envelope::{AutonomyEnvelope, BindingDecision, DenialReason, EffectRequest, EnvelopeBinder};
use helm_idempotency::{IdempotencyError, IdempotencyStore, MemoryBackend};
use helm_policy::{AccessRequest, PolicyEngine, Verdict};
use helm_ratelimit::{RateLimitRejected, RateLimiter, RatePolicy};
use helm_receipts::{codes as receipt_codes, ActionType, EffectClass, FsReceiptSink, ReceiptDraft, ReceiptEmitError, ReceiptEmitter, ReceiptEnvelope};
use helm_toolmanifest::{validate_args, ToolArgsError, ToolManifest};
use helm_trust::{TrustEvent, TrustEventType, TrustRegistry};

use crate::config::KernelConfig;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitRejected),
    #[error(transparent)]
    ToolArgs(#[from] ToolArgsError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Receipt(#[from] ReceiptEmitError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Containment(#[from] ContainmentError),
    #[error("canonicalization failed: {0}")]
    Canon(#[from] helm_canon::CanonError),
}

impl KernelError {
    /// Stable wire code, for `helm_kernel::problem::sanitize`.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::RateLimited(_) => "ERR_RATE_LIMITED",
            KernelError::ToolArgs(e) => match e {
                ToolArgsError::NotAnObject | ToolArgsError::UnknownField { .. } | ToolArgsError::MissingRequired { .. } | ToolArgsError::TypeMismatch { .. } => {
                    helm_toolmanifest::codes::ERR_TOOL_ARGS_TYPE_MISMATCH
                }
                ToolArgsError::CanonicalizationFailed(_) => helm_toolmanifest::codes::ERR_TOOL_ARGS_CANONICALIZATION_FAILED,
            },
            KernelError::Idempotency(_) => helm_idempotency::codes::ERR_IDEMPOTENCY_CONFLICT,
            KernelError::Budget(_) => receipt_codes::ERR_RECEIPT_EMISSION_PANIC,
            KernelError::Receipt(_) => "RECEIPT_EMIT_FAILED",
            KernelError::Approval(_) => "APPROVAL_FAILED",
            KernelError::Containment(_) => helm_containment::codes::ERR_CONTAINMENT_RESUME_JUSTIFICATION_REQUIRED,
            KernelError::Canon(_) => "ERR_CANON_UNSUPPORTED",
        }
    }
}

/// Everything needed to admit (or deny) one tool call, end to end.
pub struct ToolCallRequest {
    pub run_id: String,
    pub tenant_id: String,
    pub actor: String,
    pub actor_rate_key: String,
    pub jurisdiction: String,
    pub decision_id: String,
    pub tool_manifest: ToolManifest,
    pub args: serde_json::Value,
    pub effect_class: EffectClass,
    pub bound_envelope: Option<AutonomyEnvelope>,
    pub effect_request: EffectRequest,
    pub cost: EffectCost,
    pub timestamp_virtual: u64,
    pub phenotype_hash: String,
    pub envelope_id: String,
    pub envelope_hash: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ToolCallOutcome {
    Admitted { attempt: ReceiptEnvelope },
    Denied { denial: ReceiptEnvelope, reason: String },
}

pub struct Kernel {
    pub config: KernelConfig,
    pub trust: Arc<TrustRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub policy: Arc<PolicyEngine>,
    pub idempotency: Arc<IdempotencyStore<MemoryBackend>>,
    pub approvals: Arc<ApprovalBridge>,
    pub receipts: Arc<ReceiptEmitter<FsReceiptSink>>,
    pub budget: Arc<BudgetAccountant>,
    pub containment: Arc<ContainmentController>,
    signing_key: SigningKey,
    key_id: String,
}

impl Kernel {
    pub fn new(config: KernelConfig, evidence_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        config.validate()?;
        let signing_key = match config.signing.source {
            crate::config::SigningKeySource::Ephemeral => SigningKey::generate(&mut rand::rngs::OsRng),
            crate::config::SigningKeySource::SeedFile => {
                let path = config
                    .signing
                    .seed_path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("signing.seed_path required for seed_file source"))?;
                let bytes = std::fs::read(path)?;
                let seed: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("signing seed file must contain exactly 32 bytes"))?;
                SigningKey::from_bytes(&seed)
            }
        };

        let trust = Arc::new(TrustRegistry::new());
        let sink = FsReceiptSink::new(evidence_root.into());

        Ok(Self {
            key_id: config.signing.key_id.clone(),
            idempotency: Arc::new(IdempotencyStore::new(
                MemoryBackend::default(),
                std::time::Duration::from_secs(config.run.idempotency_ttl_secs),
            )),
            rate_limiter: Arc::new(RateLimiter::new()),
            policy: Arc::new(PolicyEngine::new()),
            approvals: Arc::new(ApprovalBridge::new(trust.clone())),
            budget: Arc::new(BudgetAccountant::new()),
            containment: Arc::new(ContainmentController::new()),
            receipts: Arc::new(ReceiptEmitter::new(sink, trust.clone())),
            trust,
            config,
            signing_key,
        })
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Register this kernel's own signing key as authorized for `tenant_id`.
    /// Every receipt this kernel emits for that tenant is signed with it.
    pub async fn authorize_tenant(&self, tenant_id: &str, lamport: u64) -> Result<(), helm_trust::TrustError> {
        self.trust
            .apply(TrustEvent {
                event_type: TrustEventType::KeyAdded,
                tenant_id: tenant_id.to_string(),
                key_id: self.key_id.clone(),
                public_key: Some(self.verifying_key_bytes()),
                lamport,
            })
            .await
    }

    pub async fn init_run(&self, run_id: &str, tenant_id: &str) {
        self.budget
            .init_run(run_id.to_string(), tenant_id.to_string(), self.config.budget.into())
            .await;
    }

    fn draft(
        &self,
        req: &ToolCallRequest,
        action_type: ActionType,
        effect_type: &str,
        payload: serde_json::Value,
        policy_hash: &str,
    ) -> Result<ReceiptDraft, KernelError> {
        let salt: Vec<u8> = uuid::Uuid::new_v4().as_bytes().to_vec();
        Ok(ReceiptDraft {
            run_id: req.run_id.clone(),
            tenant_id: req.tenant_id.clone(),
            timestamp_virtual: req.timestamp_virtual,
            schema_version: self.config.run.schema_version.clone(),
            policy_version: self.config.run.policy_version.clone(),
            policy_hash: policy_hash.to_string(),
            envelope_id: req.envelope_id.clone(),
            envelope_hash: req.envelope_hash.clone(),
            jurisdiction: req.jurisdiction.clone(),
            actor: req.actor.clone(),
            action_type,
            effect_class: req.effect_class,
            effect_type: effect_type.to_string(),
            decision_id: Some(req.decision_id.clone()),
            intent_id: None,
            effect_digest_hash: None,
            capability_ref: None,
            budget_snapshot_ref: None,
            tool_name: if action_type.requires_tool_fields() { Some(req.tool_manifest.tool_id.clone()) } else { None },
            tool_manifest_hash: if action_type.requires_tool_fields() { Some(req.tool_manifest.manifest_hash()?) } else { None },
            tape_ref: None,
            phenotype_hash: req.phenotype_hash.clone(),
            parent_receipt_hashes: None,
            payload,
            payload_salt: salt,
        })
    }

    async fn emit(&self, draft: ReceiptDraft) -> Result<ReceiptEnvelope, KernelError> {
        Ok(self.receipts.emit(draft, &self.key_id, &self.signing_key).await?)
    }

    /// Run the full admission pipeline for one tool call: rate limit, policy,
    /// envelope binding, argument validation, budget, then the receipted
    /// attempt itself. Every meaningful action in the path emits its own
    /// receipt (`spec.md` §4.1's closed action set), whether it admits or
    /// denies.
    pub async fn admit_tool_call(&self, req: ToolCallRequest) -> Result<ToolCallOutcome, KernelError> {
        if let Some(key) = &req.idempotency_key {
            if let Some(cached) = self.idempotency.check(&req.tenant_id, key).await {
                let receipt: ReceiptEnvelope = serde_json::from_slice(&cached.body).map_err(|_| ToolArgsError::NotAnObject)?;
                return Ok(ToolCallOutcome::Admitted { attempt: receipt });
            }
        }

        let policy = RatePolicy::new(self.config.rate_limit.default_rpm, self.config.rate_limit.default_burst);
        self.rate_limiter.check(&req.actor_rate_key, policy).await?;

        let access = AccessRequest {
            principal_id: req.actor.clone(),
            action: req.effect_request.effect_class.is_high_finality().then(|| "high_finality").unwrap_or("effect").to_string(),
            resource_id: req.tool_manifest.tool_id.clone(),
            context: req.args.clone(),
        };
        let decision = self.policy.evaluate(&req.tool_manifest.tool_id, &access).await;
        let policy_receipt = self
            .emit(self.draft(
                &req,
                ActionType::PolicyDecision,
                "policy_decision",
                serde_json::json!({"verdict": decision.verdict, "reason": decision.reason}),
                &decision.policy_hash,
            )?)
            .await?;

        if decision.verdict == Verdict::Deny {
            let denial = self
                .emit(self.draft(
                    &req,
                    ActionType::EffectDenied,
                    "policy_deny",
                    serde_json::json!({"reason": decision.reason}),
                    &decision.policy_hash,
                )?)
                .await?;
            return Ok(ToolCallOutcome::Denied { denial, reason: decision.reason });
        }

        let binding = EnvelopeBinder::check(req.bound_envelope.as_ref(), &req.effect_request, Utc::now());
        if let BindingDecision::Denied(denial) = binding {
            let reason = match denial.reason {
                DenialReason::EnvelopeNotBound => "envelope_not_bound",
                DenialReason::EnvelopeNotEnforced => "envelope_not_enforced",
            };
            let receipt = self
                .emit(self.draft(
                    &req,
                    ActionType::EffectDenied,
                    reason,
                    serde_json::json!({"reason": denial.reason.code()}),
                    &decision.policy_hash,
                )?)
                .await?;
            return Ok(ToolCallOutcome::Denied {
                denial: receipt,
                reason: reason.to_string(),
            });
        }

        let validated = match validate_args(&req.tool_manifest, &req.args) {
            Ok(v) => v,
            Err(e) => {
                self.emit(self.draft(
                    &req,
                    ActionType::SchemaValidation,
                    "args_invalid",
                    serde_json::json!({"error": e.to_string()}),
                    &decision.policy_hash,
                )?)
                .await?;
                let denial = self
                    .emit(self.draft(
                        &req,
                        ActionType::EffectDenied,
                        "schema_invalid",
                        serde_json::json!({"error": e.to_string()}),
                        &decision.policy_hash,
                    )?)
                    .await?;
                return Ok(ToolCallOutcome::Denied { denial, reason: e.to_string() });
            }
        };
        self.emit(self.draft(
            &req,
            ActionType::SchemaValidation,
            "args_valid",
            serde_json::json!({"args_hash": validated.args_hash}),
            &decision.policy_hash,
        )?)
        .await?;

        let budget_result = self.budget.reserve(&req.run_id, req.cost).await;
        match budget_result {
            Ok(snapshot) => {
                self.emit(self.draft(
                    &req,
                    ActionType::BudgetDecrement,
                    "budget_decrement",
                    serde_json::to_value(&snapshot).unwrap_or_default(),
                    &decision.policy_hash,
                )?)
                .await?;
            }
            Err(BudgetError::Exhausted(exhausted)) => {
                self.emit(self.draft(
                    &req,
                    ActionType::BudgetExhausted,
                    "budget_exhausted",
                    serde_json::json!({"exceeded": exhausted.exceeded}),
                    &decision.policy_hash,
                )?)
                .await?;
                if self.config.containment.freeze_on_budget_exhaustion {
                    let _ = self.containment.apply(ContainmentTrigger::BudgetExhausted, Utc::now()).await;
                }
                let denial = self
                    .emit(self.draft(
                        &req,
                        ActionType::EffectDenied,
                        "budget_exhausted",
                        serde_json::json!({}),
                        &decision.policy_hash,
                    )?)
                    .await?;
                return Ok(ToolCallOutcome::Denied {
                    denial,
                    reason: "budget_exhausted".to_string(),
                });
            }
            Err(other) => return Err(other.into()),
        }

        let attempt = self
            .emit(self.draft(
                &req,
                ActionType::ToolCall,
                "tool_call",
                serde_json::json!({"args_hash": validated.args_hash, "policy_decision_id": policy_receipt.receipt_hash}),
                &decision.policy_hash,
            )?)
            .await?;

        if let Some(key) = &req.idempotency_key {
            let body = serde_json::to_vec(&attempt).unwrap_or_default();
            self.idempotency.set(&req.tenant_id, key, 200, HashMap::new(), body).await?;
        }

        Ok(ToolCallOutcome::Admitted { attempt })
    }

    /// Register a pending approval for `intent_hash`, to be satisfied later
    /// by [`Kernel::approve_intent`] or [`Kernel::reject_intent`].
    pub async fn request_approval(&self, intent_hash: String, tenant_id: String, decision_id: String, expires_at: DateTime<Utc>) {
        self.approvals.register(intent_hash, tenant_id, decision_id, expires_at).await;
    }

    /// Verify a signed approval and, on success, emit the linked
    /// `approval_action` receipt. `policy_id` names the policy that governed
    /// the original decision, so the approval receipt binds to the same
    /// policy in effect (I5), not merely to the decision's id.
    pub async fn approve_intent(
        &self,
        run_id: &str,
        jurisdiction: &str,
        envelope_id: &str,
        envelope_hash: &str,
        phenotype_hash: &str,
        timestamp_virtual: u64,
        intent_hash: &str,
        policy_id: &str,
        public_key_hex: &str,
        signature_hex: &str,
    ) -> Result<(PendingApproval, ReceiptEnvelope), KernelError> {
        let approved = self.approvals.approve(intent_hash, public_key_hex, signature_hex, Utc::now()).await?;
        let policy_hash = match self.policy.policy_hash(policy_id).await {
            Some(hash) => hash,
            None => helm_canon::canonical_hash(&serde_json::json!({"unknown_policy": policy_id}))?,
        };
        let draft = ReceiptDraft {
            run_id: run_id.to_string(),
            tenant_id: approved.tenant_id.clone(),
            timestamp_virtual,
            schema_version: self.config.run.schema_version.clone(),
            policy_version: self.config.run.policy_version.clone(),
            policy_hash,
            envelope_id: envelope_id.to_string(),
            envelope_hash: envelope_hash.to_string(),
            jurisdiction: jurisdiction.to_string(),
            actor: "operator".to_string(),
            action_type: ActionType::ApprovalAction,
            effect_class: EffectClass::E4,
            effect_type: "approval_granted".to_string(),
            decision_id: Some(approved.decision_id.clone()),
            intent_id: Some(intent_hash.to_string()),
            effect_digest_hash: None,
            capability_ref: None,
            budget_snapshot_ref: None,
            tool_name: None,
            tool_manifest_hash: None,
            tape_ref: None,
            phenotype_hash: phenotype_hash.to_string(),
            parent_receipt_hashes: None,
            payload: serde_json::to_value(&approved).unwrap_or_default(),
            payload_salt: uuid::Uuid::new_v4().as_bytes().to_vec(),
        };
        let receipt = self.emit(draft).await?;
        Ok((approved, receipt))
    }

    pub async fn reject_intent(&self, intent_hash: &str) -> Result<PendingApproval, ApprovalError> {
        self.approvals.reject(intent_hash, Utc::now()).await
    }

    pub async fn containment_state(&self) -> ContainmentState {
        self.containment.state().await
    }

    pub async fn trigger_containment(&self, trigger: ContainmentTrigger) -> Result<ContainmentTransition, ContainmentError> {
        self.containment.apply(trigger, Utc::now()).await
    }
}
