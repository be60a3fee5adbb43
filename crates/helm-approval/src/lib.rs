//! The human-in-the-loop approval bridge (§4.7): a pending-approval table
//! keyed by `intent_hash`, advanced only by a verified Ed25519 signature
//! from a key the tenant currently has authorized in [`helm_trust`].
//!
//! Approving does not itself emit a receipt — like the envelope binder, the
//! bridge hands back a decision and the embedder (`helm-kernel`) emits the
//! `approval_action` receipt via `helm-receipts`, linked by `decision_id`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use helm_trust::TrustRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub mod codes {
    pub const ERR_APPROVAL_UNKNOWN_INTENT: &str = "ERR_APPROVAL_UNKNOWN_INTENT";
    pub const ERR_APPROVAL_NOT_PENDING: &str = "ERR_APPROVAL_NOT_PENDING";
    pub const ERR_APPROVAL_EXPIRED: &str = "ERR_APPROVAL_EXPIRED";
    pub const ERR_APPROVAL_BAD_SIGNATURE: &str = "ERR_APPROVAL_BAD_SIGNATURE";
    pub const ERR_APPROVAL_KEY_NOT_AUTHORIZED: &str = "ERR_APPROVAL_KEY_NOT_AUTHORIZED";
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("{code}: no pending approval for intent {intent_hash}", code = codes::ERR_APPROVAL_UNKNOWN_INTENT)]
    UnknownIntent { intent_hash: String },
    #[error("{code}: intent {intent_hash} is {status:?}, not Pending", code = codes::ERR_APPROVAL_NOT_PENDING)]
    NotPending { intent_hash: String, status: ApprovalStatus },
    #[error("{code}: intent {intent_hash} expired at {expires_at}", code = codes::ERR_APPROVAL_EXPIRED)]
    Expired {
        intent_hash: String,
        expires_at: DateTime<Utc>,
    },
    #[error("{code}: malformed public key or signature encoding", code = codes::ERR_APPROVAL_BAD_SIGNATURE)]
    MalformedEncoding,
    #[error("{code}: signature does not verify against the supplied public key", code = codes::ERR_APPROVAL_BAD_SIGNATURE)]
    SignatureInvalid,
    #[error(
        "{code}: public key is not authorized for tenant {tenant_id}",
        code = codes::ERR_APPROVAL_KEY_NOT_AUTHORIZED
    )]
    KeyNotAuthorized { tenant_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// Proof the operator actually approved, distinct from the `approval_action`
/// DAG receipt the embedder emits afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalReceipt {
    pub public_key_hex: String,
    pub signature_hex: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub intent_hash: String,
    pub tenant_id: String,
    pub decision_id: String,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub receipt: Option<ApprovalReceipt>,
}

#[derive(Debug, Default)]
pub struct ApprovalBridge {
    pending: RwLock<HashMap<String, PendingApproval>>,
    trust: Option<Arc<TrustRegistry>>,
}

impl ApprovalBridge {
    pub fn new(trust: Arc<TrustRegistry>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            trust: Some(trust),
        }
    }

    /// Register a new pending approval, keyed by its intent hash.
    pub async fn register(&self, intent_hash: String, tenant_id: String, decision_id: String, expires_at: DateTime<Utc>) {
        let mut pending = self.pending.write().await;
        pending.insert(
            intent_hash.clone(),
            PendingApproval {
                intent_hash,
                tenant_id,
                decision_id,
                status: ApprovalStatus::Pending,
                expires_at,
                receipt: None,
            },
        );
    }

    pub async fn get(&self, intent_hash: &str) -> Option<PendingApproval> {
        self.pending.read().await.get(intent_hash).cloned()
    }

    /// Lazily transition an overdue `Pending` entry to `Expired`, returning
    /// the (possibly updated) approval. `None` if the intent is unknown.
    async fn lazy_expire(&self, intent_hash: &str, now: DateTime<Utc>) -> Option<PendingApproval> {
        let mut pending = self.pending.write().await;
        let entry = pending.get_mut(intent_hash)?;
        if entry.status == ApprovalStatus::Pending && now > entry.expires_at {
            entry.status = ApprovalStatus::Expired;
            tracing::info!(intent_hash, "pending approval expired");
        }
        Some(entry.clone())
    }

    /// §4.7 approve path, steps 1-5. A failed step other than expiry leaves
    /// the pending entry untouched at `Pending` — only the caller's request
    /// fails, matching the "signature is wrong, approval stays Pending"
    /// behavior a retried approve must still be able to use.
    pub async fn approve(
        &self,
        intent_hash: &str,
        public_key_hex: &str,
        signature_hex: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingApproval, ApprovalError> {
        let current = self
            .lazy_expire(intent_hash, now)
            .await
            .ok_or_else(|| ApprovalError::UnknownIntent {
                intent_hash: intent_hash.to_string(),
            })?;

        match current.status {
            ApprovalStatus::Expired => {
                return Err(ApprovalError::Expired {
                    intent_hash: intent_hash.to_string(),
                    expires_at: current.expires_at,
                })
            }
            ApprovalStatus::Pending => {}
            other => {
                return Err(ApprovalError::NotPending {
                    intent_hash: intent_hash.to_string(),
                    status: other,
                })
            }
        }

        let key_bytes: [u8; 32] = hex::decode(public_key_hex)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(ApprovalError::MalformedEncoding)?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| ApprovalError::MalformedEncoding)?;
        let sig_bytes = hex::decode(signature_hex).map_err(|_| ApprovalError::MalformedEncoding)?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| ApprovalError::MalformedEncoding)?;

        verifying_key
            .verify(intent_hash.as_bytes(), &signature)
            .map_err(|_| ApprovalError::SignatureInvalid)?;

        if let Some(trust) = &self.trust {
            if !trust.is_public_key_authorized(&current.tenant_id, &key_bytes).await {
                return Err(ApprovalError::KeyNotAuthorized {
                    tenant_id: current.tenant_id.clone(),
                });
            }
        }

        let mut pending = self.pending.write().await;
        let entry = pending
            .get_mut(intent_hash)
            .ok_or_else(|| ApprovalError::UnknownIntent {
                intent_hash: intent_hash.to_string(),
            })?;
        entry.status = ApprovalStatus::Approved;
        entry.receipt = Some(ApprovalReceipt {
            public_key_hex: public_key_hex.to_string(),
            signature_hex: signature_hex.to_string(),
            approved_at: now,
        });
        tracing::info!(intent_hash, "approval granted");
        Ok(entry.clone())
    }

    /// Explicit operator rejection, outside the signed-approval path.
    pub async fn reject(&self, intent_hash: &str, now: DateTime<Utc>) -> Result<PendingApproval, ApprovalError> {
        let current = self
            .lazy_expire(intent_hash, now)
            .await
            .ok_or_else(|| ApprovalError::UnknownIntent {
                intent_hash: intent_hash.to_string(),
            })?;
        if current.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending {
                intent_hash: intent_hash.to_string(),
                status: current.status,
            });
        }
        let mut pending = self.pending.write().await;
        let entry = pending.get_mut(intent_hash).expect("checked above");
        entry.status = ApprovalStatus::Rejected;
        tracing::info!(intent_hash, "approval rejected");
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::{Signer, SigningKey};
    use helm_trust::{TrustEvent, TrustEventType};

    async fn bridge_with_key() -> (ApprovalBridge, SigningKey) {
        let trust = Arc::new(TrustRegistry::new());
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
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
        (ApprovalBridge::new(trust), signing_key)
    }

    #[tokio::test]
    async fn valid_signature_from_authorized_key_approves() {
        let (bridge, key) = bridge_with_key().await;
        let now = Utc::now();
        bridge
            .register("intent1".into(), "t1".into(), "d1".into(), now + Duration::hours(1))
            .await;
        let sig = key.sign(b"intent1");
        let approved = bridge
            .approve("intent1", &hex::encode(key.verifying_key().to_bytes()), &hex::encode(sig.to_bytes()), now)
            .await
            .unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn bad_signature_leaves_entry_pending() {
        let (bridge, key) = bridge_with_key().await;
        let now = Utc::now();
        bridge
            .register("intent1".into(), "t1".into(), "d1".into(), now + Duration::hours(1))
            .await;
        let wrong_sig = key.sign(b"not-the-intent-hash");
        let err = bridge
            .approve(
                "intent1",
                &hex::encode(key.verifying_key().to_bytes()),
                &hex::encode(wrong_sig.to_bytes()),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::SignatureInvalid));
        let still_pending = bridge.get("intent1").await.unwrap();
        assert_eq!(still_pending.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn expired_intent_cannot_be_approved() {
        let (bridge, key) = bridge_with_key().await;
        let now = Utc::now();
        bridge
            .register("intent1".into(), "t1".into(), "d1".into(), now - Duration::minutes(1))
            .await;
        let sig = key.sign(b"intent1");
        let err = bridge
            .approve("intent1", &hex::encode(key.verifying_key().to_bytes()), &hex::encode(sig.to_bytes()), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Expired { .. }));
        assert_eq!(bridge.get("intent1").await.unwrap().status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn unauthorized_key_is_rejected() {
        let (bridge, _key) = bridge_with_key().await;
        let other = SigningKey::generate(&mut rand::rngs::OsRng);
        let now = Utc::now();
        bridge
            .register("intent1".into(), "t1".into(), "d1".into(), now + Duration::hours(1))
            .await;
        let sig = other.sign(b"intent1");
        let err = bridge
            .approve("intent1", &hex::encode(other.verifying_key().to_bytes()), &hex::encode(sig.to_bytes()), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::KeyNotAuthorized { .. }));
    }

    #[tokio::test]
    async fn unknown_intent_errors() {
        let (bridge, _key) = bridge_with_key().await;
        let err = bridge.approve("ghost", "00", "00", Utc::now()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::UnknownIntent { .. }));
    }
}
