//! Event-sourced trust registry: the authoritative, append-only mapping of
//! `tenant -> key_id -> authorized public key`.
//!
//! The registry is a pure function of its event log: [`TrustRegistry::apply`]
//! validates and appends one [`TrustEvent`], mutating a tenant-scoped
//! materialized view; [`TrustRegistry::resolve_authorized_keys`] can replay
//! the log up to a given Lamport height to recover the authorized set at any
//! past point in time.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod codes {
    pub const ERR_TRUST_MISSING_PUBLIC_KEY: &str = "ERR_TRUST_MISSING_PUBLIC_KEY";
}

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("{code}: {event_type:?} event requires a public_key", code = codes::ERR_TRUST_MISSING_PUBLIC_KEY)]
    MissingPublicKey { event_type: TrustEventType },
    #[error("malformed public key for tenant {tenant_id}, key {key_id}")]
    MalformedPublicKey { tenant_id: String, key_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustEventType {
    KeyAdded,
    KeyRevoked,
    KeyRotated,
}

/// One entry in the append-only trust event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEvent {
    pub event_type: TrustEventType,
    pub tenant_id: String,
    pub key_id: String,
    /// Required for `KeyAdded` / `KeyRotated`; ignored for `KeyRevoked`.
    pub public_key: Option<[u8; 32]>,
    pub lamport: u64,
}

#[derive(Debug, Clone)]
struct KeyRecord {
    public_key: [u8; 32],
    active: bool,
    insertion_order: u64,
}

#[derive(Debug, Clone, Default)]
struct TenantState {
    log: Vec<TrustEvent>,
    keys: HashMap<String, KeyRecord>,
    next_insertion_order: u64,
}

impl TenantState {
    fn apply_in_place(&mut self, event: &TrustEvent) {
        match event.event_type {
            TrustEventType::KeyAdded | TrustEventType::KeyRotated => {
                let insertion_order = self
                    .keys
                    .get(&event.key_id)
                    .map(|k| k.insertion_order)
                    .unwrap_or_else(|| {
                        let n = self.next_insertion_order;
                        self.next_insertion_order += 1;
                        n
                    });
                self.keys.insert(
                    event.key_id.clone(),
                    KeyRecord {
                        public_key: event.public_key.expect("validated before apply"),
                        active: true,
                        insertion_order,
                    },
                );
            }
            TrustEventType::KeyRevoked => {
                if let Some(rec) = self.keys.get_mut(&event.key_id) {
                    rec.active = false;
                }
            }
        }
    }

    /// Rebuild current state from the log, considering only events with
    /// `lamport <= height`, applied in log order. Log order already
    /// encodes the insertion-order tie-break for equal-lamport events.
    fn replay_up_to(&self, height: u64) -> TenantState {
        let mut fresh = TenantState::default();
        for event in &self.log {
            if event.lamport <= height {
                fresh.apply_in_place(event);
            }
        }
        fresh
    }
}

/// Authorized key as returned by a resolve/lookup, ordered for determinism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub key_id: String,
    pub public_key: [u8; 32],
}

#[derive(Debug, Default)]
pub struct TrustRegistry {
    tenants: RwLock<HashMap<String, TenantState>>,
}

impl TrustRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply one trust event, mutating the tenant's
    /// materialized view. Readers may run concurrently with other readers
    /// but this call serializes against them and other writers.
    pub async fn apply(&self, event: TrustEvent) -> Result<(), TrustError> {
        if matches!(
            event.event_type,
            TrustEventType::KeyAdded | TrustEventType::KeyRotated
        ) && event.public_key.is_none()
        {
            return Err(TrustError::MissingPublicKey {
                event_type: event.event_type,
            });
        }

        let mut tenants = self.tenants.write().await;
        let state = tenants.entry(event.tenant_id.clone()).or_default();
        state.apply_in_place(&event);
        state.log.push(event.clone());
        tracing::info!(
            tenant_id = %event.tenant_id,
            key_id = %event.key_id,
            event_type = ?event.event_type,
            "trust event applied"
        );
        Ok(())
    }

    /// Authorized keys for `tenant` at `lamport_height`. `height == 0` means
    /// "current state"; otherwise the log is replayed up to (and including)
    /// that height. An unknown tenant yields an empty set, not an error.
    pub async fn resolve_authorized_keys(&self, tenant_id: &str, lamport_height: u64) -> Vec<AuthorizedKey> {
        let tenants = self.tenants.read().await;
        let Some(state) = tenants.get(tenant_id) else {
            return Vec::new();
        };
        let effective = if lamport_height == 0 {
            state.clone()
        } else {
            state.replay_up_to(lamport_height)
        };
        let mut keys: Vec<(String, KeyRecord)> = effective
            .keys
            .into_iter()
            .filter(|(_, rec)| rec.active)
            .collect();
        keys.sort_by_key(|(_, rec)| rec.insertion_order);
        keys.into_iter()
            .map(|(key_id, rec)| AuthorizedKey {
                key_id,
                public_key: rec.public_key,
            })
            .collect()
    }

    /// O(1) current-state lookup: is `key_id` presently authorized for `tenant_id`?
    pub async fn is_authorized(&self, tenant_id: &str, key_id: &str) -> bool {
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant_id)
            .and_then(|s| s.keys.get(key_id))
            .map(|rec| rec.active)
            .unwrap_or(false)
    }

    /// Whether `public_key` matches any currently-active key for `tenant_id`,
    /// regardless of its `key_id` — used by the approval bridge, which only
    /// ever sees a raw public key over the wire (§4.7 step 4).
    pub async fn is_public_key_authorized(&self, tenant_id: &str, public_key: &[u8; 32]) -> bool {
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant_id)
            .map(|s| {
                s.keys
                    .values()
                    .any(|rec| rec.active && &rec.public_key == public_key)
            })
            .unwrap_or(false)
    }

    /// Verify an Ed25519 signature against the key the tenant has
    /// currently authorized for `key_id`. Returns `false` (not an error)
    /// when the key is unknown, revoked, or malformed.
    pub async fn verify_with_authorized_key(
        &self,
        tenant_id: &str,
        key_id: &str,
        message: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> bool {
        use ed25519_dalek::Verifier;
        let tenants = self.tenants.read().await;
        let Some(rec) = tenants.get(tenant_id).and_then(|s| s.keys.get(key_id)) else {
            return false;
        };
        if !rec.active {
            return false;
        }
        let Ok(vk) = VerifyingKey::from_bytes(&rec.public_key) else {
            return false;
        };
        vk.verify(message, signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(tenant: &str, key_id: &str, lamport: u64) -> TrustEvent {
        TrustEvent {
            event_type: TrustEventType::KeyAdded,
            tenant_id: tenant.into(),
            key_id: key_id.into(),
            public_key: Some([7u8; 32]),
            lamport,
        }
    }

    #[tokio::test]
    async fn added_without_key_is_rejected() {
        let reg = TrustRegistry::new();
        let mut ev = added("t1", "k1", 1);
        ev.public_key = None;
        assert!(reg.apply(ev).await.is_err());
    }

    #[tokio::test]
    async fn revoke_then_verify_fails() {
        let reg = TrustRegistry::new();
        reg.apply(added("t1", "k1", 1)).await.unwrap();
        assert!(reg.is_authorized("t1", "k1").await);
        reg.apply(TrustEvent {
            event_type: TrustEventType::KeyRevoked,
            tenant_id: "t1".into(),
            key_id: "k1".into(),
            public_key: None,
            lamport: 2,
        })
        .await
        .unwrap();
        assert!(!reg.is_authorized("t1", "k1").await);
    }

    #[tokio::test]
    async fn unknown_tenant_resolves_empty_not_error() {
        let reg = TrustRegistry::new();
        let keys = reg.resolve_authorized_keys("ghost", 0).await;
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn replay_at_height_excludes_later_revocation() {
        let reg = TrustRegistry::new();
        reg.apply(added("t1", "k1", 1)).await.unwrap();
        reg.apply(TrustEvent {
            event_type: TrustEventType::KeyRevoked,
            tenant_id: "t1".into(),
            key_id: "k1".into(),
            public_key: None,
            lamport: 5,
        })
        .await
        .unwrap();
        let at_1 = reg.resolve_authorized_keys("t1", 1).await;
        assert_eq!(at_1.len(), 1);
        let at_5 = reg.resolve_authorized_keys("t1", 5).await;
        assert!(at_5.is_empty());
    }

    #[tokio::test]
    async fn tie_break_on_equal_lamport_is_insertion_order() {
        let reg = TrustRegistry::new();
        reg.apply(added("t1", "k1", 3)).await.unwrap();
        reg.apply(added("t1", "k2", 3)).await.unwrap();
        let keys = reg.resolve_authorized_keys("t1", 3).await;
        assert_eq!(keys[0].key_id, "k1");
        assert_eq!(keys[1].key_id, "k2");
    }
}
