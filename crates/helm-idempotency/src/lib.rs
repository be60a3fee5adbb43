//! At-most-once replay of mutating requests keyed by `Idempotency-Key`.
//!
//! Idempotency is best-effort enrichment: a durable backend's write failure
//! is logged and swallowed (the request still succeeds), the sole exception
//! being a genuine conflict — a second request reusing the same key with a
//! different body hash — which raises [`IdempotencyError::Conflict`].

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codes {
    pub const ERR_IDEMPOTENCY_CONFLICT: &str = "ERR_IDEMPOTENCY_CONFLICT";
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("{code}: key reused with a different request body", code = codes::ERR_IDEMPOTENCY_CONFLICT)]
    Conflict,
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub body_hash: String,
    pub stored_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        now - self.stored_at > ttl
    }
}

/// Shared contract between the in-memory and durable backends.
#[async_trait]
pub trait IdempotencyBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;
    async fn put(&self, key: &str, record: IdempotencyRecord) -> Result<(), IdempotencyError>;
    async fn delete(&self, key: &str) -> Result<(), IdempotencyError>;
    async fn keys(&self) -> Result<Vec<String>, IdempotencyError>;
}

/// Coarse-locked in-memory backend with a background 5-minute sweeper.
#[derive(Default)]
pub struct MemoryBackend {
    data: StdMutex<HashMap<String, IdempotencyRecord>>,
}

#[async_trait]
impl IdempotencyBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        self.data.lock().unwrap().insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, IdempotencyError> {
        Ok(self.data.lock().unwrap().keys().cloned().collect())
    }
}

/// Durable backend over `sled`. Write failures are never surfaced to
/// callers of [`IdempotencyStore::set`] — only logged.
pub struct SledBackend {
    tree: sled::Db,
}

impl SledBackend {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, IdempotencyError> {
        let tree = sled::open(path).map_err(|e| IdempotencyError::Backend(e.to_string()))?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl IdempotencyBackend for SledBackend {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        match self.tree.get(key) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| IdempotencyError::Backend(e.to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(IdempotencyError::Backend(e.to_string())),
        }
    }

    async fn put(&self, key: &str, record: IdempotencyRecord) -> Result<(), IdempotencyError> {
        let bytes = serde_json::to_vec(&record).map_err(|e| IdempotencyError::Backend(e.to_string()))?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| IdempotencyError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        self.tree
            .remove(key)
            .map_err(|e| IdempotencyError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, IdempotencyError> {
        self.tree
            .iter()
            .keys()
            .map(|k| {
                k.map(|k| String::from_utf8_lossy(&k).into_owned())
                    .map_err(|e| IdempotencyError::Backend(e.to_string()))
            })
            .collect()
    }
}

pub struct IdempotencyStore<B: IdempotencyBackend> {
    backend: B,
    ttl: Duration,
}

impl<B: IdempotencyBackend> IdempotencyStore<B> {
    pub fn new(backend: B, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn scoped_key(tenant_id: &str, idempotency_key: &str) -> String {
        format!("{tenant_id}:{idempotency_key}")
    }

    /// Returns the cached response if one exists and has not expired.
    pub async fn check(&self, tenant_id: &str, idempotency_key: &str) -> Option<IdempotencyRecord> {
        let key = Self::scoped_key(tenant_id, idempotency_key);
        match self.backend.get(&key).await {
            Ok(Some(record)) if !record.is_expired(Utc::now(), self.ttl) => Some(record),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "idempotency backend read failed; treating as cache miss");
                None
            }
        }
    }

    /// Store a response for `idempotency_key`, enforcing the conflict rule.
    /// Only 2xx statuses are cached; non-2xx responses are accepted but
    /// silently not persisted, so a subsequent retry still goes through
    /// normal processing.
    pub async fn set(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<(), IdempotencyError> {
        let key = Self::scoped_key(tenant_id, idempotency_key);
        let body_hash = helm_canon::sha256_hex(&body);

        if let Ok(Some(existing)) = self.backend.get(&key).await {
            if !existing.is_expired(Utc::now(), self.ttl) && existing.body_hash != body_hash {
                return Err(IdempotencyError::Conflict);
            }
        }

        if !(200..300).contains(&status) {
            return Ok(());
        }

        let record = IdempotencyRecord {
            status,
            headers,
            body,
            body_hash,
            stored_at: Utc::now(),
        };

        if let Err(e) = self.backend.put(&key, record).await {
            tracing::error!(error = %e, "idempotency backend write failed; continuing (best effort)");
        }
        Ok(())
    }

    /// Delete entries older than the configured TTL. Intended to run on a
    /// 5-minute tick from a background task.
    pub async fn sweep(&self) -> usize {
        let keys = match self.backend.keys().await {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "idempotency sweep could not list keys");
                return 0;
            }
        };
        let mut evicted = 0;
        for key in keys {
            if let Ok(Some(record)) = self.backend.get(&key).await {
                if record.is_expired(Utc::now(), self.ttl) {
                    let _ = self.backend.delete(&key).await;
                    evicted += 1;
                }
            }
        }
        evicted
    }
}
