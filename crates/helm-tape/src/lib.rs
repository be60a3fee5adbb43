//! VCR tape (§4.10): every non-deterministic read — clock, randomness,
//! external I/O body — is recorded as a `{seq, data_class, value_hash,
//! salt}` entry; replay resolves the same `seq` from the backend and
//! recomputes the hash, raising [`TapeError::ReplayHashDivergence`] on any
//! mismatch.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use helm_canon::sha256_hex;
use helm_receipts::shared_codes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("{code}: no tape entry for seq {seq}", code = shared_codes::REPLAY_TAPE_MISS)]
    TapeMiss { seq: u64 },
    #[error(
        "{code}: recomputed value_hash for seq {seq} does not match recorded hash",
        code = shared_codes::REPLAY_HASH_DIVERGENCE
    )]
    ReplayHashDivergence { seq: u64 },
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TapeMode {
    Record,
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeEntry {
    pub seq: u64,
    pub data_class: String,
    pub value_hash: String,
    pub salt: Vec<u8>,
    pub envelope_ref: Option<String>,
}

fn value_hash(salt: &[u8], value: &[u8]) -> String {
    let mut buf = Vec::with_capacity(salt.len() + value.len());
    buf.extend_from_slice(salt);
    buf.extend_from_slice(value);
    sha256_hex(&buf)
}

/// Raw value storage behind a tape, keyed by `seq`. The tape itself only
/// ever persists hashes; backends hold the bytes those hashes commit to.
#[async_trait]
pub trait TapeBackend: Send + Sync {
    async fn write_value(&self, seq: u64, bytes: &[u8]) -> Result<(), TapeError>;
    async fn read_value(&self, seq: u64) -> Result<Option<Vec<u8>>, TapeError>;
}

/// In-memory backend, suitable for a single run's lifetime.
#[derive(Default)]
pub struct MemoryTapeBackend {
    values: Mutex<std::collections::HashMap<u64, Vec<u8>>>,
}

#[async_trait]
impl TapeBackend for MemoryTapeBackend {
    async fn write_value(&self, seq: u64, bytes: &[u8]) -> Result<(), TapeError> {
        self.values.lock().await.insert(seq, bytes.to_vec());
        Ok(())
    }

    async fn read_value(&self, seq: u64) -> Result<Option<Vec<u8>>, TapeError> {
        Ok(self.values.lock().await.get(&seq).cloned())
    }
}

/// Filesystem backend: one file per seq under `<root>/08_TAPES/values/`.
pub struct FsTapeBackend {
    pub root: std::path::PathBuf,
}

impl FsTapeBackend {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, seq: u64) -> std::path::PathBuf {
        self.root.join("08_TAPES").join("values").join(format!("{seq}.bin"))
    }
}

#[async_trait]
impl TapeBackend for FsTapeBackend {
    async fn write_value(&self, seq: u64, bytes: &[u8]) -> Result<(), TapeError> {
        let path = self.path_for(seq);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TapeError::Backend(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| TapeError::Backend(e.to_string()))
    }

    async fn read_value(&self, seq: u64) -> Result<Option<Vec<u8>>, TapeError> {
        match tokio::fs::read(self.path_for(seq)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TapeError::Backend(e.to_string())),
        }
    }
}

/// A single run's tape, either recording live reads or replaying a
/// previously recorded sequence.
pub struct Tape<B: TapeBackend> {
    mode: TapeMode,
    backend: B,
    entries: Mutex<Vec<TapeEntry>>,
    next_seq: AtomicU64,
}

impl<B: TapeBackend> Tape<B> {
    pub fn new_record(backend: B) -> Self {
        Self {
            mode: TapeMode::Record,
            backend,
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn new_replay(backend: B, entries: Vec<TapeEntry>) -> Self {
        Self {
            mode: TapeMode::Replay,
            backend,
            entries: Mutex::new(entries),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn mode(&self) -> TapeMode {
        self.mode
    }

    /// Record a live non-deterministic read, returning the entry assigned
    /// to it. Panics (via `debug_assert`) if called on a replay tape;
    /// callers are expected to branch on `mode()` first.
    pub async fn record(&self, data_class: &str, salt: Vec<u8>, value: &[u8], envelope_ref: Option<String>) -> Result<TapeEntry, TapeError> {
        debug_assert_eq!(self.mode, TapeMode::Record);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let hash = value_hash(&salt, value);
        self.backend.write_value(seq, value).await?;
        let entry = TapeEntry {
            seq,
            data_class: data_class.to_string(),
            value_hash: hash,
            salt,
            envelope_ref,
        };
        self.entries.lock().await.push(entry.clone());
        tracing::debug!(seq, data_class, "tape entry recorded");
        Ok(entry)
    }

    /// Resolve the next expected read from the replay tape, validating the
    /// stored bytes still hash to the recorded `value_hash`.
    pub async fn replay_next(&self, data_class: &str) -> Result<Vec<u8>, TapeError> {
        debug_assert_eq!(self.mode, TapeMode::Replay);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().await;
        let entry = entries
            .iter()
            .find(|e| e.seq == seq)
            .ok_or(TapeError::TapeMiss { seq })?
            .clone();
        drop(entries);

        if entry.data_class != data_class {
            return Err(TapeError::ReplayHashDivergence { seq });
        }
        let bytes = self
            .backend
            .read_value(seq)
            .await?
            .ok_or(TapeError::TapeMiss { seq })?;
        let recomputed = value_hash(&entry.salt, &bytes);
        if recomputed != entry.value_hash {
            return Err(TapeError::ReplayHashDivergence { seq });
        }
        Ok(bytes)
    }

    pub async fn entries(&self) -> Vec<TapeEntry> {
        self.entries.lock().await.clone()
    }

    /// Rolling digest over `(seq, data_class, value_hash)` in order — the
    /// `live_hash` or `replay_hash` half of a [`DeterminismManifest`].
    pub async fn digest(&self) -> String {
        let entries = self.entries.lock().await;
        let joined: Vec<_> = entries
            .iter()
            .map(|e| format!("{}:{}:{}", e.seq, e.data_class, e.value_hash))
            .collect();
        sha256_hex(joined.join("|").as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeterminismManifest {
    pub live_hash: String,
    pub replay_hash: String,
}

impl DeterminismManifest {
    pub fn bit_identical(&self) -> bool {
        self.live_hash == self.replay_hash
    }
}

pub async fn build_determinism_manifest<B: TapeBackend>(live: &Tape<B>, replay: &Tape<B>) -> DeterminismManifest {
    DeterminismManifest {
        live_hash: live.digest().await,
        replay_hash: replay.digest().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_then_replay_round_trips() {
        let tape = Tape::new_record(MemoryTapeBackend::default());
        tape.record("clock", vec![1, 2, 3], b"2026-07-28T00:00:00Z", None).await.unwrap();
        let entries = tape.entries().await;

        let replay_backend = MemoryTapeBackend::default();
        replay_backend.write_value(1, b"2026-07-28T00:00:00Z").await.unwrap();
        let replay = Tape::new_replay(replay_backend, entries);
        let resolved = replay.replay_next("clock").await.unwrap();
        assert_eq!(resolved, b"2026-07-28T00:00:00Z");
    }

    #[tokio::test]
    async fn tampered_value_diverges() {
        let tape = Tape::new_record(MemoryTapeBackend::default());
        tape.record("clock", vec![1], b"original", None).await.unwrap();
        let entries = tape.entries().await;

        let replay_backend = MemoryTapeBackend::default();
        replay_backend.write_value(1, b"tampered").await.unwrap();
        let replay = Tape::new_replay(replay_backend, entries);
        let err = replay.replay_next("clock").await.unwrap_err();
        assert!(matches!(err, TapeError::ReplayHashDivergence { .. }));
    }

    #[tokio::test]
    async fn missing_seq_is_tape_miss() {
        let replay = Tape::new_replay(MemoryTapeBackend::default(), vec![]);
        let err = replay.replay_next("clock").await.unwrap_err();
        assert!(matches!(err, TapeError::TapeMiss { .. }));
    }

    #[tokio::test]
    async fn manifest_matches_for_identical_tapes() {
        let live = Tape::new_record(MemoryTapeBackend::default());
        live.record("clock", vec![9], b"v", None).await.unwrap();
        let entries = live.entries().await;

        let replay_backend = MemoryTapeBackend::default();
        replay_backend.write_value(1, b"v").await.unwrap();
        let replay = Tape::new_replay(replay_backend, entries);
        replay.replay_next("clock").await.unwrap();

        let manifest = build_determinism_manifest(&live, &replay).await;
        assert!(manifest.bit_identical());
    }

    #[tokio::test]
    async fn fs_backend_persists_values() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsTapeBackend::new(dir.path());
        backend.write_value(1, b"hello").await.unwrap();
        let read = backend.read_value(1).await.unwrap();
        assert_eq!(read, Some(b"hello".to_vec()));
    }
}
