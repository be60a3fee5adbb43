//! Gate trait and the evidence-pack read helpers every gate shares.

use std::path::{Path, PathBuf};

use helm_receipts::envelope::ReceiptEnvelope;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone, serde::Serialize)]
pub struct GateResult {
    pub pass: bool,
    pub reasons: Vec<String>,
    pub evidence_paths: Vec<String>,
    pub metrics: Value,
}

impl GateResult {
    pub fn ok() -> Self {
        Self {
            pass: true,
            reasons: Vec::new(),
            evidence_paths: Vec::new(),
            metrics: Value::Null,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            reasons: vec![reason.into()],
            evidence_paths: Vec::new(),
            metrics: Value::Null,
        }
    }

    pub fn with_evidence(mut self, path: impl Into<String>) -> Self {
        self.evidence_paths.push(path.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Accumulates failures across independent checks within one gate without
/// short-circuiting — a gate reports every violation it finds, not just the
/// first.
#[derive(Default)]
pub struct Findings {
    reasons: Vec<String>,
    evidence_paths: Vec<String>,
}

impl Findings {
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    pub fn evidence(&mut self, path: impl Into<String>) {
        self.evidence_paths.push(path.into());
    }

    pub fn into_result(self, metrics: Value) -> GateResult {
        GateResult {
            pass: self.reasons.is_empty(),
            reasons: self.reasons,
            evidence_paths: self.evidence_paths,
            metrics,
        }
    }
}

/// Gates MUST NOT panic (§4.14 step 4): every [`Gate::run`] returns a
/// [`GateResult`] rather than propagating a `Result`/`Err`.
pub trait Gate: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, ctx: &GateContext) -> GateResult;
}

pub struct GateContext {
    pub root: PathBuf,
}

impl GateContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    pub fn dir_nonempty(&self, rel: &str) -> bool {
        std::fs::read_dir(self.path(rel))
            .map(|mut it| it.next().is_some())
            .unwrap_or(false)
    }

    pub fn read_json<T: DeserializeOwned>(&self, rel: &str) -> Option<T> {
        let bytes = std::fs::read(self.path(rel)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// All `*.json` files directly under `rel`, parsed as raw JSON.
    pub fn read_dir_jsons(&self, rel: &str) -> Vec<(PathBuf, Value)> {
        let dir = self.path(rel);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = std::fs::read(&path) {
                if let Ok(value) = serde_json::from_slice(&bytes) {
                    out.push((path, value));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// All receipts in `02_PROOFGRAPH/receipts/`, parsed and sorted by
    /// `(run_id, seq)` for deterministic gate checks.
    pub fn receipts(&self) -> Vec<ReceiptEnvelope> {
        let mut receipts: Vec<ReceiptEnvelope> = self
            .read_dir_jsons("02_PROOFGRAPH/receipts")
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect();
        receipts.sort_by(|a, b| (a.run_id.clone(), a.seq).cmp(&(b.run_id.clone(), b.seq)));
        receipts
    }

    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}
