//! The conformance engine: registers gates in canonical order and runs a
//! profile's required subset against an EvidencePack (§4.14).

use std::path::PathBuf;

use ed25519_dalek::SigningKey;
use helm_evidence::EvidencePackAssembler;
use thiserror::Error;

use crate::gate::{Gate, GateContext};
use crate::gates::canonical_gates;
use crate::profile::{required_gates, Profile};
use crate::report::{sign_report, ConformanceScore, GateReport};

#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error("RECEIPT_EMISSION_PANIC: evidence pack contains an unresolved panic record")]
    PanicRecordPresent,
    #[error("gate {0} not registered")]
    GateNotRegistered(String),
    #[error("evidence assembly failed: {0}")]
    Evidence(#[from] helm_evidence::EvidenceError),
    #[error("report signing failed: {0}")]
    Canon(#[from] helm_canon::CanonError),
}

/// An Ed25519 key to sign the conformance report with (§4.14.1), optional.
pub struct ReportSigner {
    pub signing_key: SigningKey,
    pub signer_id: String,
}

pub struct RunOptions {
    pub profile: Profile,
    pub jurisdiction: String,
    pub gate_filter: Option<Vec<String>>,
    pub evidence_root: PathBuf,
    pub sign_with: Option<ReportSigner>,
}

pub struct ConformanceEngine {
    gates: Vec<Box<dyn Gate>>,
}

impl Default for ConformanceEngine {
    fn default() -> Self {
        Self { gates: canonical_gates() }
    }
}

impl ConformanceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, options: &RunOptions) -> Result<Vec<&dyn Gate>, ConformanceError> {
        let wanted: Vec<String> = match &options.gate_filter {
            Some(filter) if !filter.is_empty() => filter.clone(),
            _ => required_gates(options.profile).into_iter().map(String::from).collect(),
        };

        let mut resolved = Vec::with_capacity(wanted.len());
        for id in &wanted {
            let gate = self.gates.iter().find(|g| g.id() == id).ok_or_else(|| ConformanceError::GateNotRegistered(id.clone()))?;
            resolved.push(gate.as_ref());
        }
        Ok(resolved)
    }

    pub async fn run(&self, options: RunOptions) -> Result<ConformanceScore, ConformanceError> {
        let panic_path = options.evidence_root.join("06_LOGS/receipt_emission_panic.json");
        if panic_path.is_file() {
            return Err(ConformanceError::PanicRecordPresent);
        }

        let assembler = EvidencePackAssembler::new(&options.evidence_root);
        assembler.initialize().await?;

        let gates = self.resolve(&options)?;
        let ctx = GateContext::new(&options.evidence_root);

        let mut reports = Vec::with_capacity(gates.len());
        let mut overall_pass = true;
        for gate in gates {
            let result = gate.run(&ctx);
            overall_pass &= result.pass;
            reports.push(GateReport {
                gate_id: gate.id().to_string(),
                result: result.into(),
            });
        }

        let policy_hash = receipts_policy_hash(&ctx)?;
        let schema_bundle_hash = schema_bundle_hash(&options.evidence_root).await?;

        let score = ConformanceScore {
            profile: options.profile.key().to_string(),
            jurisdiction: options.jurisdiction,
            generated_at: chrono::Utc::now(),
            overall_pass,
            gates: reports,
            policy_hash: policy_hash.clone(),
            schema_bundle_hash: schema_bundle_hash.clone(),
        };

        let score_bytes = serde_json::to_vec_pretty(&score).map_err(|e| ConformanceError::Evidence(helm_evidence::EvidenceError::Serde(e)))?;
        tokio::fs::write(options.evidence_root.join("01_SCORE.json"), &score_bytes)
            .await
            .map_err(|e| ConformanceError::Evidence(helm_evidence::EvidenceError::Io {
                path: options.evidence_root.join("01_SCORE.json"),
                source: e,
            }))?;

        let index = assembler.build_index(Vec::new()).await?;
        let index_bytes = serde_json::to_vec_pretty(&index).map_err(|e| ConformanceError::Evidence(helm_evidence::EvidenceError::Serde(e)))?;
        assembler.write_index(&index).await?;

        if let Some(signer) = options.sign_with {
            let signature = sign_report(
                &index_bytes,
                &score_bytes,
                &policy_hash,
                &schema_bundle_hash,
                &signer.signing_key,
                &signer.signer_id,
                score.generated_at,
            )?;
            let sig_bytes = serde_json::to_vec_pretty(&signature).map_err(|e| ConformanceError::Evidence(helm_evidence::EvidenceError::Serde(e)))?;
            tokio::fs::write(options.evidence_root.join("07_ATTESTATIONS/conformance_report.sig"), &sig_bytes)
                .await
                .map_err(|e| ConformanceError::Evidence(helm_evidence::EvidenceError::Io {
                    path: options.evidence_root.join("07_ATTESTATIONS/conformance_report.sig"),
                    source: e,
                }))?;
        }

        Ok(score)
    }
}

/// The distinct `policy_hash` values carried by this pack's receipts,
/// canonically hashed into one value — binds the report to the policy (or
/// policies, across a multi-run pack) actually in effect (§3 I5), rather
/// than to an identifier unrelated to policy content.
fn receipts_policy_hash(ctx: &GateContext) -> Result<String, ConformanceError> {
    let mut hashes: Vec<String> = ctx.receipts().into_iter().map(|r| r.policy_hash).filter(|h| !h.is_empty()).collect();
    hashes.sort();
    hashes.dedup();
    Ok(helm_canon::canonical_hash(&hashes)?)
}

/// Hash of every file under `09_SCHEMAS/`, canonically combined — the
/// "schema bundle" the pack was validated against (§4.14.1).
async fn schema_bundle_hash(root: &std::path::Path) -> Result<String, ConformanceError> {
    let schemas_dir = root.join("09_SCHEMAS");
    let mut hashes = Vec::new();
    for entry in walkdir::WalkDir::new(&schemas_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let bytes = tokio::fs::read(entry.path()).await.map_err(|e| {
            ConformanceError::Evidence(helm_evidence::EvidenceError::Io {
                path: entry.path().to_path_buf(),
                source: e,
            })
        })?;
        hashes.push(helm_canon::sha256_hex(&bytes));
    }
    hashes.sort();
    Ok(helm_canon::canonical_hash(&hashes)?)
}
