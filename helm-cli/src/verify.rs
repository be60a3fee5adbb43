use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use tracing::{info, warn};

use helm_conformance::gate::{Gate, GateContext};
use helm_conformance::gates::G1ProofReceipts;
use helm_conformance::report::{ConformanceScore, ReportSignature};
use helm_evidence::IndexDocument;

/// Re-hashes every file `00_INDEX.json` names, re-derives every receipt's
/// `receipt_hash` from its canonical bytes, and, if a signer key is given,
/// checks `07_ATTESTATIONS/conformance_report.sig`. Returns `true` iff
/// nothing mismatched.
pub async fn handle_verify(evidence_dir: &Path, signer_public_key_hex: Option<&str>, json: bool) -> Result<bool> {
    let mut mismatches = Vec::new();

    let index_path = evidence_dir.join("00_INDEX.json");
    let index_bytes = tokio::fs::read(&index_path)
        .await
        .with_context(|| format!("reading {}", index_path.display()))?;
    let index: IndexDocument = serde_json::from_slice(&index_bytes).with_context(|| format!("parsing {}", index_path.display()))?;

    for entry in &index.files {
        let file_path = evidence_dir.join(&entry.path);
        match tokio::fs::read(&file_path).await {
            Ok(bytes) => {
                let actual = helm_canon::sha256_hex(&bytes);
                if actual != entry.sha256 {
                    mismatches.push(format!("HASH_MISMATCH: {} indexed as {} but is {}", entry.path, entry.sha256, actual));
                }
            }
            Err(e) => mismatches.push(format!("HASH_MISMATCH: {} could not be read: {e}", entry.path)),
        }
    }

    let ctx = GateContext::new(evidence_dir);
    let g1 = G1ProofReceipts.run(&ctx);
    if !g1.pass {
        mismatches.extend(g1.reasons);
    }

    let sig_path = evidence_dir.join("07_ATTESTATIONS/conformance_report.sig");
    if sig_path.is_file() {
        let sig_bytes = tokio::fs::read(&sig_path).await.with_context(|| format!("reading {}", sig_path.display()))?;
        let signature: ReportSignature = serde_json::from_slice(&sig_bytes)?;
        match signer_public_key_hex {
            Some(hex_key) => {
                let score_path = evidence_dir.join("01_SCORE.json");
                let score_bytes = tokio::fs::read(&score_path).await.with_context(|| format!("reading {}", score_path.display()))?;
                let key_bytes = hex::decode(hex_key).context("signer_public_key_hex is not valid hex")?;
                let key_array: [u8; 32] = key_bytes.try_into().map_err(|_| anyhow::anyhow!("signer public key must be 32 bytes"))?;
                let verifying_key = VerifyingKey::from_bytes(&key_array).context("invalid Ed25519 public key")?;
                let score: ConformanceScore = serde_json::from_slice(&score_bytes).with_context(|| format!("parsing {}", score_path.display()))?;
                let ok = helm_conformance::report::verify_report(
                    &index_bytes,
                    &score_bytes,
                    &score.policy_hash,
                    &score.schema_bundle_hash,
                    &signature,
                    &verifying_key,
                );
                if !ok {
                    mismatches.push("SIGNATURE_MISMATCH: conformance_report.sig does not verify against the given key".to_string());
                }
            }
            None => warn!("conformance_report.sig present but no --signer-public-key-hex given; skipping signature check"),
        }
    }

    let ok = mismatches.is_empty();
    if json {
        println!("{}", serde_json::json!({"ok": ok, "mismatches": mismatches}));
    } else if ok {
        println!("OK: {} file(s), {} receipt(s) verified", index.files.len(), ctx.receipts().len());
    } else {
        println!("FAILED:");
        for m in &mismatches {
            println!("  - {m}");
        }
    }

    info!(ok, count = mismatches.len(), "verify complete");
    Ok(ok)
}
