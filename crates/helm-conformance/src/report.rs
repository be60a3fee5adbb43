//! Conformance report scoring and the optional report signature (§4.14.1).
//!
//! Open question resolved here (see `DESIGN.md`): the signature covers only
//! the four fields §4.14.1 names — `00_INDEX.json` hash, `01_SCORE.json`
//! hash, `policy_hash`, `schema_bundle_hash` — not `extensions`. Extensions
//! are declared in `00_INDEX.json`, which is itself hashed, so a change to
//! declared extensions still invalidates the signature transitively.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use helm_canon::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::GateResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub gate_id: String,
    pub result: GateResultOwned,
}

/// `serde`-friendly mirror of [`GateResult`] (kept separate so the gate
/// module stays free of a `Deserialize` requirement it doesn't otherwise
/// need).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResultOwned {
    pub pass: bool,
    pub reasons: Vec<String>,
    pub evidence_paths: Vec<String>,
    pub metrics: Value,
}

impl From<GateResult> for GateResultOwned {
    fn from(r: GateResult) -> Self {
        Self {
            pass: r.pass,
            reasons: r.reasons,
            evidence_paths: r.evidence_paths,
            metrics: r.metrics,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConformanceScore {
    pub profile: String,
    pub jurisdiction: String,
    pub generated_at: DateTime<Utc>,
    pub overall_pass: bool,
    pub gates: Vec<GateReport>,
    /// Binds the report to the policy/policies in effect over the receipts
    /// it was scored against (§3 I5); this is the same value §4.14.1's
    /// report signature covers, so `helm-cli verify` reads it straight off
    /// `01_SCORE.json` rather than recomputing it independently.
    pub policy_hash: String,
    /// Hash of the schema bundle (`09_SCHEMAS/`) the pack was validated
    /// against; also covered by the §4.14.1 signature.
    pub schema_bundle_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSignature {
    pub signer_id: String,
    pub signed_at: DateTime<Utc>,
    pub signature_hex: String,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    index_hash: &'a str,
    score_hash: &'a str,
    policy_hash: &'a str,
    schema_bundle_hash: &'a str,
}

fn signed_bytes(index_bytes: &[u8], score_bytes: &[u8], policy_hash: &str, schema_bundle_hash: &str) -> Result<Vec<u8>, helm_canon::CanonError> {
    let fields = SignedFields {
        index_hash: &sha256_hex(index_bytes),
        score_hash: &sha256_hex(score_bytes),
        policy_hash,
        schema_bundle_hash,
    };
    helm_canon::to_jcs_bytes(&fields)
}

pub fn sign_report(
    index_bytes: &[u8],
    score_bytes: &[u8],
    policy_hash: &str,
    schema_bundle_hash: &str,
    signing_key: &SigningKey,
    signer_id: &str,
    now: DateTime<Utc>,
) -> Result<ReportSignature, helm_canon::CanonError> {
    let bytes = signed_bytes(index_bytes, score_bytes, policy_hash, schema_bundle_hash)?;
    let signature = signing_key.sign(&bytes);
    Ok(ReportSignature {
        signer_id: signer_id.to_string(),
        signed_at: now,
        signature_hex: hex::encode(signature.to_bytes()),
    })
}

pub fn verify_report(
    index_bytes: &[u8],
    score_bytes: &[u8],
    policy_hash: &str,
    schema_bundle_hash: &str,
    signature: &ReportSignature,
    verifying_key: &VerifyingKey,
) -> bool {
    let Ok(bytes) = signed_bytes(index_bytes, score_bytes, policy_hash, schema_bundle_hash) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&signature.signature_hex) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(&bytes, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let index = b"{\"files\":[]}";
        let score = b"{\"overall_pass\":true}";
        let sig = sign_report(index, score, "sha256:p", "sha256:s", &key, "signer1", Utc::now()).unwrap();
        assert!(verify_report(index, score, "sha256:p", "sha256:s", &sig, &key.verifying_key()));
    }

    #[test]
    fn tampering_with_index_breaks_verification() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let index = b"{\"files\":[]}";
        let score = b"{\"overall_pass\":true}";
        let sig = sign_report(index, score, "sha256:p", "sha256:s", &key, "signer1", Utc::now()).unwrap();
        assert!(!verify_report(b"{\"files\":[1]}", score, "sha256:p", "sha256:s", &sig, &key.verifying_key()));
    }
}
