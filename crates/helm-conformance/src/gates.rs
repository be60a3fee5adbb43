//! Gate contracts, §4.14.3. Each gate walks the EvidencePack and returns a
//! [`GateResult`]; none of them may panic.

use std::collections::{HashMap, HashSet};

use helm_receipts::envelope::ActionType;
use serde_json::Value;

use crate::gate::{Gate, GateContext, GateResult};

pub struct G0BuildIdentity;
impl Gate for G0BuildIdentity {
    fn id(&self) -> &'static str {
        "G0"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let mut reasons = Vec::new();
        if !ctx.exists("07_ATTESTATIONS/build_identity.json") {
            reasons.push("BUILD_IDENTITY_MISSING".to_string());
        }
        if !ctx.exists("07_ATTESTATIONS/dependency_lock.json") {
            reasons.push("BUILD_IDENTITY_MISSING: dependency lockfile absent".to_string());
        }
        if !ctx.exists("07_ATTESTATIONS/sbom.json") {
            reasons.push("BUILD_IDENTITY_MISSING: sbom absent".to_string());
        }
        if !ctx.exists("07_ATTESTATIONS/provenance.json") {
            reasons.push("BUILD_IDENTITY_MISSING: provenance absent".to_string());
        }
        if !ctx.exists("07_ATTESTATIONS/trust_roots.json") {
            reasons.push("TRUST_ROOTS_MISSING".to_string());
        }
        if reasons.is_empty() {
            GateResult::ok()
        } else {
            GateResult {
                pass: false,
                reasons,
                evidence_paths: vec!["07_ATTESTATIONS".to_string()],
                metrics: Value::Null,
            }
        }
    }
}

pub struct G1ProofReceipts;
impl Gate for G1ProofReceipts {
    fn id(&self) -> &'static str {
        "G1"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let receipts = ctx.receipts();
        let mut reasons = Vec::new();
        let mut seen_hashes: HashSet<String> = HashSet::new();
        let mut parent_claimed: HashSet<String> = HashSet::new();
        let mut last_seq: HashMap<String, u64> = HashMap::new();

        for r in &receipts {
            if r.tenant_id.trim().is_empty() {
                reasons.push(format!("TENANT_ID_MISSING: receipt {}", r.receipt_hash));
            }
            let prev = last_seq.get(&r.run_id).copied().unwrap_or(0);
            if r.seq <= prev {
                reasons.push(format!("LAMPORT_NOT_MONOTONIC: run {} seq {}", r.run_id, r.seq));
            }
            last_seq.insert(r.run_id.clone(), r.seq);

            if r.action_type.requires_tool_fields() && (r.tool_name.is_none() || r.tool_manifest_hash.is_none()) {
                reasons.push(format!("RECEIPT_DAG_BROKEN: {} missing tool fields", r.receipt_hash));
            }

            for parent in &r.parent_receipt_hashes {
                if parent != "genesis" && !seen_hashes.contains(parent) {
                    reasons.push(format!("RECEIPT_DAG_BROKEN: parent {parent} does not resolve"));
                }
                if parent != "genesis" {
                    if !parent_claimed.insert(parent.clone()) {
                        reasons.push(format!("RECEIPT_DAG_BROKEN: parent {parent} claimed by two receipts"));
                    }
                }
            }

            match r.hashable_bytes() {
                Ok(bytes) => {
                    let recomputed = helm_canon::sha256_hex(&bytes);
                    if recomputed != r.receipt_hash {
                        reasons.push(format!("RECEIPT_CHAIN_BROKEN: {} hash mismatch", r.receipt_hash));
                    }
                }
                Err(_) => reasons.push(format!("RECEIPT_CHAIN_BROKEN: {} not canonicalizable", r.receipt_hash)),
            }

            seen_hashes.insert(r.receipt_hash.clone());
        }

        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["02_PROOFGRAPH/receipts".to_string()],
            metrics: serde_json::json!({"receipt_count": receipts.len()}),
        }
    }
}

pub struct G2Replay;
impl Gate for G2Replay {
    fn id(&self) -> &'static str {
        "G2"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let mut reasons = Vec::new();
        let Some(manifest) = ctx.read_json::<Value>("08_TAPES/tape_manifest.json") else {
            return GateResult::fail("REPLAY_TAPE_MISS: tape_manifest.json absent or unparsable");
        };
        if ctx.dir_nonempty("05_DIFFS") {
            reasons.push("replay produced non-empty 05_DIFFS/".to_string());
        }
        let live = manifest.get("live_hash").and_then(Value::as_str);
        let replay = manifest.get("replay_hash").and_then(Value::as_str);
        match (live, replay) {
            (Some(l), Some(r)) if l == r => {}
            _ => reasons.push("REPLAY_HASH_DIVERGENCE: live_hash != replay_hash".to_string()),
        }

        let receipts = ctx.receipts();
        let mut last: HashMap<String, u64> = HashMap::new();
        for r in &receipts {
            let prev = last.get(&r.run_id).copied().unwrap_or(0);
            if r.timestamp_virtual < prev {
                reasons.push(format!("LAMPORT_NOT_MONOTONIC: run {}", r.run_id));
            }
            last.insert(r.run_id.clone(), r.timestamp_virtual);
        }

        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["08_TAPES/tape_manifest.json".to_string()],
            metrics: Value::Null,
        }
    }
}

pub struct G2ASchemaFirst;
impl Gate for G2ASchemaFirst {
    fn id(&self) -> &'static str {
        "G2A"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        if !ctx.dir_nonempty("09_SCHEMAS/tool_io") {
            return GateResult::fail("09_SCHEMAS/tool_io is empty or missing");
        }
        if !ctx.dir_nonempty("02_PROOFGRAPH/tool_io_commitments") {
            return GateResult::fail("02_PROOFGRAPH/tool_io_commitments is empty or missing");
        }
        GateResult::ok()
    }
}

pub struct G3PolicyFailClosed;
impl Gate for G3PolicyFailClosed {
    fn id(&self) -> &'static str {
        "G3"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let decisions = ctx.read_dir_jsons("02_PROOFGRAPH/policy_decisions");
        let mut reasons = Vec::new();
        for (path, value) in &decisions {
            if value.get("policy_hash").and_then(Value::as_str).unwrap_or_default().is_empty() {
                reasons.push(format!("POLICY_DECISION_MISSING: {} has no policy_hash", ctx.relative(path)));
            }
            if value.get("boundary").is_none() {
                reasons.push(format!("POLICY_DECISION_MISSING: {} has no boundary", ctx.relative(path)));
            }
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["02_PROOFGRAPH/policy_decisions".to_string()],
            metrics: serde_json::json!({"decision_count": decisions.len()}),
        }
    }
}

pub struct G3ABudget;
impl Gate for G3ABudget {
    fn id(&self) -> &'static str {
        "G3A"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let Some(metrics) = ctx.read_json::<Value>("03_TELEMETRY/budget_metrics.json") else {
            return GateResult::fail("BUDGET_EXHAUSTED: budget_metrics.json absent or unparsable");
        };
        let caps_reached = metrics.get("caps_reached").and_then(Value::as_bool).unwrap_or(false);
        let receipts = ctx.receipts();

        let mut exhausted_seq: HashMap<String, u64> = HashMap::new();
        for r in &receipts {
            if matches!(r.action_type, ActionType::BudgetExhausted) {
                exhausted_seq.entry(r.run_id.clone()).or_insert(r.seq);
            }
        }

        let mut reasons = Vec::new();
        if caps_reached && exhausted_seq.is_empty() {
            reasons.push("BUDGET_EXHAUSTED: caps reached but no budget_exhausted receipt".to_string());
        }
        for r in &receipts {
            if matches!(r.action_type, ActionType::BudgetDecrement) {
                if let Some(&exhausted_at) = exhausted_seq.get(&r.run_id) {
                    if r.seq > exhausted_at {
                        reasons.push(format!("BUDGET_EXHAUSTED: decrement seq {} follows exhaustion in run {}", r.seq, r.run_id));
                    }
                }
            }
        }

        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["03_TELEMETRY/budget_metrics.json".to_string()],
            metrics,
        }
    }
}

const SECRET_PATTERNS: &[&str] = &["BEGIN RSA PRIVATE KEY", "BEGIN PRIVATE KEY", "BEGIN OPENSSH PRIVATE KEY", "AKIA"];

pub struct G4Secrets;
impl Gate for G4Secrets {
    fn id(&self) -> &'static str {
        "G4"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let mut reasons = Vec::new();
        for entry in walkdir::WalkDir::new(&ctx.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            let Ok(text) = std::str::from_utf8(&bytes) else {
                continue;
            };
            for pattern in SECRET_PATTERNS {
                if text.contains(pattern) {
                    reasons.push(format!("secret pattern '{pattern}' found in {}", ctx.relative(entry.path())));
                }
            }
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: Vec::new(),
            metrics: Value::Null,
        }
    }
}

const TOOL_MANIFEST_FIELDS: &[&str] = &[
    "tool_id",
    "version",
    "capabilities",
    "side_effect_classes",
    "data_classes_in",
    "data_classes_out",
    "network_scopes",
    "fs_scopes",
    "required_approvals",
    "schemas",
    "signatures",
];

pub struct G5ToolTrust;
impl Gate for G5ToolTrust {
    fn id(&self) -> &'static str {
        "G5"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let manifests = ctx.read_dir_jsons("09_SCHEMAS/tool_manifests");
        let mut reasons = Vec::new();
        if manifests.is_empty() {
            reasons.push("no tool manifests found under 09_SCHEMAS/tool_manifests".to_string());
        }
        for (path, value) in &manifests {
            for field in TOOL_MANIFEST_FIELDS {
                if value.get(*field).is_none() {
                    reasons.push(format!("{} missing field {field}", ctx.relative(path)));
                }
            }
            if value.get("signatures").and_then(Value::as_array).map(|a| a.is_empty()).unwrap_or(true) {
                reasons.push(format!("{} has empty signatures", ctx.relative(path)));
            }
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["09_SCHEMAS/tool_manifests".to_string()],
            metrics: serde_json::json!({"manifest_count": manifests.len()}),
        }
    }
}

pub struct G5AA2a;
impl Gate for G5AA2a {
    fn id(&self) -> &'static str {
        "G5A"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let Some(report) = ctx.read_json::<Value>("10_A2A/proof_capsule_verification.json") else {
            return GateResult::fail("proof_capsule_verification.json absent or unparsable");
        };
        if report.get("all_valid").and_then(Value::as_bool) == Some(true) {
            GateResult::ok()
        } else {
            GateResult::fail("proof capsule verification reports all_valid=false")
        }
    }
}

pub struct G6Taint;
impl Gate for G6Taint {
    fn id(&self) -> &'static str {
        "G6"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let Some(graph) = ctx.read_json::<Value>("03_TELEMETRY/lineage_graph.json") else {
            return GateResult::fail("lineage_graph.json absent or unparsable");
        };
        let mut reasons = Vec::new();
        let violations = graph.get("violations").and_then(Value::as_array).cloned().unwrap_or_default();
        if !violations.is_empty() {
            reasons.push(format!("{} taint violations present", violations.len()));
        }
        let nodes = graph.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();
        for node in &nodes {
            if node.get("lineage_hash").and_then(Value::as_str).unwrap_or_default().is_empty() {
                reasons.push("lineage node missing lineage_hash".to_string());
            }
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["03_TELEMETRY/lineage_graph.json".to_string()],
            metrics: serde_json::json!({"node_count": nodes.len()}),
        }
    }
}

pub struct G7Incident;
impl Gate for G7Incident {
    fn id(&self) -> &'static str {
        "G7"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let has_transition = ctx
            .receipts()
            .iter()
            .any(|r| matches!(r.action_type, ActionType::ContainmentTransition));
        if has_transition || ctx.exists("04_EXPORTS/incident_export.json") {
            GateResult::ok()
        } else {
            GateResult::fail("no containment_transition receipt and no incident export")
        }
    }
}

pub struct G8Hitl;
impl Gate for G8Hitl {
    fn id(&self) -> &'static str {
        "G8"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        if ctx.receipts().iter().any(|r| r.actor == "operator") {
            GateResult::ok()
        } else {
            GateResult::fail("no receipt with actor == \"operator\"")
        }
    }
}

const JURISDICTION_REQUIRED_FILES: &[&str] = &[
    "policy_bundle.json",
    "evidence_requirements.json",
    "retention_rules.json",
    "conformance_report.json",
];

pub struct G9Jurisdiction;
impl Gate for G9Jurisdiction {
    fn id(&self) -> &'static str {
        "G9"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let dir = ctx.path("04_EXPORTS/jurisdictions");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return GateResult::fail("04_EXPORTS/jurisdictions is missing");
        };
        let mut reasons = Vec::new();
        let mut count = 0;
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            count += 1;
            for required in JURISDICTION_REQUIRED_FILES {
                if !entry.path().join(required).is_file() {
                    reasons.push(format!("{}/{required} missing", entry.file_name().to_string_lossy()));
                }
            }
        }
        if count < 2 {
            reasons.push(format!("only {count} jurisdiction packs present, need >=2"));
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["04_EXPORTS/jurisdictions".to_string()],
            metrics: serde_json::json!({"jurisdiction_count": count}),
        }
    }
}

pub struct G10Formal;
impl Gate for G10Formal {
    fn id(&self) -> &'static str {
        "G10"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let mut reasons = Vec::new();
        if !ctx.exists("03_TELEMETRY/telemetry_events.jsonl") {
            reasons.push("03_TELEMETRY/telemetry_events.jsonl missing".to_string());
        }
        match ctx.read_json::<Value>("11_FORMAL/mdp_export.json") {
            Some(v) if v.get("states").is_some() => {}
            Some(_) => reasons.push("mdp_export.json missing \"states\" key".to_string()),
            None => reasons.push("11_FORMAL/mdp_export.json absent or unparsable".to_string()),
        }
        let has_properties = ["json", "yaml", "txt"]
            .iter()
            .any(|ext| ctx.exists(&format!("11_FORMAL/properties.{ext}")));
        if !has_properties {
            reasons.push("11_FORMAL/properties.* missing".to_string());
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["11_FORMAL".to_string()],
            metrics: Value::Null,
        }
    }
}

const REQUIRED_SLOS: &[&str] = &[
    "availability",
    "latency_p99",
    "receipt_emission_success_rate",
    "replay_determinism_rate",
    "containment_mttr",
];

pub struct G11Operability;
impl Gate for G11Operability {
    fn id(&self) -> &'static str {
        "G11"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let mut reasons = Vec::new();
        match ctx.read_json::<Value>("03_TELEMETRY/slo.json") {
            Some(v) => {
                let names: HashSet<String> = v
                    .get("slos")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|x| x.get("name").and_then(Value::as_str)).map(String::from).collect())
                    .unwrap_or_default();
                for required in REQUIRED_SLOS {
                    if !names.contains(*required) {
                        reasons.push(format!("SLO '{required}' missing"));
                    }
                }
            }
            None => reasons.push("03_TELEMETRY/slo.json absent or unparsable".to_string()),
        }
        if !ctx.exists("12_REPORTS/dashboard_snapshot.json") {
            reasons.push("12_REPORTS/dashboard_snapshot.json missing".to_string());
        }
        if !ctx.exists("12_REPORTS/runbook_index.json") {
            reasons.push("12_REPORTS/runbook_index.json missing".to_string());
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["03_TELEMETRY/slo.json".to_string(), "12_REPORTS".to_string()],
            metrics: Value::Null,
        }
    }
}

pub struct G12SupplyChain;
impl Gate for G12SupplyChain {
    fn id(&self) -> &'static str {
        "G12"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let mut reasons = Vec::new();
        if ctx.read_json::<Value>("07_ATTESTATIONS/pack_signatures.json").is_none() {
            reasons.push("07_ATTESTATIONS/pack_signatures.json absent or unparsable".to_string());
        }
        if !ctx.exists("07_ATTESTATIONS/trust_roots.json") {
            reasons.push("TRUST_ROOTS_MISSING".to_string());
        }
        let has_pack_receipt = ctx.receipts().iter().any(|r| {
            matches!(
                r.action_type,
                ActionType::PackInstall | ActionType::PackUpgrade | ActionType::PackRollback
            )
        });
        if !has_pack_receipt {
            reasons.push("no pack_install/upgrade/rollback receipt".to_string());
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["07_ATTESTATIONS".to_string()],
            metrics: Value::Null,
        }
    }
}

pub struct GxTenant;
impl Gate for GxTenant {
    fn id(&self) -> &'static str {
        "GX_TENANT"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let receipts = ctx.receipts();
        let mut reasons = Vec::new();
        let mut tenants: HashSet<String> = HashSet::new();
        for r in &receipts {
            if r.tenant_id.trim().is_empty() {
                reasons.push(format!("TENANT_ID_MISSING: {}", r.receipt_hash));
            }
            tenants.insert(r.tenant_id.clone());
        }
        if tenants.len() > 1 {
            reasons.push(format!("TENANT_ISOLATION_VIOLATION: {} distinct tenant_ids in one run", tenants.len()));
        }
        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["02_PROOFGRAPH/receipts".to_string()],
            metrics: serde_json::json!({"tenant_count": tenants.len()}),
        }
    }
}

pub struct GxEnvelope;
impl Gate for GxEnvelope {
    fn id(&self) -> &'static str {
        "GX_ENVELOPE"
    }
    fn run(&self, ctx: &GateContext) -> GateResult {
        let receipts = ctx.receipts();
        let mut reasons = Vec::new();

        for r in &receipts {
            if matches!(r.action_type, ActionType::EffectAttempt | ActionType::EffectDenied) {
                if r.envelope_id.trim().is_empty() || r.envelope_hash.trim().is_empty() {
                    reasons.push(format!("ENVELOPE_NOT_BOUND: {}", r.receipt_hash));
                }
            }
        }

        let denials: HashSet<Option<String>> = receipts
            .iter()
            .filter(|r| matches!(r.action_type, ActionType::EffectDenied))
            .map(|r| r.decision_id.clone())
            .collect();
        for r in &receipts {
            if matches!(r.action_type, ActionType::PolicyDecision) && r.effect_type == "deny" && !denials.contains(&r.decision_id) {
                reasons.push(format!("ENVELOPE_DENIAL_NO_RECEIPT: decision {:?} has no matching effect_denied", r.decision_id));
            }
        }

        GateResult {
            pass: reasons.is_empty(),
            reasons,
            evidence_paths: vec!["02_PROOFGRAPH/receipts".to_string()],
            metrics: Value::Null,
        }
    }
}

pub fn canonical_gates() -> Vec<Box<dyn Gate>> {
    vec![
        Box::new(G0BuildIdentity),
        Box::new(G1ProofReceipts),
        Box::new(G2Replay),
        Box::new(G2ASchemaFirst),
        Box::new(G3PolicyFailClosed),
        Box::new(G3ABudget),
        Box::new(G4Secrets),
        Box::new(G5ToolTrust),
        Box::new(G5AA2a),
        Box::new(G6Taint),
        Box::new(G7Incident),
        Box::new(G8Hitl),
        Box::new(G9Jurisdiction),
        Box::new(G10Formal),
        Box::new(G11Operability),
        Box::new(G12SupplyChain),
        Box::new(GxTenant),
        Box::new(GxEnvelope),
    ]
}
