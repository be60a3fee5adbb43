//! Adversarial suite (§4.15): ten named checks, each mirroring one of the
//! receipt-DAG / envelope / budget invariants, run directly against an
//! EvidencePack directory rather than through the conformance engine.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use helm_receipts::envelope::{ActionType, EffectClass, ReceiptEnvelope};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub pass: bool,
    pub detail: Option<String>,
}

impl TestResult {
    fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pass: true,
            detail: None,
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            pass: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub id: &'static str,
    pub pass: bool,
    pub tests: Vec<TestResult>,
}

fn suite(id: &'static str, tests: Vec<TestResult>) -> SuiteResult {
    SuiteResult {
        pass: tests.iter().all(|t| t.pass),
        id,
        tests,
    }
}

fn read_receipts(root: &Path) -> Vec<ReceiptEnvelope> {
    let dir = root.join("02_PROOFGRAPH/receipts");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(bytes) = std::fs::read(entry.path()) {
            if let Ok(r) = serde_json::from_slice::<ReceiptEnvelope>(&bytes) {
                out.push(r);
            }
        }
    }
    out.sort_by(|a, b| (a.run_id.clone(), a.seq).cmp(&(b.run_id.clone(), b.seq)));
    out
}

fn by_run(receipts: &[ReceiptEnvelope]) -> HashMap<String, Vec<&ReceiptEnvelope>> {
    let mut map: HashMap<String, Vec<&ReceiptEnvelope>> = HashMap::new();
    for r in receipts {
        map.entry(r.run_id.clone()).or_default().push(r);
    }
    map
}

pub fn adv01_receipt_gap(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut tests = Vec::new();
    for (run_id, rs) in by_run(&receipts) {
        let mut seqs: Vec<u64> = rs.iter().map(|r| r.seq).collect();
        seqs.sort_unstable();
        let contiguous = seqs.iter().enumerate().all(|(i, &s)| s == (i as u64) + 1);
        if contiguous {
            tests.push(TestResult::ok(&format!("run {run_id} has contiguous seq")));
        } else {
            tests.push(TestResult::fail(&format!("run {run_id} has contiguous seq"), format!("seqs: {seqs:?}")));
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no receipts present"));
    }
    suite("ADV-01", tests)
}

pub fn adv02_policy_bypass(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut tests = Vec::new();
    for (run_id, rs) in by_run(&receipts) {
        let decisions: HashSet<(Option<String>, u64)> = rs
            .iter()
            .filter(|r| matches!(r.action_type, ActionType::PolicyDecision))
            .map(|r| (r.decision_id.clone(), r.seq))
            .collect();
        for effect in rs.iter().filter(|r| matches!(r.action_type, ActionType::EffectAttempt)) {
            let has_prior_decision = decisions.iter().any(|(id, seq)| *id == effect.decision_id && *seq < effect.seq);
            if has_prior_decision {
                tests.push(TestResult::ok(&format!("run {run_id} effect {} has preceding policy_decision", effect.receipt_hash)));
            } else {
                tests.push(TestResult::fail(
                    &format!("run {run_id} effect {} has preceding policy_decision", effect.receipt_hash),
                    "no matching policy_decision before this effect_attempt",
                ));
            }
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no effect_attempt receipts present"));
    }
    suite("ADV-02", tests)
}

pub fn adv03_dag_fork(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut claimed: HashMap<String, String> = HashMap::new();
    let mut tests = Vec::new();
    for r in &receipts {
        for parent in &r.parent_receipt_hashes {
            if parent == "genesis" {
                continue;
            }
            if let Some(existing) = claimed.get(parent) {
                if existing != &r.receipt_hash {
                    tests.push(TestResult::fail(
                        &format!("parent {parent} has a single child"),
                        format!("claimed by both {existing} and {}", r.receipt_hash),
                    ));
                    continue;
                }
            }
            claimed.insert(parent.clone(), r.receipt_hash.clone());
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no forked parents"));
    }
    suite("ADV-03", tests)
}

pub fn adv04_budget_overdraft(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut tests = Vec::new();
    for (run_id, rs) in by_run(&receipts) {
        let Some(exhausted_seq) = rs
            .iter()
            .filter(|r| matches!(r.action_type, ActionType::BudgetExhausted))
            .map(|r| r.seq)
            .min()
        else {
            continue;
        };
        let overdraft: Vec<u64> = rs
            .iter()
            .filter(|r| matches!(r.action_type, ActionType::BudgetDecrement) && r.seq > exhausted_seq)
            .map(|r| r.seq)
            .collect();
        if overdraft.is_empty() {
            tests.push(TestResult::ok(&format!("run {run_id} has no decrement after exhaustion")));
        } else {
            tests.push(TestResult::fail(
                &format!("run {run_id} has no decrement after exhaustion"),
                format!("decrements at seq {overdraft:?} follow exhaustion at {exhausted_seq}"),
            ));
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no budget_exhausted receipts present"));
    }
    suite("ADV-04", tests)
}

pub fn adv05_envelope_escape(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut tests = Vec::new();
    for r in receipts.iter().filter(|r| matches!(r.action_type, ActionType::EffectAttempt | ActionType::EffectDenied)) {
        if r.envelope_id.trim().is_empty() || r.envelope_hash.trim().is_empty() {
            tests.push(TestResult::fail(&format!("receipt {} carries an envelope binding", r.receipt_hash), "empty envelope_id or envelope_hash"));
        } else {
            tests.push(TestResult::ok(&format!("receipt {} carries an envelope binding", r.receipt_hash)));
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no effect receipts present"));
    }
    suite("ADV-05", tests)
}

pub fn adv06_tape_replay_tamper(root: &Path) -> SuiteResult {
    let mut tests = Vec::new();
    match std::fs::read(root.join("08_TAPES/tape_entries.json")) {
        Ok(bytes) => match serde_json::from_slice::<Vec<Value>>(&bytes) {
            Ok(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    let has_hash = entry.get("value_hash").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);
                    let has_class = entry.get("data_class").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);
                    if has_hash && has_class {
                        tests.push(TestResult::ok(&format!("tape entry {i} has value_hash and data_class")));
                    } else {
                        tests.push(TestResult::fail(&format!("tape entry {i} has value_hash and data_class"), "missing field"));
                    }
                }
            }
            Err(e) => tests.push(TestResult::fail("tape_entries.json parses", e.to_string())),
        },
        Err(_) => tests.push(TestResult::ok("no tape_entries.json present")),
    }
    suite("ADV-06", tests)
}

pub fn adv07_tenant_cross_leak(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut tests = Vec::new();
    for (run_id, rs) in by_run(&receipts) {
        let tenants: HashSet<&str> = rs.iter().map(|r| r.tenant_id.as_str()).collect();
        if tenants.len() <= 1 {
            tests.push(TestResult::ok(&format!("run {run_id} has a single tenant_id")));
        } else {
            tests.push(TestResult::fail(&format!("run {run_id} has a single tenant_id"), format!("{tenants:?}")));
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no receipts present"));
    }
    suite("ADV-07", tests)
}

const REQUIRED_MANIFEST_FIELDS: &[&str] = &[
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

pub fn adv08_tool_manifest_forge(root: &Path) -> SuiteResult {
    let dir = root.join("09_SCHEMAS/tool_manifests");
    let mut tests = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        tests.push(TestResult::ok("no tool manifests present"));
        return suite("ADV-08", tests);
    };
    for entry in entries.flatten() {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(bytes) = std::fs::read(entry.path()) else { continue };
        let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
            tests.push(TestResult::fail(&format!("{name} parses as a manifest"), "invalid json"));
            continue;
        };
        let missing: Vec<&str> = REQUIRED_MANIFEST_FIELDS.iter().filter(|f| value.get(**f).is_none()).copied().collect();
        let sig_empty = value.get("signatures").and_then(Value::as_array).map(|a| a.is_empty()).unwrap_or(true);
        if missing.is_empty() && !sig_empty {
            tests.push(TestResult::ok(&format!("{name} carries all required fields and a signature")));
        } else {
            tests.push(TestResult::fail(
                &format!("{name} carries all required fields and a signature"),
                format!("missing={missing:?} empty_signatures={sig_empty}"),
            ));
        }
    }
    suite("ADV-08", tests)
}

pub fn adv09_emission_panic_hijack(root: &Path) -> SuiteResult {
    let mut tests = Vec::new();
    match std::fs::read(root.join("06_LOGS/receipt_emission_panic.json")) {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(record) => {
                let run_id = record.get("run_id").and_then(Value::as_str).unwrap_or_default();
                let last_good_seq = record.get("last_good_seq").and_then(Value::as_u64).unwrap_or(0);
                let offenders: Vec<u64> = read_receipts(root)
                    .into_iter()
                    .filter(|r| r.run_id == run_id && r.seq > last_good_seq)
                    .map(|r| r.seq)
                    .collect();
                if offenders.is_empty() {
                    tests.push(TestResult::ok("no receipts follow the panic's last_good_seq"));
                } else {
                    tests.push(TestResult::fail("no receipts follow the panic's last_good_seq", format!("{offenders:?}")));
                }
            }
            Err(e) => tests.push(TestResult::fail("panic record parses", e.to_string())),
        },
        Err(_) => tests.push(TestResult::ok("no panic record present")),
    }
    suite("ADV-09", tests)
}

pub fn adv10_high_finality_unsigned(root: &Path) -> SuiteResult {
    let receipts = read_receipts(root);
    let mut tests = Vec::new();
    for (run_id, rs) in by_run(&receipts) {
        let approvals: HashSet<Option<String>> = rs
            .iter()
            .filter(|r| matches!(r.action_type, ActionType::ApprovalAction))
            .map(|r| r.decision_id.clone())
            .collect();
        for effect in rs.iter().filter(|r| {
            matches!(r.action_type, ActionType::EffectAttempt) && matches!(r.effect_class, EffectClass::E4 | EffectClass::E5)
        }) {
            if approvals.contains(&effect.decision_id) {
                tests.push(TestResult::ok(&format!("run {run_id} high-finality effect {} is approved", effect.receipt_hash)));
            } else {
                tests.push(TestResult::fail(
                    &format!("run {run_id} high-finality effect {} is approved", effect.receipt_hash),
                    "no approval_action receipt for this decision_id",
                ));
            }
        }
    }
    if tests.is_empty() {
        tests.push(TestResult::ok("no high-finality effect receipts present"));
    }
    suite("ADV-10", tests)
}

pub fn run_all(root: &Path) -> Vec<SuiteResult> {
    vec![
        adv01_receipt_gap(root),
        adv02_policy_bypass(root),
        adv03_dag_fork(root),
        adv04_budget_overdraft(root),
        adv05_envelope_escape(root),
        adv06_tape_replay_tamper(root),
        adv07_tenant_cross_leak(root),
        adv08_tool_manifest_forge(root),
        adv09_emission_panic_hijack(root),
        adv10_high_finality_unsigned(root),
    ]
}

pub fn aggregate_pass(results: &[SuiteResult]) -> bool {
    results.iter().all(|r| r.pass)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pack_passes_vacuously() {
        let dir = tempfile::tempdir().unwrap();
        let results = run_all(dir.path());
        assert!(aggregate_pass(&results));
        assert_eq!(results.len(), 10);
    }

    #[test]
    fn forged_manifest_missing_signatures_fails_adv08() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("09_SCHEMAS/tool_manifests")).unwrap();
        std::fs::write(
            dir.path().join("09_SCHEMAS/tool_manifests/t1.json"),
            serde_json::json!({"tool_id": "t1"}).to_string(),
        )
        .unwrap();
        let result = adv08_tool_manifest_forge(dir.path());
        assert!(!result.pass);
    }
}
