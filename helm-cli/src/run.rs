use std::path::Path;

use anyhow::{anyhow, Result};
use tracing::info;

use helm_conformance::engine::{ConformanceEngine, RunOptions};
use helm_conformance::profile::Profile;
use helm_conformance::report::ConformanceScore;

pub async fn handle_run(profile: &str, jurisdiction: &str, gate_filter: Option<&str>, output: &Path, json: bool) -> Result<bool> {
    let profile = Profile::parse(profile).ok_or_else(|| anyhow!("unknown profile '{profile}'"))?;
    let gate_filter = gate_filter.map(|csv| csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect());

    info!(profile = profile.key(), jurisdiction, output = %output.display(), "running conformance gates");

    let engine = ConformanceEngine::new();
    let options = RunOptions {
        profile,
        jurisdiction: jurisdiction.to_string(),
        gate_filter,
        evidence_root: output.to_path_buf(),
        sign_with: None,
    };
    let score = engine.run(options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&score)?);
    } else {
        print_human(&score);
    }

    Ok(score.overall_pass)
}

fn print_human(score: &ConformanceScore) {
    println!("profile:      {}", score.profile);
    println!("jurisdiction: {}", score.jurisdiction);
    println!("generated_at: {}", score.generated_at);
    println!();
    for gate in &score.gates {
        let mark = if gate.result.pass { "PASS" } else { "FAIL" };
        println!("  [{mark}] {}", gate.gate_id);
        for reason in &gate.result.reasons {
            println!("        - {reason}");
        }
    }
    println!();
    println!("overall: {}", if score.overall_pass { "PASS" } else { "FAIL" });
}
