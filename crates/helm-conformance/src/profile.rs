//! The profile → required-gates table. `packages/helm-conformance/profiles.json`
//! at the repository root is authoritative (§4.14.2); [`PROFILES`] mirrors
//! it in-process and a test asserts the two stay in lock-step.

use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Profile {
    Smb,
    Core,
    Enterprise,
    RegulatedFinance,
    RegulatedHealth,
    AgenticWebRouter,
}

impl Profile {
    pub fn key(self) -> &'static str {
        match self {
            Profile::Smb => "SMB",
            Profile::Core => "CORE",
            Profile::Enterprise => "ENTERPRISE",
            Profile::RegulatedFinance => "REGULATED_FINANCE",
            Profile::RegulatedHealth => "REGULATED_HEALTH",
            Profile::AgenticWebRouter => "AGENTIC_WEB_ROUTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SMB" => Some(Profile::Smb),
            "CORE" => Some(Profile::Core),
            "ENTERPRISE" => Some(Profile::Enterprise),
            "REGULATED_FINANCE" => Some(Profile::RegulatedFinance),
            "REGULATED_HEALTH" => Some(Profile::RegulatedHealth),
            "AGENTIC_WEB_ROUTER" => Some(Profile::AgenticWebRouter),
            _ => None,
        }
    }
}

/// The canonical file, embedded at compile time so the binary never
/// depends on a runtime filesystem lookup to know its own profile table.
pub const PROFILES_JSON: &str = include_str!("../../../packages/helm-conformance/profiles.json");

pub static PROFILES: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("SMB", vec!["G0", "G1", "G2", "G3", "G3A", "G5", "G7", "G8", "GX_ENVELOPE"]);
    m.insert(
        "CORE",
        vec!["G0", "G1", "G2", "G2A", "G3", "G3A", "G5", "G6", "G7", "G8", "G12", "GX_ENVELOPE"],
    );
    m.insert(
        "ENTERPRISE",
        vec![
            "G0", "G1", "G2", "G2A", "G3", "G3A", "G4", "G5", "G6", "G7", "G8", "G9", "G11", "G12", "GX_TENANT", "GX_ENVELOPE",
        ],
    );
    m.insert(
        "REGULATED_FINANCE",
        vec![
            "G0", "G1", "G2", "G2A", "G3", "G3A", "G4", "G5", "G5A", "G6", "G7", "G8", "G9", "G10", "G11", "G12", "GX_TENANT",
            "GX_ENVELOPE",
        ],
    );
    m.insert(
        "REGULATED_HEALTH",
        vec![
            "G0", "G1", "G2", "G2A", "G3", "G3A", "G4", "G5", "G6", "G7", "G8", "G9", "G10", "G11", "G12", "GX_TENANT", "GX_ENVELOPE",
        ],
    );
    m.insert(
        "AGENTIC_WEB_ROUTER",
        vec![
            "G0", "G1", "G2", "G2A", "G3", "G3A", "G4", "G5", "G5A", "G6", "G7", "G8", "G9", "G11", "G12", "GX_TENANT",
            "GX_ENVELOPE",
        ],
    );
    m
});

pub fn required_gates(profile: Profile) -> Vec<&'static str> {
    PROFILES.get(profile.key()).cloned().unwrap_or_default()
}

#[derive(Debug, serde::Deserialize)]
struct ProfilesFile {
    profiles: HashMap<String, ProfileEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct ProfileEntry {
    required_gates: Vec<String>,
}

/// Compares [`PROFILES`] against the parsed canonical JSON; `Ok(())` iff
/// every profile's gate list matches exactly (order-insensitive).
pub fn check_drift() -> Result<(), String> {
    let parsed: ProfilesFile = serde_json::from_str(PROFILES_JSON).map_err(|e| e.to_string())?;
    for (name, gates) in PROFILES.iter() {
        let Some(canonical) = parsed.profiles.get(*name) else {
            return Err(format!("profile {name} missing from profiles.json"));
        };
        let mut a: Vec<&str> = gates.clone();
        let mut b: Vec<&str> = canonical.required_gates.iter().map(|s| s.as_str()).collect();
        a.sort();
        b.sort();
        if a != b {
            return Err(format!("profile {name} drifted: in-process {a:?} vs canonical {b:?}"));
        }
    }
    if parsed.profiles.len() != PROFILES.len() {
        return Err("profiles.json declares a profile not present in PROFILES".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_table_matches_canonical_json() {
        check_drift().unwrap();
    }

    #[test]
    fn parse_round_trips_key() {
        assert_eq!(Profile::parse("ENTERPRISE"), Some(Profile::Enterprise));
        assert_eq!(Profile::Enterprise.key(), "ENTERPRISE");
    }
}
