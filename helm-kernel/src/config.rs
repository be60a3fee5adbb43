//! Kernel configuration: nested TOML-backed structs with per-section
//! defaults, loaded and validated the way `BpciConfig` loads deployment
//! config — one file, one `validate()` pass, fail closed on anything
//! inconsistent.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    pub run: RunConfig,
    pub rate_limit: RateLimitConfig,
    pub budget: BudgetConfig,
    pub containment: ContainmentConfig,
    pub evidence: EvidenceConfig,
    pub signing: SigningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub default_tenant_id: String,
    pub default_jurisdiction: String,
    pub schema_version: String,
    pub policy_version: String,
    pub idempotency_ttl_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_tenant_id: "default".to_string(),
            default_jurisdiction: "US".to_string(),
            schema_version: "1".to_string(),
            policy_version: "1".to_string(),
            idempotency_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub default_rpm: u32,
    pub default_burst: u32,
    /// Per-actor overrides, keyed by `actor_id`.
    #[serde(default)]
    pub overrides: HashMap<String, (u32, u32)>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rpm: 600,
            default_burst: 20,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub time_ms: u64,
    pub tokens: u64,
    pub tool_calls: u64,
    pub spend_cents: u64,
    pub recursion_depth: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            time_ms: 120_000,
            tokens: 200_000,
            tool_calls: 50,
            spend_cents: 2_000,
            recursion_depth: 8,
        }
    }
}

impl From<BudgetConfig> for helm_budget::BudgetCaps {
    fn from(c: BudgetConfig) -> Self {
        helm_budget::BudgetCaps {
            time_ms: c.time_ms,
            tokens: c.tokens,
            tool_calls: c.tool_calls,
            spend_cents: c.spend_cents,
            recursion_depth: c.recursion_depth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainmentConfig {
    /// Whether a budget exhaustion on any run should also freeze the
    /// process-wide containment controller, not just halt that run.
    pub freeze_on_budget_exhaustion: bool,
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        Self {
            freeze_on_budget_exhaustion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    pub output_root: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            output_root: "./evidence".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningKeySource {
    /// Generate an ephemeral key at startup — development / test only.
    Ephemeral,
    /// Read a 32-byte raw Ed25519 seed from the given file path.
    SeedFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    pub source: SigningKeySource,
    pub seed_path: Option<String>,
    pub key_id: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            source: SigningKeySource::Ephemeral,
            seed_path: None,
            key_id: "kernel-key".to_string(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            rate_limit: RateLimitConfig::default(),
            budget: BudgetConfig::default(),
            containment: ContainmentConfig::default(),
            evidence: EvidenceConfig::default(),
            signing: SigningConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Load from a TOML file and validate it. Missing sections fall back to
    /// their defaults via `#[serde(default)]` on the caller's document, not
    /// here — this mirrors `BpciConfig::load_from_file`'s single
    /// read-then-validate pass.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("reading kernel config {}: {e}", path.as_ref().display()))?;
        let config: KernelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.default_tenant_id.trim().is_empty() {
            return Err(anyhow!("run.default_tenant_id must not be empty"));
        }
        if self.signing.source == SigningKeySource::SeedFile && self.signing.seed_path.is_none() {
            return Err(anyhow!("signing.seed_path is required when signing.source = \"seed_file\""));
        }
        if self.budget.time_ms == 0 && self.budget.tokens == 0 && self.budget.tool_calls == 0 {
            return Err(anyhow!("budget config must cap at least one dimension above zero"));
        }
        Ok(())
    }
}
