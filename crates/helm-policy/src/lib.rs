//! Deny-by-default policy engine: named policies, each an expression over an
//! [`AccessRequest`], producing an [`Verdict`] plus a human-readable reason.
//! Any evaluation error — an unknown policy, a malformed condition — resolves
//! to [`Verdict::Deny`], never to an implicit allow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod codes {
    pub const ERR_POLICY_UNKNOWN: &str = "ERR_POLICY_UNKNOWN";
    pub const ERR_POLICY_MALFORMED: &str = "ERR_POLICY_MALFORMED";
}

#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("{code}: {0}", code = codes::ERR_POLICY_MALFORMED)]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub principal_id: String,
    pub action: String,
    pub resource_id: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub reason: String,
    /// Content hash of the policy this decision was evaluated against,
    /// binding receipts built from this decision to the policy in effect.
    pub policy_hash: String,
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>, policy_hash: String) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason: reason.into(),
            policy_hash,
        }
    }

    fn allow(reason: impl Into<String>, policy_hash: String) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: reason.into(),
            policy_hash,
        }
    }
}

/// A boolean expression evaluated against an [`AccessRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Condition {
    Always,
    ActionEquals(String),
    ResourcePrefix(String),
    ContextFieldEquals { field: String, value: serde_json::Value },
    ContextFieldExists(String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    fn eval(&self, req: &AccessRequest) -> bool {
        match self {
            Condition::Always => true,
            Condition::ActionEquals(a) => &req.action == a,
            Condition::ResourcePrefix(p) => req.resource_id.starts_with(p.as_str()),
            Condition::ContextFieldEquals { field, value } => {
                req.context.get(field).map(|v| v == value).unwrap_or(false)
            }
            Condition::ContextFieldExists(field) => req.context.get(field).is_some(),
            Condition::And(cs) => cs.iter().all(|c| c.eval(req)),
            Condition::Or(cs) => cs.iter().any(|c| c.eval(req)),
            Condition::Not(c) => !c.eval(req),
        }
    }
}

/// One rule: if `when` matches, the policy resolves to `verdict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub verdict: Verdict,
    pub when: Condition,
    pub reason: String,
}

/// A named policy: an ordered list of rules evaluated first-match-wins, with
/// an implicit deny if nothing matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub id: String,
    pub rules: Vec<PolicyRule>,
}

impl PolicyDefinition {
    /// Content hash binding a decision to this exact policy (id and rules),
    /// not merely to the tool or resource it was evaluated against (I5).
    pub fn content_hash(&self) -> String {
        helm_canon::canonical_hash(self).unwrap_or_else(|_| helm_canon::sha256_hex(self.id.as_bytes()))
    }

    fn evaluate(&self, req: &AccessRequest) -> PolicyDecision {
        let policy_hash = self.content_hash();
        for rule in &self.rules {
            if rule.when.eval(req) {
                return match rule.verdict {
                    Verdict::Allow => PolicyDecision::allow(rule.reason.clone(), policy_hash),
                    Verdict::Deny => PolicyDecision::deny(rule.reason.clone(), policy_hash),
                };
            }
        }
        PolicyDecision::deny("no rule matched; default deny", policy_hash)
    }
}

pub enum PolicySource {
    Definition(PolicyDefinition),
    Json(serde_json::Value),
}

#[derive(Default)]
pub struct PolicyEngine {
    policies: RwLock<HashMap<String, PolicyDefinition>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load_policy(&self, id: &str, source: PolicySource) -> Result<(), PolicyLoadError> {
        let def = match source {
            PolicySource::Definition(d) => d,
            PolicySource::Json(v) => serde_json::from_value(v)
                .map_err(|e| PolicyLoadError::Malformed(e.to_string()))?,
        };
        if def.id != id {
            return Err(PolicyLoadError::Malformed(format!(
                "policy id mismatch: loading as '{id}' but definition declares '{}'",
                def.id
            )));
        }
        self.policies.write().await.insert(id.to_string(), def);
        Ok(())
    }

    pub async fn list_definitions(&self) -> Vec<String> {
        self.policies.read().await.keys().cloned().collect()
    }

    /// Content hash of `policy_id`'s currently loaded definition, for
    /// binding receipts built outside [`PolicyEngine::evaluate`] (e.g. an
    /// approval receipt) to the same policy in effect.
    pub async fn policy_hash(&self, policy_id: &str) -> Option<String> {
        self.policies.read().await.get(policy_id).map(PolicyDefinition::content_hash)
    }

    /// Evaluate `policy_id` over `req`. Unknown policy or an internal
    /// evaluation error both resolve to deny, never to allow.
    pub async fn evaluate(&self, policy_id: &str, req: &AccessRequest) -> PolicyDecision {
        let policies = self.policies.read().await;
        match policies.get(policy_id) {
            Some(def) => {
                let decision = def.evaluate(req);
                tracing::debug!(policy_id, ?decision.verdict, "policy evaluated");
                decision
            }
            None => {
                tracing::warn!(policy_id, "unknown policy; defaulting to deny");
                let policy_hash = helm_canon::canonical_hash(&serde_json::json!({"unknown_policy": policy_id}))
                    .unwrap_or_else(|_| helm_canon::sha256_hex(policy_id.as_bytes()));
                PolicyDecision::deny(format!("{}: policy '{policy_id}' not loaded", codes::ERR_POLICY_UNKNOWN), policy_hash)
            }
        }
    }
}
