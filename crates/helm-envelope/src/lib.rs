//! The autonomy envelope and the binder that enforces it on every effect.
//!
//! Binding is pure decision logic: [`EnvelopeBinder::check`] never emits a
//! receipt itself. `spec.md` §4.9 requires that a denial MUST produce a
//! receipt ("a silent drop fails gate GX_ENVELOPE"); the embedder
//! (`helm-kernel`) is responsible for turning a [`Denial`] into an
//! `effect_denied` receipt via `helm-receipts`.

use chrono::{DateTime, Utc};
use helm_receipts::EffectClass;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeConstraints {
    pub network_scopes: HashSet<String>,
    pub fs_scopes: HashSet<String>,
    pub effect_classes: HashSet<EffectClassKey>,
    pub data_classes: HashSet<String>,
}

/// `EffectClass` does not implement `Hash`/`Eq` in `helm-receipts` (it is a
/// plain enum there); this newtype gives the binder a hashable key without
/// adding derive bloat to the shared receipt type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectClassKey {
    E1,
    E2,
    E3,
    E4,
    E5,
}

impl From<EffectClass> for EffectClassKey {
    fn from(value: EffectClass) -> Self {
        match value {
            EffectClass::E1 => EffectClassKey::E1,
            EffectClass::E2 => EffectClassKey::E2,
            EffectClass::E3 => EffectClassKey::E3,
            EffectClass::E4 => EffectClassKey::E4,
            EffectClass::E5 => EffectClassKey::E5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyEnvelope {
    pub envelope_id: String,
    pub envelope_hash: String,
    pub jurisdiction: String,
    pub tenant_id: String,
    pub constraints: EnvelopeConstraints,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectRequest {
    pub network_scopes: HashSet<String>,
    pub fs_scopes: HashSet<String>,
    pub effect_class: EffectClass,
    pub data_classes: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    /// No envelope is currently bound, or the bound envelope does not match.
    EnvelopeNotBound,
    /// An envelope is bound, but the requested capability is not a subset
    /// of its constraints.
    EnvelopeNotEnforced,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::EnvelopeNotBound => "ENVELOPE_NOT_BOUND",
            DenialReason::EnvelopeNotEnforced => "ENVELOPE_NOT_ENFORCED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingDecision {
    Admitted,
    Denied(Denial),
}

pub struct EnvelopeBinder;

impl EnvelopeBinder {
    /// `bound` is the envelope currently active for the run, if any.
    pub fn check(bound: Option<&AutonomyEnvelope>, requested: &EffectRequest, now: DateTime<Utc>) -> BindingDecision {
        let Some(envelope) = bound else {
            return BindingDecision::Denied(Denial {
                reason: DenialReason::EnvelopeNotBound,
            });
        };
        if now < envelope.valid_from || now > envelope.valid_until {
            return BindingDecision::Denied(Denial {
                reason: DenialReason::EnvelopeNotBound,
            });
        }

        let class_ok = envelope
            .constraints
            .effect_classes
            .contains(&requested.effect_class.into());
        let network_ok = requested.network_scopes.is_subset(&envelope.constraints.network_scopes);
        let fs_ok = requested.fs_scopes.is_subset(&envelope.constraints.fs_scopes);
        let data_ok = requested.data_classes.is_subset(&envelope.constraints.data_classes);

        if class_ok && network_ok && fs_ok && data_ok {
            BindingDecision::Admitted
        } else {
            BindingDecision::Denied(Denial {
                reason: DenialReason::EnvelopeNotEnforced,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn envelope() -> AutonomyEnvelope {
        let now = Utc::now();
        AutonomyEnvelope {
            envelope_id: "env1".into(),
            envelope_hash: "sha256:h".into(),
            jurisdiction: "US".into(),
            tenant_id: "t1".into(),
            constraints: EnvelopeConstraints {
                network_scopes: ["https://example.com".to_string()].into_iter().collect(),
                fs_scopes: HashSet::new(),
                effect_classes: [EffectClassKey::E1, EffectClassKey::E2].into_iter().collect(),
                data_classes: HashSet::new(),
            },
            valid_from: now - Duration::hours(1),
            valid_until: now + Duration::hours(1),
        }
    }

    #[test]
    fn no_bound_envelope_denies_not_bound() {
        let req = EffectRequest {
            network_scopes: HashSet::new(),
            fs_scopes: HashSet::new(),
            effect_class: EffectClass::E1,
            data_classes: HashSet::new(),
        };
        let decision = EnvelopeBinder::check(None, &req, Utc::now());
        assert_eq!(
            decision,
            BindingDecision::Denied(Denial {
                reason: DenialReason::EnvelopeNotBound
            })
        );
    }

    #[test]
    fn scope_outside_constraints_denies_not_enforced() {
        let env = envelope();
        let req = EffectRequest {
            network_scopes: ["https://evil.example".to_string()].into_iter().collect(),
            fs_scopes: HashSet::new(),
            effect_class: EffectClass::E1,
            data_classes: HashSet::new(),
        };
        let decision = EnvelopeBinder::check(Some(&env), &req, Utc::now());
        assert_eq!(
            decision,
            BindingDecision::Denied(Denial {
                reason: DenialReason::EnvelopeNotEnforced
            })
        );
    }

    #[test]
    fn subset_request_is_admitted() {
        let env = envelope();
        let req = EffectRequest {
            network_scopes: ["https://example.com".to_string()].into_iter().collect(),
            fs_scopes: HashSet::new(),
            effect_class: EffectClass::E2,
            data_classes: HashSet::new(),
        };
        let decision = EnvelopeBinder::check(Some(&env), &req, Utc::now());
        assert_eq!(decision, BindingDecision::Admitted);
    }

    #[test]
    fn expired_envelope_denies() {
        let mut env = envelope();
        env.valid_until = Utc::now() - Duration::hours(2);
        let req = EffectRequest {
            network_scopes: HashSet::new(),
            fs_scopes: HashSet::new(),
            effect_class: EffectClass::E1,
            data_classes: HashSet::new(),
        };
        let decision = EnvelopeBinder::check(Some(&env), &req, Utc::now());
        assert_eq!(
            decision,
            BindingDecision::Denied(Denial {
                reason: DenialReason::EnvelopeNotBound
            })
        );
    }
}
