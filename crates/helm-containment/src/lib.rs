//! Process-wide containment FSM (§4.12). A single mutex guards the current
//! state; every transition is synchronous and total. Resume is the only
//! transition that carries an authorization requirement of its own —
//! operator identity plus a non-empty justification — enforced here so the
//! embedder cannot forget it before emitting the `containment_transition`
//! receipt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub mod codes {
    pub const ERR_CONTAINMENT_RESUME_JUSTIFICATION_REQUIRED: &str = "ERR_CONTAINMENT_RESUME_JUSTIFICATION_REQUIRED";
}

#[derive(Debug, Error)]
pub enum ContainmentError {
    #[error(
        "{code}: resume requires a non-empty operator justification",
        code = codes::ERR_CONTAINMENT_RESUME_JUSTIFICATION_REQUIRED
    )]
    JustificationRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainmentState {
    Autonomous,
    Throttled,
    Frozen,
    Emergency,
}

impl ContainmentState {
    pub fn allows_autonomous_effects(self) -> bool {
        matches!(self, ContainmentState::Autonomous)
    }

    /// Per §5 backpressure: a throttled run still admits read-class effects.
    pub fn allows_read_effects(self) -> bool {
        !matches!(self, ContainmentState::Emergency)
    }
}

#[derive(Debug, Clone)]
pub enum ContainmentTrigger {
    BudgetExhausted,
    IncidentOpen,
    OperatorCommand { operator_id: String, target: ContainmentState },
    Resume { operator_id: String, justification: String },
}

impl ContainmentTrigger {
    fn label(&self) -> &'static str {
        match self {
            ContainmentTrigger::BudgetExhausted => "budget_exhausted",
            ContainmentTrigger::IncidentOpen => "incident_open",
            ContainmentTrigger::OperatorCommand { .. } => "operator_command",
            ContainmentTrigger::Resume { .. } => "resume",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainmentTransition {
    pub from: ContainmentState,
    pub to: ContainmentState,
    pub trigger: &'static str,
    pub operator_id: Option<String>,
    pub justification: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct ContainmentController {
    state: Mutex<ContainmentState>,
}

impl Default for ContainmentController {
    fn default() -> Self {
        Self {
            state: Mutex::new(ContainmentState::Autonomous),
        }
    }
}

impl ContainmentController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> ContainmentState {
        *self.state.lock().await
    }

    pub async fn apply(&self, trigger: ContainmentTrigger, now: DateTime<Utc>) -> Result<ContainmentTransition, ContainmentError> {
        let mut state = self.state.lock().await;
        let from = *state;
        let label = trigger.label();

        let (to, operator_id, justification) = match &trigger {
            ContainmentTrigger::BudgetExhausted => {
                let to = if from == ContainmentState::Emergency { from } else { ContainmentState::Frozen };
                (to, None, None)
            }
            ContainmentTrigger::IncidentOpen => (ContainmentState::Emergency, None, None),
            ContainmentTrigger::OperatorCommand { operator_id, target } => (*target, Some(operator_id.clone()), None),
            ContainmentTrigger::Resume { operator_id, justification } => {
                if justification.trim().is_empty() {
                    return Err(ContainmentError::JustificationRequired);
                }
                (ContainmentState::Autonomous, Some(operator_id.clone()), Some(justification.clone()))
            }
        };

        *state = to;
        tracing::info!(?from, ?to, trigger = label, "containment transition");
        Ok(ContainmentTransition {
            from,
            to,
            trigger: label,
            operator_id,
            justification,
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_autonomous() {
        let c = ContainmentController::new();
        assert_eq!(c.state().await, ContainmentState::Autonomous);
    }

    #[tokio::test]
    async fn budget_exhausted_freezes() {
        let c = ContainmentController::new();
        let t = c.apply(ContainmentTrigger::BudgetExhausted, Utc::now()).await.unwrap();
        assert_eq!(t.to, ContainmentState::Frozen);
        assert!(!c.state().await.allows_autonomous_effects());
    }

    #[tokio::test]
    async fn incident_open_is_emergency_and_blocks_reads() {
        let c = ContainmentController::new();
        c.apply(ContainmentTrigger::IncidentOpen, Utc::now()).await.unwrap();
        assert_eq!(c.state().await, ContainmentState::Emergency);
        assert!(!c.state().await.allows_read_effects());
    }

    #[tokio::test]
    async fn resume_requires_justification() {
        let c = ContainmentController::new();
        c.apply(ContainmentTrigger::BudgetExhausted, Utc::now()).await.unwrap();
        let err = c
            .apply(
                ContainmentTrigger::Resume {
                    operator_id: "op1".into(),
                    justification: "   ".into(),
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContainmentError::JustificationRequired));
        assert_eq!(c.state().await, ContainmentState::Frozen);
    }

    #[tokio::test]
    async fn resume_with_justification_restores_autonomous() {
        let c = ContainmentController::new();
        c.apply(ContainmentTrigger::BudgetExhausted, Utc::now()).await.unwrap();
        let t = c
            .apply(
                ContainmentTrigger::Resume {
                    operator_id: "op1".into(),
                    justification: "false alarm, budget miscomputed".into(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(t.to, ContainmentState::Autonomous);
        assert!(c.state().await.allows_autonomous_effects());
    }
}
