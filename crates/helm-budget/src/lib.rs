//! Budget accountant (§4.11): a per-run snapshot across five spend
//! dimensions. [`BudgetAccountant::reserve`] is the sole mutation point —
//! once a run is latched exhausted, every subsequent reserve is refused
//! without touching the snapshot, so no `budget_decrement` can follow a
//! `budget_exhausted` for that run (ADV-04).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("no budget initialized for run {run_id}")]
    UnknownRun { run_id: String },
    #[error("budget_exhausted")]
    Exhausted(BudgetExhausted),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetDimension {
    Time,
    Tokens,
    ToolCalls,
    SpendCents,
    RecursionDepth,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub time_ms: u64,
    pub tokens: u64,
    pub tool_calls: u64,
    pub spend_cents: u64,
    pub recursion_depth: u64,
}

/// The deltas a single effect would consume if admitted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EffectCost {
    pub time_ms: u64,
    pub tokens: u64,
    pub tool_calls: u64,
    pub spend_cents: u64,
    pub recursion_depth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tenant_id: String,
    pub time_used_ms: u64,
    pub tokens_used: u64,
    pub tool_calls: u64,
    pub spend_cents: u64,
    pub recursion_depth: u64,
    pub caps: BudgetCaps,
}

impl BudgetSnapshot {
    fn new(tenant_id: String, caps: BudgetCaps) -> Self {
        Self {
            tenant_id,
            time_used_ms: 0,
            tokens_used: 0,
            tool_calls: 0,
            spend_cents: 0,
            recursion_depth: 0,
            caps,
        }
    }

    /// Dimensions that would exceed their cap if `cost` were applied.
    fn exceeded(&self, cost: &EffectCost) -> Vec<BudgetDimension> {
        let mut dims = Vec::new();
        if self.time_used_ms + cost.time_ms > self.caps.time_ms {
            dims.push(BudgetDimension::Time);
        }
        if self.tokens_used + cost.tokens > self.caps.tokens {
            dims.push(BudgetDimension::Tokens);
        }
        if self.tool_calls + cost.tool_calls > self.caps.tool_calls {
            dims.push(BudgetDimension::ToolCalls);
        }
        if self.spend_cents + cost.spend_cents > self.caps.spend_cents {
            dims.push(BudgetDimension::SpendCents);
        }
        if self.recursion_depth + cost.recursion_depth > self.caps.recursion_depth {
            dims.push(BudgetDimension::RecursionDepth);
        }
        dims
    }

    fn apply(&mut self, cost: &EffectCost) {
        self.time_used_ms += cost.time_ms;
        self.tokens_used += cost.tokens;
        self.tool_calls += cost.tool_calls;
        self.spend_cents += cost.spend_cents;
        self.recursion_depth += cost.recursion_depth;
    }
}

#[derive(Debug, Clone)]
pub struct BudgetExhausted {
    pub snapshot: BudgetSnapshot,
    pub exceeded: Vec<BudgetDimension>,
}

struct RunBudget {
    snapshot: BudgetSnapshot,
    exhausted: bool,
}

#[derive(Default)]
pub struct BudgetAccountant {
    runs: RwLock<HashMap<String, RunBudget>>,
}

impl BudgetAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init_run(&self, run_id: String, tenant_id: String, caps: BudgetCaps) {
        let mut runs = self.runs.write().await;
        runs.insert(
            run_id,
            RunBudget {
                snapshot: BudgetSnapshot::new(tenant_id, caps),
                exhausted: false,
            },
        );
    }

    pub async fn snapshot(&self, run_id: &str) -> Result<BudgetSnapshot, BudgetError> {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .map(|r| r.snapshot.clone())
            .ok_or_else(|| BudgetError::UnknownRun { run_id: run_id.to_string() })
    }

    /// Attempt to reserve `cost` against `run_id`'s budget. Returns the
    /// updated snapshot on success, or [`BudgetError::Exhausted`] describing
    /// which dimensions would have been exceeded. A run latched exhausted
    /// stays exhausted for its lifetime — the snapshot returned on repeat
    /// failures is the last admitted one, never partially applied.
    pub async fn reserve(&self, run_id: &str, cost: EffectCost) -> Result<BudgetSnapshot, BudgetError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| BudgetError::UnknownRun { run_id: run_id.to_string() })?;

        if run.exhausted {
            return Err(BudgetError::Exhausted(BudgetExhausted {
                snapshot: run.snapshot.clone(),
                exceeded: Vec::new(),
            }));
        }

        let exceeded = run.snapshot.exceeded(&cost);
        if exceeded.is_empty() {
            run.snapshot.apply(&cost);
            tracing::debug!(run_id, "budget reserved");
            Ok(run.snapshot.clone())
        } else {
            run.exhausted = true;
            tracing::warn!(run_id, ?exceeded, "budget exhausted");
            Err(BudgetError::Exhausted(BudgetExhausted {
                snapshot: run.snapshot.clone(),
                exceeded,
            }))
        }
    }

    pub async fn is_exhausted(&self, run_id: &str) -> bool {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|r| r.exhausted)
            .unwrap_or(false)
    }
}
