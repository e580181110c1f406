//! Embedding spend tracking and cost estimation.
//!
//! The tracker is an explicit value handed to the embedder, not ambient
//! state. Check-and-reserve happens under one lock so two concurrent batches
//! cannot both fit into the last dollar of budget.

use std::sync::Mutex;

use crate::error::PipelineError;

/// Price per 1k tokens for known embedding models, in USD.
fn price_per_1k_tokens(model: &str) -> f64 {
    match model {
        "text-embedding-3-large" => 0.00013,
        "text-embedding-3-small" => 0.00002,
        "text-embedding-ada-002" => 0.0001,
        _ => 0.0001,
    }
}

/// Rough token estimate for a set of texts (~0.75 tokens per word).
pub fn estimate_tokens(texts: &[&str]) -> u64 {
    let words: usize = texts.iter().map(|t| t.split_whitespace().count()).sum();
    (words as f64 * 0.75) as u64
}

/// Estimated USD cost of embedding `texts` with `model`.
pub fn estimate_cost(texts: &[&str], model: &str) -> (u64, f64) {
    let tokens = estimate_tokens(texts);
    let cost = tokens as f64 / 1000.0 * price_per_1k_tokens(model);
    (tokens, cost)
}

#[derive(Debug)]
struct BudgetState {
    spent_usd: f64,
    /// Day key (days since epoch) the current spend belongs to.
    period_day: i64,
}

/// Daily spend ceiling with atomic check-and-reserve semantics.
///
/// A ceiling of 0 disables enforcement. The period resets when the UTC day
/// changes.
#[derive(Debug)]
pub struct BudgetTracker {
    ceiling_usd: f64,
    state: Mutex<BudgetState>,
}

impl BudgetTracker {
    pub fn new(ceiling_usd: f64) -> Self {
        Self {
            ceiling_usd,
            state: Mutex::new(BudgetState {
                spent_usd: 0.0,
                period_day: current_day(),
            }),
        }
    }

    /// Reserve `estimated_usd` against the current period, or fail fast with
    /// `BudgetExceeded` without reserving anything.
    pub fn reserve(&self, estimated_usd: f64) -> Result<(), PipelineError> {
        let mut state = self.state.lock().expect("budget lock poisoned");

        let today = current_day();
        if state.period_day != today {
            state.period_day = today;
            state.spent_usd = 0.0;
        }

        if self.ceiling_usd > 0.0 && state.spent_usd + estimated_usd > self.ceiling_usd {
            return Err(PipelineError::BudgetExceeded {
                spent: state.spent_usd,
                estimated: estimated_usd,
                ceiling: self.ceiling_usd,
            });
        }

        state.spent_usd += estimated_usd;
        Ok(())
    }

    /// Return a reservation that never turned into a provider call.
    pub fn release(&self, estimated_usd: f64) {
        let mut state = self.state.lock().expect("budget lock poisoned");
        state.spent_usd = (state.spent_usd - estimated_usd).max(0.0);
    }

    pub fn spent_usd(&self) -> f64 {
        self.state.lock().expect("budget lock poisoned").spent_usd
    }
}

fn current_day() -> i64 {
    chrono::Utc::now().timestamp() / 86_400
}
