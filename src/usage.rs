//! Process-wide spend tracking for paid collaborator calls.
//!
//! One [`CostLedger`] is created at process start and shared by reference with every client
//! that talks to a paid vendor. It is never reset. Crossing the ceiling is a hard circuit
//! breaker that does not care which task or stage caused the spend.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const MICROS_PER_USD: f64 = 1_000_000.0;

/// USD price per token for models we know how to bill.
const MODEL_TOKEN_PRICES_USD: &[(&str, f64)] = &[
    ("text-embedding-ada-002", 0.0004 / 1000.0),
    ("text-embedding-3-small", 0.00002 / 1000.0),
    ("text-embedding-3-large", 0.00013 / 1000.0),
    ("multilingual-22-12", 0.0002 / 1000.0),
    ("gpt-3.5-turbo", 0.002 / 1000.0),
    ("gpt-4", 0.06 / 1000.0),
    ("gpt-4o-mini", 0.0006 / 1000.0),
    ("gpt-4o", 0.01 / 1000.0),
];

/// Raised when cumulative spend crosses the configured ceiling.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
#[error("Maximum cost exceeded: spent {spent_usd:.4} USD of {max_usd:.4} USD")]
pub struct BudgetExceeded {
    /// Total spend recorded so far, including the call that crossed the ceiling.
    pub spent_usd: f64,
    /// Configured ceiling.
    pub max_usd: f64,
}

/// What the ledger does once the ceiling is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceedPolicy {
    /// Log and terminate the process with exit status 1.
    Exit,
    /// Return [`BudgetExceeded`] to the caller.
    Error,
}

/// Thread-safe cumulative spend counter with a hard ceiling.
pub struct CostLedger {
    max_micros: u64,
    spent_micros: AtomicU64,
    policy: ExceedPolicy,
}

impl CostLedger {
    /// Create a ledger with a ceiling in USD.
    pub fn new(max_cost_usd: f64, policy: ExceedPolicy) -> Self {
        tracing::info!(max_cost_usd, "Maximum cost set");
        Self {
            max_micros: to_micros(max_cost_usd),
            spent_micros: AtomicU64::new(0),
            policy,
        }
    }

    /// Record a spend in USD.
    pub fn add_cost(&self, cost_usd: f64) -> Result<(), BudgetExceeded> {
        let micros = to_micros(cost_usd);
        let total = self.spent_micros.fetch_add(micros, Ordering::SeqCst) + micros;
        tracing::debug!(total_cost_usd = from_micros(total), "Recorded collaborator cost");

        if total <= self.max_micros {
            return Ok(());
        }

        let exceeded = BudgetExceeded {
            spent_usd: from_micros(total),
            max_usd: from_micros(self.max_micros),
        };
        tracing::error!(error = %exceeded, "Maximum cost exceeded");
        match self.policy {
            ExceedPolicy::Exit => std::process::exit(1),
            ExceedPolicy::Error => Err(exceeded),
        }
    }

    /// Record token usage for a model, priced from the built-in table.
    ///
    /// Models missing from the table (local runtimes, for instance) are free.
    pub fn add_tokens(&self, model: &str, tokens: u64) -> Result<(), BudgetExceeded> {
        match token_price_usd(model) {
            Some(price) => self.add_cost(price * tokens as f64),
            None => {
                tracing::debug!(model, tokens, "No price known for model; not billing");
                Ok(())
            }
        }
    }

    /// Total spend recorded since the ledger was created.
    pub fn total_cost_usd(&self) -> f64 {
        from_micros(self.spent_micros.load(Ordering::SeqCst))
    }

    /// Configured ceiling in USD.
    pub fn max_cost_usd(&self) -> f64 {
        from_micros(self.max_micros)
    }
}

fn token_price_usd(model: &str) -> Option<f64> {
    MODEL_TOKEN_PRICES_USD
        .iter()
        .find(|(name, _)| model == *name || model.starts_with(&format!("{name}-")))
        .map(|(_, price)| *price)
}

fn to_micros(usd: f64) -> u64 {
    (usd.max(0.0) * MICROS_PER_USD).round() as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_costs() {
        let ledger = CostLedger::new(1.0, ExceedPolicy::Error);
        ledger.add_cost(0.25).expect("within budget");
        ledger.add_cost(0.25).expect("within budget");
        assert!((ledger.total_cost_usd() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn crossing_the_ceiling_is_reported() {
        let ledger = CostLedger::new(0.01, ExceedPolicy::Error);
        ledger.add_cost(0.01).expect("exactly at the ceiling");
        let error = ledger.add_cost(0.001).expect_err("over budget");
        assert!(error.spent_usd > error.max_usd);
        assert!((ledger.max_cost_usd() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn tokens_are_priced_per_model() {
        let ledger = CostLedger::new(10.0, ExceedPolicy::Error);
        ledger.add_tokens("gpt-4", 1000).expect("within budget");
        assert!((ledger.total_cost_usd() - 0.06).abs() < 1e-9);

        ledger.add_tokens("llama3.1:8b", 1_000_000).expect("free model");
        assert!((ledger.total_cost_usd() - 0.06).abs() < 1e-9);
    }
}
