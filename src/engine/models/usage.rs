// ── Canopy Models: Usage Log & Budget Guard ────────────────────────────────
//
// Best-effort JSONL usage logger for provider calls plus the per-build USD
// budget guard.
//
// Logging is intentionally non-fatal: a failed append is swallowed. The
// budget guard is the opposite — when a budget is configured AND enforcement
// is on, crossing it returns `BudgetExceeded`, which fails the in-flight
// build so the caller can stop burning money.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ObservabilityConfig;

/// Rough per-million-token USD rates by model family. Unknown models use the
/// default row; rates only need to be right within a factor small enough for
/// budget stops to be meaningful.
fn rates_for(model: &str) -> (f64, f64) {
    let m = model.to_lowercase();
    if m.contains("gpt-4o-mini") || m.contains("mini") {
        (0.15, 0.60)
    } else if m.contains("gpt-4") || m.contains("gpt-5") {
        (2.50, 10.00)
    } else if m.contains("embedding") {
        (0.02, 0.0)
    } else {
        (1.00, 3.00)
    }
}

pub fn estimate_cost_usd(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let (in_rate, out_rate) = rates_for(model);
    (prompt_tokens as f64 / 1e6) * in_rate + (completion_tokens as f64 / 1e6) * out_rate
}

pub struct UsageTracker {
    log_path: Option<PathBuf>,
    budget_usd: Option<f64>,
    enforce: bool,
    spent_usd: Mutex<f64>,
    write_lock: Mutex<()>,
}

impl UsageTracker {
    pub fn new(config: &ObservabilityConfig) -> Self {
        Self {
            log_path: config.usage_log_path.clone(),
            budget_usd: config.budget_usd,
            enforce: config.enforce_budget,
            spent_usd: Mutex::new(0.0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&ObservabilityConfig::default())
    }

    /// Total estimated spend so far.
    pub fn spent_usd(&self) -> f64 {
        *self.spent_usd.lock()
    }

    /// Reset the accumulator (start of a new build).
    pub fn reset(&self) {
        *self.spent_usd.lock() = 0.0;
    }

    /// Record one provider call. Returns `BudgetExceeded` when the enforced
    /// budget is crossed; all logging failures are swallowed.
    pub fn record(
        &self,
        kind: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        meta: Value,
    ) -> EngineResult<()> {
        let rec = json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "kind": kind,
            "model": model,
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
            "meta": meta,
        });

        if let Some(path) = &self.log_path {
            let _guard = self.write_lock.lock();
            let append = || -> std::io::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(f, "{}", rec)?;
                Ok(())
            };
            if let Err(e) = append() {
                log::warn!("[models:usage] log append failed: {}", e);
            }
        }

        let est = estimate_cost_usd(model, prompt_tokens, completion_tokens);
        if est > 0.0 {
            let mut spent = self.spent_usd.lock();
            *spent += est;
            if self.enforce {
                if let Some(budget) = self.budget_usd {
                    if budget > 0.0 && *spent > budget {
                        return Err(EngineError::BudgetExceeded {
                            spent_usd: *spent,
                            budget_usd: budget,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(budget: Option<f64>, enforce: bool) -> UsageTracker {
        UsageTracker::new(&ObservabilityConfig {
            usage_log_path: None,
            budget_usd: budget,
            enforce_budget: enforce,
            summary_debug_log_path: None,
            debug_events: vec![],
        })
    }

    #[test]
    fn accumulates_spend() {
        let t = tracker(None, false);
        t.record("summarize", "gpt-4o", 1_000_000, 0, json!({})).unwrap();
        assert!(t.spent_usd() > 2.0);
    }

    #[test]
    fn unenforced_budget_never_errors() {
        let t = tracker(Some(0.000001), false);
        for _ in 0..10 {
            t.record("summarize", "gpt-4o", 1_000_000, 1_000_000, json!({})).unwrap();
        }
    }

    #[test]
    fn enforced_budget_fails_loudly() {
        let t = tracker(Some(0.01), true);
        let mut failed = false;
        for _ in 0..100 {
            if let Err(EngineError::BudgetExceeded { spent_usd, budget_usd }) =
                t.record("summarize", "gpt-4o", 1_000_000, 0, json!({}))
            {
                assert!(spent_usd > budget_usd);
                failed = true;
                break;
            }
        }
        assert!(failed, "budget guard never fired");
    }

    #[test]
    fn reset_clears_accumulator() {
        let t = tracker(None, false);
        t.record("summarize", "gpt-4o", 500_000, 0, json!({})).unwrap();
        t.reset();
        assert_eq!(t.spent_usd(), 0.0);
    }
}
