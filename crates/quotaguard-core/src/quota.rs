//! Daily budget arithmetic: thresholds, status snapshots and block decisions.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider's free-tier daily budget.
pub const DEFAULT_DAILY_LIMIT: u64 = 10_000;

/// Budget and alert thresholds, as fractions of the daily limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub daily_limit: u64,

    /// Log a warning
    pub warning: f64,

    /// Log and escalate
    pub critical: f64,

    /// Refuse new requests. The gap to 100% is headroom for must-run calls.
    pub block: f64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            warning: 0.75,
            critical: 0.90,
            block: 0.95,
        }
    }
}

impl QuotaPolicy {
    /// Fraction of the limit that `units` represents.
    pub fn fraction(&self, units: u64) -> f64 {
        if self.daily_limit == 0 {
            return 1.0;
        }
        units as f64 / self.daily_limit as f64
    }

    /// Highest alert level reached at `units`.
    pub fn level(&self, units: u64) -> AlertLevel {
        let fraction = self.fraction(units);
        if fraction >= self.block {
            AlertLevel::Block
        } else if fraction >= self.critical {
            AlertLevel::Critical
        } else if fraction >= self.warning {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }

    /// Decide whether a request for `required` more units must be refused.
    pub fn decide(&self, used: u64, required: u64) -> BudgetDecision {
        if self.fraction(used) >= self.block {
            return BudgetDecision::LimitReached { used };
        }
        let projected = used.saturating_add(required);
        if self.fraction(projected) >= self.block {
            return BudgetDecision::WouldExceed { projected };
        }
        BudgetDecision::Allow { projected }
    }

    /// Build a status snapshot for `used` units on `date`.
    pub fn status(&self, date: NaiveDate, used: u64, reset_at: DateTime<Utc>) -> QuotaStatus {
        let fraction = self.fraction(used);
        QuotaStatus {
            date,
            units_used: used,
            units_remaining: self.daily_limit.saturating_sub(used),
            fraction_used: fraction,
            daily_limit: self.daily_limit,
            reset_at,
            is_exceeded: used >= self.daily_limit,
            should_block: fraction >= self.block,
        }
    }

    /// Snapshot used when the ledger cannot be read: assume the budget is gone.
    pub fn exhausted_status(&self, date: NaiveDate, reset_at: DateTime<Utc>) -> QuotaStatus {
        QuotaStatus {
            date,
            units_used: self.daily_limit,
            units_remaining: 0,
            fraction_used: 1.0,
            daily_limit: self.daily_limit,
            reset_at,
            is_exceeded: true,
            should_block: true,
        }
    }
}

/// Alert levels, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
    Block,
}

impl AlertLevel {
    /// Levels that must reach a human, not only the log.
    pub fn escalates(&self) -> bool {
        matches!(self, AlertLevel::Critical | AlertLevel::Block)
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Block => "block",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the day's budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub date: NaiveDate,
    pub units_used: u64,
    pub units_remaining: u64,
    pub fraction_used: f64,
    pub daily_limit: u64,
    pub reset_at: DateTime<Utc>,
    pub is_exceeded: bool,
    pub should_block: bool,
}

impl QuotaStatus {
    /// Usage as a percentage with one decimal, for logs.
    pub fn percent(&self) -> String {
        format!("{:.1}%", self.fraction_used * 100.0)
    }
}

/// Result of the budget arithmetic for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow { projected: u64 },
    LimitReached { used: u64 },
    WouldExceed { projected: u64 },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reset() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_projection_over_block_line() {
        let policy = QuotaPolicy::default();
        assert_eq!(
            policy.decide(9_600, 500),
            BudgetDecision::LimitReached { used: 9_600 }
        );
        assert_eq!(
            policy.decide(9_000, 500),
            BudgetDecision::WouldExceed { projected: 9_500 }
        );
    }

    #[test]
    fn test_small_request_allowed() {
        let policy = QuotaPolicy::default();
        assert_eq!(
            policy.decide(1_000, 50),
            BudgetDecision::Allow { projected: 1_050 }
        );
    }

    #[test]
    fn test_levels() {
        let policy = QuotaPolicy::default();
        assert_eq!(policy.level(7_499), AlertLevel::Normal);
        assert_eq!(policy.level(7_500), AlertLevel::Warning);
        assert_eq!(policy.level(9_000), AlertLevel::Critical);
        assert_eq!(policy.level(9_500), AlertLevel::Block);
        assert!(AlertLevel::Critical.escalates());
        assert!(!AlertLevel::Warning.escalates());
    }

    #[test]
    fn test_status_snapshot() {
        let policy = QuotaPolicy::default();
        let date = NaiveDate::from_ymd_opt(2025, 11, 2).unwrap();
        let status = policy.status(date, 10_250, reset());
        assert_eq!(status.units_remaining, 0);
        assert!(status.is_exceeded);
        assert!(status.should_block);
        assert_eq!(status.percent(), "102.5%");

        let safe = policy.exhausted_status(date, reset());
        assert!(safe.should_block);
        assert_eq!(safe.units_used, policy.daily_limit);
    }

    proptest! {
        #[test]
        fn prop_level_is_monotonic(a in 0u64..20_000, b in 0u64..20_000) {
            let policy = QuotaPolicy::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(policy.level(lo) <= policy.level(hi));
        }

        #[test]
        fn prop_allowed_requests_stay_under_block(used in 0u64..20_000, req in 0u64..2_000) {
            let policy = QuotaPolicy::default();
            if policy.decide(used, req).is_allowed() {
                prop_assert!(policy.fraction(used + req) < policy.block);
            }
        }
    }
}
