//! Persisted records: circuit state rows and the two append-only ledgers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a protected service's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Service failing, calls rejected until the cool-down elapses
    Open,

    /// Recovery test, a limited number of probe calls allowed
    HalfOpen,
}

impl CircuitState {
    /// Name as stored in the `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per protected service. Overwritten in place, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Unique service key (e.g. "youtube_api")
    pub service: String,

    pub state: CircuitState,

    /// Consecutive failures; zeroed by any success while CLOSED
    pub failure_count: u32,

    /// Consecutive successes; zeroed by any failure
    pub success_count: u32,

    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitRecord {
    /// A fresh CLOSED record with zeroed counters.
    pub fn closed(service: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            service: service.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            half_open_at: None,
            updated_at: now,
        }
    }
}

/// Append-only quota ledger entry.
///
/// Failed calls are written with `units_used = 0`; only rows with
/// `success = true` count towards the day's consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsageRecord {
    /// Calendar day in the provider's quota timezone
    pub date: NaiveDate,
    pub operation: String,
    pub units_used: u32,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub success: bool,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QuotaUsageRecord {
    /// Units this row contributes to the day's consumption.
    pub fn billable_units(&self) -> u64 {
        if self.success {
            u64::from(self.units_used)
        } else {
            0
        }
    }
}

/// Append-only performance record, one per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMetricRecord {
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_type: Option<String>,
    pub retry_count: u32,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_state_names() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }

    #[test]
    fn test_failed_rows_are_not_billable() {
        let row = QuotaUsageRecord {
            date: NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
            operation: "videos.list".to_string(),
            units_used: 7,
            user_id: None,
            endpoint: None,
            success: false,
            error_code: Some("503".to_string()),
            created_at: Utc::now(),
        };
        assert_eq!(row.billable_units(), 0);
    }
}
