//! Daily quota tracking against the shared usage ledger.
//!
//! Every process guarding the same upstream reads the same ledger. The
//! block decision is serialized across processes with a non-blocking
//! advisory lock keyed by the quota day; any doubt blocks.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use quotaguard_core::{
    AlertLevel, ApiMetricRecord, BudgetDecision, Clock, ErrorType, QuotaCalendar, QuotaPolicy,
    QuotaStatus, QuotaUsageRecord,
};

use crate::alerts::{Alert, AlertSink};
use crate::config::QuotaConfig;
use crate::store::{MetricsQuery, StateStore};

/// One completed attempt, as written to the usage ledger.
#[derive(Debug, Clone, Default)]
pub struct UsageEntry {
    pub operation: String,
    pub units_used: u32,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub success: bool,
    pub error_code: Option<String>,
}

/// One attempt's performance record.
#[derive(Debug, Clone, Default)]
pub struct MetricEntry {
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_type: Option<ErrorType>,
    pub retry_count: u32,
    pub user_id: Option<String>,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// Another process holds today's quota lock
    LockContended,

    /// Usage alone is already at the block threshold
    LimitReached { used: u64 },

    /// This request would push usage to the block threshold
    WouldExceed { projected: u64 },

    /// The ledger could not be consulted
    CheckFailed { error: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::LockContended => f.write_str("Quota check in progress by another process"),
            BlockReason::LimitReached { used } => {
                write!(f, "Daily quota limit reached ({used} units used)")
            }
            BlockReason::WouldExceed { projected } => {
                write!(f, "Request would exceed daily quota ({projected} units projected)")
            }
            BlockReason::CheckFailed { error } => write!(f, "Quota check failed: {error}"),
        }
    }
}

/// Outcome of [`QuotaTracker::should_block_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaDecision {
    pub should_block: bool,
    pub reason: Option<BlockReason>,

    /// Budget as read inside the lock; absent when the ledger was not read
    pub status: Option<QuotaStatus>,
}

impl QuotaDecision {
    fn allow(status: QuotaStatus) -> Self {
        Self {
            should_block: false,
            reason: None,
            status: Some(status),
        }
    }

    fn block(reason: BlockReason, status: Option<QuotaStatus>) -> Self {
        Self {
            should_block: true,
            reason: Some(reason),
            status,
        }
    }
}

/// Latency and success summary over metric records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_calls: u64,
    /// Fraction of calls that succeeded, 0.0..=1.0
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl PerformanceSummary {
    /// Summarize `records`. Percentiles use the sorted duration at index
    /// `floor(n * p)`.
    pub fn from_records(records: &[ApiMetricRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let mut durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();
        let n = durations.len();
        let percentile = |p: f64| {
            let idx = ((n as f64 * p).floor() as usize).min(n - 1);
            durations[idx]
        };

        let successes = records.iter().filter(|r| r.success).count();
        let total: u64 = durations.iter().sum();

        Self {
            total_calls: n as u64,
            success_rate: successes as f64 / n as f64,
            avg_duration_ms: total as f64 / n as f64,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
        }
    }
}

/// Tracks the shared daily quota for one upstream.
pub struct QuotaTracker {
    policy: QuotaPolicy,
    calendar: QuotaCalendar,
    slow_call_threshold: Duration,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl QuotaTracker {
    pub fn new(
        config: &QuotaConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            policy: config.policy(),
            calendar: config.calendar(),
            slow_call_threshold: config.slow_call_threshold,
            store,
            clock,
            alerts,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Current quota day in the provider's timezone.
    pub fn today(&self) -> NaiveDate {
        self.calendar.date_at(self.clock.now())
    }

    /// Next instant the provider resets the quota.
    pub fn reset_time(&self) -> DateTime<Utc> {
        self.calendar.next_reset(self.clock.now())
    }

    /// Today's budget. A ledger failure yields an exhausted snapshot.
    pub async fn status(&self) -> QuotaStatus {
        let now = self.clock.now();
        let date = self.calendar.date_at(now);
        let reset_at = self.calendar.next_reset(now);

        match self.store.sum_successful_usage(date).await {
            Ok(used) => self.policy.status(date, used, reset_at),
            Err(e) => {
                tracing::error!(date = %date, error = %e, "Failed to read quota usage - assuming exhausted");
                self.policy.exhausted_status(date, reset_at)
            }
        }
    }

    /// Decide whether a request costing `required_units` must be refused.
    ///
    /// Never blocks on the lock. Contention and store errors both refuse the
    /// request.
    pub async fn should_block_request(&self, required_units: u64) -> QuotaDecision {
        let now = self.clock.now();
        let date = self.calendar.date_at(now);
        let reset_at = self.calendar.next_reset(now);
        let key = self.calendar.lock_key(date);

        match self.store.try_advisory_lock(key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(date = %date, lock_key = key, "Quota lock held by another process - blocking request");
                return QuotaDecision::block(BlockReason::LockContended, None);
            }
            Err(e) => {
                tracing::error!(date = %date, error = %e, "Quota lock unavailable - blocking request");
                return QuotaDecision::block(
                    BlockReason::CheckFailed {
                        error: e.to_string(),
                    },
                    None,
                );
            }
        }

        let used = self.store.sum_successful_usage(date).await;

        if let Err(e) = self.store.advisory_unlock(key).await {
            tracing::error!(date = %date, lock_key = key, error = %e, "Failed to release quota lock");
        }

        let used = match used {
            Ok(used) => used,
            Err(e) => {
                tracing::error!(date = %date, error = %e, "Quota check failed - blocking request");
                return QuotaDecision::block(
                    BlockReason::CheckFailed {
                        error: e.to_string(),
                    },
                    Some(self.policy.exhausted_status(date, reset_at)),
                );
            }
        };

        let status = self.policy.status(date, used, reset_at);
        match self.policy.decide(used, required_units) {
            BudgetDecision::Allow { .. } => QuotaDecision::allow(status),
            BudgetDecision::LimitReached { used } => {
                tracing::error!(
                    units_used = used,
                    daily_limit = self.policy.daily_limit,
                    "Daily quota limit reached - blocking request"
                );
                QuotaDecision::block(BlockReason::LimitReached { used }, Some(status))
            }
            BudgetDecision::WouldExceed { projected } => {
                tracing::warn!(
                    units_used = used,
                    required_units,
                    projected,
                    daily_limit = self.policy.daily_limit,
                    "Request would exceed quota block threshold - blocking request"
                );
                QuotaDecision::block(BlockReason::WouldExceed { projected }, Some(status))
            }
        }
    }

    /// Append a ledger row for one completed attempt, then check thresholds.
    ///
    /// Failed attempts are always written with zero units.
    pub async fn track_usage(&self, entry: UsageEntry) {
        let units_used = if entry.success || entry.units_used == 0 {
            entry.units_used
        } else {
            tracing::warn!(
                operation = %entry.operation,
                units = entry.units_used,
                "Failed attempt reported quota units - recording zero"
            );
            0
        };

        let now = self.clock.now();
        let record = QuotaUsageRecord {
            date: self.calendar.date_at(now),
            operation: entry.operation,
            units_used,
            user_id: entry.user_id,
            endpoint: entry.endpoint,
            success: entry.success,
            error_code: entry.error_code,
            created_at: now,
        };

        if let Err(e) = self.store.append_usage(&record).await {
            tracing::error!(operation = %record.operation, error = %e, "Failed to record quota usage");
            return;
        }

        tracing::debug!(
            operation = %record.operation,
            units = record.units_used,
            success = record.success,
            "Quota usage recorded"
        );

        if record.success && record.units_used > 0 {
            self.check_thresholds().await;
        }
    }

    /// Append a performance record for one attempt.
    pub async fn track_metrics(&self, entry: MetricEntry) {
        if entry.duration_ms > self.slow_call_threshold.as_millis() as u64 {
            tracing::warn!(
                operation = %entry.operation,
                duration_ms = entry.duration_ms,
                "Slow upstream call"
            );
        }

        let record = ApiMetricRecord {
            operation: entry.operation,
            duration_ms: entry.duration_ms,
            success: entry.success,
            status_code: entry.status_code,
            error_type: entry.error_type.map(|t| t.as_str().to_string()),
            retry_count: entry.retry_count,
            user_id: entry.user_id,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.store.append_metric(&record).await {
            tracing::error!(operation = %record.operation, error = %e, "Failed to record API metric");
        }
    }

    /// Log the highest threshold crossed today and escalate CRITICAL and BLOCK.
    pub async fn check_thresholds(&self) -> (AlertLevel, QuotaStatus) {
        let status = self.status().await;
        let level = self.policy.level(status.units_used);

        match level {
            AlertLevel::Normal => {}
            AlertLevel::Warning => tracing::warn!(
                units_used = status.units_used,
                daily_limit = status.daily_limit,
                percent = %status.percent(),
                "Quota WARNING threshold reached"
            ),
            AlertLevel::Critical | AlertLevel::Block => tracing::error!(
                level = %level,
                units_used = status.units_used,
                daily_limit = status.daily_limit,
                percent = %status.percent(),
                "Quota threshold reached"
            ),
        }

        if level.escalates() {
            self.alerts.notify(&Alert::Quota {
                level,
                status: status.clone(),
            });
        }

        (level, status)
    }

    /// Latency and success summary for the matching metric records.
    pub async fn performance(&self, query: &MetricsQuery) -> PerformanceSummary {
        match self.store.query_metrics(query).await {
            Ok(records) => PerformanceSummary::from_records(&records),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read API metrics");
                PerformanceSummary::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use quotaguard_core::{CircuitRecord, ManualClock};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        alerts: Arc<RecordingAlertSink>,
        tracker: QuotaTracker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        // 2025-06-14 12:00 PDT
        let clock = ManualClock::new(DateTime::from_timestamp(1_749_927_600, 0).unwrap());
        let alerts = Arc::new(RecordingAlertSink::new());
        let tracker = QuotaTracker::new(
            &QuotaConfig::default(),
            store.clone(),
            Arc::new(clock.clone()),
            alerts.clone(),
        );
        Fixture {
            store,
            clock,
            alerts,
            tracker,
        }
    }

    fn spent(units: u32) -> UsageEntry {
        UsageEntry {
            operation: "search.list".to_string(),
            units_used: units,
            success: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_blocks_request_past_threshold() {
        let fx = fixture();
        fx.tracker.track_usage(spent(9_600)).await;

        let decision = fx.tracker.should_block_request(500).await;
        assert!(decision.should_block);
        assert_eq!(decision.reason, Some(BlockReason::LimitReached { used: 9_600 }));
        assert!(!fx.store.is_locked(fx.tracker.calendar.lock_key(fx.tracker.today())));
    }

    #[tokio::test]
    async fn test_projection_blocks_before_usage_does() {
        let fx = fixture();
        fx.tracker.track_usage(spent(9_000)).await;

        let decision = fx.tracker.should_block_request(500).await;
        assert_eq!(decision.reason, Some(BlockReason::WouldExceed { projected: 9_500 }));
        assert!(!fx.tracker.should_block_request(100).await.should_block);
    }

    #[tokio::test]
    async fn test_allows_request_with_headroom() {
        let fx = fixture();
        fx.tracker.track_usage(spent(1_000)).await;

        let decision = fx.tracker.should_block_request(50).await;
        assert!(!decision.should_block);
        assert_eq!(decision.status.unwrap().units_remaining, 9_000);
    }

    #[tokio::test]
    async fn test_contended_lock_blocks() {
        let fx = fixture();
        let key = fx.tracker.calendar.lock_key(fx.tracker.today());
        fx.store.try_advisory_lock(key).await.unwrap();

        let decision = fx.tracker.should_block_request(1).await;
        assert!(decision.should_block);
        assert_eq!(decision.reason, Some(BlockReason::LockContended));
        // The holder's lock is untouched.
        assert!(fx.store.is_locked(key));
    }

    #[tokio::test]
    async fn test_failed_attempts_record_zero_units() {
        let fx = fixture();
        fx.tracker
            .track_usage(UsageEntry {
                operation: "videos.list".to_string(),
                units_used: 7,
                success: false,
                error_code: Some("api_error".to_string()),
                ..Default::default()
            })
            .await;

        let rows = fx.store.usage_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].units_used, 0);
        assert_eq!(fx.tracker.status().await.units_used, 0);
    }

    #[tokio::test]
    async fn test_usage_rolls_over_at_provider_midnight() {
        let fx = fixture();
        fx.tracker.track_usage(spent(5_000)).await;
        assert_eq!(fx.tracker.status().await.units_used, 5_000);

        fx.clock.set(fx.tracker.reset_time());
        let status = fx.tracker.status().await;
        assert_eq!(status.units_used, 0);
        assert_eq!(status.date, NaiveDate::from_ymd_opt(2025, 6, 15).unwrap());
    }

    #[tokio::test]
    async fn test_escalates_critical_and_block_only() {
        let fx = fixture();
        fx.tracker.track_usage(spent(7_600)).await;
        assert!(fx.alerts.alerts().is_empty());

        fx.tracker.track_usage(spent(1_500)).await;
        match fx.alerts.alerts().as_slice() {
            [Alert::Quota { level, status }] => {
                assert_eq!(*level, AlertLevel::Critical);
                assert_eq!(status.units_used, 9_100);
            }
            other => panic!("unexpected alerts: {other:?}"),
        }

        fx.tracker.track_usage(spent(400)).await;
        assert!(matches!(
            fx.alerts.alerts().last(),
            Some(Alert::Quota {
                level: AlertLevel::Block,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_performance_percentiles() {
        let fx = fixture();
        for duration_ms in 1..=100u64 {
            fx.tracker
                .track_metrics(MetricEntry {
                    operation: "videos.list".to_string(),
                    duration_ms,
                    success: duration_ms % 4 != 0,
                    ..Default::default()
                })
                .await;
        }

        let summary = fx
            .tracker
            .performance(&MetricsQuery::for_operation("videos.list"))
            .await;
        assert_eq!(summary.total_calls, 100);
        assert_eq!(summary.p50_ms, 51);
        assert_eq!(summary.p95_ms, 96);
        assert_eq!(summary.p99_ms, 100);
        assert!((summary.avg_duration_ms - 50.5).abs() < f64::EPSILON);
        assert!((summary.success_rate - 0.75).abs() < f64::EPSILON);

        let empty = fx
            .tracker
            .performance(&MetricsQuery::for_operation("search.list"))
            .await;
        assert_eq!(empty, PerformanceSummary::default());
    }

    fn metric(duration_ms: u64, success: bool) -> ApiMetricRecord {
        ApiMetricRecord {
            operation: "videos.list".to_string(),
            duration_ms,
            success,
            status_code: None,
            error_type: None,
            retry_count: 0,
            user_id: None,
            created_at: DateTime::from_timestamp(1_749_927_600, 0).unwrap(),
        }
    }

    proptest! {
        #[test]
        fn prop_percentiles_ordered_and_bounded(
            samples in prop::collection::vec((0u64..60_000, any::<bool>()), 1..200)
        ) {
            let records: Vec<_> = samples.iter().map(|&(d, ok)| metric(d, ok)).collect();
            let summary = PerformanceSummary::from_records(&records);
            let min = samples.iter().map(|s| s.0).min().unwrap();
            let max = samples.iter().map(|s| s.0).max().unwrap();

            prop_assert_eq!(summary.total_calls, samples.len() as u64);
            prop_assert!(min <= summary.p50_ms);
            prop_assert!(summary.p50_ms <= summary.p95_ms);
            prop_assert!(summary.p95_ms <= summary.p99_ms);
            prop_assert!(summary.p99_ms <= max);
            prop_assert!((0.0..=1.0).contains(&summary.success_rate));
        }
    }

    /// Store whose ledger reads always fail.
    struct UnreadableLedger(MemoryStore);

    #[async_trait]
    impl StateStore for UnreadableLedger {
        async fn load_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError> {
            self.0.load_circuit(service).await
        }
        async fn upsert_circuit(&self, record: &CircuitRecord) -> Result<(), StoreError> {
            self.0.upsert_circuit(record).await
        }
        async fn append_usage(&self, record: &QuotaUsageRecord) -> Result<(), StoreError> {
            self.0.append_usage(record).await
        }
        async fn append_metric(&self, record: &ApiMetricRecord) -> Result<(), StoreError> {
            self.0.append_metric(record).await
        }
        async fn sum_successful_usage(&self, _date: NaiveDate) -> Result<u64, StoreError> {
            Err(StoreError::Query("relation quota_usage does not exist".into()))
        }
        async fn query_metrics(&self, query: &MetricsQuery) -> Result<Vec<ApiMetricRecord>, StoreError> {
            self.0.query_metrics(query).await
        }
        async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError> {
            self.0.try_advisory_lock(key).await
        }
        async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError> {
            self.0.advisory_unlock(key).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_and_releases_lock() {
        let store = Arc::new(UnreadableLedger(MemoryStore::new()));
        let clock = ManualClock::new(DateTime::from_timestamp(1_749_927_600, 0).unwrap());
        let tracker = QuotaTracker::new(
            &QuotaConfig::default(),
            store.clone(),
            Arc::new(clock),
            Arc::new(RecordingAlertSink::new()),
        );

        let decision = tracker.should_block_request(1).await;
        assert!(decision.should_block);
        assert!(matches!(decision.reason, Some(BlockReason::CheckFailed { .. })));
        assert!(!store.0.is_locked(tracker.calendar.lock_key(tracker.today())));

        let status = tracker.status().await;
        assert!(status.should_block);
        assert_eq!(status.units_remaining, 0);
    }
}
