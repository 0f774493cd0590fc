//! Retry orchestrator for quota-metered upstream calls.
//!
//! The orchestrator wraps one upstream call end to end. It implements:
//! - Cost validation against the static cost table
//! - Pre-flight quota admission (fail-closed)
//! - Circuit breaker protection
//! - Deterministic failure classification with bounded retries
//! - One metric row per attempt; ledger rows carry quota only on success

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;

use quotaguard_core::{
    classify_at, exponential_delay, validate_cost, Clock, ErrorClass, ErrorType, QuotaStatus,
    SystemClock, UpstreamError,
};

use crate::alerts::{AlertSink, LogAlertSink};
use crate::config::{ConfigError, GuardConfig};
use crate::monitor::QuotaMonitor;
use crate::resilience::{
    BreakerError, CircuitBreaker, CircuitSnapshot, MetricEntry, PerformanceSummary,
    PersistenceError, QuotaTracker, UsageEntry,
};
use crate::store::{MetricsQuery, StateStore};

/// Fatal errors from the orchestrator.
///
/// Expected upstream failures are not errors here; they arrive as
/// [`CallError`] inside a [`CallOutcome`].
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("State store not configured")]
    StoreNotConfigured,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One metered upstream call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Operation name as listed in the cost table (e.g. "videos.list")
    pub operation: String,

    /// Units the caller expects to spend
    pub declared_cost: u32,

    pub user_id: Option<String>,
    pub endpoint: Option<String>,

    /// Overrides `retry.retries`
    pub retries: Option<u32>,

    /// Overrides `retry.initial_backoff`
    pub initial_backoff: Option<Duration>,
}

impl CallRequest {
    pub fn new(operation: impl Into<String>, declared_cost: u32) -> Self {
        Self {
            operation: operation.into(),
            declared_cost,
            user_id: None,
            endpoint: None,
            retries: None,
            initial_backoff: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }
}

/// Caller-facing description of a failed call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error_type}: {message}")]
pub struct CallError {
    pub error_type: ErrorType,
    pub message: String,
    pub retryable: bool,

    /// Explicit delay the upstream asked for
    pub retry_after: Option<Duration>,

    pub status_code: Option<u16>,

    /// Set for `circuit_open` while the circuit is cooling down
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Set for `quota_exceeded`
    pub quota_status: Option<QuotaStatus>,
}

impl CallError {
    fn new(error_type: ErrorType, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            error_type,
            message: message.into(),
            retryable,
            retry_after: None,
            status_code: None,
            next_attempt_at: None,
            quota_status: None,
        }
    }

    fn from_class(class: &ErrorClass, source: &UpstreamError) -> Self {
        Self {
            retry_after: class.retry_after(),
            status_code: class.status_code(),
            ..Self::new(class.error_type(), class.describe(source), class.is_retryable())
        }
    }
}

/// Timing and spend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallMetrics {
    /// Wall time including retry sleeps
    pub duration_ms: u64,

    /// Retries performed after the first attempt
    pub retry_count: u32,

    /// Units charged to the ledger
    pub quota_used: u32,
}

/// Result of [`RetryOrchestrator::execute`].
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: Result<T, CallError>,
    pub metrics: CallMetrics,
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Runs metered upstream calls through quota admission, the circuit breaker
/// and the retry loop.
pub struct RetryOrchestrator {
    config: GuardConfig,
    breaker: Arc<CircuitBreaker>,
    quota: Arc<QuotaTracker>,
    clock: Arc<dyn Clock>,
}

impl RetryOrchestrator {
    pub fn builder() -> RetryOrchestratorBuilder {
        RetryOrchestratorBuilder::new()
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Run `call` with quota admission, circuit protection and retries.
    ///
    /// Returns `Err` only for a breaker persistence fault; the attempt that
    /// hit the fault is still written to the ledger first. Every expected
    /// failure comes back as `Ok` with a failed [`CallOutcome`].
    pub async fn execute<F, Fut, T>(
        &self,
        request: CallRequest,
        mut call: F,
    ) -> Result<CallOutcome<T>, GuardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let started = Instant::now();
        let retries = request.retries.unwrap_or(self.config.retry.retries);
        let initial_backoff = request
            .initial_backoff
            .unwrap_or(self.config.retry.initial_backoff);

        let cost = validate_cost(&request.operation, request.declared_cost);
        if cost.is_mismatch() {
            tracing::error!(
                operation = %request.operation,
                declared = cost.declared,
                expected = cost.expected,
                "Quota cost mismatch"
            );
            tracing::warn!(
                operation = %request.operation,
                charged = cost.charged,
                "Using corrected quota cost"
            );
        }
        let charged = cost.charged;

        let decision = self.quota.should_block_request(u64::from(charged)).await;
        if decision.should_block {
            let message = decision
                .reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "Daily quota exceeded".to_string());
            let quota_status = match decision.status {
                Some(status) => status,
                None => self.quota.status().await,
            };
            tracing::warn!(
                operation = %request.operation,
                required = charged,
                reason = %message,
                "Request blocked by quota"
            );

            let duration_ms = elapsed_ms(started);
            self.quota
                .track_metrics(MetricEntry {
                    operation: request.operation.clone(),
                    duration_ms,
                    success: false,
                    status_code: None,
                    error_type: Some(ErrorType::QuotaExceeded),
                    retry_count: 0,
                    user_id: request.user_id.clone(),
                })
                .await;

            return Ok(CallOutcome {
                result: Err(CallError {
                    quota_status: Some(quota_status),
                    ..CallError::new(ErrorType::QuotaExceeded, message, false)
                }),
                metrics: CallMetrics {
                    duration_ms,
                    retry_count: 0,
                    quota_used: 0,
                },
            });
        }

        let mut attempt: u32 = 0;
        loop {
            let attempt_started = Instant::now();
            let outcome = self.breaker.execute(|| call()).await;
            let attempt_ms = elapsed_ms(attempt_started);

            let error = match outcome {
                Ok(value) => {
                    self.record_attempt(&request, attempt, attempt_ms, charged, None)
                        .await;
                    tracing::debug!(
                        operation = %request.operation,
                        units = charged,
                        retry_count = attempt,
                        "Upstream call succeeded"
                    );
                    return Ok(CallOutcome {
                        result: Ok(value),
                        metrics: CallMetrics {
                            duration_ms: elapsed_ms(started),
                            retry_count: attempt,
                            quota_used: charged,
                        },
                    });
                }
                Err(BreakerError::Persistence { error, completed }) => {
                    match completed {
                        Some(Ok(())) => {
                            self.record_attempt(&request, attempt, attempt_ms, charged, None)
                                .await
                        }
                        Some(Err(upstream)) => {
                            let failure = self.upstream_failure(&request, attempt, &upstream).await;
                            self.record_attempt(&request, attempt, attempt_ms, 0, Some(&failure))
                                .await
                        }
                        None => {}
                    }
                    return Err(GuardError::Persistence(error));
                }
                Err(BreakerError::Open(e)) => {
                    tracing::warn!(
                        operation = %request.operation,
                        error = %e,
                        "Circuit breaker rejected call"
                    );
                    CallError {
                        next_attempt_at: e.next_attempt_at(),
                        ..CallError::new(ErrorType::CircuitOpen, e.to_string(), false)
                    }
                }
                Err(BreakerError::Inner(upstream)) => {
                    self.upstream_failure(&request, attempt, &upstream).await
                }
            };

            self.record_attempt(&request, attempt, attempt_ms, 0, Some(&error))
                .await;

            if !error.retryable || attempt >= retries {
                return Ok(self.failed(error, started, attempt));
            }

            let delay = match error.retry_after {
                Some(delay) if delay > self.config.retry.max_retry_after => {
                    tracing::warn!(
                        operation = %request.operation,
                        retry_after = ?delay,
                        max_retry_after = ?self.config.retry.max_retry_after,
                        "Retry-After exceeds limit - not waiting"
                    );
                    return Ok(self.failed(error, started, attempt));
                }
                Some(delay) => delay,
                None => exponential_delay(initial_backoff, attempt + 1),
            };

            tracing::info!(
                operation = %request.operation,
                attempt = attempt + 1,
                max_attempts = retries + 1,
                delay = ?delay,
                "Retrying upstream call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn upstream_failure(
        &self,
        request: &CallRequest,
        attempt: u32,
        upstream: &UpstreamError,
    ) -> CallError {
        let class = classify_at(upstream, self.clock.now());
        let mut error = CallError::from_class(&class, upstream);
        if class.error_type() == ErrorType::QuotaExceeded {
            error.quota_status = Some(self.quota.status().await);
        }
        tracing::warn!(
            operation = %request.operation,
            attempt = attempt + 1,
            error_type = %error.error_type,
            status = ?error.status_code,
            retryable = error.retryable,
            "Upstream call failed"
        );
        error
    }

    fn failed<T>(&self, error: CallError, started: Instant, attempt: u32) -> CallOutcome<T> {
        CallOutcome {
            result: Err(error),
            metrics: CallMetrics {
                duration_ms: elapsed_ms(started),
                retry_count: attempt,
                quota_used: 0,
            },
        }
    }

    /// Write the ledger row and metric row for one attempt.
    async fn record_attempt(
        &self,
        request: &CallRequest,
        attempt: u32,
        duration_ms: u64,
        units: u32,
        error: Option<&CallError>,
    ) {
        let usage = UsageEntry {
            operation: request.operation.clone(),
            units_used: units,
            user_id: request.user_id.clone(),
            endpoint: request.endpoint.clone(),
            success: error.is_none(),
            error_code: error.map(|e| e.error_type.as_str().to_string()),
        };
        let metric = MetricEntry {
            operation: request.operation.clone(),
            duration_ms,
            success: error.is_none(),
            status_code: error.and_then(|e| e.status_code),
            error_type: error.map(|e| e.error_type),
            retry_count: attempt,
            user_id: request.user_id.clone(),
        };

        tokio::join!(
            self.quota.track_usage(usage),
            self.quota.track_metrics(metric)
        );
    }

    /// Today's budget.
    pub async fn quota_status(&self) -> QuotaStatus {
        self.quota.status().await
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Latency summary for one operation.
    pub async fn performance(&self, operation: &str) -> PerformanceSummary {
        self.quota
            .performance(&MetricsQuery::for_operation(operation))
            .await
    }

    /// A monitor over this orchestrator's quota and circuit. Not started.
    pub fn monitor(&self) -> QuotaMonitor {
        QuotaMonitor::new(
            self.quota.clone(),
            self.breaker.clone(),
            self.config.monitor.interval,
        )
    }
}

/// Builder for RetryOrchestrator.
pub struct RetryOrchestratorBuilder {
    config: GuardConfig,
    store: Option<Arc<dyn StateStore>>,
    clock: Option<Arc<dyn Clock>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl RetryOrchestratorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: GuardConfig::default(),
            store: None,
            clock: None,
            alerts: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the shared state store.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the clock. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the alert sink. Defaults to logging only.
    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Build the orchestrator, loading the circuit state from the store.
    pub async fn build(self) -> Result<RetryOrchestrator, GuardError> {
        self.config.validate()?;
        let store = self.store.ok_or(GuardError::StoreNotConfigured)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let alerts = self.alerts.unwrap_or_else(|| Arc::new(LogAlertSink));

        let breaker = CircuitBreaker::load(
            self.config.service.clone(),
            self.config.breaker.clone(),
            store.clone(),
            clock.clone(),
            alerts.clone(),
        )
        .await;
        let quota = QuotaTracker::new(&self.config.quota, store, clock.clone(), alerts);

        Ok(RetryOrchestrator {
            config: self.config,
            breaker: Arc::new(breaker),
            quota: Arc::new(quota),
            clock,
        })
    }
}

impl Default for RetryOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::resilience::CircuitBreakerConfig;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use quotaguard_core::{
        ApiMetricRecord, CircuitRecord, CircuitState, ManualClock, QuotaUsageRecord,
        TransportFailure,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        store: Arc<MemoryStore>,
        orchestrator: RetryOrchestrator,
    }

    async fn harness(config: GuardConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = RetryOrchestrator::builder()
            .config(config)
            .store(store.clone())
            .clock(Arc::new(ManualClock::new(
                DateTime::from_timestamp(1_749_927_600, 0).unwrap(),
            )))
            .alerts(Arc::new(RecordingAlertSink::new()))
            .build()
            .await
            .unwrap();
        Harness {
            store,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_builder_requires_store() {
        let result = RetryOrchestrator::builder().build().await;
        assert!(matches!(result, Err(GuardError::StoreNotConfigured)));
    }

    #[tokio::test]
    async fn test_success_charges_table_cost() {
        let h = harness(GuardConfig::default()).await;

        let outcome = h
            .orchestrator
            .execute(CallRequest::new("search.list", 1).user("u-1"), || async {
                Ok::<_, UpstreamError>("results")
            })
            .await
            .unwrap();

        assert_eq!(outcome.result.unwrap(), "results");
        assert_eq!(outcome.metrics.quota_used, 100);
        assert_eq!(outcome.metrics.retry_count, 0);

        let rows = h.store.usage_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].units_used, 100);
        assert_eq!(rows[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(h.orchestrator.quota_status().await.units_used, 100);
        assert_eq!(h.store.metric_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_preflight_block_skips_upstream() {
        let h = harness(GuardConfig::default()).await;
        h.orchestrator
            .quota()
            .track_usage(UsageEntry {
                operation: "search.list".to_string(),
                units_used: 9_600,
                success: true,
                ..Default::default()
            })
            .await;

        let calls = AtomicU32::new(0);
        let outcome = h
            .orchestrator
            .execute(CallRequest::new("search.list", 100), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, UpstreamError>(())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::QuotaExceeded);
        assert!(!error.retryable);
        assert_eq!(error.quota_status.unwrap().units_used, 9_600);
        assert_eq!(outcome.metrics.quota_used, 0);

        assert_eq!(h.store.usage_rows().len(), 1);
        let metrics = h.store.metric_rows();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].error_type.as_deref(), Some("quota_exceeded"));
        assert_eq!(h.orchestrator.circuit_snapshot().record.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let h = harness(GuardConfig::default()).await;
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let outcome = h
            .orchestrator
            .execute(
                CallRequest::new("videos.list", 1).initial_backoff(Duration::from_millis(10)),
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(UpstreamError::http(429, "Too Many Requests").with_header("Retry-After", "5"))
                    } else {
                        Ok("ok")
                    }
                },
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(outcome.metrics.retry_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_between_attempts() {
        let h = harness(GuardConfig::default()).await;

        let started = Instant::now();
        let outcome = h
            .orchestrator
            .execute(CallRequest::new("videos.list", 1).retries(2), || async {
                Err::<(), _>(UpstreamError::transport(
                    TransportFailure::ConnectionReset,
                    "socket hang up",
                ))
            })
            .await
            .unwrap();

        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::NetworkError);
        assert!(error.retryable);
        assert_eq!(outcome.metrics.retry_count, 2);
        // 1s then 2s
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_never_charge_quota() {
        let h = harness(GuardConfig::default()).await;
        let calls = AtomicU32::new(0);

        let outcome = h
            .orchestrator
            .execute(CallRequest::new("search.list", 100), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::http(503, "Service Unavailable"))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.metrics.retry_count, 3);
        assert_eq!(outcome.metrics.quota_used, 0);

        let rows = h.store.usage_rows();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.units_used == 0 && !r.success));
        assert_eq!(h.store.metric_rows().len(), 4);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let h = harness(GuardConfig::default()).await;
        let calls = AtomicU32::new(0);

        let outcome = h
            .orchestrator
            .execute(CallRequest::new("videos.list", 1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::http(404, "Not Found"))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::ApiError);
        assert_eq!(error.status_code, Some(404));
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn test_quota_reason_is_terminal_with_snapshot() {
        let h = harness(GuardConfig::default()).await;

        let outcome = h
            .orchestrator
            .execute(CallRequest::new("videos.list", 1), || async {
                Err::<(), _>(UpstreamError::http(403, "Forbidden").with_reason("quotaExceeded"))
            })
            .await
            .unwrap();

        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::QuotaExceeded);
        assert!(error.quota_status.is_some());
        assert_eq!(outcome.metrics.retry_count, 0);
    }

    #[tokio::test]
    async fn test_excessive_retry_after_is_not_waited() {
        let h = harness(GuardConfig::default()).await;
        let calls = AtomicU32::new(0);

        let outcome = h
            .orchestrator
            .execute(CallRequest::new("videos.list", 1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::http(429, "Too Many Requests").with_header("retry-after", "600"))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let error = outcome.result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::RateLimit);
        assert_eq!(error.retry_after, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_open_circuit_is_terminal() {
        let config = GuardConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let h = harness(config).await;

        let first = h
            .orchestrator
            .execute(CallRequest::new("videos.list", 1).retries(0), || async {
                Err::<(), _>(UpstreamError::http(500, "Internal Server Error"))
            })
            .await
            .unwrap();
        assert!(!first.is_success());
        assert_eq!(h.orchestrator.circuit_snapshot().record.state, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let second = h
            .orchestrator
            .execute(CallRequest::new("videos.list", 1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, UpstreamError>(())
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let error = second.result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::CircuitOpen);
        assert!(!error.retryable);
        assert!(error.next_attempt_at.is_some());
    }

    /// Memory store that rejects every circuit write.
    struct CircuitWritesFail {
        inner: MemoryStore,
    }

    #[async_trait]
    impl StateStore for CircuitWritesFail {
        async fn load_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError> {
            self.inner.load_circuit(service).await
        }
        async fn upsert_circuit(&self, _record: &CircuitRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection reset".into()))
        }
        async fn append_usage(&self, record: &QuotaUsageRecord) -> Result<(), StoreError> {
            self.inner.append_usage(record).await
        }
        async fn append_metric(&self, record: &ApiMetricRecord) -> Result<(), StoreError> {
            self.inner.append_metric(record).await
        }
        async fn sum_successful_usage(&self, date: NaiveDate) -> Result<u64, StoreError> {
            self.inner.sum_successful_usage(date).await
        }
        async fn query_metrics(&self, query: &MetricsQuery) -> Result<Vec<ApiMetricRecord>, StoreError> {
            self.inner.query_metrics(query).await
        }
        async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError> {
            self.inner.try_advisory_lock(key).await
        }
        async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError> {
            self.inner.advisory_unlock(key).await
        }
    }

    async fn with_failing_circuit_writes() -> (Arc<CircuitWritesFail>, RetryOrchestrator) {
        let store = Arc::new(CircuitWritesFail {
            inner: MemoryStore::new(),
        });
        let orchestrator = RetryOrchestrator::builder()
            .store(store.clone())
            .clock(Arc::new(ManualClock::new(
                DateTime::from_timestamp(1_749_927_600, 0).unwrap(),
            )))
            .alerts(Arc::new(RecordingAlertSink::new()))
            .build()
            .await
            .unwrap();
        (store, orchestrator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_fault_still_charges_spent_units() {
        let (store, orchestrator) = with_failing_circuit_writes().await;

        let result = orchestrator
            .execute(CallRequest::new("search.list", 100), || async {
                Ok::<_, UpstreamError>("spent")
            })
            .await;

        assert!(matches!(result, Err(GuardError::Persistence(_))));
        let usage = store.inner.usage_rows();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].units_used, 100);
        assert!(usage[0].success);
        let metrics = store.inner.metric_rows();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].success);
        assert_eq!(orchestrator.quota_status().await.units_used, 100);
        assert_eq!(orchestrator.circuit_snapshot().record.state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_fault_after_upstream_failure_is_recorded() {
        let (store, orchestrator) = with_failing_circuit_writes().await;
        let calls = AtomicU32::new(0);

        let result = orchestrator
            .execute(CallRequest::new("search.list", 100), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::http(503, "Service Unavailable"))
            })
            .await;

        assert!(matches!(result, Err(GuardError::Persistence(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let usage = store.inner.usage_rows();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].units_used, 0);
        assert!(!usage[0].success);
        let metrics = store.inner.metric_rows();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].error_type.as_deref(), Some("api_error"));
        assert_eq!(metrics[0].status_code, Some(503));
        assert_eq!(orchestrator.quota_status().await.units_used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_date_retry_after_is_honoured() {
        let h = harness(GuardConfig::default()).await;
        let calls = AtomicU32::new(0);

        // Harness clock reads 2025-06-14 19:00:00 UTC.
        let started = Instant::now();
        let outcome = h
            .orchestrator
            .execute(
                CallRequest::new("videos.list", 1).initial_backoff(Duration::from_millis(10)),
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(UpstreamError::http(429, "Too Many Requests")
                            .with_header("Retry-After", "Sat, 14 Jun 2025 19:00:05 GMT"))
                    } else {
                        Ok("ok")
                    }
                },
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(outcome.metrics.retry_count, 1);
    }
}
