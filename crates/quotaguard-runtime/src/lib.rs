//! # quotaguard-runtime
//!
//! Async guard for a metered, rate-limited upstream API.
//!
//! Every call goes through the [`RetryOrchestrator`]:
//! 1. Validate the declared cost against the cost table
//! 2. Ask the [`QuotaTracker`] whether the shared daily budget allows it
//! 3. Run it under the durable [`CircuitBreaker`]
//! 4. Classify failures, retry the transient ones, record every attempt
//!
//! Breaker state, the usage ledger and the metric ledger live in a
//! [`StateStore`] shared by every process, so the guard holds across
//! replicas and restarts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quotaguard_runtime::{CallRequest, GuardConfig, MemoryStore, RetryOrchestrator};
//!
//! let orchestrator = RetryOrchestrator::builder()
//!     .config(GuardConfig::from_yaml_file("quotaguard.yaml")?)
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .await?;
//!
//! let outcome = orchestrator
//!     .execute(CallRequest::new("videos.list", 1), || client.list_videos())
//!     .await?;
//! ```

pub mod alerts;
pub mod config;
pub mod monitor;
pub mod orchestrator;
pub mod resilience;
pub mod store;

pub use alerts::{Alert, AlertSink, LogAlertSink, RecordingAlertSink};
pub use config::{ConfigError, GuardConfig, MonitorConfig, QuotaConfig, RetryConfig};
pub use monitor::{MonitorHandle, MonitorReport, QuotaMonitor};
pub use orchestrator::{
    CallError, CallMetrics, CallOutcome, CallRequest, GuardError, RetryOrchestrator,
    RetryOrchestratorBuilder,
};
pub use resilience::{
    BlockReason, BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError,
    CircuitSnapshot, MetricEntry, PerformanceSummary, PersistenceError, QuotaDecision,
    QuotaTracker, UsageEntry,
};
pub use store::{MemoryStore, MetricsQuery, StateStore, StoreError};
