//! Resilience patterns for quotaguard-runtime.
//!
//! This module provides:
//! - Durable circuit breaker to prevent cascade failures
//! - Shared daily quota tracking with fail-closed admission

mod circuit_breaker;
mod quota_tracker;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitSnapshot,
    PersistenceError,
};
pub use quota_tracker::{
    BlockReason, MetricEntry, PerformanceSummary, QuotaDecision, QuotaTracker, UsageEntry,
};
