//! # quotaguard-core
//!
//! Deterministic model for guarding a metered, rate-limited upstream API.
//!
//! This crate holds everything about the guard that can be decided without
//! touching the network or the store:
//! - What an operation costs ([`costs`])
//! - How a failure is classified and whether it may be retried ([`classify`])
//! - How much of the daily budget is left and when it resets ([`quota`], [`calendar`])
//! - The persisted record shapes shared by every process ([`records`])
//!
//! The async machinery (store, circuit breaker, quota tracker, retry
//! orchestrator) lives in `quotaguard-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use quotaguard_core::{classify, validate_cost, ErrorType, UpstreamError};
//!
//! let check = validate_cost("search.list", 1);
//! assert_eq!(check.charged, 100);
//!
//! let err = UpstreamError::http(429, "slow down").with_header("Retry-After", "5");
//! assert_eq!(classify(&err).error_type(), ErrorType::RateLimit);
//! ```

pub mod backoff;
pub mod calendar;
pub mod classify;
pub mod clock;
pub mod costs;
pub mod quota;
pub mod records;

pub use backoff::exponential_delay;
pub use calendar::{lock_key_for, QuotaCalendar, DEFAULT_QUOTA_TIMEZONE};
pub use classify::{classify, classify_at, ErrorClass, ErrorType, TransportFailure, UpstreamError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use costs::{estimate_cost, validate_cost, CostCheck, DEFAULT_UNIT_COST};
pub use quota::{AlertLevel, BudgetDecision, QuotaPolicy, QuotaStatus, DEFAULT_DAILY_LIMIT};
pub use records::{ApiMetricRecord, CircuitRecord, CircuitState, QuotaUsageRecord};
