//! Durable circuit breaker to prevent cascade failures.
//!
//! When upstream calls fail repeatedly the circuit opens and subsequent calls
//! are rejected immediately until a cool-down elapses. State lives in the
//! shared store so it survives restarts and is visible to every replica.
//!
//! ```text
//! CLOSED --failure_threshold failures--> OPEN --timeout elapsed, next call--> HALF_OPEN
//!   ^                                     ^                                       |
//!   |                                     +--------------any failure--------------+
//!   +-------------------------success_threshold successes-------------------------+
//! ```
//!
//! Transitions are not lock-protected across processes: the last writer wins,
//! which at worst grants one extra HALF_OPEN probe.

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use quotaguard_core::{CircuitRecord, CircuitState, Clock};

use crate::alerts::{Alert, AlertSink};
use crate::config::{duration_str, ConfigError};
use crate::store::{StateStore, StoreError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening circuit
    pub failure_threshold: u32,

    /// Consecutive HALF_OPEN successes needed to close circuit
    pub success_threshold: u32,

    /// Time OPEN before a probe is allowed
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Probe calls allowed in flight while HALF_OPEN
    pub max_half_open_concurrent: u32,

    /// Persistence retries after the first failed write
    pub persist_retries: u32,

    /// Delay before the first persistence retry; doubles per retry
    #[serde(with = "duration_str")]
    pub persist_backoff: Duration,

    /// How long to stay OPEN when state cannot be persisted
    #[serde(with = "duration_str")]
    pub safe_mode_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_half_open_concurrent: 1,
            persist_retries: 3,
            persist_backoff: Duration::from_secs(1),
            safe_mode_cooldown: Duration::from_secs(3600),
        }
    }
}

impl CircuitBreakerConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker thresholds must be positive".into(),
            ));
        }
        if self.max_half_open_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "breaker.max_half_open_concurrent must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Call rejected without reaching the upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitOpenError {
    #[error("Circuit breaker '{service}' is OPEN. Next attempt at {next_attempt_at}")]
    CoolingDown {
        service: String,
        next_attempt_at: DateTime<Utc>,
    },

    #[error("Circuit breaker '{service}' is HALF_OPEN - limiting concurrent test requests")]
    ProbeLimit { service: String },
}

impl CircuitOpenError {
    pub fn service(&self) -> &str {
        match self {
            CircuitOpenError::CoolingDown { service, .. } => service,
            CircuitOpenError::ProbeLimit { service } => service,
        }
    }

    /// When the circuit will next admit a probe, if known.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CircuitOpenError::CoolingDown {
                next_attempt_at, ..
            } => Some(*next_attempt_at),
            CircuitOpenError::ProbeLimit { .. } => None,
        }
    }
}

/// State could not be made durable; the breaker forced itself OPEN.
#[derive(Error, Debug, Clone)]
#[error(
    "Circuit breaker '{service}' cannot persist state after {attempts} attempts; \
     forced OPEN until {until}"
)]
pub struct PersistenceError {
    pub service: String,
    pub attempts: u32,
    pub until: DateTime<Utc>,
    #[source]
    pub source: StoreError,
}

/// Errors from [`CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("Operation failed: {0}")]
    Inner(#[source] E),

    /// Breaker state could not be written. `completed` holds the result of
    /// the operation when it ran before the fault, so callers can still
    /// account for it.
    #[error("{error}")]
    Persistence {
        #[source]
        error: PersistenceError,
        completed: Option<Result<(), E>>,
    },
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub record: CircuitRecord,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub probes_in_flight: u32,
}

struct Inner {
    record: CircuitRecord,
    next_attempt_at: Option<DateTime<Utc>>,
    probes_in_flight: u32,
}

/// Probe slot held for the duration of one HALF_OPEN call.
struct ProbeSlot<'a> {
    inner: &'a Mutex<Inner>,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Durable circuit breaker for one protected service.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl CircuitBreaker {
    /// Create a breaker, loading its last persisted state.
    ///
    /// A store failure here is logged and the breaker starts CLOSED.
    pub async fn load(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let service = service.into();
        let now = clock.now();

        let record = match store.load_circuit(&service).await {
            Ok(Some(record)) => {
                tracing::info!(
                    service = %service,
                    state = %record.state,
                    failure_count = record.failure_count,
                    "Circuit breaker state loaded from store"
                );
                record
            }
            Ok(None) => CircuitRecord::closed(&service, now),
            Err(e) => {
                tracing::error!(service = %service, error = %e, "Failed to load circuit breaker state");
                CircuitRecord::closed(&service, now)
            }
        };

        let next_attempt_at = match record.state {
            CircuitState::Open => Some(
                record
                    .opened_at
                    .map(|at| at + chrono_duration(config.timeout))
                    .unwrap_or(now),
            ),
            _ => None,
        };

        Self {
            service,
            config,
            inner: Mutex::new(Inner {
                record,
                next_attempt_at,
                probes_in_flight: 0,
            }),
            store,
            clock,
            alerts,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().record.state
    }

    /// Current record and timing.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            record: inner.record.clone(),
            next_attempt_at: inner.next_attempt_at,
            probes_in_flight: inner.probes_in_flight,
        }
    }

    /// Run `f` under circuit protection.
    ///
    /// Rejected calls never invoke `f`. Every outcome of `f` is recorded and
    /// persisted before returning.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let (slot, transitioned) = self.admit()?;
        if let Some(record) = transitioned {
            self.persist(record)
                .await
                .map_err(|error| BreakerError::Persistence {
                    error,
                    completed: None,
                })?;
        }

        let holds_slot = slot.is_some();
        let outcome = f().await;

        match outcome {
            Ok(value) => {
                let record = self.on_success(holds_slot);
                drop(slot);
                match self.persist(record).await {
                    Ok(()) => Ok(value),
                    Err(error) => Err(BreakerError::Persistence {
                        error,
                        completed: Some(Ok(())),
                    }),
                }
            }
            Err(e) => {
                let (record, alert) = self.on_failure(&e, holds_slot);
                drop(slot);
                if let Some(alert) = alert {
                    self.alerts.notify(&alert);
                }
                match self.persist(record).await {
                    Ok(()) => Err(BreakerError::Inner(e)),
                    Err(error) => Err(BreakerError::Persistence {
                        error,
                        completed: Some(Err(e)),
                    }),
                }
            }
        }
    }

    /// Force the circuit CLOSED (admin operation).
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        tracing::info!(service = %self.service, "Circuit breaker manually reset");
        let record = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            Self::close(&mut inner, now);
            inner.record.clone()
        };
        self.persist(record).await
    }

    /// Decide whether a call may proceed.
    ///
    /// Returns the probe slot for HALF_OPEN calls and, when this call moved
    /// the circuit from OPEN to HALF_OPEN, the record to persist.
    #[allow(clippy::type_complexity)]
    fn admit(&self) -> Result<(Option<ProbeSlot<'_>>, Option<CircuitRecord>), CircuitOpenError> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let mut transitioned = None;

        if inner.record.state == CircuitState::Open {
            let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
            if now < next_attempt_at {
                return Err(CircuitOpenError::CoolingDown {
                    service: self.service.clone(),
                    next_attempt_at,
                });
            }

            inner.record.state = CircuitState::HalfOpen;
            inner.record.half_open_at = Some(now);
            inner.record.failure_count = 0;
            inner.record.success_count = 0;
            inner.record.updated_at = now;
            inner.next_attempt_at = None;
            tracing::info!(
                service = %self.service,
                half_open_at = %now,
                "Circuit breaker transitioned to HALF_OPEN - testing service recovery"
            );
            transitioned = Some(inner.record.clone());
        }

        if inner.record.state == CircuitState::HalfOpen {
            if inner.probes_in_flight >= self.config.max_half_open_concurrent {
                return Err(CircuitOpenError::ProbeLimit {
                    service: self.service.clone(),
                });
            }
            inner.probes_in_flight += 1;
            drop(inner);
            return Ok((Some(ProbeSlot { inner: &self.inner }), transitioned));
        }

        Ok((None, transitioned))
    }

    /// Record a success. Only calls holding a HALF_OPEN slot count toward
    /// recovery; results of calls admitted in an earlier state are stale.
    fn on_success(&self, holds_slot: bool) -> CircuitRecord {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.record.last_success_at = Some(now);
        inner.record.updated_at = now;

        match (inner.record.state, holds_slot) {
            (CircuitState::HalfOpen, true) => {
                inner.record.success_count += 1;
                if inner.record.success_count >= self.config.success_threshold {
                    Self::close(&mut inner, now);
                    tracing::info!(service = %self.service, "Circuit breaker CLOSED - service recovered");
                }
            }
            (CircuitState::Closed, _) => {
                inner.record.success_count += 1;
                inner.record.failure_count = 0;
            }
            (state, _) => tracing::debug!(
                service = %self.service,
                state = %state,
                "Ignoring stale success from a call admitted before the last transition"
            ),
        }

        inner.record.clone()
    }

    fn on_failure<E: Display>(&self, error: &E, holds_slot: bool) -> (CircuitRecord, Option<Alert>) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.record.last_failure_at = Some(now);
        inner.record.updated_at = now;

        let state = inner.record.state;
        let counted = matches!(
            (state, holds_slot),
            (CircuitState::HalfOpen, true) | (CircuitState::Closed, _)
        );
        if !counted {
            tracing::debug!(
                service = %self.service,
                state = %state,
                error = %error,
                "Ignoring stale failure from a call admitted before the last transition"
            );
            return (inner.record.clone(), None);
        }

        inner.record.failure_count += 1;
        inner.record.success_count = 0;

        tracing::warn!(
            service = %self.service,
            state = %state,
            failure_count = inner.record.failure_count,
            threshold = self.config.failure_threshold,
            error = %error,
            "Circuit breaker failure recorded"
        );

        let should_open = state == CircuitState::HalfOpen
            || inner.record.failure_count >= self.config.failure_threshold;

        let alert = should_open.then(|| {
            let failures = inner.record.failure_count;
            let next_attempt_at = self.open(&mut inner, now, self.config.timeout);
            tracing::error!(
                service = %self.service,
                failure_count = failures,
                opened_at = %now,
                next_attempt_at = %next_attempt_at,
                "Circuit breaker OPENED - service marked as failing"
            );
            Alert::CircuitOpened {
                service: self.service.clone(),
                next_attempt_at,
            }
        });

        (inner.record.clone(), alert)
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
        let next_attempt_at = now + chrono_duration(cooldown);
        inner.record.state = CircuitState::Open;
        inner.record.failure_count = 0;
        inner.record.success_count = 0;
        inner.record.opened_at = Some(now);
        inner.record.half_open_at = None;
        inner.record.updated_at = now;
        inner.next_attempt_at = Some(next_attempt_at);
        next_attempt_at
    }

    fn close(inner: &mut Inner, now: DateTime<Utc>) {
        inner.record.state = CircuitState::Closed;
        inner.record.failure_count = 0;
        inner.record.success_count = 0;
        inner.record.opened_at = None;
        inner.record.half_open_at = None;
        inner.record.updated_at = now;
        inner.next_attempt_at = None;
    }

    /// Write `record`, retrying with exponential backoff.
    ///
    /// If every attempt fails the breaker forces itself OPEN for the safe-mode
    /// cool-down and reports the fault.
    async fn persist(&self, record: CircuitRecord) -> Result<(), PersistenceError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.persist_backoff)
            .with_factor(2.0)
            .with_max_times(self.config.persist_retries as usize);

        let store = &self.store;
        let record = &record;
        let service = self.service.as_str();
        let result = (move || async move { store.upsert_circuit(record).await })
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .notify(|e: &StoreError, delay: Duration| {
                tracing::warn!(
                    service = %service,
                    error = %e,
                    retry_in = ?delay,
                    "Circuit breaker state persistence failed - retrying"
                );
            })
            .await;

        let source = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let until = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            let until = self.open(&mut inner, now, self.config.safe_mode_cooldown);
            tracing::error!(
                service = %self.service,
                error = %source,
                until = %until,
                "CRITICAL: circuit breaker cannot persist state - entering safe mode"
            );
            until
        };

        self.alerts.notify(&Alert::PersistenceFault {
            service: self.service.clone(),
            until,
            error: source.to_string(),
        });

        Err(PersistenceError {
            service: self.service.clone(),
            attempts: self.config.persist_retries + 1,
            until,
            source,
        })
    }
}
