//! Escalation hooks for conditions an operator must hear about.
//!
//! Everything is logged regardless; an [`AlertSink`] is where the host wires
//! paging, chat or email for the subset that escalates.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use quotaguard_core::{AlertLevel, QuotaStatus};

/// A condition that needs operator attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    /// Daily quota crossed an escalating threshold
    Quota {
        level: AlertLevel,
        status: QuotaStatus,
    },

    /// A circuit opened and is now rejecting calls
    CircuitOpened {
        service: String,
        next_attempt_at: DateTime<Utc>,
    },

    /// A circuit could not persist its state and forced itself open
    PersistenceFault {
        service: String,
        until: DateTime<Utc>,
        error: String,
    },
}

/// Receiver for escalated alerts.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Sink that only logs. Used when the host wires nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &Alert) {
        match alert {
            Alert::Quota { level, status } => tracing::error!(
                level = %level,
                units_used = status.units_used,
                daily_limit = status.daily_limit,
                "Quota alert escalated"
            ),
            Alert::CircuitOpened {
                service,
                next_attempt_at,
            } => tracing::error!(
                service = %service,
                next_attempt_at = %next_attempt_at,
                "Circuit open alert escalated"
            ),
            Alert::PersistenceFault {
                service,
                until,
                error,
            } => tracing::error!(
                service = %service,
                until = %until,
                error = %error,
                "Circuit persistence fault escalated"
            ),
        }
    }
}

/// Sink that keeps every alert, for tests and drills.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}
