//! Periodic quota monitoring.
//!
//! The monitor is an owned task: the host starts it, keeps the handle, and
//! stops it on shutdown. Nothing in this crate spawns it implicitly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use quotaguard_core::{AlertLevel, CircuitState, QuotaStatus};

use crate::resilience::{CircuitBreaker, QuotaTracker};

/// What one monitor pass observed.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReport {
    pub level: AlertLevel,
    pub status: QuotaStatus,
    pub circuit: CircuitState,
}

/// Periodic quota and circuit watcher, started and stopped by the host.
pub struct QuotaMonitor {
    quota: Arc<QuotaTracker>,
    breaker: Arc<CircuitBreaker>,
    interval: Duration,
}

impl QuotaMonitor {
    pub fn new(quota: Arc<QuotaTracker>, breaker: Arc<CircuitBreaker>, interval: Duration) -> Self {
        Self {
            quota,
            breaker,
            interval,
        }
    }

    /// Run one pass: snapshot quota, apply alert thresholds, log the circuit.
    pub async fn check_once(&self) -> MonitorReport {
        let (level, status) = self.quota.check_thresholds().await;
        let circuit = self.breaker.state();

        tracing::info!(
            units_used = status.units_used,
            daily_limit = status.daily_limit,
            percent = %status.percent(),
            reset_at = %status.reset_at,
            service = %self.breaker.service(),
            circuit = %circuit,
            "Quota monitor check"
        );

        MonitorReport {
            level,
            status,
            circuit,
        }
    }

    /// Spawn the monitor loop. The first pass runs immediately.
    pub fn start(self) -> MonitorHandle {
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(rx));
        MonitorHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.interval, "Quota monitor starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Quota monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Handle to a running [`QuotaMonitor`].
pub struct MonitorHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        // Receiver may already be gone if the task ended.
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Quota monitor task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, RecordingAlertSink};
    use crate::config::QuotaConfig;
    use crate::resilience::{CircuitBreakerConfig, UsageEntry};
    use crate::store::MemoryStore;
    use chrono::DateTime;
    use quotaguard_core::ManualClock;

    async fn monitor(alerts: Arc<RecordingAlertSink>, interval: Duration) -> (QuotaMonitor, Arc<QuotaTracker>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1_749_927_600, 0).unwrap()));
        let quota = Arc::new(QuotaTracker::new(
            &QuotaConfig::default(),
            store.clone(),
            clock.clone(),
            alerts.clone(),
        ));
        let breaker = Arc::new(
            CircuitBreaker::load("youtube_api", CircuitBreakerConfig::default(), store, clock, alerts).await,
        );
        (QuotaMonitor::new(quota.clone(), breaker, interval), quota)
    }

    #[tokio::test]
    async fn test_check_once_reports_level_and_circuit() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let (monitor, quota) = monitor(alerts.clone(), Duration::from_secs(60)).await;
        quota
            .track_usage(UsageEntry {
                operation: "videos.list".to_string(),
                units_used: 8_000,
                success: true,
                ..Default::default()
            })
            .await;

        let report = monitor.check_once().await;
        assert_eq!(report.level, AlertLevel::Warning);
        assert_eq!(report.status.units_used, 8_000);
        assert_eq!(report.circuit, CircuitState::Closed);
        assert!(alerts.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_ticks_until_stopped() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let (monitor, quota) = monitor(alerts.clone(), Duration::from_secs(60)).await;
        quota
            .track_usage(UsageEntry {
                operation: "search.list".to_string(),
                units_used: 9_200,
                success: true,
                ..Default::default()
            })
            .await;
        let escalated_by_write = alerts.alerts().len();

        let handle = monitor.start();
        time::sleep(Duration::from_secs(150)).await;
        handle.stop().await;

        // Ticks at 0s, 60s and 120s.
        let from_monitor = alerts.alerts().len() - escalated_by_write;
        assert_eq!(from_monitor, 3);
        assert!(alerts
            .alerts()
            .iter()
            .all(|a| matches!(a, Alert::Quota { level: AlertLevel::Critical, .. })));

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(alerts.alerts().len(), escalated_by_write + 3);
    }
}
