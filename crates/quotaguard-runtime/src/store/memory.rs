//! In-memory state store.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use quotaguard_core::{ApiMetricRecord, CircuitRecord, QuotaUsageRecord};

use super::{MetricsQuery, StateStore, StoreError};

#[derive(Default)]
struct Tables {
    circuits: HashMap<String, CircuitRecord>,
    usage: Vec<QuotaUsageRecord>,
    metrics: Vec<ApiMetricRecord>,
    locks: HashSet<i64>,
}

/// State store backed by process memory.
///
/// Share one instance (behind an `Arc`) between guards to model several
/// processes using the same database.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the usage ledger, in append order.
    pub fn usage_rows(&self) -> Vec<QuotaUsageRecord> {
        self.tables.lock().usage.clone()
    }

    /// Snapshot of the metric ledger, in append order.
    pub fn metric_rows(&self) -> Vec<ApiMetricRecord> {
        self.tables.lock().metrics.clone()
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: i64) -> bool {
        self.tables.lock().locks.contains(&key)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError> {
        Ok(self.tables.lock().circuits.get(service).cloned())
    }

    async fn upsert_circuit(&self, record: &CircuitRecord) -> Result<(), StoreError> {
        self.tables
            .lock()
            .circuits
            .insert(record.service.clone(), record.clone());
        Ok(())
    }

    async fn append_usage(&self, record: &QuotaUsageRecord) -> Result<(), StoreError> {
        self.tables.lock().usage.push(record.clone());
        Ok(())
    }

    async fn append_metric(&self, record: &ApiMetricRecord) -> Result<(), StoreError> {
        self.tables.lock().metrics.push(record.clone());
        Ok(())
    }

    async fn sum_successful_usage(&self, date: NaiveDate) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .lock()
            .usage
            .iter()
            .filter(|row| row.date == date)
            .map(QuotaUsageRecord::billable_units)
            .sum())
    }

    async fn query_metrics(&self, query: &MetricsQuery) -> Result<Vec<ApiMetricRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut rows: Vec<ApiMetricRecord> = tables
            .metrics
            .iter()
            .filter(|m| query.operation.as_deref().map_or(true, |op| m.operation == op))
            .filter(|m| query.since.map_or(true, |since| m.created_at >= since))
            .cloned()
            .collect();
        // Stable sort keeps append order among equal timestamps.
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError> {
        Ok(self.tables.lock().locks.insert(key))
    }

    async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError> {
        self.tables.lock().locks.remove(&key);
        Ok(())
    }
}
