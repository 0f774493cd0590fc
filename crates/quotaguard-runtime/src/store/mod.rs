//! Durable state store abstraction.
//!
//! Every process guarding the same upstream shares one store. It holds the
//! circuit rows, the usage and metric ledgers, and provides the advisory lock
//! that serializes quota decisions across processes.
//!
//! The relational backend is provided by the host application; this module
//! defines the contract and ships [`MemoryStore`] for tests, drills and
//! single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use quotaguard_core::{ApiMetricRecord, CircuitRecord, QuotaUsageRecord};

mod memory;

pub use memory::MemoryStore;

/// Errors from the state store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Advisory lock {key} error: {message}")]
    Lock { key: i64, message: String },
}

/// Filter for reading back metric records.
#[derive(Debug, Clone, Default)]
pub struct MetricsQuery {
    /// Only records for this operation
    pub operation: Option<String>,

    /// Only records created at or after this instant
    pub since: Option<DateTime<Utc>>,

    /// Newest `limit` records only
    pub limit: Option<usize>,
}

impl MetricsQuery {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }
}

/// Store contract shared by every guard instance.
///
/// # Requirements
/// - `upsert_circuit` replaces the row keyed by `service` atomically
/// - Ledger appends are never rewritten or reordered
/// - `try_advisory_lock` never waits: it reports `false` when another holder
///   has the key
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a service's circuit row, if one was ever written.
    async fn load_circuit(&self, service: &str) -> Result<Option<CircuitRecord>, StoreError>;

    /// Insert or overwrite a service's circuit row.
    async fn upsert_circuit(&self, record: &CircuitRecord) -> Result<(), StoreError>;

    /// Append one quota ledger row.
    async fn append_usage(&self, record: &QuotaUsageRecord) -> Result<(), StoreError>;

    /// Append one metric row.
    async fn append_metric(&self, record: &ApiMetricRecord) -> Result<(), StoreError>;

    /// Sum of `units_used` over successful rows for `date`.
    async fn sum_successful_usage(&self, date: NaiveDate) -> Result<u64, StoreError>;

    /// Metric rows matching `query`, newest first.
    async fn query_metrics(&self, query: &MetricsQuery) -> Result<Vec<ApiMetricRecord>, StoreError>;

    /// Try to take the advisory lock `key` without waiting.
    async fn try_advisory_lock(&self, key: i64) -> Result<bool, StoreError>;

    /// Release an advisory lock taken with [`StateStore::try_advisory_lock`].
    async fn advisory_unlock(&self, key: i64) -> Result<(), StoreError>;
}
