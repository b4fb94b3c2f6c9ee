// src/storage/mod.rs
// Storage abstraction for the pool: domain models plus an async trait with
// sqlite (durable, default) and in-memory backends.

pub mod memory;
pub mod sqlite;

use crate::error::PoolResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Lifecycle of a pooled transaction.
///
/// One-way: `pending -> selected -> executed | failed`. A transaction leaves
/// `pending` exactly once, via the claim a batch cycle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Selected,
    Executed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Selected => "selected",
            TxStatus::Executed => "executed",
            TxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TxStatus::Pending),
            "selected" => Some(TxStatus::Selected),
            "executed" => Some(TxStatus::Executed),
            "failed" => Some(TxStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch lifecycle: created `executing`, flipped once to `completed` after
/// every member has a result row. There is no failed batch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Executing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Executing => "executing",
            BatchStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executing" => Some(BatchStatus::Executing),
            "completed" => Some(BatchStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission held in the pool. Amounts are exact decimals; the payload is
/// opaque and forwarded untouched at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTransaction {
    pub id: Uuid,
    pub agent_id: String,
    pub target_url: String,
    pub payload: JsonValue,
    pub amount: Decimal,
    pub privacy_fee: Decimal,
    pub status: TxStatus,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

/// A FIFO grouping of claimed transactions. Count and total value are
/// snapshots taken at claim time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub id: Uuid,
    pub tx_count: i64,
    pub total_value: Decimal,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of one dispatch. Exactly one row per transaction that left the
/// pending queue; `response` when an HTTP response was decoded, `error` when
/// the call failed outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    pub tx_id: Uuid,
    pub batch_id: Uuid,
    pub success: bool,
    pub response: Option<JsonValue>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Per-calendar-date rollup (UTC), updated incrementally as batches complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: String,
    pub total_transactions: i64,
    pub total_volume: Decimal,
    pub total_fees: Decimal,
    pub avg_batch_size: f64,
    // Tracked for the dashboard; nothing increments it yet.
    pub mev_attacks_prevented: i64,
}

impl DailyStats {
    /// The all-zero row a date starts from (and the shape /stats reports for
    /// a date with no activity).
    pub fn zeroed(date: &str) -> Self {
        Self {
            date: date.to_string(),
            total_transactions: 0,
            total_volume: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            avg_batch_size: 0.0,
            mev_attacks_prevented: 0,
        }
    }
}

/// Which backend to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Sqlite,
    Memory,
}

impl StorageMode {
    /// Parse a STORAGE_MODE value, defaulting to sqlite on anything unknown.
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sqlite" => StorageMode::Sqlite,
            "memory" | "mem" => StorageMode::Memory,
            other => {
                warn!("Unknown STORAGE_MODE '{}', defaulting to sqlite", other);
                StorageMode::Sqlite
            }
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Sqlite => f.write_str("sqlite"),
            StorageMode::Memory => f.write_str("memory"),
        }
    }
}

/// Persistence boundary for the pool.
///
/// Both backends uphold the same contract: `form_batch` claims atomically and
/// only ever moves `pending` rows, result rows are unique per transaction,
/// and `fold_daily_stats` applies its read-modify-write as one critical
/// section.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_transaction(&self, tx: &PoolTransaction) -> PoolResult<()>;

    async fn get_transaction(&self, id: Uuid) -> PoolResult<Option<PoolTransaction>>;

    /// Number of transactions currently waiting in the pool.
    async fn pending_count(&self) -> PoolResult<i64>;

    /// Form an execution batch from up to `limit` of the oldest pending
    /// transactions, atomically.
    ///
    /// Candidates are taken in `created_at ASC, id ASC` order (deterministic
    /// FIFO). Each is moved `pending -> selected` with `batch_id` stamped,
    /// conditionally on it still being pending, so a racing claimer can never
    /// win the same row. The batch row (`executing`, snapshot count and
    /// decimal-summed value) is written in the same transaction as the
    /// claims. Returns `None` without writing anything when nothing was
    /// claimable.
    async fn form_batch(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> PoolResult<Option<(ExecutionBatch, Vec<PoolTransaction>)>>;

    async fn get_batch(&self, id: Uuid) -> PoolResult<Option<ExecutionBatch>>;

    /// Batches still in `executing` state, oldest first.
    async fn open_batches(&self) -> PoolResult<Vec<ExecutionBatch>>;

    /// Flip a batch to `completed` and stamp `completed_at`. Returns whether
    /// this call performed the flip; completing an already-completed batch is
    /// a no-op returning `false`, so exactly one caller wins the flip and the
    /// rollup folds once per batch.
    async fn complete_batch(&self, id: Uuid, completed_at: DateTime<Utc>) -> PoolResult<bool>;

    /// Mark a selected transaction `executed` and stamp `executed_at`.
    async fn mark_executed(&self, tx_id: Uuid, executed_at: DateTime<Utc>) -> PoolResult<()>;

    /// Mark a selected transaction `failed` and stamp `executed_at`.
    async fn mark_failed(&self, tx_id: Uuid, executed_at: DateTime<Utc>) -> PoolResult<()>;

    async fn insert_result(&self, result: &TransactionResult) -> PoolResult<()>;

    async fn get_result(&self, tx_id: Uuid) -> PoolResult<Option<TransactionResult>>;

    async fn results_for_batch(&self, batch_id: Uuid) -> PoolResult<Vec<TransactionResult>>;

    /// Members of a batch in claim order.
    async fn transactions_for_batch(&self, batch_id: Uuid) -> PoolResult<Vec<PoolTransaction>>;

    async fn get_daily_stats(&self, date: &str) -> PoolResult<Option<DailyStats>>;

    /// Fold one completed batch into `date`'s row (creating it from zero if
    /// absent) and return the row as written. The whole read-compute-write
    /// happens under the backend's lock.
    async fn fold_daily_stats(
        &self,
        date: &str,
        batch_size: i64,
        volume: Decimal,
        fees: Decimal,
    ) -> PoolResult<DailyStats>;
}

/// Open the configured backend.
pub async fn create_storage(mode: StorageMode, sqlite_path: &str) -> PoolResult<Arc<dyn Storage>> {
    match mode {
        StorageMode::Sqlite => {
            let storage = SqliteStorage::open(sqlite_path)?;
            Ok(Arc::new(storage))
        }
        StorageMode::Memory => Ok(Arc::new(MemoryStorage::new())),
    }
}

/// Timestamp format used at rest: fixed-width RFC 3339 with microseconds and
/// a `Z` suffix, so lexicographic order is chronological order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
