// src/storage/sqlite.rs
// Durable backend: single bundled-SQLite connection behind a mutex, WAL mode,
// fresh schema created on open.

use crate::error::{PoolError, PoolResult};
use crate::stats;
use crate::storage::{
    encode_ts, BatchStatus, DailyStats, ExecutionBatch, PoolTransaction, Storage,
    TransactionResult, TxStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pool_transactions (
    id          TEXT PRIMARY KEY,
    agent_id    TEXT NOT NULL,
    target_url  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    amount      TEXT NOT NULL,
    privacy_fee TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending',
    batch_id    TEXT,
    created_at  TEXT NOT NULL,
    executed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_pool_tx_status_created
    ON pool_transactions(status, created_at);
CREATE INDEX IF NOT EXISTS idx_pool_tx_batch ON pool_transactions(batch_id);

CREATE TABLE IF NOT EXISTS execution_batches (
    id           TEXT PRIMARY KEY,
    tx_count     INTEGER NOT NULL,
    total_value  TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'executing',
    created_at   TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_batches_status ON execution_batches(status);

CREATE TABLE IF NOT EXISTS transaction_results (
    tx_id       TEXT PRIMARY KEY,
    batch_id    TEXT NOT NULL,
    success     INTEGER NOT NULL,
    response    TEXT,
    error       TEXT,
    executed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_batch ON transaction_results(batch_id);

CREATE TABLE IF NOT EXISTS daily_stats (
    date                  TEXT PRIMARY KEY,
    total_transactions    INTEGER NOT NULL DEFAULT 0,
    total_volume          TEXT NOT NULL DEFAULT '0',
    total_fees            TEXT NOT NULL DEFAULT '0',
    avg_batch_size        REAL NOT NULL DEFAULT 0,
    mev_attacks_prevented INTEGER NOT NULL DEFAULT 0
);
"#;

const TX_COLS: &str =
    "id, agent_id, target_url, payload, amount, privacy_fee, status, batch_id, created_at, executed_at";

const BATCH_COLS: &str = "id, tx_count, total_value, status, created_at, completed_at";

const RESULT_COLS: &str = "tx_id, batch_id, success, response, error, executed_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &str) -> PoolResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PoolError::Persistence(format!(
                        "failed to create data directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(5_000))?;
        conn.execute_batch(SCHEMA)?;

        info!("SQLite storage ready at {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("⚠️  SQLite connection mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn bad_enum_err(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown enum value '{}'", value).into(),
    )
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn tx_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PoolTransaction> {
    let id: String = row.get(0)?;
    let payload: String = row.get(3)?;
    let amount: String = row.get(4)?;
    let privacy_fee: String = row.get(5)?;
    let status: String = row.get(6)?;
    let batch_id: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let executed_at: Option<String> = row.get(9)?;

    Ok(PoolTransaction {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        agent_id: row.get(1)?,
        target_url: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(3, e))?,
        amount: amount.parse::<Decimal>().map_err(|e| conversion_err(4, e))?,
        privacy_fee: privacy_fee
            .parse::<Decimal>()
            .map_err(|e| conversion_err(5, e))?,
        status: TxStatus::parse(&status).ok_or_else(|| bad_enum_err(6, &status))?,
        batch_id: batch_id
            .map(|b| Uuid::parse_str(&b).map_err(|e| conversion_err(7, e)))
            .transpose()?,
        created_at: parse_ts(8, &created_at)?,
        executed_at: executed_at.map(|ts| parse_ts(9, &ts)).transpose()?,
    })
}

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionBatch> {
    let id: String = row.get(0)?;
    let total_value: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let completed_at: Option<String> = row.get(5)?;

    Ok(ExecutionBatch {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        tx_count: row.get(1)?,
        total_value: total_value
            .parse::<Decimal>()
            .map_err(|e| conversion_err(2, e))?,
        status: BatchStatus::parse(&status).ok_or_else(|| bad_enum_err(3, &status))?,
        created_at: parse_ts(4, &created_at)?,
        completed_at: completed_at.map(|ts| parse_ts(5, &ts)).transpose()?,
    })
}

fn result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionResult> {
    let tx_id: String = row.get(0)?;
    let batch_id: String = row.get(1)?;
    let success: i64 = row.get(2)?;
    let response: Option<String> = row.get(3)?;
    let executed_at: String = row.get(5)?;

    Ok(TransactionResult {
        tx_id: Uuid::parse_str(&tx_id).map_err(|e| conversion_err(0, e))?,
        batch_id: Uuid::parse_str(&batch_id).map_err(|e| conversion_err(1, e))?,
        success: success != 0,
        response: response
            .map(|r| serde_json::from_str(&r).map_err(|e| conversion_err(3, e)))
            .transpose()?,
        error: row.get(4)?,
        executed_at: parse_ts(5, &executed_at)?,
    })
}

fn stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyStats> {
    let total_volume: String = row.get(2)?;
    let total_fees: String = row.get(3)?;

    Ok(DailyStats {
        date: row.get(0)?,
        total_transactions: row.get(1)?,
        total_volume: total_volume
            .parse::<Decimal>()
            .map_err(|e| conversion_err(2, e))?,
        total_fees: total_fees
            .parse::<Decimal>()
            .map_err(|e| conversion_err(3, e))?,
        avg_batch_size: row.get(4)?,
        mev_attacks_prevented: row.get(5)?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_transaction(&self, tx: &PoolTransaction) -> PoolResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pool_transactions
                 (id, agent_id, target_url, payload, amount, privacy_fee, status, batch_id, created_at, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tx.id.to_string(),
                tx.agent_id,
                tx.target_url,
                serde_json::to_string(&tx.payload)?,
                tx.amount.to_string(),
                tx.privacy_fee.to_string(),
                tx.status.as_str(),
                tx.batch_id.map(|b| b.to_string()),
                encode_ts(tx.created_at),
                tx.executed_at.map(encode_ts),
            ],
        )?;
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> PoolResult<Option<PoolTransaction>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM pool_transactions WHERE id = ?1", TX_COLS);
        let tx = conn
            .query_row(&sql, params![id.to_string()], tx_from_row)
            .optional()?;
        Ok(tx)
    }

    async fn pending_count(&self) -> PoolResult<i64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pool_transactions WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    async fn form_batch(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> PoolResult<Option<(ExecutionBatch, Vec<PoolTransaction>)>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<PoolTransaction> = {
            let sql = format!(
                "SELECT {} FROM pool_transactions
                 WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1",
                TX_COLS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], tx_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            // Conditional move: a racing claimer can never win the same row.
            let n = tx.execute(
                "UPDATE pool_transactions
                 SET status = 'selected', batch_id = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![batch_id.to_string(), candidate.id.to_string()],
            )?;
            if n == 1 {
                candidate.status = TxStatus::Selected;
                candidate.batch_id = Some(batch_id);
                claimed.push(candidate);
            }
        }

        if claimed.is_empty() {
            tx.commit()?;
            return Ok(None);
        }

        let total_value: Decimal = claimed.iter().map(|t| t.amount).sum();
        let batch = ExecutionBatch {
            id: batch_id,
            tx_count: claimed.len() as i64,
            total_value,
            status: BatchStatus::Executing,
            created_at: Utc::now(),
            completed_at: None,
        };
        tx.execute(
            "INSERT INTO execution_batches
                 (id, tx_count, total_value, status, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                batch.id.to_string(),
                batch.tx_count,
                batch.total_value.to_string(),
                batch.status.as_str(),
                encode_ts(batch.created_at),
            ],
        )?;

        tx.commit()?;
        Ok(Some((batch, claimed)))
    }

    async fn get_batch(&self, id: Uuid) -> PoolResult<Option<ExecutionBatch>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM execution_batches WHERE id = ?1", BATCH_COLS);
        let batch = conn
            .query_row(&sql, params![id.to_string()], batch_from_row)
            .optional()?;
        Ok(batch)
    }

    async fn open_batches(&self) -> PoolResult<Vec<ExecutionBatch>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM execution_batches WHERE status = 'executing' ORDER BY created_at ASC",
            BATCH_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], batch_from_row)?;
        let batches = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    async fn complete_batch(&self, id: Uuid, completed_at: DateTime<Utc>) -> PoolResult<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE execution_batches
             SET status = 'completed', completed_at = ?1
             WHERE id = ?2 AND status = 'executing'",
            params![encode_ts(completed_at), id.to_string()],
        )?;
        Ok(n == 1)
    }

    async fn mark_executed(&self, tx_id: Uuid, executed_at: DateTime<Utc>) -> PoolResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE pool_transactions
             SET status = 'executed', executed_at = ?1
             WHERE id = ?2 AND status = 'selected'",
            params![encode_ts(executed_at), tx_id.to_string()],
        )?;
        Ok(())
    }

    async fn mark_failed(&self, tx_id: Uuid, executed_at: DateTime<Utc>) -> PoolResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE pool_transactions
             SET status = 'failed', executed_at = ?1
             WHERE id = ?2 AND status = 'selected'",
            params![encode_ts(executed_at), tx_id.to_string()],
        )?;
        Ok(())
    }

    async fn insert_result(&self, result: &TransactionResult) -> PoolResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO transaction_results
                 (tx_id, batch_id, success, response, error, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.tx_id.to_string(),
                result.batch_id.to_string(),
                result.success as i64,
                result
                    .response
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                result.error,
                encode_ts(result.executed_at),
            ],
        )?;
        Ok(())
    }

    async fn get_result(&self, tx_id: Uuid) -> PoolResult<Option<TransactionResult>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM transaction_results WHERE tx_id = ?1",
            RESULT_COLS
        );
        let result = conn
            .query_row(&sql, params![tx_id.to_string()], result_from_row)
            .optional()?;
        Ok(result)
    }

    async fn results_for_batch(&self, batch_id: Uuid) -> PoolResult<Vec<TransactionResult>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM transaction_results WHERE batch_id = ?1 ORDER BY executed_at ASC",
            RESULT_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![batch_id.to_string()], result_from_row)?;
        let results = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    async fn transactions_for_batch(&self, batch_id: Uuid) -> PoolResult<Vec<PoolTransaction>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM pool_transactions WHERE batch_id = ?1 ORDER BY created_at ASC, id ASC",
            TX_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![batch_id.to_string()], tx_from_row)?;
        let txs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(txs)
    }

    async fn get_daily_stats(&self, date: &str) -> PoolResult<Option<DailyStats>> {
        let conn = self.conn();
        let stats = conn
            .query_row(
                "SELECT date, total_transactions, total_volume, total_fees, avg_batch_size, mev_attacks_prevented
                 FROM daily_stats WHERE date = ?1",
                params![date],
                stats_from_row,
            )
            .optional()?;
        Ok(stats)
    }

    async fn fold_daily_stats(
        &self,
        date: &str,
        batch_size: i64,
        volume: Decimal,
        fees: Decimal,
    ) -> PoolResult<DailyStats> {
        // One critical section for the read-modify-write, so two batches
        // completing close together cannot lose each other's fold.
        let conn = self.conn();
        let old = conn
            .query_row(
                "SELECT date, total_transactions, total_volume, total_fees, avg_batch_size, mev_attacks_prevented
                 FROM daily_stats WHERE date = ?1",
                params![date],
                stats_from_row,
            )
            .optional()?
            .unwrap_or_else(|| DailyStats::zeroed(date));

        let updated = stats::fold(&old, batch_size, volume, fees);

        conn.execute(
            "INSERT OR REPLACE INTO daily_stats
                 (date, total_transactions, total_volume, total_fees, avg_batch_size, mev_attacks_prevented)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                updated.date,
                updated.total_transactions,
                updated.total_volume.to_string(),
                updated.total_fees.to_string(),
                updated.avg_batch_size,
                updated.mev_attacks_prevented,
            ],
        )?;

        Ok(updated)
    }
}
