// src/storage/memory.rs
// Volatile backend: plain maps behind one mutex. Same claim and fold
// semantics as the sqlite backend, for tests and ephemeral runs.

use crate::error::{PoolError, PoolResult};
use crate::stats;
use crate::storage::{
    BatchStatus, DailyStats, ExecutionBatch, PoolTransaction, Storage, TransactionResult, TxStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    transactions: HashMap<Uuid, PoolTransaction>,
    batches: HashMap<Uuid, ExecutionBatch>,
    results: HashMap<Uuid, TransactionResult>,
    stats: HashMap<String, DailyStats>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("⚠️  Memory storage mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_transaction(&self, tx: &PoolTransaction) -> PoolResult<()> {
        let mut inner = self.inner();
        if inner.transactions.contains_key(&tx.id) {
            return Err(PoolError::Persistence(format!(
                "duplicate transaction id {}",
                tx.id
            )));
        }
        inner.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> PoolResult<Option<PoolTransaction>> {
        Ok(self.inner().transactions.get(&id).cloned())
    }

    async fn pending_count(&self) -> PoolResult<i64> {
        let inner = self.inner();
        Ok(inner
            .transactions
            .values()
            .filter(|t| t.status == TxStatus::Pending)
            .count() as i64)
    }

    async fn form_batch(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> PoolResult<Option<(ExecutionBatch, Vec<PoolTransaction>)>> {
        let mut inner = self.inner();

        let mut pending_ids: Vec<(DateTime<Utc>, Uuid)> = inner
            .transactions
            .values()
            .filter(|t| t.status == TxStatus::Pending)
            .map(|t| (t.created_at, t.id))
            .collect();
        pending_ids.sort();
        pending_ids.truncate(limit);

        let mut claimed = Vec::with_capacity(pending_ids.len());
        for (_, id) in pending_ids {
            if let Some(tx) = inner.transactions.get_mut(&id) {
                if tx.status == TxStatus::Pending {
                    tx.status = TxStatus::Selected;
                    tx.batch_id = Some(batch_id);
                    claimed.push(tx.clone());
                }
            }
        }

        if claimed.is_empty() {
            return Ok(None);
        }

        let batch = ExecutionBatch {
            id: batch_id,
            tx_count: claimed.len() as i64,
            total_value: claimed.iter().map(|t| t.amount).sum(),
            status: BatchStatus::Executing,
            created_at: Utc::now(),
            completed_at: None,
        };
        inner.batches.insert(batch_id, batch.clone());
        Ok(Some((batch, claimed)))
    }

    async fn get_batch(&self, id: Uuid) -> PoolResult<Option<ExecutionBatch>> {
        Ok(self.inner().batches.get(&id).cloned())
    }

    async fn open_batches(&self) -> PoolResult<Vec<ExecutionBatch>> {
        let inner = self.inner();
        let mut open: Vec<ExecutionBatch> = inner
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Executing)
            .cloned()
            .collect();
        open.sort_by_key(|b| b.created_at);
        Ok(open)
    }

    async fn complete_batch(&self, id: Uuid, completed_at: DateTime<Utc>) -> PoolResult<bool> {
        let mut inner = self.inner();
        if let Some(batch) = inner.batches.get_mut(&id) {
            if batch.status == BatchStatus::Executing {
                batch.status = BatchStatus::Completed;
                batch.completed_at = Some(completed_at);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_executed(&self, tx_id: Uuid, executed_at: DateTime<Utc>) -> PoolResult<()> {
        let mut inner = self.inner();
        if let Some(tx) = inner.transactions.get_mut(&tx_id) {
            if tx.status == TxStatus::Selected {
                tx.status = TxStatus::Executed;
                tx.executed_at = Some(executed_at);
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, tx_id: Uuid, executed_at: DateTime<Utc>) -> PoolResult<()> {
        let mut inner = self.inner();
        if let Some(tx) = inner.transactions.get_mut(&tx_id) {
            if tx.status == TxStatus::Selected {
                tx.status = TxStatus::Failed;
                tx.executed_at = Some(executed_at);
            }
        }
        Ok(())
    }

    async fn insert_result(&self, result: &TransactionResult) -> PoolResult<()> {
        let mut inner = self.inner();
        if inner.results.contains_key(&result.tx_id) {
            return Err(PoolError::Persistence(format!(
                "result already recorded for transaction {}",
                result.tx_id
            )));
        }
        inner.results.insert(result.tx_id, result.clone());
        Ok(())
    }

    async fn get_result(&self, tx_id: Uuid) -> PoolResult<Option<TransactionResult>> {
        Ok(self.inner().results.get(&tx_id).cloned())
    }

    async fn results_for_batch(&self, batch_id: Uuid) -> PoolResult<Vec<TransactionResult>> {
        let inner = self.inner();
        let mut results: Vec<TransactionResult> = inner
            .results
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.executed_at);
        Ok(results)
    }

    async fn transactions_for_batch(&self, batch_id: Uuid) -> PoolResult<Vec<PoolTransaction>> {
        let inner = self.inner();
        let mut txs: Vec<PoolTransaction> = inner
            .transactions
            .values()
            .filter(|t| t.batch_id == Some(batch_id))
            .cloned()
            .collect();
        txs.sort_by_key(|t| (t.created_at, t.id));
        Ok(txs)
    }

    async fn get_daily_stats(&self, date: &str) -> PoolResult<Option<DailyStats>> {
        Ok(self.inner().stats.get(date).cloned())
    }

    async fn fold_daily_stats(
        &self,
        date: &str,
        batch_size: i64,
        volume: Decimal,
        fees: Decimal,
    ) -> PoolResult<DailyStats> {
        let mut inner = self.inner();
        let old = inner
            .stats
            .get(date)
            .cloned()
            .unwrap_or_else(|| DailyStats::zeroed(date));
        let updated = stats::fold(&old, batch_size, volume, fees);
        inner.stats.insert(date.to_string(), updated.clone());
        Ok(updated)
    }
}
