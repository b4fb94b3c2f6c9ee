// src/executor.rs
// The batch cycle: form a FIFO batch, dispatch each member independently,
// record outcomes, complete the batch, fold the daily rollup.

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::PoolResult;
use crate::stats;
use crate::storage::{Storage, TransactionResult};
use chrono::Utc;
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

pub struct BatchExecutor {
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    max_batch_size: usize,
}

impl BatchExecutor {
    pub fn new(storage: Arc<dyn Storage>, dispatcher: Dispatcher, max_batch_size: usize) -> Self {
        Self {
            storage,
            dispatcher,
            max_batch_size,
        }
    }

    /// One batch-processing cycle.
    ///
    /// 1. Form a batch from up to `max_batch_size` of the oldest pending
    ///    transactions (atomic claim, see `Storage::form_batch`)
    /// 2. Dispatch members one at a time; each outcome is recorded on its own
    ///    and never affects the others
    /// 3. Complete the batch once every member's outcome is durably recorded.
    ///    If any result or status write failed, the batch stays `executing`
    ///    for the reconciler to repair
    /// 4. Fold the batch into its completion date's rollup, but only when this
    ///    cycle performed the completion flip - a reconciler that raced us and
    ///    won already folded. A rollup failure is logged and never unwinds the
    ///    completed batch
    ///
    /// Returns the batch id, or `None` when the pool had nothing pending.
    pub async fn run_cycle(&self) -> PoolResult<Option<Uuid>> {
        let batch_id = Uuid::new_v4();
        let formed = self
            .storage
            .form_batch(batch_id, self.max_batch_size)
            .await?;
        let (batch, members) = match formed {
            Some(formed) => formed,
            None => {
                debug!("no pending transactions, skipping cycle");
                return Ok(None);
            }
        };

        info!(
            "📦 Batch {} formed: {} tx, total value {}",
            batch_id, batch.tx_count, batch.total_value
        );

        let mut succeeded = 0usize;
        let mut unrecorded = 0usize;
        for tx in &members {
            match self.dispatcher.dispatch(tx).await {
                DispatchOutcome::Responded { success, body } => {
                    let executed_at = Utc::now();
                    let result = TransactionResult {
                        tx_id: tx.id,
                        batch_id,
                        success,
                        response: Some(body),
                        error: None,
                        executed_at,
                    };
                    if let Err(e) = self.storage.insert_result(&result).await {
                        error!("failed to record result for tx {}: {}", tx.id, e);
                        unrecorded += 1;
                        continue;
                    }
                    if let Err(e) = self.storage.mark_executed(tx.id, executed_at).await {
                        error!("failed to mark tx {} executed: {}", tx.id, e);
                        unrecorded += 1;
                        continue;
                    }
                    if success {
                        succeeded += 1;
                        debug!("tx {} executed", tx.id);
                    } else {
                        info!("tx {} executed, target responded non-2xx", tx.id);
                    }
                }
                DispatchOutcome::Errored(detail) => {
                    warn!("⚠️  Dispatch failed for tx {}: {}", tx.id, detail);
                    let executed_at = Utc::now();
                    let result = TransactionResult {
                        tx_id: tx.id,
                        batch_id,
                        success: false,
                        response: None,
                        error: Some(detail),
                        executed_at,
                    };
                    if let Err(e) = self.storage.insert_result(&result).await {
                        error!("failed to record failure for tx {}: {}", tx.id, e);
                        unrecorded += 1;
                        continue;
                    }
                    if let Err(e) = self.storage.mark_failed(tx.id, executed_at).await {
                        error!("failed to mark tx {} failed: {}", tx.id, e);
                        unrecorded += 1;
                    }
                }
            }
        }

        if unrecorded > 0 {
            warn!(
                "⚠️  Batch {} left open: {} member outcome(s) not durably recorded - reconciler will repair",
                batch_id, unrecorded
            );
            return Ok(Some(batch_id));
        }

        let completed_at = Utc::now();
        if !self.storage.complete_batch(batch_id, completed_at).await? {
            info!(
                "Batch {} was already completed (reconciler won the flip), skipping rollup",
                batch_id
            );
            return Ok(Some(batch_id));
        }
        info!(
            "✅ Batch {} completed: {}/{} dispatches succeeded",
            batch_id,
            succeeded,
            members.len()
        );

        let fees_total: Decimal = members.iter().map(|t| t.privacy_fee).sum();
        if let Err(e) = self
            .storage
            .fold_daily_stats(
                &stats::day_key(completed_at),
                batch.tx_count,
                batch.total_value,
                fees_total,
            )
            .await
        {
            error!("stats rollup failed for batch {}: {}", batch_id, e);
        }

        Ok(Some(batch_id))
    }
}

/// Drive batch cycles on a fixed cadence until shutdown.
///
/// The first cycle fires one full window after start; cycles never overlap
/// because the loop awaits each one before taking the next tick.
pub async fn run_batch_loop(
    executor: Arc<BatchExecutor>,
    window_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let window = Duration::from_secs(window_secs);
    let mut ticker = interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("⏱️  Batch runner started ({}s window)", window_secs);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = executor.run_cycle().await {
                    error!("batch cycle failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                info!("Batch runner stopping");
                break;
            }
        }
    }
}
