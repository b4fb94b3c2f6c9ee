// src/reconcile.rs
// Repairs batches a crash (or operator kill) left open, so the pool's
// invariants hold again without manual surgery.

use crate::error::PoolResult;
use crate::stats;
use crate::storage::{ExecutionBatch, PoolTransaction, Storage, TransactionResult, TxStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// What one pass changed. Returned for logging and tests.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub batches_completed: usize,
    pub results_synthesized: usize,
    pub statuses_repaired: usize,
}

pub struct Reconciler {
    storage: Arc<dyn Storage>,
    stale_after: ChronoDuration,
}

impl Reconciler {
    pub fn new(storage: Arc<dyn Storage>, stale_secs: u64) -> Self {
        Self {
            storage,
            stale_after: ChronoDuration::seconds(stale_secs as i64),
        }
    }

    /// One repair pass over batches stuck in `executing`.
    ///
    /// For each open batch:
    /// 1. Members with a recorded result but still `selected` get their final
    ///    status applied from the result (the flip was lost mid-crash)
    /// 2. If every member has a result, the batch is completed and folded
    ///    into the rollup - only the completion flip was lost
    /// 3. If the batch is older than the stale threshold, members that never
    ///    got dispatched receive a synthetic failure result and are failed,
    ///    then the batch is completed as in step 2
    /// 4. Younger batches with missing results are left alone - their cycle
    ///    may still be running
    ///
    /// Idempotent: a repaired batch is no longer `executing`, so a second
    /// pass skips it.
    pub async fn run_pass(&self) -> PoolResult<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let open = self.storage.open_batches().await?;
        if open.is_empty() {
            return Ok(summary);
        }

        let now = Utc::now();
        for batch in open {
            let members = self.storage.transactions_for_batch(batch.id).await?;
            let results = self.storage.results_for_batch(batch.id).await?;
            let by_tx: HashMap<_, _> = results.iter().map(|r| (r.tx_id, r)).collect();

            for member in &members {
                if member.status == TxStatus::Selected {
                    if let Some(result) = by_tx.get(&member.id) {
                        if result.success {
                            self.storage
                                .mark_executed(member.id, result.executed_at)
                                .await?;
                        } else {
                            self.storage
                                .mark_failed(member.id, result.executed_at)
                                .await?;
                        }
                        info!("🔧 Repaired status of tx {} from its recorded result", member.id);
                        summary.statuses_repaired += 1;
                    }
                }
            }

            let missing: Vec<&PoolTransaction> = members
                .iter()
                .filter(|m| !by_tx.contains_key(&m.id))
                .collect();

            if missing.is_empty() {
                if self.finish_batch(&batch, &members, now).await? {
                    summary.batches_completed += 1;
                }
                continue;
            }

            if now - batch.created_at >= self.stale_after {
                warn!(
                    "⚠️  Batch {} is stale with {} undispatched member(s) - failing them",
                    batch.id,
                    missing.len()
                );
                for member in &missing {
                    let result = TransactionResult {
                        tx_id: member.id,
                        batch_id: batch.id,
                        success: false,
                        response: None,
                        error: Some("interrupted before dispatch".into()),
                        executed_at: now,
                    };
                    self.storage.insert_result(&result).await?;
                    self.storage.mark_failed(member.id, now).await?;
                    summary.results_synthesized += 1;
                }
                if self.finish_batch(&batch, &members, now).await? {
                    summary.batches_completed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Complete the batch and fold its rollup, but only when this pass wins
    /// the completion flip - a cycle finishing concurrently must not see the
    /// batch folded twice. Returns whether the flip happened here.
    async fn finish_batch(
        &self,
        batch: &ExecutionBatch,
        members: &[PoolTransaction],
        now: DateTime<Utc>,
    ) -> PoolResult<bool> {
        if !self.storage.complete_batch(batch.id, now).await? {
            return Ok(false);
        }
        info!("✅ Reconciled batch {} to completed", batch.id);

        let fees_total: Decimal = members.iter().map(|t| t.privacy_fee).sum();
        if let Err(e) = self
            .storage
            .fold_daily_stats(
                &stats::day_key(now),
                batch.tx_count,
                batch.total_value,
                fees_total,
            )
            .await
        {
            error!("stats rollup failed for reconciled batch {}: {}", batch.id, e);
        }
        Ok(true)
    }
}

/// Periodic reconciliation until shutdown.
pub async fn run_reconcile_loop(
    reconciler: Arc<Reconciler>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let every = Duration::from_secs(interval_secs);
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("🔎 Reconciler started ({}s interval)", interval_secs);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reconciler.run_pass().await {
                    Ok(summary) => {
                        if summary.batches_completed > 0 || summary.statuses_repaired > 0 {
                            info!(
                                "Reconcile pass: {} batch(es) completed, {} result(s) synthesized, {} status(es) repaired",
                                summary.batches_completed,
                                summary.results_synthesized,
                                summary.statuses_repaired
                            );
                        }
                    }
                    Err(e) => error!("reconcile pass failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                info!("Reconciler stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BatchStatus, MemoryStorage};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    fn mk_tx(amount: Decimal) -> PoolTransaction {
        PoolTransaction {
            id: Uuid::new_v4(),
            agent_id: "agent".into(),
            target_url: "http://127.0.0.1:9/run".into(),
            payload: json!({}),
            amount,
            privacy_fee: crate::fees::privacy_fee(amount, 5),
            status: TxStatus::Pending,
            batch_id: None,
            created_at: Utc::now(),
            executed_at: None,
        }
    }

    async fn stuck_batch(
        storage: &MemoryStorage,
        amounts: &[Decimal],
    ) -> (ExecutionBatch, Vec<PoolTransaction>) {
        for amount in amounts {
            storage.insert_transaction(&mk_tx(*amount)).await.unwrap();
        }
        // form_batch leaves members selected with no results: exactly the
        // state a crash mid-cycle leaves behind.
        storage
            .form_batch(Uuid::new_v4(), amounts.len())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn nothing_open_nothing_done() {
        let storage = Arc::new(MemoryStorage::new());
        let reconciler = Reconciler::new(storage, 0);
        let summary = reconciler.run_pass().await.unwrap();
        assert_eq!(summary.batches_completed, 0);
        assert_eq!(summary.results_synthesized, 0);
    }

    #[tokio::test]
    async fn lost_completion_flip_is_repaired() {
        let storage = Arc::new(MemoryStorage::new());
        let (batch, members) = stuck_batch(&storage, &[dec!(10.00), dec!(20.00)]).await;

        // Results landed but the process died before status flips/completion.
        for member in &members {
            storage
                .insert_result(&TransactionResult {
                    tx_id: member.id,
                    batch_id: batch.id,
                    success: true,
                    response: Some(json!({"ok": true})),
                    error: None,
                    executed_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let reconciler = Reconciler::new(storage.clone(), 3600);
        let summary = reconciler.run_pass().await.unwrap();
        assert_eq!(summary.statuses_repaired, 2);
        assert_eq!(summary.batches_completed, 1);
        assert_eq!(summary.results_synthesized, 0);

        let got = storage.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(got.status, BatchStatus::Completed);
        for member in &members {
            let tx = storage.get_transaction(member.id).await.unwrap().unwrap();
            assert_eq!(tx.status, TxStatus::Executed);
        }

        let day = stats::day_key(Utc::now());
        let stats = storage.get_daily_stats(&day).await.unwrap().unwrap();
        assert_eq!(stats.total_transactions, 2);
        assert_eq!(stats.total_volume, dec!(30.00));
    }

    #[tokio::test]
    async fn stale_batch_gets_synthetic_failures() {
        let storage = Arc::new(MemoryStorage::new());
        let (batch, members) = stuck_batch(&storage, &[dec!(5.00)]).await;

        // stale_after of zero makes the batch immediately eligible.
        let reconciler = Reconciler::new(storage.clone(), 0);
        let summary = reconciler.run_pass().await.unwrap();
        assert_eq!(summary.results_synthesized, 1);
        assert_eq!(summary.batches_completed, 1);

        let tx = storage
            .get_transaction(members[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TxStatus::Failed);
        let result = storage.get_result(members[0].id).await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("interrupted before dispatch"));

        let got = storage.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(got.status, BatchStatus::Completed);

        // Second pass finds nothing open.
        let second = reconciler.run_pass().await.unwrap();
        assert_eq!(second.batches_completed, 0);
    }

    #[tokio::test]
    async fn young_incomplete_batch_is_left_alone() {
        let storage = Arc::new(MemoryStorage::new());
        let (batch, members) = stuck_batch(&storage, &[dec!(1.00), dec!(2.00)]).await;

        let reconciler = Reconciler::new(storage.clone(), 3600);
        let summary = reconciler.run_pass().await.unwrap();
        assert_eq!(summary.batches_completed, 0);
        assert_eq!(summary.results_synthesized, 0);

        let got = storage.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(got.status, BatchStatus::Executing);
        for member in &members {
            assert!(storage.get_result(member.id).await.unwrap().is_none());
        }
    }
}
