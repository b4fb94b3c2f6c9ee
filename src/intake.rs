// src/intake.rs
// Submission intake: validate, price the privacy premium, persist as pending.
// Nothing is persisted for a rejected submission.

use crate::config::Config;
use crate::error::{PoolError, PoolResult};
use crate::fees;
use crate::storage::{PoolTransaction, Storage, TxStatus};
use chrono::Utc;
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;
use uuid::Uuid;

/// Body of POST /tx/submit. The amount travels as a string so it stays an
/// exact decimal end to end.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub agent_id: String,
    pub target_url: String,
    pub payload: JsonValue,
    pub amount: String,
}

/// What the submitter gets back: the id to poll, the premium charged, and the
/// worst-case wait until the next batch cycle picks the transaction up.
#[derive(Debug, Serialize)]
pub struct SubmitReceipt {
    pub transaction_id: Uuid,
    pub privacy_fee: Decimal,
    pub total_cost: Decimal,
    pub status: TxStatus,
    pub estimated_delay_secs: u64,
}

/// Check a submission and return the parsed amount.
pub fn validate(req: &SubmitRequest) -> PoolResult<Decimal> {
    if req.agent_id.trim().is_empty() {
        return Err(PoolError::Validation("agent_id is required".into()));
    }

    let url = Url::parse(req.target_url.trim())
        .map_err(|_| PoolError::Validation("target_url must be an absolute http(s) URL".into()))?;
    if !matches!(url.scheme(), "http" | "https") || !url.has_host() {
        return Err(PoolError::Validation(
            "target_url must be an absolute http(s) URL".into(),
        ));
    }

    let amount = req
        .amount
        .trim()
        .parse::<Decimal>()
        .map_err(|_| PoolError::Validation("amount must be a decimal number".into()))?;
    if amount.is_sign_negative() {
        return Err(PoolError::Validation("amount must be non-negative".into()));
    }

    Ok(amount)
}

/// Accept a submission into the pool and return the receipt.
pub async fn submit(
    storage: &dyn Storage,
    config: &Config,
    req: SubmitRequest,
) -> PoolResult<SubmitReceipt> {
    let amount = validate(&req)?;
    let fee = fees::privacy_fee(amount, config.premium_percent);

    let tx = PoolTransaction {
        id: Uuid::new_v4(),
        agent_id: req.agent_id.trim().to_string(),
        target_url: req.target_url.trim().to_string(),
        payload: req.payload,
        amount,
        privacy_fee: fee,
        status: TxStatus::Pending,
        batch_id: None,
        created_at: Utc::now(),
        executed_at: None,
    };

    storage.insert_transaction(&tx).await?;

    info!(
        "✅ Pooled tx {} from agent {} (amount {}, fee {})",
        tx.id, tx.agent_id, tx.amount, tx.privacy_fee
    );

    Ok(SubmitReceipt {
        transaction_id: tx.id,
        privacy_fee: fee,
        total_cost: fees::total_cost(amount, fee),
        status: TxStatus::Pending,
        estimated_delay_secs: config.batch_window_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn mk_req(agent: &str, url: &str, amount: &str) -> SubmitRequest {
        SubmitRequest {
            agent_id: agent.to_string(),
            target_url: url.to_string(),
            payload: json!({"action": "swap"}),
            amount: amount.to_string(),
        }
    }

    #[tokio::test]
    async fn accepted_submission_is_persisted_pending() {
        let storage = MemoryStorage::new();
        let config = Config::default();
        let receipt = submit(
            &storage,
            &config,
            mk_req("agent-9", "http://executor.local/run", "10.00"),
        )
        .await
        .unwrap();

        assert_eq!(receipt.privacy_fee, dec!(0.50));
        assert_eq!(receipt.total_cost, dec!(10.50));
        assert_eq!(receipt.status, TxStatus::Pending);
        assert_eq!(receipt.estimated_delay_secs, 30);

        let stored = storage
            .get_transaction(receipt.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TxStatus::Pending);
        assert_eq!(stored.amount, dec!(10.00));
        assert_eq!(stored.payload["action"], "swap");
        assert!(stored.batch_id.is_none());
    }

    #[tokio::test]
    async fn blank_agent_rejected_nothing_persisted() {
        let storage = MemoryStorage::new();
        let config = Config::default();
        let err = submit(
            &storage,
            &config,
            mk_req("   ", "http://executor.local/run", "1.00"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::Validation(_)));
        assert_eq!(storage.pending_count().await.unwrap(), 0);
    }

    #[test]
    fn url_must_be_absolute_http() {
        for bad in ["executor.local/run", "ftp://executor.local", "", "http://"] {
            let err = validate(&mk_req("a", bad, "1")).unwrap_err();
            assert!(matches!(err, PoolError::Validation(_)), "url: {:?}", bad);
        }
        assert!(validate(&mk_req("a", "https://executor.local/run", "1")).is_ok());
    }

    #[test]
    fn amount_must_be_a_non_negative_decimal() {
        for bad in ["", "abc", "1.0.0", "-5.00"] {
            let err = validate(&mk_req("a", "http://x.local/", bad)).unwrap_err();
            assert!(matches!(err, PoolError::Validation(_)), "amount: {:?}", bad);
        }
        assert_eq!(
            validate(&mk_req("a", "http://x.local/", " 12.345 ")).unwrap(),
            dec!(12.345)
        );
        assert_eq!(validate(&mk_req("a", "http://x.local/", "0")).unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn custom_premium_is_applied() {
        let storage = MemoryStorage::new();
        let config = Config {
            premium_percent: 10,
            ..Config::default()
        };
        let receipt = submit(
            &storage,
            &config,
            mk_req("agent", "http://executor.local/run", "25.00"),
        )
        .await
        .unwrap();
        assert_eq!(receipt.privacy_fee, dec!(2.50));
        assert_eq!(receipt.total_cost, dec!(27.50));
    }
}
