// src/dispatch.rs
// Outbound leg: one POST per pooled transaction to its target, bounded by the
// configured timeout. Outcomes are captured, never retried.

use crate::storage::PoolTransaction;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// What came back from a target.
///
/// Any decoded HTTP response counts as `Responded`, with `success` tracking
/// the status class; the target saying "no" is still an executed dispatch.
/// `Errored` is reserved for not getting a usable response at all: connect
/// failures, timeouts, bodies that are not JSON.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Responded { success: bool, body: JsonValue },
    Errored(String),
}

pub struct Dispatcher {
    client: Client,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// POST the transaction payload to its target URL.
    pub async fn dispatch(&self, tx: &PoolTransaction) -> DispatchOutcome {
        let sent = self
            .client
            .post(&tx.target_url)
            .timeout(self.timeout)
            .json(&tx.payload)
            .send()
            .await;

        match sent {
            Ok(resp) => {
                let status = resp.status();
                match resp.json::<JsonValue>().await {
                    Ok(body) => DispatchOutcome::Responded {
                        success: status.is_success(),
                        body,
                    },
                    Err(e) => DispatchOutcome::Errored(format!(
                        "response ({}) was not valid JSON: {}",
                        status, e
                    )),
                }
            }
            Err(e) if e.is_timeout() => DispatchOutcome::Errored(format!(
                "request timed out after {}s",
                self.timeout.as_secs()
            )),
            Err(e) => DispatchOutcome::Errored(format!("request failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TxStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    fn tx_to(url: &str) -> PoolTransaction {
        PoolTransaction {
            id: Uuid::new_v4(),
            agent_id: "agent".into(),
            target_url: url.to_string(),
            payload: json!({"ping": 1}),
            amount: dec!(1.00),
            privacy_fee: dec!(0.05),
            status: TxStatus::Selected,
            batch_id: Some(Uuid::new_v4()),
            created_at: Utc::now(),
            executed_at: None,
        }
    }

    #[tokio::test]
    async fn unreachable_target_errors_with_detail() {
        // Port 1 refuses connections on loopback.
        let dispatcher = Dispatcher::new(5);
        match dispatcher.dispatch(&tx_to("http://127.0.0.1:1/run")).await {
            DispatchOutcome::Errored(detail) => {
                assert!(detail.contains("request failed"), "detail: {}", detail)
            }
            other => panic!("expected Errored, got {:?}", other),
        }
    }
}
