// src/api.rs
// Axum-based API router for pool submission + status lookups
use crate::config::Config;
use crate::error::PoolError;
use crate::intake::{self, SubmitRequest};
use crate::stats;
use crate::storage::{DailyStats, Storage};

use axum::extract::{ConnectInfo, Extension, Path};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use log::{error, info, warn};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

type ApiResult = Result<Response, ApiError>;

/// Simple token bucket rate limiter.
/// Tracks requests per IP address with a sliding window.
#[derive(Clone)]
struct RateLimiter {
    // Map of IP address -> (request_count, window_start_time)
    buckets: Arc<Mutex<HashMap<String, (u32, Instant)>>>,
    max_requests: u32,
    window_duration: Duration,
}

impl RateLimiter {
    fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window_duration: Duration::from_secs(window_secs),
        }
    }

    /// Check if a request from the given IP should be allowed.
    /// Returns true if allowed, false if rate limit exceeded.
    fn check_rate_limit(&self, ip: &str) -> bool {
        // Handle mutex poisoning gracefully - recover the data even if poisoned
        let mut buckets = self.buckets.lock().unwrap_or_else(|poisoned| {
            warn!("⚠️  Rate limiter mutex poisoned - recovering data");
            poisoned.into_inner()
        });
        let now = Instant::now();

        // Drop stale buckets once the map grows past a full window of clients
        if buckets.len() > 1024 {
            let window = self.window_duration;
            buckets.retain(|_, (_, window_start)| now.duration_since(*window_start) < window * 2);
        }

        let entry = buckets.entry(ip.to_string()).or_insert((0, now));
        let (count, window_start) = entry;

        if now.duration_since(*window_start) > self.window_duration {
            // New window
            *count = 1;
            *window_start = now;
            true
        } else if *count < self.max_requests {
            *count += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error")]
    Internal(PoolError),
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Validation(msg) => ApiError::BadRequest(msg),
            PoolError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(e) => {
                error!("internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        let body_json = json!({ "error": body });
        (status, Json(body_json)).into_response()
    }
}

///////////////////////////////////////////////////////////////////////////
// POST /tx/submit
///////////////////////////////////////////////////////////////////////////
async fn submit_tx(
    Extension(storage): Extension<Arc<dyn Storage>>,
    Extension(config): Extension<Arc<Config>>,
    Json(incoming): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = intake::submit(storage.as_ref(), &config, incoming).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

///////////////////////////////////////////////////////////////////////////
// GET /tx/:id
///////////////////////////////////////////////////////////////////////////
async fn get_tx(
    Path(id): Path<String>,
    Extension(storage): Extension<Arc<dyn Storage>>,
) -> ApiResult {
    // A malformed id looks the same as an unknown one from outside.
    let tx_id = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return Err(ApiError::NotFound("transaction not found".into())),
    };

    let tx = storage
        .get_transaction(tx_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("transaction not found".into()))?;

    let result_json = match storage.get_result(tx_id).await? {
        Some(r) => json!({
            "success": r.success,
            "response": r.response,
            "error": r.error,
            "executed_at": r.executed_at.to_rfc3339(),
        }),
        None => JsonValue::Null,
    };

    Ok((
        StatusCode::OK,
        Json(json!({
            "id": tx.id,
            "agent_id": tx.agent_id,
            "target_url": tx.target_url,
            "payload": tx.payload,
            "amount": tx.amount,
            "privacy_fee": tx.privacy_fee,
            "status": tx.status,
            "batch_id": tx.batch_id,
            "created_at": tx.created_at.to_rfc3339(),
            "executed_at": tx.executed_at.map(|t| t.to_rfc3339()),
            "result": result_json,
        })),
    )
        .into_response())
}

///////////////////////////////////////////////////////////////////////////
// GET /batch/:id
///////////////////////////////////////////////////////////////////////////
async fn get_batch(
    Path(id): Path<String>,
    Extension(storage): Extension<Arc<dyn Storage>>,
) -> ApiResult {
    let batch_id = match Uuid::parse_str(&id) {
        Ok(u) => u,
        Err(_) => return Err(ApiError::NotFound("batch not found".into())),
    };

    let batch = storage
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("batch not found".into()))?;

    let members = storage.transactions_for_batch(batch_id).await?;
    let member_views: Vec<JsonValue> = members
        .iter()
        .map(|tx| {
            json!({
                "id": tx.id,
                "agent_id": tx.agent_id,
                "amount": tx.amount,
                "status": tx.status,
                "created_at": tx.created_at.to_rfc3339(),
                "executed_at": tx.executed_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();

    Ok((
        StatusCode::OK,
        Json(json!({
            "id": batch.id,
            "status": batch.status,
            "tx_count": batch.tx_count,
            "total_value": batch.total_value,
            "created_at": batch.created_at.to_rfc3339(),
            "completed_at": batch.completed_at.map(|t| t.to_rfc3339()),
            "transactions": member_views,
        })),
    )
        .into_response())
}

///////////////////////////////////////////////////////////////////////////
// GET /stats - today's rollup; degrades to zeros rather than erroring
///////////////////////////////////////////////////////////////////////////
async fn get_stats(Extension(storage): Extension<Arc<dyn Storage>>) -> ApiResult {
    let today = stats::day_key(Utc::now());

    let rollup = match storage.get_daily_stats(&today).await {
        Ok(Some(s)) => s,
        Ok(None) => DailyStats::zeroed(&today),
        Err(e) => {
            error!("stats read failed: {}", e);
            DailyStats::zeroed(&today)
        }
    };

    let pending = match storage.pending_count().await {
        Ok(n) => n,
        Err(e) => {
            error!("pending count failed: {}", e);
            0
        }
    };

    Ok((
        StatusCode::OK,
        Json(json!({
            "date": rollup.date,
            "total_transactions": rollup.total_transactions,
            "total_volume": rollup.total_volume,
            "total_fees": rollup.total_fees,
            "avg_batch_size": rollup.avg_batch_size,
            "mev_attacks_prevented": rollup.mev_attacks_prevented,
            "pending_count": pending,
        })),
    )
        .into_response())
}

///////////////////////////////////////////////////////////////////////////
// GET /health - Basic liveness check
///////////////////////////////////////////////////////////////////////////
async fn health() -> ApiResult {
    Ok((StatusCode::OK, Json(json!({"status": "ok"}))).into_response())
}

/// Request logging middleware.
///
/// Logs all HTTP requests with method, path, status, and latency.
async fn logging_middleware<B>(req: Request<B>, next: Next<B>) -> Result<Response, StatusCode> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();

    info!("{} {} {} - {:.3}s", method, path, status, latency);

    Ok(response)
}

/// Rate limiting middleware.
///
/// Returns 429 Too Many Requests once an IP exhausts its window; limits come
/// from `Config` (`rate_limit_max_requests` / `rate_limit_window_secs`).
async fn rate_limit_middleware<B>(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(rate_limiter): Extension<RateLimiter>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let ip = addr.ip().to_string();

    if rate_limiter.check_rate_limit(&ip) {
        Ok(next.run(req).await)
    } else {
        warn!("🚫 Rate limit exceeded for IP: {}", ip);
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Build the router (call from main).
///
/// The server must be started with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the rate limiter
/// can see client addresses.
pub fn router(storage: Arc<dyn Storage>, config: Arc<Config>) -> Router {
    let rate_limiter = RateLimiter::new(
        config.rate_limit_max_requests,
        config.rate_limit_window_secs,
    );

    info!(
        "🛡️  Rate limiting enabled: {} requests per {} seconds",
        config.rate_limit_max_requests, config.rate_limit_window_secs
    );

    // Public routes (no rate limiting)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes with rate limiting (layers run bottom to top)
    let protected_routes = Router::new()
        .route("/tx/submit", post(submit_tx))
        .route("/tx/:id", get(get_tx))
        .route("/batch/:id", get(get_batch))
        .route("/stats", get(get_stats))
        .layer(middleware::from_fn(rate_limit_middleware))
        .layer(Extension(rate_limiter));

    // Combine all routes with global logging middleware
    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn(logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(storage))
        .layer(Extension(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_caps_within_window() {
        let limiter = RateLimiter::new(3, 60);
        assert!(limiter.check_rate_limit("10.0.0.1"));
        assert!(limiter.check_rate_limit("10.0.0.1"));
        assert!(limiter.check_rate_limit("10.0.0.1"));
        assert!(!limiter.check_rate_limit("10.0.0.1"));
        // Other clients are unaffected.
        assert!(limiter.check_rate_limit("10.0.0.2"));
    }

    #[test]
    fn rate_limiter_window_resets() {
        let limiter = RateLimiter::new(1, 0);
        assert!(limiter.check_rate_limit("10.0.0.1"));
        std::thread::sleep(Duration::from_millis(5));
        // Zero-length window means every request starts a fresh one.
        assert!(limiter.check_rate_limit("10.0.0.1"));
    }

    #[test]
    fn pool_errors_map_to_http_statuses() {
        let bad: ApiError = PoolError::Validation("amount must be a decimal number".into()).into();
        assert!(matches!(bad, ApiError::BadRequest(_)));

        let missing: ApiError = PoolError::NotFound("transaction not found".into()).into();
        assert!(matches!(missing, ApiError::NotFound(_)));

        let broken: ApiError = PoolError::Persistence("disk full".into()).into();
        assert!(matches!(broken, ApiError::Internal(_)));
    }
}
