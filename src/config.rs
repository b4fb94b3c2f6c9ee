// src/config.rs
// Runtime configuration: read once from the environment at boot, validated,
// then passed explicitly to every component. Nothing reads env vars after this.

use crate::storage::StorageMode;
use log::{error, info, warn};
use std::env;

/// Node configuration with the defaults the service ships with.
#[derive(Debug, Clone)]
pub struct Config {
    /// Privacy premium charged on every submission, in whole percent.
    pub premium_percent: u32,
    /// Upper bound on transactions per execution batch.
    pub max_batch_size: usize,
    /// Seconds between batch-processing cycles.
    pub batch_window_secs: u64,
    /// Per-dispatch HTTP timeout in seconds.
    pub dispatch_timeout_secs: u64,
    /// Bind address for the HTTP API.
    pub api_addr: String,
    pub storage_mode: StorageMode,
    pub sqlite_path: String,
    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
    /// Age after which an open batch is considered interrupted.
    pub reconcile_stale_secs: u64,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Config {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let premium_percent = env::var("PREMIUM_PERCENT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);

        let max_batch_size = env::var("MAX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10);

        let batch_window_secs = env::var("BATCH_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let dispatch_timeout_secs = env::var("DISPATCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let api_addr = env::var("API_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());

        let storage_mode = StorageMode::from_env_str(
            &env::var("STORAGE_MODE").unwrap_or_else(|_| "sqlite".into()),
        );

        let sqlite_path = env::var("SQLITE_PATH").unwrap_or_else(|_| "data/darkpool.db".into());

        let reconcile_interval_secs = env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        let reconcile_stale_secs = env::var("RECONCILE_STALE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(900);

        let rate_limit_max_requests = env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(100);

        let rate_limit_window_secs = env::var("RATE_LIMIT_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);

        Self {
            premium_percent,
            max_batch_size,
            batch_window_secs,
            dispatch_timeout_secs,
            api_addr,
            storage_mode,
            sqlite_path,
            reconcile_interval_secs,
            reconcile_stale_secs,
            rate_limit_max_requests,
            rate_limit_window_secs,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            premium_percent: 5,
            max_batch_size: 10,
            batch_window_secs: 30,
            dispatch_timeout_secs: 30,
            api_addr: "0.0.0.0:8080".into(),
            storage_mode: StorageMode::Sqlite,
            sqlite_path: "data/darkpool.db".into(),
            reconcile_interval_secs: 60,
            reconcile_stale_secs: 900,
            rate_limit_max_requests: 100,
            rate_limit_window_secs: 60,
        }
    }
}

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        if !self.warnings.is_empty() {
            warn!("⚠️  Configuration Warnings:");
            for w in &self.warnings {
                warn!("   - {}", w);
            }
        }

        if !self.errors.is_empty() {
            error!("❌ Configuration Errors:");
            for e in &self.errors {
                error!("   - {}", e);
            }
        }

        if self.valid && self.warnings.is_empty() {
            info!("✅ Configuration validation passed");
        }
    }
}

/// Validate all critical configuration at startup
pub fn validate_config(config: &Config) -> ConfigValidation {
    let mut validation = ConfigValidation::new();

    info!("🔍 Validating configuration...");

    if let Err(_) = config.api_addr.parse::<std::net::SocketAddr>() {
        validation.add_error(format!(
            "API_ADDR has invalid format: '{}' (expected IP:PORT)",
            config.api_addr
        ));
    }

    if config.max_batch_size == 0 {
        validation.add_error("MAX_BATCH_SIZE must be at least 1".into());
    }

    if config.batch_window_secs == 0 {
        validation.add_error("BATCH_WINDOW_SECS must be at least 1".into());
    }

    if config.premium_percent > 50 {
        validation.add_warning(format!(
            "PREMIUM_PERCENT is very high ({}%) - agents may not accept it",
            config.premium_percent
        ));
    }

    if config.dispatch_timeout_secs >= config.batch_window_secs * 2 {
        validation.add_warning(format!(
            "DISPATCH_TIMEOUT_SECS ({}) is large relative to the batch window ({}) - slow targets can back up cycles",
            config.dispatch_timeout_secs, config.batch_window_secs
        ));
    }

    if config.reconcile_stale_secs < config.batch_window_secs {
        validation.add_warning(format!(
            "RECONCILE_STALE_SECS ({}) is shorter than the batch window ({}) - in-flight batches could be reclaimed early",
            config.reconcile_stale_secs, config.batch_window_secs
        ));
    }

    // A full batch of timing-out dispatches runs max_batch_size * timeout
    // seconds; the stale threshold must exceed that or the reconciler can
    // fail members of a cycle that is still running.
    let worst_case_cycle_secs = config.max_batch_size as u64 * config.dispatch_timeout_secs;
    if config.reconcile_stale_secs <= worst_case_cycle_secs {
        validation.add_warning(format!(
            "RECONCILE_STALE_SECS ({}) does not cover a worst-case cycle ({} members x {}s timeout = {}s) - a slow cycle could be reclaimed while still dispatching",
            config.reconcile_stale_secs,
            config.max_batch_size,
            config.dispatch_timeout_secs,
            worst_case_cycle_secs
        ));
    }

    if config.rate_limit_max_requests > 10000 {
        validation.add_warning(format!(
            "RATE_LIMIT_MAX_REQUESTS is very high ({}) - may not prevent DoS effectively",
            config.rate_limit_max_requests
        ));
    }

    if let StorageMode::Memory = config.storage_mode {
        validation.add_warning(
            "STORAGE_MODE=memory - the pool is volatile and will be lost on restart".into(),
        );
    }

    validation
}
