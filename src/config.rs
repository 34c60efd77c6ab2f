//! Configuration for the replicator
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::dispatch::BatchLayout;
use crate::engine::EngineConfig;
use crate::jobs::TrackerConfig;
use crate::platform::GraphClientConfig;
use crate::recovery::RecoveryConfig;
use crate::retry::BackoffPolicy;
use crate::selection::SelectionOverride;

/// Replicator - bulk replication engine for a rate-limited ad platform
#[derive(Parser, Debug, Clone)]
#[command(name = "replicator")]
#[command(about = "Bulk replication and rate-limited dispatch engine")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Lease owner identity of this process (random if unset)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "replicator")]
    pub mongodb_db: String,

    /// Development mode: fall back to in-memory stores when MongoDB is unreachable
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Use the in-process simulated platform instead of the Graph API
    #[arg(long, env = "SIMULATE_PLATFORM", default_value = "false")]
    pub simulate_platform: bool,

    /// Graph API base URL
    #[arg(long, env = "GRAPH_API_URL", default_value = "https://graph.facebook.com")]
    pub graph_api_url: String,

    /// Graph API version path segment
    #[arg(long, env = "GRAPH_API_VERSION", default_value = "v19.0")]
    pub graph_api_version: String,

    /// Per network call timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Sub-operations per batch call (two per copy)
    #[arg(long, env = "MAX_OPS_PER_CALL", default_value = "50")]
    pub max_ops_per_call: usize,

    /// Slot layout of batch calls
    #[arg(long, env = "BATCH_LAYOUT", value_enum, default_value = "interleaved")]
    pub batch_layout: BatchLayout,

    /// Replication jobs run concurrently by this process
    #[arg(long, env = "WORKER_COUNT", default_value = "2")]
    pub worker_count: usize,

    /// Targets deployed concurrently in parallel fan-out
    #[arg(long, env = "FANOUT_CONCURRENCY", default_value = "3")]
    pub fanout_concurrency: usize,

    /// Sequential recovery attempts per unit
    #[arg(long, env = "RECOVERY_MAX_ATTEMPTS", default_value = "10")]
    pub recovery_max_attempts: u32,

    /// Delay between sequential creates, in milliseconds
    #[arg(long, env = "RECOVERY_DELAY_MS", default_value = "2000")]
    pub recovery_delay_ms: u64,

    /// Attempts per call, first one included
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "4")]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value = "500")]
    pub retry_base_delay_ms: u64,

    #[arg(long, env = "RETRY_MULTIPLIER", default_value = "2.0")]
    pub retry_multiplier: f64,

    #[arg(long, env = "RETRY_MAX_JITTER_MS", default_value = "250")]
    pub retry_max_jitter_ms: u64,

    /// Batch success rate below which the adaptive strategy goes sequential
    #[arg(long, env = "FALLBACK_SUCCESS_THRESHOLD", default_value = "0.5")]
    pub fallback_success_threshold: f64,

    /// Length of a credential quota window in seconds
    #[arg(long, env = "QUOTA_WINDOW_SECS", default_value = "3600")]
    pub quota_window_secs: u64,

    /// Job lease duration in seconds
    #[arg(long, env = "LEASE_SECS", default_value = "60")]
    pub lease_secs: u64,

    /// Idle worker poll interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Stored default ad account for the selection chain
    #[arg(long, env = "DEFAULT_AD_ACCOUNT")]
    pub default_ad_account: Option<String>,

    /// Stored default pixel for the selection chain
    #[arg(long, env = "DEFAULT_PIXEL")]
    pub default_pixel: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (plain, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "plain")]
    pub log_format: String,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_ops_per_call < 2 || self.max_ops_per_call % 2 != 0 {
            return Err("MAX_OPS_PER_CALL must be an even number of at least 2".to_string());
        }
        if self.worker_count == 0 {
            return Err("WORKER_COUNT must be greater than zero".to_string());
        }
        if self.fanout_concurrency == 0 {
            return Err("FANOUT_CONCURRENCY must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.fallback_success_threshold) {
            return Err("FALLBACK_SUCCESS_THRESHOLD must be within [0, 1]".to_string());
        }
        if self.retry_max_attempts == 0 {
            return Err("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.retry_multiplier < 1.0 {
            return Err("RETRY_MULTIPLIER must be at least 1.0".to_string());
        }
        if self.quota_window_secs == 0 || self.lease_secs == 0 {
            return Err("QUOTA_WINDOW_SECS and LEASE_SECS must be greater than zero".to_string());
        }
        if !matches!(self.log_format.as_str(), "plain" | "json") {
            return Err("LOG_FORMAT must be plain or json".to_string());
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_multiplier,
            max_jitter: Duration::from_millis(self.retry_max_jitter_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let delay = Duration::from_millis(self.recovery_delay_ms);
        EngineConfig {
            max_ops_per_call: self.max_ops_per_call,
            layout: self.batch_layout,
            retry: self.retry_policy(),
            recovery: RecoveryConfig {
                max_attempts: self.recovery_max_attempts,
                inter_request_delay: delay,
            },
            sequential_delay: delay,
            fallback_threshold: self.fallback_success_threshold,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let defaults = TrackerConfig::default();
        TrackerConfig {
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
            worker_count: self.worker_count,
            fanout_concurrency: self.fanout_concurrency,
            lease: Duration::from_secs(self.lease_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retention: defaults.retention,
        }
    }

    pub fn graph_config(&self) -> GraphClientConfig {
        GraphClientConfig {
            base_url: self.graph_api_url.clone(),
            api_version: self.graph_api_version.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn quota_window(&self) -> Duration {
        Duration::from_secs(self.quota_window_secs)
    }

    /// Stored defaults of the selection chain
    pub fn stored_selection(&self) -> SelectionOverride {
        SelectionOverride {
            ad_account: self.default_ad_account.clone(),
            pixel: self.default_pixel.clone(),
        }
    }
}
