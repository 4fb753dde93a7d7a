//! Configuration infrastructure
//!
//! Contains configuration loading and management for the reporting cycle.
//!
//! Configuration is organized into sections, one per component:
//! 1. `concurrency` - adaptive worker-pool sizing
//! 2. `scheduler` - job attempts, timeouts, backoff and systemic-failure detection
//! 3. `enrichment` - lookup pool, lookup timeouts and request rate
//! 4. `reporting` - ranking sizes and outbound batch size
//! 5. `endpoints` - remote service locations and credentials
//! 6. `logging`

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "SHELF_SENTINEL_CONFIG";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub concurrency: ConcurrencyConfig,
    pub scheduler: SchedulerConfig,
    pub enrichment: EnrichmentConfig,
    pub reporting: ReportingConfig,
    pub endpoints: EndpointConfig,
    pub logging: LoggingConfig,
}

/// Adaptive concurrency controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// When false the pool stays at `initial` for the whole run
    pub adaptive: bool,
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// Slots added or removed per resource-driven change
    pub step: usize,
    pub cpu_upper_percent: f32,
    pub cpu_lower_percent: f32,
    pub mem_upper_percent: f32,
    pub mem_lower_percent: f32,
    pub sample_interval_ms: u64,
    pub cooldown_ms: u64,
    /// Sliding window used by the failure-pressure throttle
    pub failure_window_ms: u64,
    /// Failures per started job inside the window that trigger a halving
    pub failure_rate_threshold: f64,
}

/// Job scheduler / worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total attempts per job, first run included
    pub max_attempts: u32,
    pub job_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Failed / terminal ratio above which the run is aborted
    pub systemic_failure_ratio: f64,
    /// Terminal jobs required before the systemic ratio is evaluated
    pub systemic_min_samples: usize,
    /// How often the pool re-reads the concurrency target
    pub poll_interval_ms: u64,
}

/// Enrichment pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Items enriched concurrently
    pub lookup_pool_size: usize,
    pub lookup_timeout_ms: u64,
    /// Attempts per lookup for transient failures
    pub lookup_max_attempts: u32,
    pub lookup_retry_delay_ms: u64,
    pub requests_per_second: u32,
}

/// Aggregation and delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub network_top_n: usize,
    pub contributors_per_item: usize,
    pub items_per_location: usize,
    pub worst_location_count: usize,
    /// Maximum entries per outbound message
    pub batch_size: usize,
}

/// Remote collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Metrics endpoint; the lookup key and date range are sent as query parameters
    pub dashboard_metrics_url: String,
    /// Flagged-items endpoint, `{lookup_key}` is substituted per job
    pub dashboard_items_url: String,
    pub dashboard_cookie: Option<String>,
    pub product_base_url: String,
    pub stock_base_url: String,
    pub location_base_url: String,
    pub api_key: String,
    pub token_url: Option<String>,
    pub webhook_url: Option<String>,
    /// JSON array of locations to collect
    pub jobs_file: PathBuf,
    pub request_timeout_ms: u64,
    /// Reporting period requested from the dashboard
    pub date_range_mode: DateRangeMode,
}

/// Dashboard reporting period, resolved against local time when a job runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRangeMode {
    /// Midnight until the current hour
    #[default]
    Today,
    /// The whole of the previous day
    Yesterday,
    /// Today and the six days before it
    #[serde(rename = "last_7_days")]
    Last7Days,
    /// Today and the 29 days before it
    #[serde(rename = "last_30_days")]
    Last30Days,
    /// Monday of the current week until the current hour
    WeekToDate,
}

impl DateRangeMode {
    /// Heading prefix for reports
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Today => "Today's",
            Self::Yesterday => "Yesterday's",
            Self::Last7Days => "Last 7 Days",
            Self::Last30Days => "Last 30 Days",
            Self::WeekToDate => "Week to Date",
        }
    }
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to the platform data directory when unset
    pub log_dir: Option<PathBuf>,
    /// Module-specific log level filters (e.g., "reqwest": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            initial: defaults::INITIAL_CONCURRENCY,
            min: defaults::MIN_CONCURRENCY,
            max: defaults::MAX_CONCURRENCY,
            step: defaults::CONCURRENCY_STEP,
            cpu_upper_percent: defaults::CPU_UPPER_PERCENT,
            cpu_lower_percent: defaults::CPU_LOWER_PERCENT,
            mem_upper_percent: defaults::MEM_UPPER_PERCENT,
            mem_lower_percent: defaults::MEM_LOWER_PERCENT,
            sample_interval_ms: defaults::SAMPLE_INTERVAL_MS,
            cooldown_ms: defaults::COOLDOWN_MS,
            failure_window_ms: defaults::FAILURE_WINDOW_MS,
            failure_rate_threshold: defaults::FAILURE_RATE_THRESHOLD,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            job_timeout_ms: defaults::JOB_TIMEOUT_MS,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            systemic_failure_ratio: defaults::SYSTEMIC_FAILURE_RATIO,
            systemic_min_samples: defaults::SYSTEMIC_MIN_SAMPLES,
            poll_interval_ms: defaults::SCHEDULER_POLL_INTERVAL_MS,
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            lookup_pool_size: defaults::LOOKUP_POOL_SIZE,
            lookup_timeout_ms: defaults::LOOKUP_TIMEOUT_MS,
            lookup_max_attempts: defaults::LOOKUP_MAX_ATTEMPTS,
            lookup_retry_delay_ms: defaults::LOOKUP_RETRY_DELAY_MS,
            requests_per_second: defaults::REQUESTS_PER_SECOND,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            network_top_n: defaults::NETWORK_TOP_N,
            contributors_per_item: defaults::CONTRIBUTORS_PER_ITEM,
            items_per_location: defaults::ITEMS_PER_LOCATION,
            worst_location_count: defaults::WORST_LOCATION_COUNT,
            batch_size: defaults::BATCH_SIZE,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            dashboard_metrics_url: String::new(),
            dashboard_items_url: String::new(),
            dashboard_cookie: None,
            product_base_url: defaults::PRODUCT_BASE_URL.to_string(),
            stock_base_url: defaults::STOCK_BASE_URL.to_string(),
            location_base_url: defaults::LOCATION_BASE_URL.to_string(),
            api_key: String::new(),
            token_url: None,
            webhook_url: None,
            jobs_file: PathBuf::from(defaults::JOBS_FILE),
            request_timeout_ms: defaults::REQUEST_TIMEOUT_MS,
            date_range_mode: DateRangeMode::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: None,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("reqwest".to_string(), "warn".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("hyper_util".to_string(), "warn".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl ConcurrencyConfig {
    /// Never zero; `tokio::time::interval` rejects a zero period
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub const fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

impl SchedulerConfig {
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Never zero; `tokio::time::interval` rejects a zero period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl EnrichmentConfig {
    pub const fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub const fn lookup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_retry_delay_ms)
    }
}

impl AppConfig {
    /// Reject settings that would break controller or scheduler invariants.
    pub fn validate(&self) -> Result<()> {
        let c = &self.concurrency;
        if c.min == 0 {
            bail!("concurrency.min must be at least 1");
        }
        if c.min > c.max {
            bail!("concurrency.min ({}) exceeds concurrency.max ({})", c.min, c.max);
        }
        if c.initial < c.min || c.initial > c.max {
            bail!(
                "concurrency.initial ({}) outside [{}, {}]",
                c.initial, c.min, c.max
            );
        }
        if c.step == 0 {
            bail!("concurrency.step must be at least 1");
        }
        if c.cpu_lower_percent >= c.cpu_upper_percent {
            bail!("concurrency.cpu_lower_percent must be below cpu_upper_percent");
        }
        if c.mem_lower_percent >= c.mem_upper_percent {
            bail!("concurrency.mem_lower_percent must be below mem_upper_percent");
        }
        if c.sample_interval_ms == 0 {
            bail!("concurrency.sample_interval_ms must be greater than zero");
        }

        let s = &self.scheduler;
        if s.max_attempts == 0 {
            bail!("scheduler.max_attempts must be at least 1");
        }
        if s.poll_interval_ms == 0 {
            bail!("scheduler.poll_interval_ms must be greater than zero");
        }
        if s.job_timeout_ms == 0 {
            bail!("scheduler.job_timeout_ms must be greater than zero");
        }
        if !(s.systemic_failure_ratio > 0.0 && s.systemic_failure_ratio <= 1.0) {
            bail!(
                "scheduler.systemic_failure_ratio ({}) must be in (0, 1]",
                s.systemic_failure_ratio
            );
        }

        let e = &self.enrichment;
        if e.lookup_pool_size == 0 {
            bail!("enrichment.lookup_pool_size must be at least 1");
        }
        if e.lookup_max_attempts == 0 {
            bail!("enrichment.lookup_max_attempts must be at least 1");
        }
        if e.lookup_timeout_ms == 0 {
            bail!("enrichment.lookup_timeout_ms must be greater than zero");
        }
        if e.requests_per_second == 0 {
            bail!("enrichment.requests_per_second must be at least 1");
        }

        if self.reporting.batch_size == 0 {
            bail!("reporting.batch_size must be at least 1");
        }
        Ok(())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("shelf-sentinel");

        Ok(config_dir)
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("shelf-sentinel");

        Ok(data_dir)
    }

    /// Resolve the config path from the environment, falling back to the platform directory
    pub fn new() -> Result<Self> {
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(Self::with_path(explicit));
        }
        let config_path = Self::get_config_dir()?.join("shelf_sentinel_config.json");
        Ok(Self { config_path })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !fs::try_exists(&self.config_path).await.unwrap_or(false) {
            info!(
                "Configuration file not found, creating default: {:?}",
                self.config_path
            );
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        let config: AppConfig = match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(parse_error) => {
                warn!("⚠️  Configuration file is not valid: {}", parse_error);
                self.backup_corrupted().await;
                return Err(parse_error).context("Failed to parse configuration file");
            }
        };

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_path))?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Reset configuration to defaults (useful for troubleshooting)
    pub async fn reset_to_defaults(&self) -> Result<AppConfig> {
        info!("🔄 Resetting configuration to defaults");
        let default_config = AppConfig::default();
        self.save_config(&default_config).await?;
        Ok(default_config)
    }

    async fn backup_corrupted(&self) {
        let backup_path = self.config_path.with_extension("json.corrupted");
        match fs::copy(&self.config_path, &backup_path).await {
            Ok(_) => info!("Backed up corrupted config to: {:?}", backup_path),
            Err(e) => warn!("Failed to create backup of corrupted config: {}", e),
        }
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Default configuration values
pub mod defaults {
    // Concurrency controller
    pub const INITIAL_CONCURRENCY: usize = 2;
    pub const MIN_CONCURRENCY: usize = 1;
    pub const MAX_CONCURRENCY: usize = 20;
    pub const CONCURRENCY_STEP: usize = 1;
    pub const CPU_UPPER_PERCENT: f32 = 90.0;
    pub const CPU_LOWER_PERCENT: f32 = 65.0;
    pub const MEM_UPPER_PERCENT: f32 = 90.0;
    pub const MEM_LOWER_PERCENT: f32 = 80.0;
    pub const SAMPLE_INTERVAL_MS: u64 = 5_000;
    pub const COOLDOWN_MS: u64 = 15_000;
    pub const FAILURE_WINDOW_MS: u64 = 60_000;
    pub const FAILURE_RATE_THRESHOLD: f64 = 0.05;

    // Scheduler
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const JOB_TIMEOUT_MS: u64 = 120_000;
    pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;
    pub const SYSTEMIC_FAILURE_RATIO: f64 = 0.5;
    pub const SYSTEMIC_MIN_SAMPLES: usize = 10;
    pub const SCHEDULER_POLL_INTERVAL_MS: u64 = 250;

    // Enrichment
    pub const LOOKUP_POOL_SIZE: usize = 16;
    pub const LOOKUP_TIMEOUT_MS: u64 = 20_000;
    pub const LOOKUP_MAX_ATTEMPTS: u32 = 2;
    pub const LOOKUP_RETRY_DELAY_MS: u64 = 500;
    pub const REQUESTS_PER_SECOND: u32 = 20;

    // Reporting
    pub const NETWORK_TOP_N: usize = 10;
    pub const CONTRIBUTORS_PER_ITEM: usize = 3;
    pub const ITEMS_PER_LOCATION: usize = 5;
    pub const WORST_LOCATION_COUNT: usize = 5;
    pub const BATCH_SIZE: usize = 100;

    // Endpoints
    pub const PRODUCT_BASE_URL: &str = "https://api.morrisons.com/product/v1/items";
    pub const STOCK_BASE_URL: &str = "https://api.morrisons.com/stock/v2/locations";
    pub const LOCATION_BASE_URL: &str = "https://api.morrisons.com/priceintegrity/v1/locations";
    pub const JOBS_FILE: &str = "locations.json";
    pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

    // Logging
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;
}
