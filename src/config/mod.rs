use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Upstream endpoints and HTTP behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_roster_url")]
    pub roster_url: String,

    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,

    #[serde(default = "default_history_url")]
    pub history_url: String,

    /// Open-data authorization key, required for realtime fetches.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_pause_min_secs")]
    pub pause_min_secs: f64,

    #[serde(default = "default_pause_max_secs")]
    pub pause_max_secs: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff step; doubles on every retry.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// One is picked at random for every request.
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// Value of the roster's station type column that is kept.
    #[serde(default = "default_staffed_station_type")]
    pub staffed_station_type: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Size of the history window crawled on first initialization.
    #[serde(default = "default_history_days")]
    pub history_days: i64,

    /// UTC offset of the upstream's local dates, in hours.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_roster_url() -> String {
    "https://e-service.cwa.gov.tw/wdps/obs/state.htm".to_string()
}
fn default_realtime_url() -> String {
    "https://opendata.cwa.gov.tw/api/v1/rest/datastore/O-A0003-001".to_string()
}
fn default_history_url() -> String {
    "https://codis.cwa.gov.tw/api/station".to_string()
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_pause_min_secs() -> f64 {
    0.5
}
fn default_pause_max_secs() -> f64 {
    5.0
}
fn default_max_retries() -> usize {
    5
}
fn default_retry_base_ms() -> u64 {
    1500
}
fn default_retry_max_delay_secs() -> u64 {
    60
}
fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64; rv:123.0) Gecko/20100101 Firefox/123.0".to_string(),
    ]
}
fn default_staffed_station_type() -> String {
    "署屬有人站".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/weather.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    1000
}
fn default_concurrency() -> usize {
    4
}
fn default_history_days() -> i64 {
    366
}
fn default_utc_offset_hours() -> i32 {
    8
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            roster_url: default_roster_url(),
            realtime_url: default_realtime_url(),
            history_url: default_history_url(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            pause_min_secs: default_pause_min_secs(),
            pause_max_secs: default_pause_max_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            user_agents: default_user_agents(),
            staffed_station_type: default_staffed_station_type(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
            batch_size: default_batch_size(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            history_days: default_history_days(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

impl PipelineConfig {
    /// Fixed upstream-local offset used for dates and "yesterday".
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .with_context(|| format!("Invalid UTC offset {}h", self.utc_offset_hours))
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("WEATHER").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    fn validate(&self) -> Result<()> {
        let up = &self.upstream;
        if up.pause_min_secs < 0.0 || up.pause_max_secs < up.pause_min_secs {
            anyhow::bail!(
                "upstream pause range [{}, {}] is invalid",
                up.pause_min_secs,
                up.pause_max_secs
            );
        }
        if self.storage.batch_size == 0 {
            anyhow::bail!("storage.batch_size must be at least 1");
        }
        if !(-12..=14).contains(&self.pipeline.utc_offset_hours) {
            anyhow::bail!("pipeline.utc_offset_hours out of range");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.pipeline.concurrency, 4);
        assert_eq!(cfg.upstream.timeout_secs, 5);
        assert_eq!(cfg.pipeline.history_days, 366);
    }

    #[test]
    fn test_empty_source_deserializes_to_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.storage.batch_size, 1000);
        assert_eq!(cfg.upstream.staffed_station_type, "署屬有人站");
    }

    #[test]
    fn test_rejects_inverted_pause_range() {
        let mut cfg = AppConfig::default();
        cfg.upstream.pause_min_secs = 3.0;
        cfg.upstream.pause_max_secs = 1.0;
        assert!(cfg.validate().is_err());
    }
}
