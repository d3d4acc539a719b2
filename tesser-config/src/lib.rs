//! Layered configuration loading utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// JSON log file written next to stdout output when set.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub exchanges: BTreeMap<String, ExchangeConfig>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationConfig {
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_ledger_timeout_ms")]
    pub ledger_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_concurrent_collections")]
    pub max_concurrent_collections: usize,
    /// Pause between scheduled sessions in `reconcile watch`.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Per-exchange call budget; unlimited when absent.
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    #[serde(default)]
    pub tolerances: ToleranceConfig,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ToleranceConfig {
    #[serde(default = "default_tolerance")]
    pub absolute: Decimal,
    #[serde(default = "default_tolerance")]
    pub relative: Decimal,
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: Decimal,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_driver_name")]
    pub driver: String,
    /// Driver specific settings, e.g. `fixture` for the paper driver.
    #[serde(default, flatten)]
    pub params: Value,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
    #[serde(default = "default_capital_asset")]
    pub capital_asset: String,
    /// Ledger versions retained for point-in-time reads.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_path")]
    pub store_path: PathBuf,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            ledger_timeout_ms: default_ledger_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_concurrent_collections: default_max_concurrent_collections(),
            interval_secs: default_interval_secs(),
            requests_per_second: None,
            tolerances: ToleranceConfig::default(),
        }
    }
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            absolute: default_tolerance(),
            relative: default_tolerance(),
            critical_ratio: default_critical_ratio(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            capital_asset: default_capital_asset(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            store_path: default_reports_path(),
        }
    }
}

impl ReconciliationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9100".into()
}

fn default_session_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_ledger_timeout_ms() -> u64 {
    5_000
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_max_concurrent_collections() -> usize {
    8
}

fn default_interval_secs() -> u64 {
    60
}

fn default_tolerance() -> Decimal {
    Decimal::new(1, 6)
}

fn default_critical_ratio() -> Decimal {
    Decimal::new(1, 2) // 1%
}

fn default_exchange_driver_name() -> String {
    "paper".to_string()
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("./data/ledger.db")
}

fn default_capital_asset() -> String {
    "USDT".to_string()
}

fn default_history_limit() -> usize {
    256
}

fn default_reports_path() -> PathBuf {
    PathBuf::from("./data/reports.db")
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `TESSER__`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    load_config_from(Path::new("config"), env)
}

/// Same as [`load_config`] but rooted at `base_path` instead of `./config`.
pub fn load_config_from(base_path: &Path, env: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("TESSER")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
