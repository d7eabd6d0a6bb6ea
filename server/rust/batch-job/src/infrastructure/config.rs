use std::collections::HashMap;

use anyhow::Context;
use secrecy::Secret;
use serde::Deserialize;

use crate::infrastructure::database::DatabaseConfig;

/// Config はアプリケーション全体の設定。
#[derive(Debug, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub data_source: DataSourceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// YAML ファイルから設定を読み込む。
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let cfg: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {path}"))?;
        Ok(cfg)
    }
}

/// AppConfig はアプリケーション設定。
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

/// ServerConfig はサーバー設定。
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// DataSourceConfig は外部データソース API への接続設定。
/// credentials は credential_ref から API キーへの対応で、ログには出力されない。
#[derive(Debug, Deserialize)]
pub struct DataSourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub credentials: HashMap<String, Secret<String>>,
}

fn default_base_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            credentials: HashMap::new(),
        }
    }
}

/// BatchConfig は実行エンジンの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u32,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    /// このプロセスで同時に実行できるループ数の上限。
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_batch_size() -> u32 {
    1000
}

fn default_registry_capacity() -> usize {
    64
}

fn default_lease_timeout_secs() -> u64 {
    900
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            registry_capacity: default_registry_capacity(),
            lease_timeout_secs: default_lease_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

/// TenantConfig は静的テナントディレクトリの 1 エントリ。
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub credential_refs: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// ObservabilityConfig はログとトレースの設定。
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub trace_endpoint: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            trace_endpoint: None,
            sample_rate: default_sample_rate(),
        }
    }
}
