//! Configuration for segprof
//!
//! Sources, highest priority first:
//! 1. Environment variables (`SEGPROF_*`)
//! 2. Configuration file (`SEGPROF_CONFIG`, `.segprof`, `.segprof.yaml`, ...)
//! 3. Built-in defaults

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use segprof_api::{default_backends, BackendId, IdentityStrictness, UnsupportedBackend};
use segprof_core::ReportOptions;
use segprof_dispatch::{HttpRemoteConfig, RetryPolicy};
use segprof_logging::LoggingOptions;
use segprof_session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SegprofConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote compilation service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the service
    pub endpoint: Option<String>,
    /// Bearer token, passed through untouched
    pub token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

/// Backend leasing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Owner of the leases; quota is counted per user
    #[serde(default = "default_user")]
    pub user: String,
    /// Backends leased by `profile()`, as `hardware/library`
    #[serde(default = "default_backend_names")]
    pub backends: Vec<String>,
    /// Concurrently leased backends allowed per user
    #[serde(default = "default_quota")]
    pub quota: usize,
    /// Instances of every catalog backend in the local pool
    #[serde(default = "default_instances")]
    pub instances_per_backend: usize,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub strictness: IdentityStrictness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub verbose: bool,
    /// Print the report when a profiling scope is dropped
    #[serde(default = "default_true")]
    pub print: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit span begin/end events to the trace hook
    #[serde(default)]
    pub traces: bool,
}

fn default_request_timeout() -> u64 {
    120
}

fn default_retry_attempts() -> usize {
    5
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_retry_max_delay() -> u64 {
    2000
}

fn default_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string())
}

fn default_backend_names() -> Vec<String> {
    default_backends().iter().map(|b| b.to_string()).collect()
}

fn default_quota() -> usize {
    4
}

fn default_instances() -> usize {
    1
}

fn default_queue_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    50
}

fn default_threshold() -> usize {
    3
}

fn default_top_n() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            timeout_secs: default_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            backends: default_backend_names(),
            quota: default_quota(),
            instances_per_backend: default_instances(),
            queue_timeout_secs: default_queue_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            top_n: default_top_n(),
            verbose: false,
            print: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            traces: false,
        }
    }
}

impl RemoteConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn http_config(&self) -> Result<HttpRemoteConfig> {
        let base_url = self
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| anyhow!("remote.endpoint is not configured (set SEGPROF_ENDPOINT)"))?;
        Ok(HttpRemoteConfig {
            base_url,
            auth_token: self.token.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

impl SessionConfig {
    pub fn backend_ids(&self) -> std::result::Result<Vec<BackendId>, UnsupportedBackend> {
        BackendId::parse_list(&self.backends)
    }

    pub fn to_options(&self) -> SessionOptions {
        SessionOptions {
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

impl ReportConfig {
    pub fn to_options(&self) -> ReportOptions {
        ReportOptions {
            threshold: self.threshold,
            top_n: self.top_n,
            verbose: self.verbose,
        }
    }
}

impl LoggingConfig {
    pub fn to_options(&self) -> LoggingOptions {
        LoggingOptions {
            default_directive: self.level.clone(),
            enable_traces: self.traces,
            ..LoggingOptions::default()
        }
    }
}

/// Configuration loader with multiple source support
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the first configuration file found, then applies environment
    /// overrides.
    pub fn load() -> Result<SegprofConfig> {
        let mut config = Self::load_from_files()?;
        Self::apply_environment_variables(&mut config)?;
        Ok(config)
    }

    fn load_from_files() -> Result<SegprofConfig> {
        for path in Self::find_config_files() {
            if path.is_dir() {
                info!(
                    "Ignoring config directory path (expected file): {}",
                    path.display()
                );
                continue;
            }
            if path.exists() {
                info!("Loading configuration from: {}", path.display());
                return Self::load_from_file(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(SegprofConfig::default())
    }

    fn find_config_files() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(config_path) = env::var("SEGPROF_CONFIG") {
            paths.push(PathBuf::from(config_path));
        }

        if let Ok(current_dir) = env::current_dir() {
            for name in [
                ".segprof",
                ".segprof.toml",
                ".segprof.yaml",
                ".segprof.yml",
                ".segprof.json",
            ] {
                paths.push(current_dir.join(name));
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".segprof"));
            paths.push(home_dir.join(".config/segprof/config.yaml"));
            paths.push(home_dir.join(".config/segprof/config.toml"));
            paths.push(home_dir.join(".config/segprof/config.json"));
        }

        paths
    }

    pub fn load_from_file(path: &Path) -> Result<SegprofConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            // `.segprof` has no extension and is TOML
            None if path.file_name().and_then(|n| n.to_str()) == Some(".segprof") => {
                toml::from_str(&content).with_context(|| {
                    format!("Failed to parse .segprof (TOML) config: {}", path.display())
                })?
            }
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            _ => {
                if let Ok(config) = toml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_yaml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_json::from_str(&content) {
                    config
                } else {
                    return Err(anyhow!(
                        "Could not parse config file {} (tried TOML, YAML, JSON)",
                        path.display()
                    ));
                }
            }
        };

        Ok(config)
    }

    pub fn apply_environment_variables(config: &mut SegprofConfig) -> Result<()> {
        if let Ok(endpoint) = env::var("SEGPROF_ENDPOINT") {
            let trimmed = endpoint.trim();
            config.remote.endpoint = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        if let Ok(token) = env::var("SEGPROF_TOKEN") {
            config.remote.token = (!token.is_empty()).then_some(token);
        }
        if let Some(attempts) = parse_env::<usize>("SEGPROF_RETRY_ATTEMPTS") {
            config.remote.retry_attempts = attempts.max(1);
        }

        if let Ok(user) = env::var("SEGPROF_USER") {
            if !user.trim().is_empty() {
                config.session.user = user.trim().to_string();
            }
        }
        if let Ok(backends) = env::var("SEGPROF_BACKENDS") {
            let names: Vec<String> = backends
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            BackendId::parse_list(&names).context("Invalid SEGPROF_BACKENDS")?;
            config.session.backends = names;
        }
        if let Some(quota) = parse_env::<usize>("SEGPROF_QUOTA") {
            config.session.quota = quota;
        }
        if let Some(timeout) = parse_env::<u64>("SEGPROF_QUEUE_TIMEOUT") {
            config.session.queue_timeout_secs = timeout;
        }

        if let Ok(strictness) = env::var("SEGPROF_STRICTNESS") {
            config.identity.strictness = parse_strictness(&strictness)
                .ok_or_else(|| anyhow!("Invalid SEGPROF_STRICTNESS: {strictness}"))?;
        }

        if let Some(threshold) = parse_env::<usize>("SEGPROF_THRESHOLD") {
            config.report.threshold = threshold;
        }
        if let Some(top_n) = parse_env::<usize>("SEGPROF_TOP_N") {
            config.report.top_n = top_n;
        }
        if let Ok(verbose) = env::var("SEGPROF_VERBOSE") {
            config.report.verbose = parse_bool(&verbose).unwrap_or(false);
        }
        if let Some(print) = env::var("SEGPROF_PRINT").ok().and_then(|v| parse_bool(&v)) {
            config.report.print = print;
        }

        if let Ok(level) = env::var("SEGPROF_LOG_LEVEL") {
            if !level.trim().is_empty() {
                config.logging.level = level.trim().to_string();
            }
        }
        if let Some(traces) = env::var("SEGPROF_TRACES").ok().and_then(|v| parse_bool(&v)) {
            config.logging.traces = traces;
        }

        Ok(())
    }

    pub fn save_to_file(config: &SegprofConfig, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(config)
                .context("Failed to serialize config to JSON")?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(config).context("Failed to serialize config to YAML")?
            }
            _ => toml::to_string_pretty(config).context("Failed to serialize config to TOML")?,
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    pub fn generate_sample_config() -> String {
        let config = SegprofConfig::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| "# Failed to generate config".to_string())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        "" => Some(false),
        _ => None,
    }
}

fn parse_strictness(value: &str) -> Option<IdentityStrictness> {
    match value.trim().to_ascii_lowercase().as_str() {
        "strict" => Some(IdentityStrictness::Strict),
        "permissive" | "loose" => Some(IdentityStrictness::Permissive),
        _ => None,
    }
}
