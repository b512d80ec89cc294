//! Configuration module for HVWatch
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Environment variable overriding `cluster.password`
pub const PASSWORD_ENV: &str = "HVWATCH_OS_PASSWORD";

/// Delay growth between tracking polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every poll
    #[default]
    Fixed,
    /// Delay multiplied by `backoff_factor` after each poll
    Exponential,
}

/// Migration tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Delay between migration polls
    #[serde(with = "humantime_serde", default = "default_tracking_interval")]
    pub interval: Duration,

    /// Polls allowed before giving up on pending servers
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,

    /// Upper bound on the exponential delay
    #[serde(with = "humantime_serde", default = "default_max_interval")]
    pub max_interval: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            interval: default_tracking_interval(),
            max_retries: default_max_retries(),
            backoff: BackoffKind::default(),
            backoff_factor: default_backoff_factor(),
            max_interval: default_max_interval(),
        }
    }
}

/// Control plane connection configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Keystone v2 endpoint
    #[serde(default = "default_auth_url")]
    pub auth_url: Url,

    #[serde(default = "default_username")]
    pub username: String,

    /// May be supplied through HVWATCH_OS_PASSWORD instead
    #[serde(default)]
    pub password: String,

    #[serde(default = "default_username")]
    pub project_name: String,

    /// Service catalog region
    #[serde(default)]
    pub region: Option<String>,

    /// Compute endpoint, bypassing the service catalog
    #[serde(default)]
    pub compute_endpoint: Option<Url>,

    /// Evacuate onto shared storage
    #[serde(default)]
    pub on_shared_storage: bool,

    /// Timeout for every control plane request
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("auth_url", &self.auth_url.as_str())
            .field("username", &self.username)
            .field("project_name", &self.project_name)
            .field("region", &self.region)
            .field("compute_endpoint", &self.compute_endpoint)
            .field("on_shared_storage", &self.on_shared_storage)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            username: default_username(),
            password: String::new(),
            project_name: default_username(),
            region: None,
            compute_endpoint: None,
            on_shared_storage: false,
            request_timeout: default_request_timeout(),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log file name; stdout when unset
    #[serde(default)]
    pub file: Option<String>,

    /// Directory holding the log file
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// Resolved log file path, if file logging is configured
    pub fn path(&self) -> Option<PathBuf> {
        let file = self.file.as_ref()?;
        Some(match &self.dir {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        })
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Delay between reconciliation cycles
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Wait between evacuation and the first migration poll
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// Down nodes processed at once
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Dry run mode - log evacuations but don't issue them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
            max_concurrent_nodes: default_max_concurrent_nodes(),
            tracking: TrackingConfig::default(),
            cluster: ClusterConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be > 0");
        }
        if self.max_concurrent_nodes == 0 {
            anyhow::bail!("max_concurrent_nodes must be > 0");
        }
        if self.tracking.interval.is_zero() {
            anyhow::bail!("tracking.interval must be > 0");
        }
        if self.tracking.max_retries == 0 {
            anyhow::bail!("tracking.max_retries must be > 0");
        }
        if self.tracking.backoff == BackoffKind::Exponential {
            if self.tracking.backoff_factor < 2 {
                anyhow::bail!("tracking.backoff_factor must be >= 2 for exponential backoff");
            }
            if self.tracking.max_interval < self.tracking.interval {
                anyhow::bail!("tracking.max_interval must be >= tracking.interval");
            }
        }
        if self.cluster.username.is_empty() {
            anyhow::bail!("cluster.username must be set");
        }
        if self.cluster.project_name.is_empty() {
            anyhow::bail!("cluster.project_name must be set");
        }
        if self.cluster.password.is_empty() {
            anyhow::bail!("cluster.password must be set (or {})", PASSWORD_ENV);
        }
        if self.cluster.request_timeout.is_zero() {
            anyhow::bail!("cluster.request_timeout must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }

    /// Override the cluster password from the environment if set
    pub fn with_password_from_env(self) -> Self {
        self.with_password(std::env::var(PASSWORD_ENV).ok())
    }

    fn with_password(mut self, password: Option<String>) -> Self {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.cluster.password = password;
        }
        self
    }
}

// Default value functions
fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_concurrent_nodes() -> usize {
    1
}

fn default_tracking_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    10
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_max_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_auth_url() -> Url {
    Url::parse("http://localhost:5000/v2.0").expect("default auth_url is a valid URL")
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_port() -> u16 {
    9101
}

fn default_true() -> bool {
    true
}
