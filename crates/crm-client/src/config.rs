//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret and refresh token come from `CRM_CLIENT_SECRET` /
//! `CRM_REFRESH_TOKEN` or from the `*_file` paths, never from the TOML body.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{RedactionConfig, Region, Secret, ValidationMode};
use serde::Deserialize;

use crate::deprecation::DeprecationConfig;

pub const CLIENT_SECRET_ENV: &str = "CRM_CLIENT_SECRET";
pub const REFRESH_TOKEN_ENV: &str = "CRM_REFRESH_TOKEN";
pub const CONFIG_PATH_ENV: &str = "CRM_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "crm-client.toml";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub auth: AuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Client-side limiter for API calls; disabled when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub bulk_download_rate_limit: BulkDownloadRateLimitConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub deprecations: DeprecationConfig,
}

/// OAuth client settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    #[serde(default)]
    pub region: Region,
    /// Replaces the region's token endpoint.
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default = "default_max_cached_tokens")]
    pub max_cached_tokens: usize,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub api_base_url: Option<String>,
    pub default_api_path: String,
    pub allow_insecure_http: bool,
    pub slow_request_threshold_ms: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            api_base_url: None,
            default_api_path: crm_http::DEFAULT_API_PATH.to_string(),
            allow_insecure_http: false,
            slow_request_threshold_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = crm_http::RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> crm_http::RetryPolicy {
        crm_http::RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests_per_interval: usize,
    pub interval_ms: u64,
    #[serde(default)]
    pub max_queue: Option<usize>,
    #[serde(default)]
    pub max_queue_wait_ms: Option<u64>,
    #[serde(default = "default_warn_at_fraction")]
    pub warn_at_fraction: f64,
}

impl RateLimitConfig {
    pub fn options(&self, scope: &str) -> rate_limiter::RateLimiterOptions {
        rate_limiter::RateLimiterOptions {
            max_queue: self.max_queue,
            max_queue_wait: self.max_queue_wait_ms.map(Duration::from_millis),
            warn_at_fraction: self.warn_at_fraction,
            scope: scope.to_string(),
            ..rate_limiter::RateLimiterOptions::new(
                self.max_requests_per_interval,
                Duration::from_millis(self.interval_ms),
            )
        }
    }

    fn validate(&self, section: &str) -> common::Result<()> {
        if self.max_requests_per_interval == 0 {
            return Err(common::Error::Config(format!(
                "{section}.max_requests_per_interval must be greater than 0"
            )));
        }
        if self.interval_ms == 0 {
            return Err(common::Error::Config(format!(
                "{section}.interval_ms must be greater than 0"
            )));
        }
        if !(self.warn_at_fraction > 0.0 && self.warn_at_fraction <= 1.0) {
            return Err(common::Error::Config(format!(
                "{section}.warn_at_fraction must be in (0, 1], got {}",
                self.warn_at_fraction
            )));
        }
        Ok(())
    }
}

/// Limiter for bulk result downloads; on by default at 10 per minute.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BulkDownloadRateLimitConfig {
    pub enabled: bool,
    pub max_requests_per_interval: usize,
    pub interval_ms: u64,
    pub max_queue: Option<usize>,
    pub max_queue_wait_ms: Option<u64>,
    pub warn_at_fraction: f64,
}

impl Default for BulkDownloadRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_interval: 10,
            interval_ms: 60_000,
            max_queue: None,
            max_queue_wait_ms: None,
            warn_at_fraction: default_warn_at_fraction(),
        }
    }
}

impl BulkDownloadRateLimitConfig {
    pub fn limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_interval: self.max_requests_per_interval,
            interval_ms: self.interval_ms,
            max_queue: self.max_queue,
            max_queue_wait_ms: self.max_queue_wait_ms,
            warn_at_fraction: self.warn_at_fraction,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub mode: ValidationMode,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_cached_tokens() -> usize {
    1
}

fn default_warn_at_fraction() -> f64 {
    0.8
}

impl ClientConfig {
    /// Load configuration from a TOML file, then overlay secrets.
    ///
    /// Secret resolution order, per secret:
    /// 1. environment variable
    /// 2. `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Same as [`ClientConfig::load`] for TOML already in memory.
    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;

        config.auth.client_secret = Some(resolve_secret(
            CLIENT_SECRET_ENV,
            config.auth.client_secret_file.as_deref(),
            "client_secret",
        )?);
        config.auth.refresh_token = Some(resolve_secret(
            REFRESH_TOKEN_ENV,
            config.auth.refresh_token_file.as_deref(),
            "refresh_token",
        )?);
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.auth.client_id.trim().is_empty() {
            return Err(common::Error::Config("auth.client_id must be non-empty".into()));
        }
        if self.auth.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "auth.request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(common::Error::Config(
                "http.timeout_secs must be greater than 0".into(),
            ));
        }
        for (field, url) in [
            ("auth.token_url", &self.auth.token_url),
            ("http.api_base_url", &self.http.api_base_url),
        ] {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(common::Error::Config(format!(
                        "{field} must start with http:// or https://, got: {url}"
                    )));
                }
            }
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate("rate_limit")?;
        }
        if self.bulk_download_rate_limit.enabled {
            self.bulk_download_rate_limit
                .limit()
                .validate("bulk_download_rate_limit")?;
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CRM_CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

fn resolve_secret(env_var: &str, file: Option<&Path>, field: &str) -> common::Result<Secret<String>> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.trim().is_empty() {
            return Ok(Secret::new(value));
        }
    }
    if let Some(file) = file {
        let value = std::fs::read_to_string(file).map_err(|e| {
            common::Error::Config(format!("failed to read {field}_file {}: {e}", file.display()))
        })?;
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }
    Err(common::Error::Config(format!(
        "{field} is not set: export {env_var} or point auth.{field}_file at a file"
    )))
}
