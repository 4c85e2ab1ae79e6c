//! Deprecation notices for legacy client entry points

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SUPPRESS_ENV_VAR: &str = "CRM_SUPPRESS_DEPRECATION_WARNINGS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeprecationConfig {
    pub enabled: bool,
    /// Log each `feature:removal_version` pair only once per client.
    pub emit_once: bool,
    /// Setting this variable to `1`, `true` or `yes` silences all notices.
    pub suppress_env_var: String,
}

impl Default for DeprecationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emit_once: true,
            suppress_env_var: DEFAULT_SUPPRESS_ENV_VAR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprecationNotice {
    pub feature: String,
    pub message: String,
    pub alternative: Option<String>,
    pub removal_version: Option<String>,
    pub reason: Option<String>,
}

impl DeprecationNotice {
    pub fn new(feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternative = Some(alternative.into());
        self
    }

    pub fn removal_version(mut self, version: impl Into<String>) -> Self {
        self.removal_version = Some(version.into());
        self
    }

    fn key(&self) -> String {
        format!(
            "{}:{}",
            self.feature,
            self.removal_version.as_deref().unwrap_or_default()
        )
    }

    fn render(&self) -> String {
        let mut parts = vec![format!("Deprecated: {}.", self.feature), self.message.clone()];
        if let Some(alternative) = &self.alternative {
            parts.push(format!("Use {alternative} instead."));
        }
        if let Some(version) = &self.removal_version {
            parts.push(format!("Removal target: {version}."));
        }
        parts.join(" ")
    }
}

/// Per-client deprecation logger.
#[derive(Debug, Default)]
pub struct Deprecations {
    config: DeprecationConfig,
    warned: Mutex<HashSet<String>>,
}

impl Deprecations {
    pub fn new(config: DeprecationConfig) -> Self {
        Self {
            config,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Log `notice` at `warn` unless suppressed. Returns whether it was logged.
    pub fn warn(&self, notice: &DeprecationNotice) -> bool {
        if self.suppressed() {
            return false;
        }
        let first = self.warned.lock().insert(notice.key());
        if self.config.emit_once && !first {
            return false;
        }
        warn!(
            feature = %notice.feature,
            alternative = notice.alternative.as_deref(),
            removal_version = notice.removal_version.as_deref(),
            reason = notice.reason.as_deref(),
            "{}",
            notice.render()
        );
        true
    }

    fn suppressed(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        std::env::var(&self.config.suppress_env_var)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}
