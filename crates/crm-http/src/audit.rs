//! Audit trail for API calls
//!
//! One event per attempt. Caller context is merged from the configured
//! provider and the request, then passed through [`RedactionConfig`] before
//! it reaches the sink.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common::{RedactionConfig, Region};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::mapping::{request_id, sanitize_path};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub timestamp_ms: u64,
    pub method: String,
    /// Query string stripped.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub region: Region,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes each event as one JSON line on the `crm_audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(line) => info!(target: "crm_audit", event = %line, "audit"),
            Err(e) => warn!(target: "crm_audit", error = %e, "failed to serialize audit event"),
        }
    }
}

/// Extra context attached to every event (tenant, user, ...).
pub type ContextProvider = Arc<dyn Fn() -> Option<Map<String, Value>> + Send + Sync>;

#[derive(Clone)]
pub struct AuditConfig {
    pub sink: Arc<dyn AuditSink>,
    pub context_provider: Option<ContextProvider>,
    pub redaction: RedactionConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: Arc::new(TracingAuditSink),
            context_provider: None,
            redaction: RedactionConfig::default(),
        }
    }
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfig")
            .field("context_provider", &self.context_provider.is_some())
            .field("redaction", &self.redaction)
            .finish_non_exhaustive()
    }
}

/// Attempt outcome as seen by the audit trail.
pub(crate) struct AuditOutcome<'a> {
    pub success: bool,
    pub status: Option<u16>,
    pub duration: Duration,
    pub headers: Option<&'a BTreeMap<String, String>>,
    pub error_name: Option<&'a str>,
}

impl AuditConfig {
    pub(crate) fn emit(
        &self,
        method: &str,
        path: &str,
        region: Region,
        request_context: Option<&Map<String, Value>>,
        outcome: AuditOutcome<'_>,
    ) {
        let event = AuditEvent {
            timestamp_ms: now_millis(),
            method: method.to_string(),
            path: sanitize_path(path),
            status: outcome.status,
            duration_ms: Some(u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX)),
            success: outcome.success,
            region,
            request_id: outcome.headers.and_then(request_id),
            error_name: outcome.error_name.map(str::to_string),
            context: self.context(request_context),
        };
        self.sink.record(&event);
    }

    /// Provider context overlaid with request context, redacted.
    fn context(&self, request_context: Option<&Map<String, Value>>) -> Option<Value> {
        let mut merged = self
            .context_provider
            .as_ref()
            .and_then(|provider| provider())
            .unwrap_or_default();
        if let Some(extra) = request_context {
            merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if merged.is_empty() {
            return None;
        }
        Some(self.redaction.redact(&Value::Object(merged)))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
