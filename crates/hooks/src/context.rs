//! Data handed to hooks at each lifecycle point

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Region, Secret};
use serde_json::Value;

/// Mutable view of an outgoing request. Changes made by a hook are what the
/// executor sends.
#[derive(Debug, Clone)]
pub struct BeforeRequestContext {
    pub method: String,
    pub path: String,
    pub params: Vec<(String, String)>,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub region: Region,
    pub attempt: u32,
    pub context: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct AfterResponseContext {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Decoded body; `Null` for raw (streamed) responses.
    pub data: Value,
    pub duration: Option<Duration>,
    pub region: Region,
    pub attempt: u32,
    pub context: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub method: String,
    pub path: String,
    pub error: Arc<dyn std::error::Error + Send + Sync>,
    /// Machine-readable error code.
    pub code: String,
    pub status: Option<u16>,
    pub duration: Option<Duration>,
    pub region: Region,
    pub attempt: u32,
    pub context: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct CredentialRefreshContext {
    pub cache_key: String,
    pub token: Secret<String>,
    /// Unix milliseconds.
    pub expires_at_ms: u64,
    pub token_type: String,
    pub region: Region,
}

/// Response a before-request hook supplies instead of a network call.
#[derive(Debug, Clone, Default)]
pub struct ResponseOverride {
    pub data: Value,
    pub status: Option<u16>,
    pub headers: Option<BTreeMap<String, String>>,
}

impl ResponseOverride {
    pub fn json(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Fill in status 200 and empty headers where the hook left them unset.
    pub fn normalize(self) -> OverrideResponse {
        OverrideResponse {
            data: self.data,
            status: self.status.unwrap_or(200),
            headers: self.headers.unwrap_or_default(),
        }
    }
}

/// Normalized override, as the executor consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideResponse {
    pub data: Value,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}
