//! Request description, response envelopes and retry policy

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::Schema;
use futures::stream::BoxStream;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};

/// API path inserted when a request path does not name one.
pub const DEFAULT_API_PATH: &str = "/crm/v2";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `Authorization` scheme the API expects in front of the access token.
pub const DEFAULT_AUTH_SCHEME: &str = "Zoho-oauthtoken";

/// One logical API call. Cloned per attempt; hooks see and may change a copy.
#[derive(Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Relative (`/Leads`), API-qualified (`/crm/v8/Leads`) or absolute URL.
    pub path: String,
    pub params: Vec<(String, String)>,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub(crate) body_error: Option<String>,
    /// Per-request override of the executor timeout.
    pub timeout: Option<Duration>,
    pub schema: Option<Arc<dyn Schema>>,
    /// Caller metadata forwarded to hooks and (redacted) to audit events.
    pub context: Option<Map<String, Value>>,
    /// Credential cache key the token is fetched under.
    pub credential_key: String,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            body_error: None,
            timeout: None,
            schema: None,
            context: None,
            credential_key: crm_auth::DEFAULT_CACHE_KEY.to_string(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Add a query parameter only when `value` is present.
    pub fn param_opt(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self.body_error = None;
        self
    }

    /// Serialize `body` as the JSON payload.
    ///
    /// A value that cannot be represented as JSON fails the request with
    /// `InputValidation` before anything is sent.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => {
                self.body = Some(value);
                self.body_error = None;
            }
            Err(e) => {
                self.body = None;
                self.body_error = Some(e.to_string());
            }
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn credential_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = key.into();
        self
    }
}

impl fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("schema", &self.schema.as_ref().map(|s| s.name().to_string()))
            .field("credential_key", &self.credential_key)
            .finish_non_exhaustive()
    }
}

/// Decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope<T> {
    pub data: T,
    pub status: u16,
    /// Lowercased header names; repeated headers joined with `", "`.
    pub headers: BTreeMap<String, String>,
}

/// Unconsumed response body.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

pub struct RawResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ByteStream,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_millis(2000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(2000));
    }

    #[test]
    fn builder_normalizes_headers_and_skips_missing_params() {
        let spec = RequestSpec::get("/Leads")
            .header("X-Custom", "1")
            .param("page", 2)
            .param_opt("fields", None::<&str>)
            .param_opt("sort_by", Some("Created_Time"));
        assert_eq!(spec.headers.get("x-custom").map(String::as_str), Some("1"));
        assert_eq!(
            spec.params,
            vec![
                ("page".to_string(), "2".to_string()),
                ("sort_by".to_string(), "Created_Time".to_string())
            ]
        );
        assert_eq!(spec.credential_key, "default");
    }

    #[test]
    fn json_body_records_serialization_failure() {
        let ok = RequestSpec::post("/Leads").json(&json!({ "data": [] }));
        assert!(ok.body.is_some());
        assert!(ok.body_error.is_none());

        let bad_keys = BTreeMap::from([((1, 2), "tuple keys are not JSON")]);
        let bad = RequestSpec::post("/Leads").json(&bad_keys);
        assert!(bad.body.is_none());
        assert!(bad.body_error.is_some());
    }
}
