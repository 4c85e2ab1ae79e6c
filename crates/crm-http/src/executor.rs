//! Retrying request executor
//!
//! One logical request runs as up to `max_retries + 1` attempts. Each attempt
//! is admitted separately by the rate limiter, so retries are paced like any
//! other call. Within an attempt every suspension point races the executor's
//! cancellation token; `close()` therefore aborts in-flight exchanges with
//! `ClientClosed` rather than a network error.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use common::schema::describe_type;
use common::{Region, ValidationIssue, ValidationMode};
use crm_auth::TokenProvider;
use futures::{StreamExt, TryStreamExt, stream};
use hooks::{AfterResponseContext, BeforeRequestContext, ErrorContext, HookPipeline};
use rate_limiter::RateLimiter;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditConfig, AuditOutcome};
use crate::error::{Error, Result};
use crate::mapping::{build_url, map_status, normalize_headers, read_json_safely, sanitize_path};
use crate::metrics;
use crate::request::{
    ByteStream, DEFAULT_API_PATH, DEFAULT_AUTH_SCHEME, DEFAULT_TIMEOUT, RawResponse, RequestSpec,
    ResponseEnvelope, RetryPolicy,
};

pub struct RequestExecutorOptions {
    pub region: Region,
    /// Replaces the region's API base URL (proxies, tests).
    pub api_base_url: Option<String>,
    pub default_api_path: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Permit `http://` URLs. Local testing only.
    pub allow_insecure_http: bool,
    pub auth_scheme: String,
    /// Attempts at least this slow are logged at `warn`.
    pub slow_request_threshold: Option<Duration>,
    pub validation_mode: ValidationMode,
    pub limiter: Option<RateLimiter>,
    pub hooks: HookPipeline,
    /// Audit trail; disabled when `None`.
    pub audit: Option<AuditConfig>,
    pub http_client: Option<reqwest::Client>,
}

impl Default for RequestExecutorOptions {
    fn default() -> Self {
        Self {
            region: Region::default(),
            api_base_url: None,
            default_api_path: DEFAULT_API_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            allow_insecure_http: false,
            auth_scheme: DEFAULT_AUTH_SCHEME.to_string(),
            slow_request_threshold: None,
            validation_mode: ValidationMode::default(),
            limiter: None,
            hooks: HookPipeline::default(),
            audit: None,
            http_client: None,
        }
    }
}

impl fmt::Debug for RequestExecutorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutorOptions")
            .field("region", &self.region)
            .field("api_base_url", &self.api_base_url)
            .field("default_api_path", &self.default_api_path)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .field("slow_request_threshold", &self.slow_request_threshold)
            .field("validation_mode", &self.validation_mode)
            .field("limiter", &self.limiter.as_ref().map(|l| l.scope().to_string()))
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

/// What a successful attempt produced, before hooks and audit see it.
struct Completed<B> {
    status: u16,
    headers: BTreeMap<String, String>,
    body: B,
    /// Data handed to after-response hooks.
    hook_data: Value,
}

/// A failed attempt, with whatever response metadata arrived.
struct Failed {
    error: Error,
    status: Option<u16>,
    headers: Option<BTreeMap<String, String>>,
}

impl Failed {
    fn http(error: Error, status: u16, headers: BTreeMap<String, String>) -> Self {
        Self {
            error,
            status: Some(status),
            headers: Some(headers),
        }
    }
}

impl From<Error> for Failed {
    fn from(error: Error) -> Self {
        Self {
            error,
            status: None,
            headers: None,
        }
    }
}

struct Inner {
    client: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    region: Region,
    base_url: String,
    default_api_path: String,
    timeout: Duration,
    retry: RetryPolicy,
    allow_insecure_http: bool,
    auth_scheme: String,
    slow_request_threshold: Option<Duration>,
    validation_mode: ValidationMode,
    limiter: Option<RateLimiter>,
    hooks: HookPipeline,
    audit: Option<AuditConfig>,
    active: AtomicUsize,
    cancel: CancellationToken,
}

/// Executes API requests with retries, hooks, audit and metrics.
///
/// Cheap to clone; clones share the connection pool and the closed state.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<Inner>,
}

impl RequestExecutor {
    pub fn new(options: RequestExecutorOptions, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        if options.timeout.is_zero() {
            return Err(Error::input("timeout", "request timeout must be greater than zero"));
        }
        let base_url = options
            .api_base_url
            .unwrap_or_else(|| options.region.api_base_url().to_string());
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(Error::input(
                "api_base_url",
                format!("API base URL must be http(s), got \"{base_url}\""),
            ));
        }
        let client = match options.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(|e| Error::request(format!("failed to build HTTP client: {e}"), None, None))?,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                tokens,
                region: options.region,
                base_url: base_url.trim_end_matches('/').to_string(),
                default_api_path: options.default_api_path,
                timeout: options.timeout,
                retry: options.retry,
                allow_insecure_http: options.allow_insecure_http,
                auth_scheme: options.auth_scheme,
                slow_request_threshold: options.slow_request_threshold,
                validation_mode: options.validation_mode,
                limiter: options.limiter,
                hooks: options.hooks,
                audit: options.audit,
                active: AtomicUsize::new(0),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Run `spec` and decode the response body into `T`.
    ///
    /// Use `T = serde_json::Value` to skip typed decoding.
    pub async fn request<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<ResponseEnvelope<T>> {
        let inner = &*self.inner;
        let spec = &spec;
        let done = inner
            .with_retries(spec, move |attempt| inner.attempt_json(spec, attempt))
            .await?;

        let actual = describe_type(&done.body);
        let data = serde_json::from_value(done.body).map_err(|e| {
            let target = std::any::type_name::<T>().to_string();
            Error::SchemaMismatch {
                issues: vec![ValidationIssue {
                    path: "/".into(),
                    expected: target.clone(),
                    actual,
                    message: format!("/: {e}"),
                }],
                schema: target,
            }
        })?;
        Ok(ResponseEnvelope {
            data,
            status: done.status,
            headers: done.headers,
        })
    }

    /// Run `spec` and hand back the unread response body.
    pub async fn request_raw(&self, spec: RequestSpec) -> Result<RawResponse> {
        let inner = &*self.inner;
        let spec = &spec;
        let done = inner
            .with_retries(spec, move |attempt| inner.attempt_raw(spec, attempt))
            .await?;
        Ok(RawResponse {
            status: done.status,
            headers: done.headers,
            body: done.body,
        })
    }

    /// Abort in-flight attempts and reject every later call with `ClientClosed`.
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(active = self.active_requests(), "request executor closed");
        }
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn region(&self) -> Region {
        self.inner.region
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.inner.hooks
    }

    /// Network exchanges currently awaiting a response.
    pub fn active_requests(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("region", &self.inner.region)
            .field("base_url", &self.inner.base_url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn with_retries<R, F, Fut>(&self, spec: &RequestSpec, mut attempt_fn: F) -> Result<R>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match &self.limiter {
                Some(limiter) => match limiter.schedule(|| attempt_fn(attempt)).await {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                },
                None => attempt_fn(attempt).await,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.retry.max_retries {
                self.log_failure(spec, attempt, &err);
                return Err(err);
            }

            let delay = self.retry.backoff(attempt);
            metrics::record_retry(spec.method.as_str());
            debug!(
                method = %spec.method,
                path = %sanitize_path(&spec.path),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying CRM request"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::ClientClosed),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    #[instrument(skip_all, fields(method = %spec.method, path = %sanitize_path(&spec.path), attempt = attempt))]
    async fn attempt_json(&self, spec: &RequestSpec, attempt: u32) -> Result<Completed<Value>> {
        self.ensure_open()?;
        let start = Instant::now();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Failed::from(Error::ClientClosed)),
            outcome = self.exchange_json(spec, attempt) => outcome,
        };
        self.settle(spec, attempt, start, outcome).await
    }

    #[instrument(skip_all, fields(method = %spec.method, path = %sanitize_path(&spec.path), attempt = attempt))]
    async fn attempt_raw(&self, spec: &RequestSpec, attempt: u32) -> Result<Completed<ByteStream>> {
        self.ensure_open()?;
        let start = Instant::now();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Failed::from(Error::ClientClosed)),
            outcome = self.exchange_raw(spec, attempt) => outcome,
        };
        self.settle(spec, attempt, start, outcome).await
    }

    async fn exchange_json(
        &self,
        spec: &RequestSpec,
        attempt: u32,
    ) -> std::result::Result<Completed<Value>, Failed> {
        let mut ctx = self.before_context(spec, attempt);
        if let Some(response) = self.hooks.run_before_request(&mut ctx).await {
            debug!("before-request hook answered; skipping network call");
            let data = self.validate(spec, response.data)?;
            return Ok(Completed {
                status: response.status,
                headers: response.headers,
                hook_data: data.clone(),
                body: data,
            });
        }

        let _active = ActiveRequest::start(&self.active);
        let timeout = ctx.timeout.unwrap_or(self.timeout);
        let response = self.send(spec, &ctx).await?;
        let status = response.status().as_u16();
        let headers = normalize_headers(response.headers());
        let bytes = match tokio::time::timeout(timeout, response.bytes()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(Failed::http(transport_error(e), status, headers)),
            Err(_) => return Err(Failed::http(Error::timeout(), status, headers)),
        };
        let payload = read_json_safely(&bytes);

        if !(200..300).contains(&status) {
            let error = map_status(status, &payload, &headers, &ctx.path);
            return Err(Failed::http(error, status, headers));
        }
        match self.validate(spec, payload) {
            Ok(data) => Ok(Completed {
                status,
                headers,
                hook_data: data.clone(),
                body: data,
            }),
            Err(error) => Err(Failed::http(error, status, headers)),
        }
    }

    async fn exchange_raw(
        &self,
        spec: &RequestSpec,
        attempt: u32,
    ) -> std::result::Result<Completed<ByteStream>, Failed> {
        let mut ctx = self.before_context(spec, attempt);
        if let Some(response) = self.hooks.run_before_request(&mut ctx).await {
            debug!("before-request hook answered; skipping network call");
            return Ok(Completed {
                status: response.status,
                headers: response.headers,
                body: override_stream(&response.data),
                hook_data: response.data,
            });
        }

        let _active = ActiveRequest::start(&self.active);
        let timeout = ctx.timeout.unwrap_or(self.timeout);
        let response = self.send(spec, &ctx).await?;
        let status = response.status().as_u16();
        let headers = normalize_headers(response.headers());

        if !(200..300).contains(&status) {
            let bytes = match tokio::time::timeout(timeout, response.bytes()).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    debug!(status, error = %e, "failed to read error response body");
                    Bytes::new()
                }
                Err(_) => {
                    debug!(status, "timed out reading error response body");
                    Bytes::new()
                }
            };
            let error = map_status(status, &read_json_safely(&bytes), &headers, &ctx.path);
            return Err(Failed::http(error, status, headers));
        }

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(transport_error(e)))
            .boxed();
        let body = guard_body(body, self.cancel.clone(), timeout);
        Ok(Completed {
            status,
            headers,
            body,
            hook_data: Value::Null,
        })
    }

    /// Build and send the request described by the (hook-edited) context.
    ///
    /// Local checks run before the token is fetched, so malformed input never
    /// causes network I/O. The timeout bounds the wait for response headers
    /// only; callers bound the body themselves.
    async fn send(
        &self,
        spec: &RequestSpec,
        ctx: &BeforeRequestContext,
    ) -> std::result::Result<reqwest::Response, Failed> {
        let method = Method::from_bytes(ctx.method.as_bytes())
            .map_err(|_| Error::input("method", format!("unsupported HTTP method \"{}\"", ctx.method)))?;
        let url = build_url(&self.base_url, &self.default_api_path, &ctx.path, &ctx.params)?;
        if url.scheme() == "http" && !self.allow_insecure_http {
            return Err(Error::input(
                "path",
                format!(
                    "insecure URL detected for path \"{}\"; use HTTPS or enable allow_insecure_http",
                    ctx.path
                ),
            )
            .into());
        }

        if let (None, Some(reason)) = (&ctx.body, &spec.body_error) {
            return Err(Error::input(
                "body",
                format!("request body could not be serialized as JSON: {reason}"),
            )
            .into());
        }
        let body = ctx
            .body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| Error::input("body", format!("request body could not be serialized as JSON: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &ctx.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::input("headers", format!("invalid header name \"{name}\": {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::input("headers", format!("invalid value for header \"{name}\": {e}")))?;
            headers.insert(header_name, header_value);
        }
        if body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let token = self
            .tokens
            .access_token(&spec.credential_key)
            .await
            .map_err(Error::from)?;
        let mut authorization = HeaderValue::from_str(&format!("{} {token}", self.auth_scheme))
            .map_err(|_| Error::Credential {
                message: "access token is not a valid header value".into(),
                status: None,
                code: None,
            })?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);

        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        match tokio::time::timeout(ctx.timeout.unwrap_or(self.timeout), request.send()).await {
            Ok(sent) => sent.map_err(|e| Failed::from(transport_error(e))),
            Err(_) => Err(Error::timeout().into()),
        }
    }

    /// Run after-response or on-error hooks, audit and metrics for one attempt.
    async fn settle<B>(
        &self,
        spec: &RequestSpec,
        attempt: u32,
        start: Instant,
        outcome: std::result::Result<Completed<B>, Failed>,
    ) -> Result<Completed<B>> {
        let duration = start.elapsed();
        let method = spec.method.as_str();
        let context = spec.context.clone().map(Value::Object);

        match outcome {
            Ok(mut done) => {
                self.hooks
                    .run_after_response(&AfterResponseContext {
                        method: method.to_string(),
                        path: spec.path.clone(),
                        status: done.status,
                        headers: done.headers.clone(),
                        data: std::mem::take(&mut done.hook_data),
                        duration: Some(duration),
                        region: self.region,
                        attempt,
                        context,
                    })
                    .await;
                self.audit(
                    spec,
                    AuditOutcome {
                        success: true,
                        status: Some(done.status),
                        duration,
                        headers: Some(&done.headers),
                        error_name: None,
                    },
                );
                metrics::record_request(method, done.status, duration.as_secs_f64());
                debug!(status = done.status, "CRM request succeeded");
                self.check_slow(spec, duration, Some(done.status));
                Ok(done)
            }
            Err(Failed {
                error,
                status,
                headers,
            }) => {
                if matches!(error, Error::Credential { status: Some(401), .. }) {
                    self.tokens.invalidate(&spec.credential_key);
                }
                self.hooks
                    .run_on_error(&ErrorContext {
                        method: method.to_string(),
                        path: spec.path.clone(),
                        error: Arc::new(error.clone()),
                        code: error.code().to_string(),
                        status: error.status(),
                        duration: Some(duration),
                        region: self.region,
                        attempt,
                        context,
                    })
                    .await;
                self.audit(
                    spec,
                    AuditOutcome {
                        success: false,
                        status,
                        duration,
                        headers: headers.as_ref(),
                        error_name: Some(error.kind()),
                    },
                );
                if let Some(status) = status {
                    metrics::record_request(method, status, duration.as_secs_f64());
                }
                metrics::record_error(method, error.kind());
                self.check_slow(spec, duration, status);
                Err(error)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    fn before_context(&self, spec: &RequestSpec, attempt: u32) -> BeforeRequestContext {
        BeforeRequestContext {
            method: spec.method.to_string(),
            path: spec.path.clone(),
            params: spec.params.clone(),
            headers: spec.headers.clone(),
            body: spec.body.clone(),
            timeout: spec.timeout,
            region: self.region,
            attempt,
            context: spec.context.clone().map(Value::Object),
        }
    }

    fn validate(&self, spec: &RequestSpec, payload: Value) -> Result<Value> {
        let Some(schema) = &spec.schema else {
            return Ok(payload);
        };
        schema
            .validate(&payload, self.validation_mode)
            .map_err(|issues| Error::SchemaMismatch {
                schema: schema.name().to_string(),
                issues,
            })
    }

    fn audit(&self, spec: &RequestSpec, outcome: AuditOutcome<'_>) {
        if let Some(audit) = &self.audit {
            audit.emit(
                spec.method.as_str(),
                &spec.path,
                self.region,
                spec.context.as_ref(),
                outcome,
            );
        }
    }

    fn check_slow(&self, spec: &RequestSpec, duration: Duration, status: Option<u16>) {
        let Some(threshold) = self.slow_request_threshold else {
            return;
        };
        if duration >= threshold {
            warn!(
                method = %spec.method,
                path = %sanitize_path(&spec.path),
                status,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "slow CRM request detected"
            );
        }
    }

    /// Final outcome after retries: `error` for server-side or unknown
    /// status, `warn` for client errors.
    fn log_failure(&self, spec: &RequestSpec, attempt: u32, err: &Error) {
        let path = sanitize_path(&spec.path);
        match err.status() {
            Some(status) if status < 500 => warn!(
                method = %spec.method,
                path = %path,
                status,
                code = err.code(),
                attempts = attempt + 1,
                error = %err,
                "CRM request failed"
            ),
            status => error!(
                method = %spec.method,
                path = %path,
                status,
                code = err.code(),
                attempts = attempt + 1,
                error = %err,
                "CRM request failed"
            ),
        }
    }
}

/// Keeps the active-request gauge in step with live exchanges.
struct ActiveRequest<'a>(&'a AtomicUsize);

impl<'a> ActiveRequest<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_requests(active);
        Self(counter)
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        let active = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_active_requests(active);
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout()
    } else if err.is_builder() {
        Error::input("path", err.without_url().to_string())
    } else {
        Error::network(err.without_url())
    }
}

/// Raw body as handed to callers. Closing the executor yields one
/// `ClientClosed` item and ends the stream; `idle` without a chunk yields a
/// timeout. The stream also ends after the first transport error.
fn guard_body(body: ByteStream, cancel: CancellationToken, idle: Duration) -> ByteStream {
    stream::unfold(Some(body), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut body = state?;
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(std::io::Error::other(Error::ClientClosed)),
                next = tokio::time::timeout(idle, body.next()) => match next {
                    Ok(Some(item)) => item,
                    Ok(None) => return None,
                    Err(_) => Err(std::io::Error::other(Error::timeout())),
                },
            };
            let rest = item.is_ok().then_some(body);
            Some((item, rest))
        }
    })
    .boxed()
}

/// Body stream for a hook-supplied raw response: strings as-is, null as
/// empty, anything else as JSON text.
fn override_stream(data: &Value) -> ByteStream {
    let chunk = match data {
        Value::Null => None,
        Value::String(text) => Some(Bytes::from(text.clone())),
        other => Some(Bytes::from(other.to_string())),
    };
    stream::iter(chunk.map(Ok)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, AuditSink};
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use common::JsonSchema;
    use crm_auth::StaticToken;
    use hooks::{HookResult, Hooks, ResponseOverride};
    use parking_lot::Mutex;
    use rate_limiter::RateLimiterOptions;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    struct Seen {
        uri: String,
        authorization: Option<String>,
        content_type: Option<String>,
        body: String,
    }

    /// Scripted API: pops one `(status, body)` per call, then answers 200.
    #[derive(Clone, Default)]
    struct MockApi {
        script: Arc<Mutex<VecDeque<(u16, Value)>>>,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<Seen>>>,
        delay: Duration,
    }

    impl MockApi {
        fn scripted(responses: Vec<(u16, Value)>) -> Self {
            Self {
                script: Arc::new(Mutex::new(responses.into())),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn handle(State(api): State<MockApi>, uri: Uri, headers: AxumHeaders, body: String) -> Response {
        api.calls.fetch_add(1, Ordering::SeqCst);
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        api.seen.lock().push(Seen {
            uri: uri.to_string(),
            authorization: header("authorization"),
            content_type: header("content-type"),
            body,
        });
        if !api.delay.is_zero() {
            tokio::time::sleep(api.delay).await;
        }
        let (status, body) = api
            .script
            .lock()
            .pop_front()
            .unwrap_or((200, json!({ "data": [] })));
        (
            StatusCode::from_u16(status).unwrap(),
            [("x-request-id", "req-test"), ("retry-after", "3")],
            Json(body),
        )
            .into_response()
    }

    async fn spawn_api(api: MockApi) -> String {
        let app = Router::new().fallback(handle).with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn options(base_url: &str) -> RequestExecutorOptions {
        RequestExecutorOptions {
            api_base_url: Some(base_url.to_string()),
            allow_insecure_http: true,
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            ..RequestExecutorOptions::default()
        }
    }

    fn build(options: RequestExecutorOptions) -> RequestExecutor {
        let tokens = Arc::new(StaticToken::new("1000.test").unwrap());
        RequestExecutor::new(options, tokens).unwrap()
    }

    fn server_error() -> (u16, Value) {
        (500, json!({ "code": "INTERNAL_ERROR", "message": "try again", "status": "error" }))
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let api = MockApi::scripted(vec![
            server_error(),
            server_error(),
            (200, json!({ "data": [{ "id": "1" }] })),
        ]);
        let executor = build(options(&spawn_api(api.clone()).await));

        let response = executor
            .request::<Value>(RequestSpec::get("/Leads"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data["data"][0]["id"], "1");
        assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("req-test"));
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn stops_after_max_retries() {
        let api = MockApi::scripted(vec![server_error(); 5]);
        let executor = build(options(&spawn_api(api.clone()).await));

        let err = executor
            .request::<Value>(RequestSpec::get("/Leads"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let api = MockApi::scripted(vec![(
            400,
            json!({ "data": [{ "code": "MANDATORY_NOT_FOUND", "message": "required field not found",
                "status": "error", "details": { "api_name": "Last_Name" } }] }),
        )]);
        let executor = build(options(&spawn_api(api.clone()).await));

        let err = executor
            .request::<Value>(RequestSpec::post("/Leads").body(json!({ "data": [{}] })))
            .await
            .unwrap_err();
        match err {
            Error::Validation { field_errors, .. } => assert!(field_errors.contains_key("Last_Name")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after_and_is_not_retried() {
        let api = MockApi::scripted(vec![(429, json!({}))]);
        let executor = build(options(&spawn_api(api.clone()).await));

        let err = executor
            .request::<Value>(RequestSpec::get("/Leads"))
            .await
            .unwrap_err();
        match err {
            Error::RateLimit { retry_after, .. } => assert_eq!(retry_after, Some(Duration::from_secs(3))),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn sends_token_default_path_params_and_json_body() {
        let api = MockApi::default();
        let executor = build(options(&spawn_api(api.clone()).await));

        executor
            .request::<Value>(RequestSpec::get("Leads").param("page", 2))
            .await
            .unwrap();
        executor
            .request::<Value>(RequestSpec::post("/crm/v8/Deals").json(&json!({ "data": [{ "Deal_Name": "x" }] })))
            .await
            .unwrap();

        let seen = api.seen.lock().clone();
        assert_eq!(seen[0].uri, "/crm/v2/Leads?page=2");
        assert_eq!(seen[0].authorization.as_deref(), Some("Zoho-oauthtoken 1000.test"));
        assert_eq!(seen[0].content_type, None);
        assert_eq!(seen[1].uri, "/crm/v8/Deals");
        assert_eq!(seen[1].content_type.as_deref(), Some("application/json"));
        assert_eq!(seen[1].body, r#"{"data":[{"Deal_Name":"x"}]}"#);
    }

    #[tokio::test]
    async fn not_found_reports_resource_and_runs_error_hooks() {
        let api = MockApi::scripted(vec![(404, json!({}))]);
        let executor = build(options(&spawn_api(api.clone()).await));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        executor.hooks().register_hooks(
            "observer",
            Hooks::new().on_error(move |ctx: &ErrorContext| -> HookResult<()> {
                sink.lock().push((ctx.code.clone(), ctx.status, ctx.attempt));
                Ok(())
            }),
        );

        let err = executor
            .request::<Value>(RequestSpec::get("/Leads/4150868000001"))
            .await
            .unwrap_err();
        match err {
            Error::NotFound { resource, id, .. } => {
                assert_eq!(resource.as_deref(), Some("Leads"));
                assert_eq!(id.as_deref(), Some("4150868000001"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            observed.lock().clone(),
            vec![("NOT_FOUND".to_string(), Some(404), 0)]
        );
    }

    #[tokio::test]
    async fn before_request_override_skips_the_network() {
        let api = MockApi::default();
        let executor = build(options(&spawn_api(api.clone()).await));
        let after = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&after);
        executor.hooks().register_hooks(
            "cache",
            Hooks::new()
                .before_request(
                    |_: &mut BeforeRequestContext| -> HookResult<Option<ResponseOverride>> {
                        Ok(Some(ResponseOverride::json(json!({ "data": [{ "id": "cached" }] }))))
                    },
                )
                .after_response(move |ctx: &AfterResponseContext| -> HookResult<()> {
                    seen.lock().push((ctx.status, ctx.data.clone()));
                    Ok(())
                }),
        );

        let response = executor
            .request::<Value>(RequestSpec::get("/Leads"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data["data"][0]["id"], "cached");
        assert_eq!(api.calls(), 0);
        assert_eq!(after.lock()[0].0, 200);
    }

    #[tokio::test]
    async fn hooks_can_rewrite_the_request() {
        let api = MockApi::default();
        let executor = build(options(&spawn_api(api.clone()).await));
        executor.hooks().register_hooks(
            "rewrite",
            Hooks::new().before_request(
                |ctx: &mut BeforeRequestContext| -> HookResult<Option<ResponseOverride>> {
                    ctx.params.push(("fields".into(), "Email".into()));
                    ctx.headers.insert("x-trace".into(), "abc".into());
                    Ok(None)
                },
            ),
        );

        executor
            .request::<Value>(RequestSpec::get("/Contacts"))
            .await
            .unwrap();
        assert_eq!(api.seen.lock()[0].uri, "/crm/v2/Contacts?fields=Email");
    }

    #[tokio::test]
    async fn insecure_http_is_rejected_before_io() {
        let api = MockApi::default();
        let mut opts = options(&spawn_api(api.clone()).await);
        opts.allow_insecure_http = false;
        let executor = build(opts);

        let err = executor
            .request::<Value>(RequestSpec::get("/Leads"))
            .await
            .unwrap_err();
        match err {
            Error::InputValidation { field_errors, .. } => assert!(field_errors.contains_key("path")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn unserializable_body_fails_before_io() {
        let api = MockApi::default();
        let executor = build(options(&spawn_api(api.clone()).await));
        let bad = BTreeMap::from([((1, 2), "tuple keys")]);

        let err = executor
            .request::<Value>(RequestSpec::post("/Leads").json(&bad))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert!(!err.is_retryable());
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn timeout_is_distinct_and_not_retried() {
        let api = MockApi {
            delay: Duration::from_millis(500),
            ..MockApi::default()
        };
        let executor = build(options(&spawn_api(api.clone()).await));

        let err = executor
            .request::<Value>(RequestSpec::get("/Leads").timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(408));
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn close_aborts_in_flight_and_rejects_new_requests() {
        let api = MockApi {
            delay: Duration::from_secs(5),
            ..MockApi::default()
        };
        let executor = build(options(&spawn_api(api.clone()).await));

        let in_flight = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.request::<Value>(RequestSpec::get("/Leads")).await })
        };
        while api.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        executor.close();

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ClientClosed), "got {err:?}");
        assert!(matches!(
            executor.request::<Value>(RequestSpec::get("/Leads")).await,
            Err(Error::ClientClosed)
        ));
        assert_eq!(executor.active_requests(), 0);
    }

    #[tokio::test]
    async fn schema_mismatch_is_not_retried() {
        let api = MockApi::scripted(vec![(200, json!({ "records": [] }))]);
        let executor = build(options(&spawn_api(api.clone()).await));
        let schema = JsonSchema::shared(
            "LeadList",
            &json!({ "type": "object", "required": ["data"] }),
        )
        .unwrap();

        let err = executor
            .request::<Value>(RequestSpec::get("/Leads").schema(schema))
            .await
            .unwrap_err();
        match err {
            Error::SchemaMismatch { schema, issues } => {
                assert_eq!(schema, "LeadList");
                assert!(!issues.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn typed_decoding_failure_is_a_schema_mismatch() {
        #[derive(Debug, serde::Deserialize)]
        struct Page {
            #[allow(dead_code)]
            data: Vec<String>,
        }
        let api = MockApi::scripted(vec![(200, json!({ "data": [1, 2] }))]);
        let executor = build(options(&spawn_api(api.clone()).await));

        let err = executor
            .request::<Page>(RequestSpec::get("/Leads"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_MISMATCH");
    }

    #[tokio::test]
    async fn raw_response_streams_body() {
        let api = MockApi::scripted(vec![(200, json!({ "id": 1 }))]);
        let executor = build(options(&spawn_api(api.clone()).await));

        let raw = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap();
        assert_eq!(raw.status, 200);
        let chunks: Vec<Bytes> = raw.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), br#"{"id":1}"#.to_vec());
    }

    /// Serves `count` NDJSON lines on every path, one every `every`.
    async fn spawn_slow_body(count: usize, every: Duration) -> String {
        let app = Router::new().fallback(move || async move {
            let lines = stream::unfold(0, move |n| async move {
                if n == count {
                    return None;
                }
                tokio::time::sleep(every).await;
                let line = Bytes::from(format!("{{\"id\":{n}}}\n"));
                Some((Ok::<_, std::io::Error>(line), n + 1))
            });
            axum::body::Body::from_stream(lines)
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn inner_error(err: &std::io::Error) -> Option<&Error> {
        err.get_ref().and_then(|e| e.downcast_ref::<Error>())
    }

    #[tokio::test]
    async fn raw_body_may_outlast_the_request_timeout() {
        let base_url = spawn_slow_body(6, Duration::from_millis(100)).await;
        let executor = build(RequestExecutorOptions {
            timeout: Duration::from_millis(300),
            ..options(&base_url)
        });

        let raw = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap();
        let chunks: Vec<Bytes> = raw.body.try_collect().await.unwrap();
        let body = String::from_utf8(chunks.concat()).unwrap();
        assert_eq!(body.lines().count(), 6);
        assert!(body.ends_with("{\"id\":5}\n"));
    }

    #[tokio::test]
    async fn stalled_raw_body_times_out() {
        let base_url = spawn_slow_body(2, Duration::from_millis(500)).await;
        let executor = build(RequestExecutorOptions {
            timeout: Duration::from_millis(100),
            ..options(&base_url)
        });

        let mut body = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap()
            .body;
        let err = body.next().await.unwrap().unwrap_err();
        let inner = inner_error(&err).unwrap();
        assert_eq!(inner.code(), "TIMEOUT");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn close_mid_body_yields_client_closed() {
        let base_url = spawn_slow_body(20, Duration::from_millis(20)).await;
        let executor = build(options(&base_url));

        let mut body = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap()
            .body;
        let mut lines = 0;
        while lines < 2 {
            let chunk = body.next().await.unwrap().unwrap();
            lines += chunk.iter().filter(|b| **b == b'\n').count();
        }
        executor.close();

        let err = body.next().await.unwrap().unwrap_err();
        assert!(matches!(inner_error(&err), Some(Error::ClientClosed)), "got {err:?}");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn raw_override_is_adapted_to_a_stream() {
        let api = MockApi::default();
        let executor = build(options(&spawn_api(api.clone()).await));
        executor.hooks().register_hooks(
            "fixture",
            Hooks::new().before_request(
                |_: &mut BeforeRequestContext| -> HookResult<Option<ResponseOverride>> {
                    Ok(Some(ResponseOverride::json(json!("{\"id\":1}\n{\"id\":2}\n"))))
                },
            ),
        );

        let raw = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap();
        let chunks: Vec<Bytes> = raw.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"{\"id\":1}\n{\"id\":2}\n".to_vec());
        assert_eq!(api.calls(), 0);

        let empty: Vec<Bytes> = override_stream(&Value::Null).try_collect().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn raw_error_status_is_mapped() {
        let api = MockApi::scripted(vec![(404, json!({}))]);
        let executor = build(options(&spawn_api(api.clone()).await));
        let err = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn raw_error_status_survives_a_broken_body() {
        let app = Router::new().fallback(|| async {
            let body = stream::iter([Ok(Bytes::from_static(b"{\"code\":"))]).chain(stream::once(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(std::io::Error::other("connection reset"))
            }));
            (StatusCode::NOT_FOUND, axum::body::Body::from_stream(body))
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let executor = build(options(&format!("http://{addr}")));

        let err = executor
            .request_raw(RequestSpec::get("/crm/bulk/v8/read/1/result"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.status(), Some(404));
    }

    #[derive(Default)]
    struct CaptureAudit(Mutex<Vec<AuditEvent>>);

    impl AuditSink for CaptureAudit {
        fn record(&self, event: &AuditEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[tokio::test]
    async fn audits_every_attempt() {
        let api = MockApi::scripted(vec![server_error(), (200, json!({ "data": [] }))]);
        let capture = Arc::new(CaptureAudit::default());
        let mut opts = options(&spawn_api(api.clone()).await);
        opts.audit = Some(AuditConfig {
            sink: capture.clone(),
            ..AuditConfig::default()
        });
        let executor = build(opts);

        let mut context = serde_json::Map::new();
        context.insert("access_token".into(), json!("1000.secret"));
        context.insert("job".into(), json!("nightly-sync"));
        executor
            .request::<Value>(RequestSpec::get("/Leads?email=x@y.z").context(context))
            .await
            .unwrap();

        let events = capture.0.lock();
        assert_eq!(events.len(), 2);
        assert!(!events[0].success);
        assert_eq!(events[0].status, Some(500));
        assert_eq!(events[0].error_name.as_deref(), Some("request"));
        assert!(events[1].success);
        assert_eq!(events[1].path, "/Leads");
        assert_eq!(events[1].request_id.as_deref(), Some("req-test"));
        let context = events[1].context.as_ref().unwrap();
        assert_eq!(context["access_token"], json!("[redacted]"));
        assert_eq!(context["job"], json!("nightly-sync"));
    }

    #[tokio::test]
    async fn closed_limiter_rejects_attempts() {
        let api = MockApi::default();
        let limiter = RateLimiter::new(RateLimiterOptions::new(10, Duration::from_secs(1)));
        limiter.close();
        let mut opts = options(&spawn_api(api.clone()).await);
        opts.limiter = Some(limiter);
        let executor = build(opts);

        assert!(matches!(
            executor.request::<Value>(RequestSpec::get("/Leads")).await,
            Err(Error::ClientClosed)
        ));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn retries_are_admitted_through_the_limiter() {
        let api = MockApi::scripted(vec![server_error(), (200, json!({ "data": [] }))]);
        let limiter = RateLimiter::new(RateLimiterOptions::new(1, Duration::from_millis(100)));
        let mut opts = options(&spawn_api(api.clone()).await);
        opts.limiter = Some(limiter);
        let executor = build(opts);

        let started = std::time::Instant::now();
        executor
            .request::<Value>(RequestSpec::get("/Leads"))
            .await
            .unwrap();
        assert_eq!(api.calls(), 2);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn rejects_zero_timeout_and_bad_base_url() {
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new("t").unwrap());
        let opts = RequestExecutorOptions {
            timeout: Duration::ZERO,
            ..RequestExecutorOptions::default()
        };
        assert!(RequestExecutor::new(opts, Arc::clone(&tokens)).is_err());

        let opts = RequestExecutorOptions {
            api_base_url: Some("ftp://example.test".into()),
            ..RequestExecutorOptions::default()
        };
        assert!(RequestExecutor::new(opts, tokens).is_err());
    }
}
