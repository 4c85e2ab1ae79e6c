//! Per-key access token cache with single-flight refresh
//!
//! The cache maps a cache key to a [`Credential`] and keeps an insertion
//! order list for FIFO eviction once `max_cached_tokens` is exceeded. Refreshes
//! are coalesced: while one refresh for a key is in flight, every other caller
//! for that key attaches to the same shared future and observes its outcome.
//!
//! Both maps sit behind short `parking_lot` critical sections that never span
//! an await point.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use common::{Region, Schema, Secret, ValidationMode};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_TOKEN_TYPE, EARLY_REFRESH_BUFFER};
use crate::error::{Error, Result};
use crate::token::{self, RefreshGrant, TokenResponse};

/// A cached access token.
///
/// `expires_at_ms` is a unix timestamp in milliseconds (absolute, not a delta).
/// Computed at storage time from `TokenResponse.expires_in` plus the current time.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: Secret<String>,
    pub expires_at_ms: u64,
    pub token_type: String,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at_ms: u64) -> Self {
        Self {
            token: Secret::new(token.into()),
            expires_at_ms,
            token_type: DEFAULT_TOKEN_TYPE.to_string(),
        }
    }

    /// Build from a token endpoint response received at `now_ms`.
    pub fn from_response(response: &TokenResponse, now_ms: u64) -> Self {
        Self {
            token: Secret::new(response.access_token.clone()),
            expires_at_ms: now_ms.saturating_add(response.expires_in.saturating_mul(1000)),
            token_type: response.token_type().to_string(),
        }
    }

    /// Still usable at `now_ms`, keeping the early-refresh buffer in reserve.
    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms
            .saturating_sub(EARLY_REFRESH_BUFFER.as_millis() as u64)
            > now_ms
    }
}

/// Caller-supplied store consulted before refreshing (hydration).
///
/// Returning a credential that is already inside the early-refresh buffer
/// is the same as returning `None`.
pub trait CredentialSource: Send + Sync {
    fn load<'a>(
        &'a self,
        cache_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + 'a>>;
}

/// Payload handed to refresh listeners after a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub cache_key: String,
    pub credential: Credential,
    pub response: TokenResponse,
    pub region: Region,
}

/// Error type listeners may return; it is logged and never propagated.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Notified after every successful refresh (persistence, hook fan-out).
pub trait RefreshListener: Send + Sync {
    fn on_refresh<'a>(
        &'a self,
        event: &'a RefreshEvent,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), ListenerError>> + Send + 'a>>;
}

/// Handle returned by [`CredentialManager::add_refresh_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Construction options for [`CredentialManager`].
#[derive(Clone)]
pub struct CredentialManagerOptions {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub refresh_token: Secret<String>,
    pub region: Region,
    /// Overrides the region's token endpoint (proxies, tests).
    pub token_url: Option<String>,
    pub max_cached_tokens: usize,
    pub request_timeout: Duration,
    /// Token payload schema; the built-in OAuth token schema when `None`.
    pub schema: Option<Arc<dyn Schema>>,
    pub validation_mode: ValidationMode,
    pub source: Option<Arc<dyn CredentialSource>>,
    pub http_client: Option<reqwest::Client>,
}

impl CredentialManagerOptions {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<Secret<String>>,
        refresh_token: impl Into<Secret<String>>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            region: Region::default(),
            token_url: None,
            max_cached_tokens: 1,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            schema: None,
            validation_mode: ValidationMode::default(),
            source: None,
            http_client: None,
        }
    }
}

impl fmt::Debug for CredentialManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManagerOptions")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("refresh_token", &self.refresh_token)
            .field("region", &self.region)
            .field("token_url", &self.token_url)
            .field("max_cached_tokens", &self.max_cached_tokens)
            .field("request_timeout", &self.request_timeout)
            .field("schema", &self.schema.as_ref().map(|s| s.name().to_string()))
            .field("validation_mode", &self.validation_mode)
            .finish_non_exhaustive()
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential>>>;

struct PendingRefresh {
    id: u64,
    future: SharedRefresh,
}

#[derive(Default)]
struct CacheState {
    tokens: HashMap<String, Credential>,
    order: VecDeque<String>,
}

struct Inner {
    client_id: String,
    client_secret: Secret<String>,
    refresh_token: Secret<String>,
    region: Region,
    token_url: String,
    max_cached_tokens: usize,
    request_timeout: Duration,
    schema: Arc<dyn Schema>,
    validation_mode: ValidationMode,
    source: Option<Arc<dyn CredentialSource>>,
    http: reqwest::Client,
    cache: Mutex<CacheState>,
    pending: Mutex<HashMap<String, PendingRefresh>>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn RefreshListener>)>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// Access token cache with coalesced refresh and FIFO eviction.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    /// Validate options and build the manager. No network I/O happens here.
    pub fn new(options: CredentialManagerOptions) -> Result<Self> {
        if options.client_id.trim().is_empty() {
            return Err(Error::InvalidConfig("client_id must be a non-empty string".into()));
        }
        if options.client_secret.is_blank() {
            return Err(Error::InvalidConfig(
                "client_secret must be a non-empty string".into(),
            ));
        }
        if options.refresh_token.is_blank() {
            return Err(Error::InvalidConfig(
                "refresh_token must be a non-empty string".into(),
            ));
        }
        if options.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must be non-zero".into()));
        }

        let token_url = options
            .token_url
            .unwrap_or_else(|| options.region.token_url());
        let max_cached_tokens = options.max_cached_tokens.max(1);
        let schema = match options.schema {
            Some(schema) => schema,
            None => token::oauth_token_schema()?,
        };
        info!(
            region = %options.region,
            max_cached_tokens,
            "credential manager initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client_id: options.client_id,
                client_secret: options.client_secret,
                refresh_token: options.refresh_token,
                region: options.region,
                token_url,
                max_cached_tokens,
                request_timeout: options.request_timeout,
                schema,
                validation_mode: options.validation_mode,
                source: options.source,
                http: options.http_client.unwrap_or_default(),
                cache: Mutex::new(CacheState::default()),
                pending: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn region(&self) -> Region {
        self.inner.region
    }

    /// Return a usable access token for `cache_key`, refreshing if needed.
    pub async fn get_credential(&self, cache_key: &str) -> Result<String> {
        self.ensure_open()?;

        if let Some(token) = self.inner.fresh_token(cache_key) {
            return Ok(token);
        }

        if let Some(source) = &self.inner.source {
            let hydrated = source.load(cache_key).await?;
            self.ensure_open()?;
            if let Some(credential) = hydrated.filter(|c| c.is_fresh_at(now_millis())) {
                debug!(cache_key, "using hydrated credential");
                let token = credential.token.expose().clone();
                self.inner.store(cache_key, credential);
                return Ok(token);
            }
        }

        let credential = self.refresh(cache_key).await?;
        Ok(credential.token.expose().clone())
    }

    /// Join the in-flight refresh for `cache_key`, or start one.
    fn refresh(&self, cache_key: &str) -> SharedRefresh {
        let mut pending = self.inner.pending.lock();
        if let Some(entry) = pending.get(cache_key) {
            debug!(cache_key, "joining in-flight token refresh");
            return entry.future.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let key = cache_key.to_string();
        let guard = PendingGuard {
            inner: Arc::downgrade(&self.inner),
            cache_key: key.clone(),
            id,
        };
        let future = async move {
            let _guard = guard;
            inner.perform_refresh(&key).await
        }
        .boxed()
        .shared();

        pending.insert(
            cache_key.to_string(),
            PendingRefresh {
                id,
                future: future.clone(),
            },
        );
        future
    }

    /// Drop the cached token for `cache_key`. In-flight refreshes are unaffected.
    pub fn invalidate(&self, cache_key: &str) {
        let size = {
            let mut cache = self.inner.cache.lock();
            cache.tokens.remove(cache_key);
            cache.order.retain(|k| k != cache_key);
            cache.tokens.len()
        };
        debug!(cache_key, "invalidated cached token");
        metrics::gauge!("crm_auth_cached_tokens").set(size as f64);
    }

    /// Drop every cached token. In-flight refreshes are unaffected.
    pub fn clear(&self) {
        {
            let mut cache = self.inner.cache.lock();
            cache.tokens.clear();
            cache.order.clear();
        }
        metrics::gauge!("crm_auth_cached_tokens").set(0.0);
    }

    /// Cancel in-flight refreshes and reject every later call with `ClientClosed`.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.clear();
        // Dropped outside the lock: dropping the last handle runs the
        // pending guard, which takes the same lock.
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        drop(pending);
        info!("credential manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Number of cached tokens (fresh or not).
    pub fn cached_len(&self) -> usize {
        self.inner.cache.lock().tokens.len()
    }

    /// Register a listener; it runs after every successful refresh.
    pub fn add_refresh_listener(&self, listener: Arc<dyn RefreshListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, listener));
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove_refresh_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }
}

impl Inner {
    fn fresh_token(&self, cache_key: &str) -> Option<String> {
        let cache = self.cache.lock();
        cache
            .tokens
            .get(cache_key)
            .filter(|c| c.is_fresh_at(now_millis()))
            .map(|c| c.token.expose().clone())
    }

    /// Insert or replace, bumping the key to the back of the eviction order.
    fn store(&self, cache_key: &str, credential: Credential) {
        let (size, evicted) = {
            let mut cache = self.cache.lock();
            if cache.tokens.insert(cache_key.to_string(), credential).is_some() {
                cache.order.retain(|k| k != cache_key);
            }
            cache.order.push_back(cache_key.to_string());

            let mut evicted = Vec::new();
            while cache.tokens.len() > self.max_cached_tokens {
                let Some(oldest) = cache.order.pop_front() else {
                    break;
                };
                cache.tokens.remove(&oldest);
                evicted.push(oldest);
            }
            (cache.tokens.len(), evicted)
        };

        for key in evicted {
            warn!(
                cache_key = %key,
                max_cached_tokens = self.max_cached_tokens,
                "token cache limit reached, evicting oldest token"
            );
        }
        metrics::gauge!("crm_auth_cached_tokens").set(size as f64);
    }

    async fn perform_refresh(&self, cache_key: &str) -> Result<Credential> {
        if self.cancel.is_cancelled() {
            return Err(Error::ClientClosed);
        }
        debug!(cache_key, region = %self.region, "refreshing access token");

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::ClientClosed),
            result = self.fetch_token() => result,
        };

        match outcome {
            Ok(response) => {
                let credential = Credential::from_response(&response, now_millis());
                self.store(cache_key, credential.clone());
                metrics::counter!(
                    "crm_auth_refresh_total",
                    "region" => self.region.as_str(),
                    "outcome" => "success"
                )
                .increment(1);
                info!(
                    cache_key,
                    region = %self.region,
                    expires_in = response.expires_in,
                    "access token refreshed"
                );

                let event = RefreshEvent {
                    cache_key: cache_key.to_string(),
                    credential: credential.clone(),
                    response,
                    region: self.region,
                };
                self.notify_listeners(&event).await;
                Ok(credential)
            }
            Err(Error::ClientClosed) => {
                debug!(cache_key, "token refresh cancelled by close");
                Err(Error::ClientClosed)
            }
            Err(e) => {
                metrics::counter!(
                    "crm_auth_refresh_total",
                    "region" => self.region.as_str(),
                    "outcome" => "error"
                )
                .increment(1);
                self.log_failure(cache_key, &e);
                Err(e)
            }
        }
    }

    async fn fetch_token(&self) -> Result<TokenResponse> {
        let grant = RefreshGrant {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            refresh_token: &self.refresh_token,
        };
        let (status, payload) =
            token::request_token(&self.http, &self.token_url, &grant, self.request_timeout)
                .await?;
        token::parse_token_payload(status, payload, Some(self.schema.as_ref()), self.validation_mode)
    }

    async fn notify_listeners(&self, event: &RefreshEvent) {
        let listeners: Vec<Arc<dyn RefreshListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if let Err(e) = listener.on_refresh(event).await {
                warn!(cache_key = %event.cache_key, error = %e, "token refresh listener failed");
            }
        }
    }

    fn log_failure(&self, cache_key: &str, e: &Error) {
        let status = e.status();
        let code = e.code();
        match status {
            Some(s) if s < 500 => {
                warn!(cache_key, region = %self.region, status = s, code, error = %e, "OAuth request failed");
            }
            _ => {
                error!(cache_key, region = %self.region, status, code, error = %e, "OAuth request failed");
            }
        }
    }
}

/// Removes a pending-refresh entry once its future settles or is dropped.
///
/// Only removes the entry it created: a later refresh for the same key
/// registered after `close()` has a different id.
struct PendingGuard {
    inner: Weak<Inner>,
    cache_key: String,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let removed = {
            let mut pending = inner.pending.lock();
            match pending.get(&self.cache_key) {
                Some(entry) if entry.id == self.id => pending.remove(&self.cache_key),
                _ => None,
            }
        };
        drop(removed);
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
