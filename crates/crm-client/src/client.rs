//! The client facade
//!
//! [`CrmClient`] owns one of each core component and wires them together:
//! the credential manager feeds the executor's tokens, its refresh
//! notifications fan out to `on_credential_refresh` hooks, and bulk downloads
//! go through their own limiter.
//!
//! API calls return [`crm_http::Error`] unchanged; setup and registry
//! operations use this crate's [`Error`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crm_auth::{
    CredentialManager, CredentialManagerOptions, ListenerError, ListenerId, RefreshEvent,
    RefreshListener, TokenProvider,
};
use crm_bulk::{BulkModule, BulkReadConfig, BulkReadOptions};
use crm_http::{RawResponse, RequestExecutor, RequestExecutorOptions, RequestSpec, ResponseEnvelope};
use futures::Stream;
use hooks::{CredentialRefreshContext, HookPipeline, Plugin};
use rate_limiter::{RateLimiter, RateLimiterOptions};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::config::ClientConfig;
use crate::deprecation::{DeprecationConfig, DeprecationNotice, Deprecations};
use crate::error::{Error, Result};
use crate::extensions::ExtensionRegistry;

pub const API_LIMITER_SCOPE: &str = "api";
pub const BULK_DOWNLOAD_LIMITER_SCOPE: &str = "bulk_download";

/// Default bulk-download pacing: 10 downloads per minute.
pub fn default_bulk_download_limit() -> RateLimiterOptions {
    RateLimiterOptions {
        scope: BULK_DOWNLOAD_LIMITER_SCOPE.to_string(),
        ..RateLimiterOptions::new(10, Duration::from_secs(60))
    }
}

pub struct CrmClientOptions {
    pub credentials: CredentialManagerOptions,
    /// The executor's region is taken from `credentials`. Set
    /// `executor.limiter` to pace API calls.
    pub executor: RequestExecutorOptions,
    /// Unpaced when `None`.
    pub bulk_download_rate_limit: Option<RateLimiterOptions>,
    pub deprecations: DeprecationConfig,
}

impl CrmClientOptions {
    pub fn new(credentials: CredentialManagerOptions) -> Self {
        Self {
            credentials,
            executor: RequestExecutorOptions::default(),
            bulk_download_rate_limit: Some(default_bulk_download_limit()),
            deprecations: DeprecationConfig::default(),
        }
    }

    /// Translate a loaded [`ClientConfig`]. Secrets must already be resolved.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let missing = |field: &str| {
            Error::Config(common::Error::Config(format!("auth.{field} is not resolved")))
        };
        let auth = config.auth;
        let client_secret = auth.client_secret.ok_or_else(|| missing("client_secret"))?;
        let refresh_token = auth.refresh_token.ok_or_else(|| missing("refresh_token"))?;

        let mut credentials =
            CredentialManagerOptions::new(auth.client_id, client_secret, refresh_token);
        credentials.region = auth.region;
        credentials.token_url = auth.token_url;
        credentials.max_cached_tokens = auth.max_cached_tokens;
        credentials.request_timeout = Duration::from_secs(auth.request_timeout_secs);
        credentials.validation_mode = config.validation.mode;

        let audit = if config.audit.enabled {
            Some(crm_http::AuditConfig {
                redaction: config.audit.redaction,
                ..crm_http::AuditConfig::default()
            })
        } else {
            None
        };
        let executor = RequestExecutorOptions {
            region: auth.region,
            api_base_url: config.http.api_base_url,
            default_api_path: config.http.default_api_path,
            timeout: Duration::from_secs(config.http.timeout_secs),
            retry: config.retry.policy(),
            allow_insecure_http: config.http.allow_insecure_http,
            slow_request_threshold: config
                .http
                .slow_request_threshold_ms
                .map(Duration::from_millis),
            validation_mode: config.validation.mode,
            limiter: config
                .rate_limit
                .map(|limit| RateLimiter::new(limit.options(API_LIMITER_SCOPE))),
            audit,
            ..RequestExecutorOptions::default()
        };

        let bulk = &config.bulk_download_rate_limit;
        Ok(Self {
            credentials,
            executor,
            bulk_download_rate_limit: bulk
                .enabled
                .then(|| bulk.limit().options(BULK_DOWNLOAD_LIMITER_SCOPE)),
            deprecations: config.deprecations,
        })
    }
}

impl fmt::Debug for CrmClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmClientOptions")
            .field("credentials", &self.credentials)
            .field("executor", &self.executor)
            .field(
                "bulk_download_rate_limit",
                &self.bulk_download_rate_limit.as_ref().map(|o| o.scope.clone()),
            )
            .field("deprecations", &self.deprecations)
            .finish()
    }
}

/// Forwards credential refreshes to the hook pipeline.
struct HookBridge {
    hooks: HookPipeline,
}

impl RefreshListener for HookBridge {
    fn on_refresh<'a>(
        &'a self,
        event: &'a RefreshEvent,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), ListenerError>> + Send + 'a>> {
        Box::pin(async move {
            let ctx = CredentialRefreshContext {
                cache_key: event.cache_key.clone(),
                token: event.credential.token.clone(),
                expires_at_ms: event.credential.expires_at_ms,
                token_type: event.credential.token_type.clone(),
                region: event.region,
            };
            self.hooks.run_on_credential_refresh(&ctx).await;
            Ok(())
        })
    }
}

fn dispose_notice() -> DeprecationNotice {
    DeprecationNotice::new("CrmClient::dispose", "dispose() only forwards to close().")
        .alternative("CrmClient::close")
        .removal_version("0.2.0")
}

fn access_token_notice() -> DeprecationNotice {
    DeprecationNotice::new(
        "CrmClient::get_access_token",
        "Reading tokens through the client is going away.",
    )
    .alternative("CrmClient::credentials().get_credential(key)")
    .removal_version("0.2.0")
}

pub struct CrmClient {
    credentials: CredentialManager,
    executor: RequestExecutor,
    bulk: BulkModule,
    hooks: HookPipeline,
    rate_limiter: Option<RateLimiter>,
    bulk_download_limiter: Option<RateLimiter>,
    extensions: ExtensionRegistry,
    deprecations: Deprecations,
    refresh_listener: ListenerId,
}

impl CrmClient {
    /// Build and wire every component. No network I/O happens here.
    pub fn new(options: CrmClientOptions) -> Result<Self> {
        let credentials = CredentialManager::new(options.credentials)?;

        let mut executor_options = options.executor;
        executor_options.region = credentials.region();
        let hooks = executor_options.hooks.clone();
        let rate_limiter = executor_options.limiter.clone();

        let tokens: Arc<dyn TokenProvider> = Arc::new(credentials.clone());
        let executor = RequestExecutor::new(executor_options, tokens)?;

        let bulk_download_limiter = options.bulk_download_rate_limit.map(RateLimiter::new);
        let bulk = BulkModule::new(executor.clone(), bulk_download_limiter.clone());

        let refresh_listener = credentials.add_refresh_listener(Arc::new(HookBridge {
            hooks: hooks.clone(),
        }));

        info!(
            region = %credentials.region(),
            base_url = executor.base_url(),
            rate_limited = rate_limiter.is_some(),
            bulk_download_limited = bulk_download_limiter.is_some(),
            "crm client ready"
        );

        Ok(Self {
            credentials,
            executor,
            bulk,
            hooks,
            rate_limiter,
            bulk_download_limiter,
            extensions: ExtensionRegistry::new(),
            deprecations: Deprecations::new(options.deprecations),
            refresh_listener,
        })
    }

    pub fn from_config(config: ClientConfig) -> Result<Self> {
        Self::new(CrmClientOptions::from_config(config)?)
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        spec: RequestSpec,
    ) -> crm_http::Result<ResponseEnvelope<T>> {
        self.executor.request(spec).await
    }

    pub async fn request_raw(&self, spec: RequestSpec) -> crm_http::Result<RawResponse> {
        self.executor.request_raw(spec).await
    }

    /// Submit a bulk read and stream its records. See [`crm_bulk::iterate_bulk_read`].
    pub fn iterate_bulk_read<'a, T>(
        &'a self,
        config: BulkReadConfig,
        options: BulkReadOptions,
    ) -> impl Stream<Item = crm_http::Result<T>> + Send + 'a
    where
        T: DeserializeOwned + Send + 'a,
    {
        crm_bulk::iterate_bulk_read(&self.bulk, config, options)
    }

    pub fn bulk(&self) -> &BulkModule {
        &self.bulk
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn bulk_download_limiter(&self) -> Option<&RateLimiter> {
        self.bulk_download_limiter.as_ref()
    }

    pub fn region(&self) -> common::Region {
        self.credentials.region()
    }

    pub fn deprecations(&self) -> &Deprecations {
        &self.deprecations
    }

    pub async fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        Ok(self.hooks.use_plugin(plugin).await?)
    }

    pub async fn remove_plugin(&self, name: &str) -> bool {
        self.hooks.remove_plugin(name).await
    }

    pub fn list_plugins(&self) -> Vec<String> {
        self.hooks.list_plugins()
    }

    pub fn register_extension<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<()> {
        self.extensions.register(name, value)?;
        info!(extension = name, "extension registered");
        Ok(())
    }

    pub fn extension<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.extensions.get(name)
    }

    pub fn unregister_extension(&self, name: &str) -> bool {
        self.extensions.unregister(name)
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.names()
    }

    /// Drop every cached access token; the next request refreshes.
    pub fn clear_cached_state(&self) {
        self.credentials.clear();
    }

    /// Reject queued work, abort in-flight requests and drop cached tokens.
    ///
    /// Every later call fails with `ClientClosed`. Calling it twice is a no-op.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.close();
        }
        if let Some(limiter) = &self.bulk_download_limiter {
            limiter.close();
        }
        self.executor.close();
        self.credentials.remove_refresh_listener(self.refresh_listener);
        self.credentials.close();
        info!("crm client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }

    #[deprecated(note = "use `CrmClient::close`")]
    pub fn dispose(&self) {
        self.deprecations.warn(&dispose_notice());
        self.close();
    }

    #[deprecated(note = "use `CrmClient::credentials().get_credential(key)`")]
    pub async fn get_access_token(&self) -> crm_http::Result<String> {
        self.deprecations.warn(&access_token_notice());
        Ok(self
            .credentials
            .get_credential(crm_auth::DEFAULT_CACHE_KEY)
            .await?)
    }
}

impl fmt::Debug for CrmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmClient")
            .field("region", &self.region())
            .field("base_url", &self.executor.base_url())
            .field("plugins", &self.list_plugins())
            .field("extensions", &self.extensions)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
