//! Hook registries and their runners
//!
//! Each category is an ordered list of `(plugin name, hook)` entries. Runners
//! snapshot the list under a short lock and then await hooks without holding
//! it, so a hook may register or remove hooks without deadlocking.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::context::{
    AfterResponseContext, BeforeRequestContext, CredentialRefreshContext, ErrorContext,
    OverrideResponse, ResponseOverride,
};
use crate::error::HookResult;
use crate::plugin::Plugin;

/// Boxed hook future. Uses `Pin<Box<dyn Future>>` for dyn-compatibility.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs before each attempt; may edit the request or answer it outright.
pub trait BeforeRequestHook: Send + Sync {
    fn before_request<'a>(
        &'a self,
        ctx: &'a mut BeforeRequestContext,
    ) -> HookFuture<'a, HookResult<Option<ResponseOverride>>>;
}

pub trait AfterResponseHook: Send + Sync {
    fn after_response<'a>(&'a self, ctx: &'a AfterResponseContext) -> HookFuture<'a, HookResult<()>>;
}

pub trait ErrorHook: Send + Sync {
    fn on_error<'a>(&'a self, ctx: &'a ErrorContext) -> HookFuture<'a, HookResult<()>>;
}

pub trait CredentialRefreshHook: Send + Sync {
    fn on_credential_refresh<'a>(
        &'a self,
        ctx: &'a CredentialRefreshContext,
    ) -> HookFuture<'a, HookResult<()>>;
}

// Plain closures work as synchronous hooks.

impl<F> BeforeRequestHook for F
where
    F: Fn(&mut BeforeRequestContext) -> HookResult<Option<ResponseOverride>> + Send + Sync,
{
    fn before_request<'a>(
        &'a self,
        ctx: &'a mut BeforeRequestContext,
    ) -> HookFuture<'a, HookResult<Option<ResponseOverride>>> {
        Box::pin(async move { self(ctx) })
    }
}

impl<F> AfterResponseHook for F
where
    F: Fn(&AfterResponseContext) -> HookResult<()> + Send + Sync,
{
    fn after_response<'a>(&'a self, ctx: &'a AfterResponseContext) -> HookFuture<'a, HookResult<()>> {
        Box::pin(async move { self(ctx) })
    }
}

impl<F> ErrorHook for F
where
    F: Fn(&ErrorContext) -> HookResult<()> + Send + Sync,
{
    fn on_error<'a>(&'a self, ctx: &'a ErrorContext) -> HookFuture<'a, HookResult<()>> {
        Box::pin(async move { self(ctx) })
    }
}

impl<F> CredentialRefreshHook for F
where
    F: Fn(&CredentialRefreshContext) -> HookResult<()> + Send + Sync,
{
    fn on_credential_refresh<'a>(
        &'a self,
        ctx: &'a CredentialRefreshContext,
    ) -> HookFuture<'a, HookResult<()>> {
        Box::pin(async move { self(ctx) })
    }
}

/// The hooks one plugin contributes. Unset categories are skipped.
#[derive(Clone, Default)]
pub struct Hooks {
    pub before_request: Option<Arc<dyn BeforeRequestHook>>,
    pub after_response: Option<Arc<dyn AfterResponseHook>>,
    pub on_error: Option<Arc<dyn ErrorHook>>,
    pub on_credential_refresh: Option<Arc<dyn CredentialRefreshHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_request(mut self, hook: impl BeforeRequestHook + 'static) -> Self {
        self.before_request = Some(Arc::new(hook));
        self
    }

    pub fn after_response(mut self, hook: impl AfterResponseHook + 'static) -> Self {
        self.after_response = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl ErrorHook + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_credential_refresh(mut self, hook: impl CredentialRefreshHook + 'static) -> Self {
        self.on_credential_refresh = Some(Arc::new(hook));
        self
    }
}

struct HookEntry<H: ?Sized> {
    plugin: String,
    hook: Arc<H>,
}

impl<H: ?Sized> Clone for HookEntry<H> {
    fn clone(&self) -> Self {
        Self {
            plugin: self.plugin.clone(),
            hook: Arc::clone(&self.hook),
        }
    }
}

#[derive(Default)]
struct Registry {
    before_request: Vec<HookEntry<dyn BeforeRequestHook>>,
    after_response: Vec<HookEntry<dyn AfterResponseHook>>,
    on_error: Vec<HookEntry<dyn ErrorHook>>,
    on_credential_refresh: Vec<HookEntry<dyn CredentialRefreshHook>>,
}

#[derive(Default)]
struct Inner {
    registry: RwLock<Registry>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
}

/// Ordered hook registries shared by the executor and the client facade.
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone, Default)]
pub struct HookPipeline {
    inner: Arc<Inner>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `hooks` to each category under `plugin_name`.
    pub fn register_hooks(&self, plugin_name: &str, hooks: Hooks) {
        let mut registry = self.inner.registry.write();
        if let Some(hook) = hooks.before_request {
            registry.before_request.push(HookEntry {
                plugin: plugin_name.to_string(),
                hook,
            });
        }
        if let Some(hook) = hooks.after_response {
            registry.after_response.push(HookEntry {
                plugin: plugin_name.to_string(),
                hook,
            });
        }
        if let Some(hook) = hooks.on_error {
            registry.on_error.push(HookEntry {
                plugin: plugin_name.to_string(),
                hook,
            });
        }
        if let Some(hook) = hooks.on_credential_refresh {
            registry.on_credential_refresh.push(HookEntry {
                plugin: plugin_name.to_string(),
                hook,
            });
        }
        debug!(plugin = plugin_name, "registered hooks");
    }

    /// Remove every hook `plugin_name` registered, across all categories at once.
    pub fn remove_hooks(&self, plugin_name: &str) {
        let mut registry = self.inner.registry.write();
        registry.before_request.retain(|e| e.plugin != plugin_name);
        registry.after_response.retain(|e| e.plugin != plugin_name);
        registry.on_error.retain(|e| e.plugin != plugin_name);
        registry.on_credential_refresh.retain(|e| e.plugin != plugin_name);
    }

    /// Total registered hooks across all categories.
    pub fn hook_count(&self) -> usize {
        let registry = self.inner.registry.read();
        registry.before_request.len()
            + registry.after_response.len()
            + registry.on_error.len()
            + registry.on_credential_refresh.len()
    }

    /// Run before-request hooks in order until one returns an override.
    pub async fn run_before_request(
        &self,
        ctx: &mut BeforeRequestContext,
    ) -> Option<OverrideResponse> {
        let entries = self.inner.registry.read().before_request.clone();
        for entry in entries {
            let outcome =
                guarded(&entry.plugin, "before_request", entry.hook.before_request(ctx)).await;
            if let Some(Some(response)) = outcome {
                debug!(plugin = %entry.plugin, "before-request hook supplied a response");
                return Some(response.normalize());
            }
        }
        None
    }

    pub async fn run_after_response(&self, ctx: &AfterResponseContext) {
        let entries = self.inner.registry.read().after_response.clone();
        for entry in entries {
            guarded(&entry.plugin, "after_response", entry.hook.after_response(ctx)).await;
        }
    }

    pub async fn run_on_error(&self, ctx: &ErrorContext) {
        let entries = self.inner.registry.read().on_error.clone();
        for entry in entries {
            guarded(&entry.plugin, "on_error", entry.hook.on_error(ctx)).await;
        }
    }

    pub async fn run_on_credential_refresh(&self, ctx: &CredentialRefreshContext) {
        let entries = self.inner.registry.read().on_credential_refresh.clone();
        for entry in entries {
            guarded(
                &entry.plugin,
                "on_credential_refresh",
                entry.hook.on_credential_refresh(ctx),
            )
            .await;
        }
    }

    pub(crate) fn plugins(&self) -> &Mutex<Vec<Arc<dyn Plugin>>> {
        &self.inner.plugins
    }
}

/// Await a hook, absorbing its error or panic.
async fn guarded<T>(
    plugin: &str,
    stage: &'static str,
    future: HookFuture<'_, HookResult<T>>,
) -> Option<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(plugin, stage, error = %e, "plugin hook failed");
            None
        }
        Err(panic) => {
            warn!(plugin, stage, error = %panic_message(panic.as_ref()), "plugin hook panicked");
            None
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
