//! Ordered, best-effort request lifecycle hooks
//!
//! Four independent hook lists run around every request:
//! - before-request: sequential; the first hook returning an override
//!   short-circuits the network call
//! - after-response, on-error, on-credential-refresh: all run, in order
//!
//! Hook failures and panics are logged with the owning plugin's name and
//! never reach the caller. Plugins bundle hooks under a name and can be
//! installed and removed at runtime.

pub mod context;
pub mod error;
pub mod pipeline;
pub mod plugin;

pub use context::{
    AfterResponseContext, BeforeRequestContext, CredentialRefreshContext, ErrorContext,
    OverrideResponse, ResponseOverride,
};
pub use error::{HookError, HookResult};
pub use pipeline::{
    AfterResponseHook, BeforeRequestHook, CredentialRefreshHook, ErrorHook, HookFuture,
    HookPipeline, Hooks,
};
pub use plugin::Plugin;
