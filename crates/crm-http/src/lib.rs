//! Request execution against the CRM REST API
//!
//! [`RequestExecutor`] turns one [`RequestSpec`] into an HTTP exchange:
//!
//! 1. Each attempt is admitted through the optional [`rate_limiter::RateLimiter`]
//! 2. Before-request hooks may rewrite the request or answer it outright
//! 3. A token from the [`crm_auth::TokenProvider`] is attached
//! 4. Non-2xx responses are mapped onto [`Error`]; only server-side
//!    failures (status >= 500) are retried, with exponential backoff
//! 5. After-response / on-error hooks, audit events and metrics follow
//!    every attempt

pub mod audit;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod metrics;
pub mod request;

pub use audit::{AuditConfig, AuditEvent, AuditSink, ContextProvider, TracingAuditSink};
pub use error::{Error, FieldErrors, Result};
pub use executor::{RequestExecutor, RequestExecutorOptions};
pub use request::{
    ByteStream, DEFAULT_API_PATH, DEFAULT_AUTH_SCHEME, DEFAULT_TIMEOUT, RawResponse,
    RequestSpec, ResponseEnvelope, RetryPolicy,
};
