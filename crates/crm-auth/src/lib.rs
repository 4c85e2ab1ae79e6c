//! OAuth credential lifecycle for the CRM API
//!
//! Exchanges a long-lived refresh token for short-lived access tokens and
//! caches them per cache key. This crate has no dependency on the request
//! executor; the executor consumes it through [`TokenProvider`].
//!
//! Credential flow:
//! 1. Caller asks `CredentialManager::get_credential(key)`
//! 2. A cached token still outside the early-refresh buffer is returned as is
//! 3. Otherwise an optional `CredentialSource` may hydrate one
//! 4. Otherwise one refresh per key runs; concurrent callers share its result
//! 5. Refresh listeners are notified so callers can persist the new token

pub mod constants;
pub mod credentials;
pub mod error;
pub mod provider;
pub mod token;

pub use constants::*;
pub use credentials::{
    Credential, CredentialManager, CredentialManagerOptions, CredentialSource, ListenerError,
    ListenerId, RefreshEvent, RefreshListener,
};
pub use error::{Error, Result};
pub use provider::{StaticToken, TokenProvider};
pub use token::{
    OAUTH_TOKEN_SCHEMA_NAME, RefreshGrant, TokenResponse, oauth_token_schema, parse_token_payload,
    request_token,
};
