//! Token provider abstraction consumed by the request executor
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn TokenProvider>`).

use std::future::Future;
use std::pin::Pin;

use common::Secret;

use crate::credentials::CredentialManager;
use crate::error::{Error, Result};

/// Source of access tokens for outgoing API requests.
pub trait TokenProvider: Send + Sync {
    /// A usable access token for `cache_key`.
    fn access_token<'a>(
        &'a self,
        cache_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Forget any cached token for `cache_key`. No-op by default.
    fn invalidate(&self, _cache_key: &str) {}
}

impl TokenProvider for CredentialManager {
    fn access_token<'a>(
        &'a self,
        cache_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.get_credential(cache_key))
    }

    fn invalidate(&self, cache_key: &str) {
        CredentialManager::invalidate(self, cache_key);
    }
}

/// Fixed token, for callers that manage OAuth themselves.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: Secret<String>,
}

impl StaticToken {
    pub fn new(token: impl Into<Secret<String>>) -> Result<Self> {
        let token = token.into();
        if token.is_blank() {
            return Err(Error::InvalidConfig("access token must be non-empty".into()));
        }
        Ok(Self { token })
    }
}

impl TokenProvider for StaticToken {
    fn access_token<'a>(
        &'a self,
        _cache_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        let token = self.token.expose().clone();
        Box::pin(async move { Ok(token) })
    }
}
