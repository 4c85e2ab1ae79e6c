//! Credential lifecycle constants

use std::time::Duration;

/// Cache key used when the caller does not partition credentials.
pub const DEFAULT_CACHE_KEY: &str = "default";

/// Tokens this close to expiry are treated as expired.
pub const EARLY_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Bound on a single token endpoint round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Token type assumed when the endpoint omits `token_type`.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";
