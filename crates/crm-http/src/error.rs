//! Error taxonomy for CRM API calls
//!
//! Every variant reports an optional HTTP status, a machine-readable code
//! and whether the executor may retry it. Errors are `Clone` so one value
//! can be handed to on-error hooks, audit and the caller.

use std::collections::BTreeMap;
use std::time::Duration;

use common::ValidationIssue;
use serde_json::Value;

/// Field name to messages, as reported by the server or by local checks.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Token refresh failed or the server rejected the token (401).
    #[error("{message}")]
    Credential {
        message: String,
        status: Option<u16>,
        code: Option<String>,
    },

    /// Server rejected the request as malformed (400).
    #[error("{message}")]
    Validation {
        message: String,
        code: Option<String>,
        field_errors: FieldErrors,
        details: Option<Value>,
    },

    /// Rejected locally before any network I/O.
    #[error("{message}")]
    InputValidation {
        message: String,
        field_errors: FieldErrors,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        code: Option<String>,
        resource: Option<String>,
        id: Option<String>,
    },

    #[error("{message}")]
    RateLimit {
        message: String,
        code: Option<String>,
        retry_after: Option<Duration>,
    },

    /// Server error, network failure, timeout, or any other status.
    #[error("{message}")]
    Request {
        message: String,
        status: Option<u16>,
        code: Option<String>,
    },

    #[error("response did not match schema \"{schema}\"{}", first_issue(.issues))]
    SchemaMismatch {
        schema: String,
        issues: Vec<ValidationIssue>,
    },

    /// Rate limiter queue full or queue wait exceeded.
    #[error("{message}")]
    ResourceLimit { message: String },

    #[error("client has been closed")]
    ClientClosed,
}

impl Error {
    pub fn request(message: impl Into<String>, status: Option<u16>, code: Option<&str>) -> Self {
        Error::Request {
            message: message.into(),
            status,
            code: code.map(str::to_string),
        }
    }

    /// Local input problem attributed to a single field.
    pub fn input(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Error::InputValidation {
            field_errors: BTreeMap::from([(field.to_string(), vec![message.clone()])]),
            message,
        }
    }

    pub fn timeout() -> Self {
        Error::request("request timed out", Some(408), Some("TIMEOUT"))
    }

    pub fn network(source: impl std::fmt::Display) -> Self {
        Error::request(
            format!("network error while calling the CRM API: {source}"),
            Some(500),
            Some("NETWORK_ERROR"),
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Credential { status, .. } | Error::Request { status, .. } => *status,
            Error::Validation { .. } | Error::InputValidation { .. } => Some(400),
            Error::NotFound { .. } => Some(404),
            Error::RateLimit { .. } => Some(429),
            Error::SchemaMismatch { .. } | Error::ResourceLimit { .. } | Error::ClientClosed => {
                None
            }
        }
    }

    /// Machine-readable code: the server-supplied one when present.
    pub fn code(&self) -> &str {
        match self {
            Error::Credential { code, .. } => code.as_deref().unwrap_or("AUTH_ERROR"),
            Error::Validation { code, .. } => code.as_deref().unwrap_or("VALIDATION_ERROR"),
            Error::InputValidation { .. } => "INVALID_INPUT",
            Error::NotFound { code, .. } => code.as_deref().unwrap_or("NOT_FOUND"),
            Error::RateLimit { code, .. } => code.as_deref().unwrap_or("RATE_LIMITED"),
            Error::Request { code, .. } => code.as_deref().unwrap_or("REQUEST_FAILED"),
            Error::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Error::ResourceLimit { .. } => "RESOURCE_LIMIT",
            Error::ClientClosed => "CLIENT_CLOSED",
        }
    }

    /// Short variant label for metric tags and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Credential { .. } => "credential",
            Error::Validation { .. } => "validation",
            Error::InputValidation { .. } => "input_validation",
            Error::NotFound { .. } => "not_found",
            Error::RateLimit { .. } => "rate_limit",
            Error::Request { .. } => "request",
            Error::SchemaMismatch { .. } => "schema_mismatch",
            Error::ResourceLimit { .. } => "resource_limit",
            Error::ClientClosed => "client_closed",
        }
    }

    /// Only server-side request failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Request { status: Some(status), .. } if *status >= 500)
    }
}

fn first_issue(issues: &[ValidationIssue]) -> String {
    issues
        .first()
        .map(|issue| format!(": {}", issue.message))
        .unwrap_or_default()
}

impl From<crm_auth::Error> for Error {
    fn from(err: crm_auth::Error) -> Self {
        match err {
            crm_auth::Error::Credential {
                message,
                status,
                code,
            } => Error::Credential {
                message,
                status,
                code,
            },
            crm_auth::Error::SchemaMismatch { schema, issues } => {
                Error::SchemaMismatch { schema, issues }
            }
            crm_auth::Error::ClientClosed => Error::ClientClosed,
            crm_auth::Error::InvalidConfig(message) => Error::InputValidation {
                message,
                field_errors: FieldErrors::new(),
            },
        }
    }
}

impl From<rate_limiter::Error> for Error {
    fn from(err: rate_limiter::Error) -> Self {
        match err {
            rate_limiter::Error::Closed => Error::ClientClosed,
            other => Error::ResourceLimit {
                message: other.to_string(),
            },
        }
    }
}

/// Result alias for request execution.
pub type Result<T> = std::result::Result<T, Error>;
