//! Error types for credential operations
//!
//! Errors are `Clone` because a single refresh outcome is handed to every
//! caller coalesced onto it.

use common::ValidationIssue;

/// Errors from credential refresh and cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Token endpoint unreachable, rejected the grant, or returned garbage.
    #[error("{message}")]
    Credential {
        message: String,
        status: Option<u16>,
        code: Option<String>,
    },

    #[error("response did not match schema \"{schema}\"{}", first_issue(.issues))]
    SchemaMismatch {
        schema: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("credential manager has been closed")]
    ClientClosed,

    #[error("invalid credential configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn credential(message: impl Into<String>, status: Option<u16>, code: Option<&str>) -> Self {
        Error::Credential {
            message: message.into(),
            status,
            code: code.map(str::to_string),
        }
    }

    /// HTTP status associated with the failure, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Credential { status, .. } => *status,
            _ => None,
        }
    }

    /// Machine-readable code.
    pub fn code(&self) -> &str {
        match self {
            Error::Credential { code: Some(code), .. } => code,
            Error::Credential { code: None, .. } => "AUTH_ERROR",
            Error::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Error::ClientClosed => "CLIENT_CLOSED",
            Error::InvalidConfig(_) => "INVALID_INPUT",
        }
    }
}

fn first_issue(issues: &[ValidationIssue]) -> String {
    issues
        .first()
        .map(|issue| format!(": {}", issue.message))
        .unwrap_or_default()
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_mismatch_message_includes_first_issue() {
        let err = Error::SchemaMismatch {
            schema: "OAuthTokenResponse".into(),
            issues: vec![ValidationIssue {
                path: "/expires_in".into(),
                expected: "type".into(),
                actual: "string".into(),
                message: "/expires_in: \"x\" is not of type \"number\"".into(),
            }],
        };
        let text = err.to_string();
        assert!(text.starts_with("response did not match schema \"OAuthTokenResponse\": /expires_in"));
        assert_eq!(err.code(), "SCHEMA_MISMATCH");
    }

    #[test]
    fn credential_code_defaults() {
        let err = Error::credential("boom", Some(400), None);
        assert_eq!(err.code(), "AUTH_ERROR");
        assert_eq!(err.status(), Some(400));

        let err = Error::credential("bad grant", Some(400), Some("invalid_code"));
        assert_eq!(err.code(), "invalid_code");
    }
}
