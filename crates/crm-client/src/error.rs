//! Client facade errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] common::Error),

    #[error(transparent)]
    Api(#[from] crm_http::Error),

    #[error("plugin error: {0}")]
    Plugin(#[from] hooks::HookError),

    #[error("cannot register extension \"{name}\": {reason}")]
    Extension { name: String, reason: String },

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}

impl From<crm_auth::Error> for Error {
    fn from(err: crm_auth::Error) -> Self {
        Error::Api(err.into())
    }
}

/// Result alias using client Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_surface_as_api_errors() {
        let err = Error::from(crm_auth::Error::InvalidConfig(
            "client_id must be a non-empty string".into(),
        ));
        match err {
            Error::Api(inner) => assert_eq!(inner.code(), "INVALID_INPUT"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn extension_error_names_the_extension() {
        let err = Error::Extension {
            name: "bulk".into(),
            reason: "name is reserved".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot register extension \"bulk\": name is reserved"
        );
    }
}
