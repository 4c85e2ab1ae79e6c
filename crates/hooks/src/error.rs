//! Hook error type

/// Failure reported by a hook or plugin. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError::Message(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError::Message(message.to_string())
    }
}

/// Result alias for hook bodies.
pub type HookResult<T> = std::result::Result<T, HookError>;
