//! Named extension registry attached to a client
//!
//! Callers can hang their own modules or helpers off a client under a name
//! and fetch them back by type. Core component names are reserved.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Names of the client's own components; never available to extensions.
pub const RESERVED_NAMES: &[&str] = &[
    "auth",
    "credentials",
    "http",
    "executor",
    "bulk",
    "hooks",
    "plugins",
    "rate_limiter",
    "bulk_download_limiter",
    "audit",
    "metrics",
    "logger",
    "telemetry",
    "validation",
    "deprecations",
    "region",
    "extensions",
];

type Extension = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct ExtensionRegistry {
    entries: RwLock<HashMap<String, Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects blank, reserved and already-registered names.
    pub fn register<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<()> {
        let rejected = |reason: &str| Error::Extension {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(rejected("name must be non-empty"));
        }
        if RESERVED_NAMES.contains(&name) {
            return Err(rejected("name is reserved for a core client component"));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(rejected("an extension with this name already exists"));
        }
        entries.insert(name.to_string(), Arc::new(value));
        Ok(())
    }

    /// The extension under `name`, if it exists and is a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let entry = self.entries.read().get(name).cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("names", &self.names())
            .finish()
    }
}
