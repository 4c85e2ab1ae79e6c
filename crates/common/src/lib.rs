//! Shared building blocks for the CRM client workspace
//!
//! Holds the pieces every other crate needs: secret wrapping, the config
//! error type, region endpoint tables, log/audit redaction, and the schema
//! validation contract used for token and API responses.

mod error;
pub mod redact;
pub mod region;
pub mod schema;
mod secret;

pub use error::{Error, Result};
pub use redact::RedactionConfig;
pub use region::Region;
pub use schema::{JsonSchema, Schema, ValidationIssue, ValidationMode};
pub use secret::Secret;
