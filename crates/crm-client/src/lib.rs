//! CRM API client
//!
//! [`CrmClient`] is the entry point. It wires the component crates together:
//! - `crm-auth`: OAuth refresh-token exchange and the access token cache
//! - `rate-limiter`: client-side pacing for API calls and bulk downloads
//! - `hooks`: request lifecycle hooks and plugins
//! - `crm-http`: the retrying request executor
//! - `crm-bulk`: bulk read/write jobs and the streaming bulk iterator
//!
//! Configuration loads from TOML ([`ClientConfig`]); [`telemetry`] installs
//! JSON logging and a Prometheus recorder for embedding applications.

pub mod client;
pub mod config;
pub mod deprecation;
pub mod error;
pub mod extensions;
pub mod telemetry;

pub use client::{CrmClient, CrmClientOptions, default_bulk_download_limit};
pub use config::ClientConfig;
pub use deprecation::{DeprecationConfig, DeprecationNotice, Deprecations};
pub use error::{Error, Result};
pub use extensions::ExtensionRegistry;

pub use crm_bulk::{BulkReadConfig, BulkReadOptions, BulkWriteConfig};
pub use crm_http::{RequestSpec, ResponseEnvelope};
