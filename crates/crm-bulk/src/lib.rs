//! Bulk read/write jobs
//!
//! Bulk jobs run asynchronously on the server: a job is submitted, polled
//! until it reaches a terminal state, and its result downloaded page by page.
//! [`iterate_bulk_read`] drives that whole cycle and yields decoded records
//! lazily from each downloaded page.
//!
//! The downloader only understands newline-delimited JSON. The API's native
//! result format is a zipped CSV; callers needing that must decode the
//! [`crm_http::ByteStream`] from [`BulkModule::download_read_result`] themselves.

pub mod codec;
pub mod config;
pub mod iter;
pub mod job;
pub mod module;

pub use codec::{DecodeError, NdjsonCodec};
pub use config::{
    BulkCallback, BulkReadConfig, BulkWriteConfig, CallbackMethod, FieldMapping, FileType,
    WriteOperation,
};
pub use crm_http::{Error, Result};
pub use iter::{BulkReadOptions, DEFAULT_POLL_INTERVAL, iterate_bulk_read};
pub use job::{JobState, JobStatus};
pub use module::{BULK_READ_PATH, BULK_WRITE_PATH, BulkModule, BulkReadApi};
