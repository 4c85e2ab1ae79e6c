//! Bulk read and write endpoints

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crm_http::{ByteStream, RequestExecutor, RequestSpec};
use rate_limiter::RateLimiter;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::Result;
use crate::config::{BulkReadConfig, BulkWriteConfig, validate_job_id};
use crate::job::JobStatus;

pub const BULK_READ_PATH: &str = "/crm/bulk/v8/read";
pub const BULK_WRITE_PATH: &str = "/crm/bulk/v8/write";

/// Submit, poll and download operations needed to drive a bulk read.
///
/// [`BulkModule`] implements this against the live API; tests substitute
/// in-memory fakes.
pub trait BulkReadApi: Send + Sync {
    fn init_read<'a>(
        &'a self,
        config: &'a BulkReadConfig,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + 'a>>;

    fn get_read_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + 'a>>;

    /// Body of the current result page.
    fn download_read_result<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream>> + Send + 'a>>;
}

/// Bulk API surface over a shared [`RequestExecutor`].
///
/// Result downloads pass through `download_limiter` when one is set, on top
/// of whatever limiter the executor applies to every request.
#[derive(Clone)]
pub struct BulkModule {
    executor: RequestExecutor,
    download_limiter: Option<RateLimiter>,
}

impl BulkModule {
    pub fn new(executor: RequestExecutor, download_limiter: Option<RateLimiter>) -> Self {
        Self {
            executor,
            download_limiter,
        }
    }

    #[instrument(skip_all, fields(module = %config.module))]
    pub async fn init_read(&self, config: &BulkReadConfig) -> Result<JobStatus> {
        config.validate()?;
        let status = self
            .job_request(RequestSpec::post(BULK_READ_PATH).body(config.payload()))
            .await?;
        debug!(job_id = ?status.id, state = %status.state, "bulk read submitted");
        Ok(status)
    }

    pub async fn get_read_status(&self, job_id: &str) -> Result<JobStatus> {
        validate_job_id(job_id)?;
        self.job_request(RequestSpec::get(format!("{BULK_READ_PATH}/{job_id}")))
            .await
    }

    /// Stream the current result page of a finished read job.
    #[instrument(skip(self))]
    pub async fn download_read_result(&self, job_id: &str) -> Result<ByteStream> {
        validate_job_id(job_id)?;
        let spec = RequestSpec::get(format!("{BULK_READ_PATH}/{job_id}/result"));
        let response = match &self.download_limiter {
            Some(limiter) => limiter.schedule(|| self.executor.request_raw(spec)).await??,
            None => self.executor.request_raw(spec).await?,
        };
        debug!(status = response.status, "bulk read download started");
        Ok(response.body)
    }

    #[instrument(skip_all, fields(module = %config.module, operation = ?config.operation))]
    pub async fn init_write(&self, config: &BulkWriteConfig) -> Result<JobStatus> {
        config.validate()?;
        let status = self
            .job_request(RequestSpec::post(BULK_WRITE_PATH).body(config.payload()))
            .await?;
        debug!(job_id = ?status.id, state = %status.state, "bulk write submitted");
        Ok(status)
    }

    pub async fn get_write_status(&self, job_id: &str) -> Result<JobStatus> {
        validate_job_id(job_id)?;
        self.job_request(RequestSpec::get(format!("{BULK_WRITE_PATH}/{job_id}")))
            .await
    }

    pub fn download_limiter(&self) -> Option<&RateLimiter> {
        self.download_limiter.as_ref()
    }

    async fn job_request(&self, spec: RequestSpec) -> Result<JobStatus> {
        let response = self.executor.request::<Value>(spec).await?;
        JobStatus::from_value(response.data)
    }
}

impl BulkReadApi for BulkModule {
    fn init_read<'a>(
        &'a self,
        config: &'a BulkReadConfig,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + 'a>> {
        Box::pin(BulkModule::init_read(self, config))
    }

    fn get_read_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + 'a>> {
        Box::pin(BulkModule::get_read_status(self, job_id))
    }

    fn download_read_result<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream>> + Send + 'a>> {
        Box::pin(BulkModule::download_read_result(self, job_id))
    }
}

impl fmt::Debug for BulkModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkModule")
            .field("executor", &self.executor)
            .field("download_limiter", &self.download_limiter.is_some())
            .finish()
    }
}
