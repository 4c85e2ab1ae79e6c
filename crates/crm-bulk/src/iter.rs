//! Lazy record stream over a bulk read job
//!
//! Submits the job, polls until it reaches a terminal state, then downloads
//! result pages one at a time. Records are decoded as the bytes arrive, so
//! at most one page is open and no page is buffered whole.

use std::time::Duration;

use bytes::Bytes;
use crm_http::ByteStream;
use futures::{Stream, StreamExt, stream};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::codec::NdjsonCodec;
use crate::config::BulkReadConfig;
use crate::job::JobStatus;
use crate::module::BulkReadApi;
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct BulkReadOptions {
    /// Delay between status polls while the job runs.
    pub poll_interval: Duration,
    /// Give up with a 408 `Request` error once polling has taken this long.
    pub max_wait: Option<Duration>,
}

impl Default for BulkReadOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

type Records<T> = FramedRead<StreamReader<ByteStream, Bytes>, NdjsonCodec<T>>;

enum Cursor<T> {
    Submit(BulkReadConfig),
    Page {
        job_id: String,
        page: u32,
        /// Whether the status preceding this page announced another one.
        more: bool,
        records: Records<T>,
    },
    Finished,
}

/// Run a bulk read and yield its records in download order.
///
/// Every call submits a new job. The stream ends after the page whose status
/// reports no more records, and stops at the first error.
pub fn iterate_bulk_read<'a, T, A>(
    api: &'a A,
    config: BulkReadConfig,
    options: BulkReadOptions,
) -> impl Stream<Item = Result<T>> + Send + 'a
where
    T: DeserializeOwned + Send + 'a,
    A: BulkReadApi + ?Sized,
{
    stream::try_unfold(Cursor::Submit(config), move |cursor| {
        advance(api, options, cursor)
    })
}

async fn advance<T, A>(
    api: &A,
    options: BulkReadOptions,
    mut cursor: Cursor<T>,
) -> Result<Option<(T, Cursor<T>)>>
where
    T: DeserializeOwned,
    A: BulkReadApi + ?Sized,
{
    loop {
        cursor = match cursor {
            Cursor::Submit(config) => {
                let job = api.init_read(&config).await?;
                let job_id = job.job_id()?.to_string();
                info!(job_id = %job_id, module = %config.module, "bulk read job submitted");

                let status = wait_for_terminal(api, &job_id, options).await?;
                open_page(api, job_id, 1, status.more_records).await?
            }
            Cursor::Page {
                job_id,
                page,
                more,
                mut records,
            } => match records.next().await {
                Some(record) => {
                    let record = record?;
                    let cursor = Cursor::Page {
                        job_id,
                        page,
                        more,
                        records,
                    };
                    return Ok(Some((record, cursor)));
                }
                None if more => {
                    let status = api.get_read_status(&job_id).await?;
                    ensure_not_failed(&job_id, &status)?;
                    open_page(api, job_id, page + 1, status.more_records).await?
                }
                None => {
                    info!(job_id = %job_id, pages = page, "bulk read job drained");
                    Cursor::Finished
                }
            },
            Cursor::Finished => return Ok(None),
        };
    }
}

async fn open_page<T, A>(api: &A, job_id: String, page: u32, more: bool) -> Result<Cursor<T>>
where
    A: BulkReadApi + ?Sized,
{
    let body = api.download_read_result(&job_id).await?;
    debug!(job_id = %job_id, page, more, "downloading bulk read page");
    Ok(Cursor::Page {
        records: FramedRead::new(StreamReader::new(body), NdjsonCodec::new()),
        job_id,
        page,
        more,
    })
}

/// Poll once immediately, then every `poll_interval` until the job settles.
async fn wait_for_terminal<A>(api: &A, job_id: &str, options: BulkReadOptions) -> Result<JobStatus>
where
    A: BulkReadApi + ?Sized,
{
    let started = Instant::now();
    let mut status = api.get_read_status(job_id).await?;
    while !status.state.is_terminal() {
        if let Some(max_wait) = options.max_wait {
            if started.elapsed() > max_wait {
                return Err(Error::request(
                    format!("bulk read job {job_id} did not finish within {max_wait:?}"),
                    Some(408),
                    Some("TIMEOUT"),
                ));
            }
        }
        debug!(job_id, state = %status.state, "bulk read job still running");
        tokio::time::sleep(options.poll_interval).await;
        status = api.get_read_status(job_id).await?;
    }
    ensure_not_failed(job_id, &status)?;
    Ok(status)
}

fn ensure_not_failed(job_id: &str, status: &JobStatus) -> Result<()> {
    if status.state.is_failure() {
        return Err(Error::request(
            format!("bulk read job {job_id} ended in state {}", status.state),
            Some(500),
            Some("BULK_JOB_FAILED"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;
    use std::pin::{Pin, pin};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct Lead {
        id: u64,
    }

    /// In-memory bulk API: scripted poll states, then one result page per download.
    struct FakeBulk {
        job_id: Option<&'static str>,
        states: parking_lot::Mutex<VecDeque<&'static str>>,
        pages: Vec<String>,
        polls: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl FakeBulk {
        fn new(pages: Vec<String>) -> Self {
            Self {
                job_id: Some("job-1"),
                states: parking_lot::Mutex::new(VecDeque::new()),
                pages,
                polls: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            }
        }

        fn with_states(self, states: &[&'static str]) -> Self {
            *self.states.lock() = states.iter().copied().collect();
            self
        }

        fn paged(total: u64, per_page: u64) -> Self {
            let pages = (0..total)
                .collect::<Vec<_>>()
                .chunks(per_page as usize)
                .map(|ids| {
                    ids.iter()
                        .map(|id| format!("{{\"id\":{id},\"Last_Name\":\"Lead {id}\"}}\n"))
                        .collect()
                })
                .collect();
            Self::new(pages)
        }

        fn status(&self) -> Value {
            let state = self.states.lock().pop_front().unwrap_or("COMPLETED");
            let downloaded = self.downloads.load(Ordering::SeqCst);
            json!({
                "data": [{
                    "id": self.job_id,
                    "state": state,
                    "result": { "more_records": downloaded + 1 < self.pages.len() }
                }]
            })
        }
    }

    impl BulkReadApi for FakeBulk {
        fn init_read<'a>(
            &'a self,
            _config: &'a BulkReadConfig,
        ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + 'a>> {
            let job = json!({ "data": [{ "id": self.job_id, "state": "ADDED" }] });
            Box::pin(async move { JobStatus::from_value(job) })
        }

        fn get_read_status<'a>(
            &'a self,
            _job_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<JobStatus>> + Send + 'a>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let status = self.status();
            Box::pin(async move { JobStatus::from_value(status) })
        }

        fn download_read_result<'a>(
            &'a self,
            _job_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<ByteStream>> + Send + 'a>> {
            let index = self.downloads.fetch_add(1, Ordering::SeqCst);
            let page = self.pages.get(index).cloned().unwrap_or_default();
            // Odd-sized chunks so records straddle chunk boundaries.
            let chunks: Vec<io::Result<Bytes>> = page
                .into_bytes()
                .chunks(97)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Box::pin(async move { Ok(stream::iter(chunks).boxed()) })
        }
    }

    fn fast() -> BulkReadOptions {
        BulkReadOptions {
            poll_interval: Duration::from_millis(10),
            max_wait: None,
        }
    }

    #[tokio::test]
    async fn yields_every_record_across_pages_in_order() {
        let api = FakeBulk::paged(10_000, 1_000);

        let leads: Vec<Lead> = iterate_bulk_read(&api, BulkReadConfig::new("Leads"), fast())
            .try_collect()
            .await
            .unwrap();

        assert_eq!(leads.len(), 10_000);
        assert!(leads.windows(2).all(|pair| pair[0].id < pair[1].id));
        assert_eq!(api.downloads.load(Ordering::SeqCst), 10);
        // Initial poll plus one re-poll before each of the nine later pages.
        assert_eq!(api.polls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn single_page_job_downloads_once() {
        let api = FakeBulk::new(vec!["{\"id\":1}\n{\"id\":2}".to_string()]);

        let leads: Vec<Lead> = iterate_bulk_read(&api, BulkReadConfig::new("Leads"), fast())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(leads.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(api.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(api.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_job_errors_before_any_record() {
        let api = FakeBulk::paged(10, 5).with_states(&["FAILED"]);

        let mut records = pin!(iterate_bulk_read::<Lead, _>(
            &api,
            BulkReadConfig::new("Leads"),
            fast()
        ));
        let err = records.next().await.unwrap().unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.code(), "BULK_JOB_FAILED");
        assert!(records.next().await.is_none());
        assert_eq!(api.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_terminal_state() {
        let api = FakeBulk::paged(3, 3).with_states(&["ADDED", "IN PROGRESS"]);
        let options = BulkReadOptions {
            poll_interval: Duration::from_secs(2),
            max_wait: Some(Duration::from_secs(30)),
        };

        let started = Instant::now();
        let leads: Vec<Lead> = iterate_bulk_read(&api, BulkReadConfig::new("Leads"), options)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(leads.len(), 3);
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_wait() {
        let api = FakeBulk::paged(3, 3).with_states(&["IN PROGRESS"; 10]);
        let options = BulkReadOptions {
            poll_interval: Duration::from_secs(2),
            max_wait: Some(Duration::from_secs(5)),
        };

        let err = iterate_bulk_read::<Lead, _>(&api, BulkReadConfig::new("Leads"), options)
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(408));
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(api.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_job_id_fails_fast() {
        let mut api = FakeBulk::paged(3, 3);
        api.job_id = None;

        let err = iterate_bulk_read::<Lead, _>(&api, BulkReadConfig::new("Leads"), fast())
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MISSING_JOB_ID");
        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_line_ends_the_stream() {
        let api = FakeBulk::new(vec!["{\"id\":1}\n{oops}\n{\"id\":3}\n".to_string()]);

        let mut records = pin!(iterate_bulk_read::<Lead, _>(
            &api,
            BulkReadConfig::new("Leads"),
            fast()
        ));
        assert_eq!(records.next().await.unwrap().unwrap().id, 1);
        let err = records.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), "INVALID_NDJSON");
        assert!(records.next().await.is_none());
    }
}
