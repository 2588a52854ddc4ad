//! Archive fetches with retry, backoff and decompression
//!
//! A fetch is a loop of single transport attempts. Transient failures
//! (timeouts, connection errors, 408/429/5xx, short bodies) are retried with
//! capped exponential backoff plus jitter until the attempt budget runs out;
//! any other status fails immediately. A complete body is then gunzipped on
//! the blocking pool. The fetcher never touches the ledger or a destination.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use super::{archive_url, ArchiveTransport};
use crate::app::models::{DownloadOutcome, FetchedArchive, RemoteEntry};
use crate::constants::limits;
use crate::errors::{AttemptError, FetchError};

/// Attempt budget and backoff shape for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the delay (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: limits::MAX_ATTEMPTS,
            base_delay: limits::RETRY_BASE_DELAY,
            max_delay: limits::RETRY_MAX_DELAY,
            jitter_factor: limits::BACKOFF_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`, then shifted by up to
    /// `jitter_factor` of itself in either direction.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base_millis = self.base_delay.as_millis() as u64;
        let exponential = base_millis.saturating_mul(1u64 << exponent);
        let capped = exponential.min(self.max_delay.as_millis() as u64);

        let jitter_range = (capped as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jittered = if jitter_range > 0 {
            (capped + fastrand::u64(0..=jitter_range * 2)).saturating_sub(jitter_range)
        } else {
            capped
        };
        Duration::from_millis(jittered)
    }
}

/// Downloads archives and reference files through an [`ArchiveTransport`]
#[derive(Clone)]
pub struct ArchiveFetcher {
    transport: Arc<dyn ArchiveTransport>,
    base_url: Url,
    policy: RetryPolicy,
}

impl ArchiveFetcher {
    pub fn new(transport: Arc<dyn ArchiveTransport>, base_url: Url, policy: RetryPolicy) -> Self {
        Self {
            transport,
            base_url,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Download and decompress one archive of `year`
    ///
    /// `cancel` is checked before every attempt and during backoff sleeps;
    /// once it reads `true` the outcome is `FetchError::Cancelled`.
    pub async fn fetch(
        &self,
        year: i32,
        entry: &RemoteEntry,
        cancel: &watch::Receiver<bool>,
    ) -> DownloadOutcome {
        let file_id = entry.file_id().to_string();
        let url = match archive_url(&self.base_url, year, &entry.file_name) {
            Ok(url) => url,
            Err(e) => {
                return DownloadOutcome {
                    file_id: file_id.clone(),
                    attempts: 0,
                    result: Err(FetchError::DownloadFailed {
                        file_id,
                        status: None,
                        attempts: 0,
                        reason: e.to_string(),
                    }),
                }
            }
        };

        let (attempts, body) = self.fetch_with_retry(&file_id, &url, cancel).await;
        let result = match body {
            Ok(raw_bytes) => decompress_archive(&file_id, raw_bytes).await,
            Err(e) => Err(e),
        };

        DownloadOutcome {
            file_id,
            attempts,
            result,
        }
    }

    /// Download an uncompressed file from an absolute URL
    pub async fn fetch_resource(
        &self,
        file_id: &str,
        url: &Url,
        cancel: &watch::Receiver<bool>,
    ) -> DownloadOutcome {
        let (attempts, body) = self.fetch_with_retry(file_id, url, cancel).await;
        DownloadOutcome {
            file_id: file_id.to_string(),
            attempts,
            result: body.map(|raw_bytes| FetchedArchive {
                payload: raw_bytes.to_vec(),
                raw_bytes,
            }),
        }
    }

    /// Attempt loop; returns the number of attempts made and the body
    async fn fetch_with_retry(
        &self,
        file_id: &str,
        url: &Url,
        cancel: &watch::Receiver<bool>,
    ) -> (u32, Result<Bytes, FetchError>) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if *cancel.borrow() {
                return (attempt, Err(cancelled(file_id)));
            }
            attempt += 1;

            let error = match self.transport.fetch_body(url).await {
                Ok(bytes) => {
                    debug!("{}: {} bytes in {} attempt(s)", file_id, bytes.len(), attempt);
                    return (attempt, Ok(bytes));
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                debug!("{}: permanent failure: {}", file_id, error);
                return (attempt, Err(download_failed(file_id, attempt, &error)));
            }
            if attempt >= max_attempts {
                warn!(
                    "{}: giving up after {} attempts: {}",
                    file_id, attempt, error
                );
                return (attempt, Err(download_failed(file_id, attempt, &error)));
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "{}: attempt {}/{} failed: {}. Retrying in {}ms",
                file_id,
                attempt,
                max_attempts,
                error,
                delay.as_millis()
            );

            let mut cancel = cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                Ok(_) = cancel.wait_for(|cancelled| *cancelled) => {
                    return (attempt, Err(cancelled(file_id)));
                }
            }
        }
    }
}

fn cancelled(file_id: &str) -> FetchError {
    FetchError::Cancelled {
        file_id: file_id.to_string(),
    }
}

fn download_failed(file_id: &str, attempts: u32, error: &AttemptError) -> FetchError {
    FetchError::DownloadFailed {
        file_id: file_id.to_string(),
        status: error.status(),
        attempts,
        reason: error.to_string(),
    }
}

/// Gunzip a complete archive body on the blocking pool
async fn decompress_archive(
    file_id: &str,
    raw_bytes: Bytes,
) -> Result<FetchedArchive, FetchError> {
    let compressed = raw_bytes.clone();
    let decoded = tokio::task::spawn_blocking(move || gunzip(&compressed))
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| result.map_err(|e| e.to_string()));

    match decoded {
        Ok(payload) => Ok(FetchedArchive { raw_bytes, payload }),
        Err(reason) => Err(FetchError::DecompressFailed {
            file_id: file_id.to_string(),
            reason,
        }),
    }
}

/// Decode a single-member gzip stream
pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut payload = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::Mutex;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Replays a fixed sequence of attempt results, then repeats the last one
    struct Scripted {
        responses: Mutex<Vec<Result<Bytes, AttemptError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<Bytes, AttemptError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ArchiveTransport for Scripted {
        async fn fetch_page(&self, _url: &Url) -> Result<String, AttemptError> {
            Err(AttemptError::Status { status: 404 })
        }

        async fn fetch_body(&self, _url: &Url) -> Result<Bytes, AttemptError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop().unwrap()
            } else {
                responses.last().cloned().unwrap()
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    fn fetcher(transport: Arc<Scripted>, max_attempts: u32) -> ArchiveFetcher {
        ArchiveFetcher::new(
            transport,
            Url::parse("http://localhost/gsod/").unwrap(),
            fast_policy(max_attempts),
        )
    }

    fn entry() -> RemoteEntry {
        RemoteEntry::new("010010-99999-2023.op.gz")
    }

    #[tokio::test]
    async fn test_fetch_decompresses_payload() {
        let transport = Arc::new(Scripted::new(vec![Ok(Bytes::from(gzip(b"STN--- WBAN")))]));
        let (_tx, rx) = watch::channel(false);

        let outcome = fetcher(transport.clone(), 3).fetch(2023, &entry(), &rx).await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.decompressed_payload(), Some(&b"STN--- WBAN"[..]));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = Arc::new(Scripted::new(vec![
            Err(AttemptError::Status { status: 503 }),
            Err(AttemptError::Incomplete {
                received: 10,
                expected: 20,
            }),
            Ok(Bytes::from(gzip(b"payload"))),
        ]));
        let (_tx, rx) = watch::channel(false);

        let outcome = fetcher(transport.clone(), 4).fetch(2023, &entry(), &rx).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_status_fails_immediately() {
        let transport = Arc::new(Scripted::new(vec![Err(AttemptError::Status { status: 404 })]));
        let (_tx, rx) = watch::channel(false);

        let outcome = fetcher(transport.clone(), 4).fetch(2023, &entry(), &rx).await;

        match outcome.result {
            Err(FetchError::DownloadFailed {
                status, attempts, ..
            }) => {
                assert_eq!(status, Some(404));
                assert_eq!(attempts, 1);
            }
            other => panic!("expected DownloadFailed, got {:?}", other),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let transport = Arc::new(Scripted::new(vec![Err(AttemptError::Timeout)]));
        let (_tx, rx) = watch::channel(false);

        let outcome = fetcher(transport.clone(), 3).fetch(2023, &entry(), &rx).await;

        assert!(matches!(
            outcome.result,
            Err(FetchError::DownloadFailed {
                status: None,
                attempts: 3,
                ..
            })
        ));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_not_retried() {
        let transport = Arc::new(Scripted::new(vec![Ok(Bytes::from_static(b"not gzip at all"))]));
        let (_tx, rx) = watch::channel(false);

        let outcome = fetcher(transport.clone(), 4).fetch(2023, &entry(), &rx).await;

        assert!(matches!(
            outcome.result,
            Err(FetchError::DecompressFailed { .. })
        ));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_truncated_archive_fails_decompression() {
        let mut data = gzip(&vec![b'x'; 4096]);
        data.truncate(data.len() / 2);
        let transport = Arc::new(Scripted::new(vec![Ok(Bytes::from(data))]));
        let (_tx, rx) = watch::channel(false);

        let outcome = fetcher(transport, 4).fetch(2023, &entry(), &rx).await;
        assert!(matches!(
            outcome.result,
            Err(FetchError::DecompressFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_makes_no_request() {
        let transport = Arc::new(Scripted::new(vec![Ok(Bytes::from(gzip(b"x")))]));
        let (_tx, rx) = watch::channel(true);

        let outcome = fetcher(transport.clone(), 4).fetch(2023, &entry(), &rx).await;

        assert!(matches!(outcome.result, Err(FetchError::Cancelled { .. })));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_resource_skips_decompression() {
        let transport = Arc::new(Scripted::new(vec![Ok(Bytes::from_static(b"USAF,WBAN\n"))]));
        let (_tx, rx) = watch::channel(false);
        let url = Url::parse("http://localhost/noaa/isd-history.csv").unwrap();

        let outcome = fetcher(transport, 2)
            .fetch_resource("isd-history.csv", &url, &rx)
            .await;
        assert_eq!(outcome.decompressed_payload(), Some(&b"USAF,WBAN\n"[..]));
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            base_delay: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };

        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis();
            assert!((800..=1200).contains(&delay), "delay {} out of range", delay);
        }
    }
}
