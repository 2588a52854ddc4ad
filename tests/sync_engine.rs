//! End-to-end sync runs against a scripted in-process GSOD server
//!
//! Every test drives the real lister, fetcher, planner, worker pool, store
//! and ledger; only the HTTP transport is replaced.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use url::Url;

use gsod_sync::app::store::FilesystemBucket;
use gsod_sync::app::{
    ArchiveFetcher, ArchiveTransport, CancelHandle, CoordinatorConfig, DirectoryLister, FailureKind,
    IngestionLedger, IngestionStatus, LayoutResolver, LoadMode, RetryPolicy, RunRequest,
    StoreWriter, SyncCoordinator, SyncEvent,
};
use gsod_sync::errors::AttemptError;

const BASE_URL: &str = "http://gsod.test/pub/data/gsod/";

#[derive(Clone)]
enum Reply {
    Page(String),
    Body(Bytes),
    Status(u16),
}

/// In-memory GSOD tree keyed by URL path
#[derive(Default)]
struct ScriptedSource {
    replies: Mutex<HashMap<String, Reply>>,
    body_requests: Mutex<HashMap<String, usize>>,
    cancel_on_body: Mutex<Option<CancelHandle>>,
}

impl ScriptedSource {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, path: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(format!("/pub/data/gsod/{}", path), reply);
    }

    /// Publish a year directory whose archives contain their own name
    fn publish_year(&self, year: i32, files: &[(&str, u64)]) {
        let mut page = String::from("<html><body><pre><a href=\"../\">../</a>\n");
        for (name, size) in files {
            page.push_str(&format!(
                "<a href=\"{name}\">{name}</a>    2024-01-05 10:12    {size}\n"
            ));
            self.set(&format!("{}/{}", year, name), Reply::Body(gzip(name.as_bytes())));
        }
        page.push_str("</pre></body></html>");
        self.set(&format!("{}/", year), Reply::Page(page));
    }

    /// Cancel `handle` while serving the next archive body
    fn cancel_on_next_body(&self, handle: CancelHandle) {
        *self.cancel_on_body.lock().unwrap() = Some(handle);
    }

    fn body_requests(&self) -> usize {
        self.body_requests.lock().unwrap().values().sum()
    }

    fn requests_for(&self, path: &str) -> usize {
        self.body_requests
            .lock()
            .unwrap()
            .get(&format!("/pub/data/gsod/{}", path))
            .copied()
            .unwrap_or(0)
    }

    fn reply(&self, url: &Url) -> Option<Reply> {
        self.replies.lock().unwrap().get(url.path()).cloned()
    }
}

#[async_trait]
impl ArchiveTransport for ScriptedSource {
    async fn fetch_page(&self, url: &Url) -> Result<String, AttemptError> {
        match self.reply(url) {
            Some(Reply::Page(html)) => Ok(html),
            Some(Reply::Status(status)) => Err(AttemptError::Status { status }),
            _ => Err(AttemptError::Status { status: 404 }),
        }
    }

    async fn fetch_body(&self, url: &Url) -> Result<Bytes, AttemptError> {
        *self
            .body_requests
            .lock()
            .unwrap()
            .entry(url.path().to_string())
            .or_insert(0) += 1;
        if let Some(handle) = self.cancel_on_body.lock().unwrap().take() {
            handle.cancel();
        }
        match self.reply(url) {
            Some(Reply::Body(bytes)) => Ok(bytes),
            Some(Reply::Status(status)) => Err(AttemptError::Status { status }),
            _ => Err(AttemptError::Status { status: 404 }),
        }
    }
}

fn gzip(data: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

struct Harness {
    temp_dir: TempDir,
    source: Arc<ScriptedSource>,
}

impl Harness {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
            source: ScriptedSource::new(),
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.temp_dir.path().join("ledger/ingestion.jsonl")
    }

    fn raw_root(&self) -> PathBuf {
        self.temp_dir.path().join("raw")
    }

    fn resolver(&self) -> LayoutResolver {
        LayoutResolver::Local {
            root: self.raw_root(),
        }
    }

    async fn coordinator(&self) -> SyncCoordinator {
        self.coordinator_with_store(StoreWriter::local()).await
    }

    async fn coordinator_with_store(&self, store: StoreWriter) -> SyncCoordinator {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        self.coordinator_with(store, policy).await
    }

    async fn coordinator_with(&self, store: StoreWriter, policy: RetryPolicy) -> SyncCoordinator {
        let base_url = Url::parse(BASE_URL).unwrap();
        let transport: Arc<dyn ArchiveTransport> = self.source.clone();
        let ledger = Arc::new(IngestionLedger::open(self.ledger_path()).await.unwrap());

        SyncCoordinator::new(
            CoordinatorConfig::default().with_worker_count(2),
            DirectoryLister::new(transport.clone(), base_url.clone()),
            ArchiveFetcher::new(transport, base_url, policy),
            store,
            ledger,
        )
    }
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn test_first_historical_run_then_incremental_rerun() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 1234)]);

    let coordinator = harness.coordinator().await;
    let plan = coordinator
        .plan_year(2023, LoadMode::Historical, None, &[])
        .await
        .unwrap();
    assert_eq!(plan.file_ids(), vec!["010010-99999-2023.op.gz"]);

    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    let year = report.year(2023).unwrap();
    assert_eq!((year.planned, year.succeeded, year.failed.len()), (1, 1, 0));

    let record = coordinator
        .ledger()
        .get("010010-99999-2023.op.gz")
        .await
        .unwrap();
    assert_eq!(record.status, IngestionStatus::Committed);
    assert_eq!(record.last_seen_size, Some(1234));
    assert_eq!(coordinator.ledger().len().await, 1);

    let written = harness.raw_root().join("2023/010010-99999-2023.op");
    assert_eq!(read(&written), b"010010-99999-2023.op.gz");

    // Second run, unchanged listing
    let plan = coordinator
        .plan_year(2023, LoadMode::Incremental, None, &[])
        .await
        .unwrap();
    assert!(plan.is_empty());
    assert_eq!(plan.skipped_count, 1);

    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Incremental),
            &harness.resolver(),
        )
        .await
        .unwrap();
    assert_eq!(report.total_planned(), 0);
    assert_eq!(report.total_skipped(), 1);
    assert_eq!(harness.source.body_requests(), 1);
}

#[tokio::test]
async fn test_historical_rerun_is_idempotent_across_reopen() {
    let harness = Harness::new();
    harness.source.publish_year(
        2023,
        &[
            ("010010-99999-2023.op.gz", 100),
            ("010014-99999-2023.op.gz", 200),
        ],
    );
    let request = RunRequest::new(vec![2023], LoadMode::Historical);

    {
        let coordinator = harness.coordinator().await;
        let report = coordinator.run(&request, &harness.resolver()).await.unwrap();
        assert_eq!(report.total_succeeded(), 2);
    }

    // A fresh process reopens the compacted journal
    let coordinator = harness.coordinator().await;
    let report = coordinator.run(&request, &harness.resolver()).await.unwrap();
    assert_eq!(report.total_planned(), 0);
    assert_eq!(report.total_skipped(), 2);
    assert_eq!(harness.source.body_requests(), 2);
}

#[tokio::test]
async fn test_failed_file_does_not_block_the_batch() {
    let harness = Harness::new();
    harness.source.publish_year(
        2023,
        &[
            ("010010-99999-2023.op.gz", 100),
            ("010014-99999-2023.op.gz", 100),
            ("010020-99999-2023.op.gz", 100),
        ],
    );
    harness
        .source
        .set("2023/010014-99999-2023.op.gz", Reply::Status(404));

    let coordinator = harness.coordinator().await;
    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    let year = report.year(2023).unwrap();
    assert_eq!(year.succeeded, 2);
    assert_eq!(year.failed.len(), 1);
    assert_eq!(year.failed[0].file_id, "010014-99999-2023.op.gz");
    assert_eq!(year.failed[0].kind, FailureKind::Download);
    assert_eq!(year.failed[0].attempts, 1);

    let ledger = coordinator.ledger();
    for committed in ["010010-99999-2023.op.gz", "010020-99999-2023.op.gz"] {
        assert_eq!(
            ledger.get(committed).await.unwrap().status,
            IngestionStatus::Committed
        );
    }
    assert_eq!(
        ledger.get("010014-99999-2023.op.gz").await.unwrap().status,
        IngestionStatus::DownloadFailed
    );
    assert!(!harness
        .raw_root()
        .join("2023/010014-99999-2023.op")
        .exists());

    // The failed file is retried by the next incremental run
    harness.source.publish_year(
        2023,
        &[
            ("010010-99999-2023.op.gz", 100),
            ("010014-99999-2023.op.gz", 100),
            ("010020-99999-2023.op.gz", 100),
        ],
    );
    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Incremental),
            &harness.resolver(),
        )
        .await
        .unwrap();
    assert_eq!(report.total_planned(), 1);
    assert_eq!(report.total_succeeded(), 1);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);
    harness
        .source
        .set("2023/010010-99999-2023.op.gz", Reply::Status(503));

    let coordinator = harness.coordinator().await;
    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    let failure = &report.year(2023).unwrap().failed[0];
    assert_eq!(failure.attempts, 3);
    assert_eq!(
        harness.source.requests_for("2023/010010-99999-2023.op.gz"),
        3
    );
}

#[tokio::test]
async fn test_corrupt_archive_is_decompress_failure() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);
    harness.source.set(
        "2023/010010-99999-2023.op.gz",
        Reply::Body(Bytes::from_static(b"definitely not gzip")),
    );

    let coordinator = harness.coordinator().await;
    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    assert_eq!(
        report.year(2023).unwrap().failed[0].kind,
        FailureKind::Decompress
    );
    let record = coordinator
        .ledger()
        .get("010010-99999-2023.op.gz")
        .await
        .unwrap();
    assert_eq!(record.status, IngestionStatus::DecompressFailed);
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn test_changed_size_is_picked_up_incrementally() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);
    let coordinator = harness.coordinator().await;
    coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 250)]);

    let historical = coordinator
        .plan_year(2023, LoadMode::Historical, None, &[])
        .await
        .unwrap();
    assert!(historical.is_empty());

    let incremental = coordinator
        .plan_year(2023, LoadMode::Incremental, None, &[])
        .await
        .unwrap();
    assert_eq!(incremental.file_ids(), vec!["010010-99999-2023.op.gz"]);

    coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Incremental),
            &harness.resolver(),
        )
        .await
        .unwrap();
    let record = coordinator
        .ledger()
        .get("010010-99999-2023.op.gz")
        .await
        .unwrap();
    assert_eq!(record.status, IngestionStatus::Committed);
    assert_eq!(record.last_seen_size, Some(250));
}

#[tokio::test]
async fn test_sample_cap_defers_the_rest() {
    let harness = Harness::new();
    let names: Vec<String> = (0..5)
        .map(|i| format!("0100{:02}-99999-2023.op.gz", i))
        .collect();
    let files: Vec<(&str, u64)> = names.iter().map(|n| (n.as_str(), 10)).collect();
    harness.source.publish_year(2023, &files);

    let coordinator = harness.coordinator().await;
    let request = RunRequest::new(vec![2023], LoadMode::Incremental).with_sample_cap(Some(2));

    let report = coordinator.run(&request, &harness.resolver()).await.unwrap();
    let year = report.year(2023).unwrap();
    assert_eq!((year.planned, year.succeeded, year.deferred), (2, 2, 3));
    assert!(harness.raw_root().join("2023/010000-99999-2023.op").exists());
    assert!(harness.raw_root().join("2023/010001-99999-2023.op").exists());
    assert!(!harness.raw_root().join("2023/010002-99999-2023.op").exists());

    let report = coordinator.run(&request, &harness.resolver()).await.unwrap();
    let year = report.year(2023).unwrap();
    assert_eq!((year.planned, year.skipped, year.deferred), (2, 2, 1));
}

#[tokio::test]
async fn test_unavailable_listing_only_skips_that_year() {
    let harness = Harness::new();
    harness.source.set("2022/", Reply::Status(500));
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);

    let coordinator = harness.coordinator().await;
    let report = coordinator
        .run(
            &RunRequest::new(vec![2022, 2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    assert_eq!(report.years.len(), 2);
    assert!(report.year(2022).unwrap().listing_error.is_some());
    assert_eq!(report.year(2023).unwrap().succeeded, 1);
    assert_eq!(report.unavailable_years(), vec![2022]);
}

#[tokio::test]
async fn test_unopenable_ledger_is_unavailable() {
    let temp_dir = TempDir::new().unwrap();
    let blocker = temp_dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"file").unwrap();

    let err = IngestionLedger::open(blocker.join("ingestion.jsonl"))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_cancelled_run_fetches_nothing() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);

    let coordinator = harness.coordinator().await;
    coordinator.cancel_handle().cancel();

    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.years.is_empty());
    assert_eq!(harness.source.body_requests(), 0);
    assert!(coordinator.ledger().is_empty().await);
}

#[tokio::test]
async fn test_cancel_during_retry_backoff_writes_nothing() {
    let harness = Harness::new();
    let name = "010010-99999-2023.op.gz";
    harness.source.publish_year(2023, &[(name, 100)]);
    harness
        .source
        .set(&format!("2023/{}", name), Reply::Status(503));

    let coordinator = harness
        .coordinator_with(
            StoreWriter::local(),
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                ..RetryPolicy::default()
            },
        )
        .await;
    let cancel = coordinator.cancel_handle();
    let request = RunRequest::new(vec![2023], LoadMode::Historical);
    let resolver = harness.resolver();

    let canceller = async {
        while harness.source.requests_for(&format!("2023/{}", name)) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    };
    let (report, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(coordinator.run(&request, &resolver), canceller)
    })
    .await
    .expect("backoff was not interrupted by cancellation");
    let report = report.unwrap();

    assert!(report.cancelled);
    let year = report.year(2023).unwrap();
    assert_eq!((year.planned, year.succeeded, year.failed.len()), (1, 0, 0));
    assert!(year.cancelled);
    assert_eq!(harness.source.requests_for(&format!("2023/{}", name)), 1);

    assert!(!harness.raw_root().join("2023/010010-99999-2023.op").exists());
    assert_eq!(
        coordinator.ledger().get(name).await.unwrap().status,
        IngestionStatus::Pending
    );
}

#[tokio::test]
async fn test_cancel_after_download_skips_the_write() {
    let harness = Harness::new();
    let name = "010010-99999-2023.op.gz";
    harness.source.publish_year(2023, &[(name, 100)]);
    let target = harness.raw_root().join("2023/010010-99999-2023.op");

    let coordinator = harness.coordinator().await;
    harness
        .source
        .cancel_on_next_body(coordinator.cancel_handle());
    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();

    let year = report.year(2023).unwrap();
    assert_eq!((year.succeeded, year.failed.len()), (0, 0));
    assert!(year.cancelled);
    assert!(!target.exists());
    assert_eq!(
        coordinator.ledger().get(name).await.unwrap().status,
        IngestionStatus::Downloaded
    );
    drop(coordinator);

    // The abandoned file is picked up by the next run
    let coordinator = harness.coordinator().await;
    let report = coordinator
        .run(
            &RunRequest::new(vec![2023], LoadMode::Incremental),
            &harness.resolver(),
        )
        .await
        .unwrap();
    assert_eq!(report.total_succeeded(), 1);
    assert_eq!(read(&target), b"010010-99999-2023.op.gz");
}

#[tokio::test]
async fn test_file_filter_limits_the_run() {
    let harness = Harness::new();
    harness.source.publish_year(
        2023,
        &[
            ("010010-99999-2023.op.gz", 100),
            ("010014-99999-2023.op.gz", 100),
        ],
    );

    let coordinator = harness.coordinator().await;
    let request = RunRequest::for_files(
        &["010014-99999-2023.op.gz".to_string()],
        LoadMode::Historical,
    );
    let report = coordinator.run(&request, &harness.resolver()).await.unwrap();

    assert_eq!(report.total_succeeded(), 1);
    assert!(coordinator
        .ledger()
        .get("010010-99999-2023.op.gz")
        .await
        .is_none());
    assert_eq!(harness.source.requests_for("2023/010010-99999-2023.op.gz"), 0);
}

#[tokio::test]
async fn test_discover_years_from_index() {
    let harness = Harness::new();
    harness.source.set(
        "",
        Reply::Page(
            "<pre><a href=\"../\">../</a>\n\
             <a href=\"1929/\">1929/</a>    01-Mar-2020 00:00    -\n\
             <a href=\"2023/\">2023/</a>    05-Jan-2024 10:12    -\n\
             <a href=\"isd-history.csv\">isd-history.csv</a>    05-Jan-2024 10:12    30M\n</pre>"
                .to_string(),
        ),
    );

    let coordinator = harness.coordinator().await;
    let all: Vec<i32> = coordinator
        .discover_years(None)
        .await
        .unwrap()
        .iter()
        .map(|y| y.year)
        .collect();
    assert_eq!(all, vec![1929, 2023]);

    let since = chrono::DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let recent: Vec<i32> = coordinator
        .discover_years(Some(since))
        .await
        .unwrap()
        .iter()
        .map(|y| y.year)
        .collect();
    assert_eq!(recent, vec![2023]);
}

#[tokio::test]
async fn test_progress_events_follow_the_run() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);
    harness.source.set("2024/", Reply::Status(503));

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let coordinator = harness.coordinator().await.with_progress(tx);
    coordinator
        .run(
            &RunRequest::new(vec![2023, 2024], LoadMode::Historical),
            &harness.resolver(),
        )
        .await
        .unwrap();
    drop(coordinator);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(events.first(), Some(&SyncEvent::YearStarted { year: 2023 }));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::FileCommitted { year: 2023, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::ListingFailed { year: 2024, .. })));
}

#[tokio::test]
async fn test_cloud_bucket_commit_and_failed_write() {
    let harness = Harness::new();
    harness
        .source
        .publish_year(2023, &[("010010-99999-2023.op.gz", 100)]);
    let bucket_root = harness.temp_dir.path().join("bucket");
    let store = StoreWriter::with_object_store(Arc::new(FilesystemBucket::new(&bucket_root)));
    let resolver = LayoutResolver::Cloud {
        container: "raw".to_string(),
        prefix: "data".to_string(),
    };

    let coordinator = harness.coordinator_with_store(store.clone()).await;
    let report = coordinator
        .run(&RunRequest::new(vec![2023], LoadMode::Historical), &resolver)
        .await
        .unwrap();
    assert_eq!(report.total_succeeded(), 1);
    assert_eq!(
        read(&bucket_root.join("raw/data/2023/010010-99999-2023.op")),
        b"010010-99999-2023.op.gz"
    );

    // A container that cannot hold objects fails the write and leaves no staging object
    harness
        .source
        .publish_year(2023, &[("010014-99999-2023.op.gz", 100)]);
    std::fs::write(bucket_root.join("blocked"), b"file").unwrap();
    let blocked = LayoutResolver::Cloud {
        container: "blocked".to_string(),
        prefix: "data".to_string(),
    };
    let report = coordinator
        .run(&RunRequest::new(vec![2023], LoadMode::Historical), &blocked)
        .await
        .unwrap();

    let failure = &report.year(2023).unwrap().failed[0];
    assert_eq!(failure.kind, FailureKind::Write);
    assert_eq!(
        coordinator
            .ledger()
            .get("010014-99999-2023.op.gz")
            .await
            .unwrap()
            .status,
        IngestionStatus::WriteFailed
    );
    assert_eq!(read(&bucket_root.join("blocked")), b"file");
}
