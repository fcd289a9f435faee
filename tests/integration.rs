use anyhow::Result;
use async_trait::async_trait;
use catalog_sync::db::{self, Pool};
use catalog_sync::error::PipelineError;
use catalog_sync::model::{FailureKind, FailureSeverity, JobStatus, RawRow, SourceId};
use catalog_sync::orchestrator::Orchestrator;
use catalog_sync::progress::ProgressChannel;
use catalog_sync::service::{Actor, PipelineService};
use catalog_sync::source::{ExportSink, MemorySink, MemorySource, RowSource};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const CHUNK: u64 = 50;

async fn setup() -> (Arc<Orchestrator>, PipelineService, Pool, i64) {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let brand = db::create_brand(&pool, "acme").await.unwrap();
    for name in ["Tops", "Bottoms"] {
        db::add_lookup(&pool, brand, db::LookupTable::Categories, name)
            .await
            .unwrap();
    }
    for name in ["Black", "White"] {
        db::add_lookup(&pool, brand, db::LookupTable::Colors, name)
            .await
            .unwrap();
    }
    db::add_lookup(&pool, brand, db::LookupTable::Sizes, "M")
        .await
        .unwrap();

    let progress = Arc::new(ProgressChannel::new(64));
    let orchestrator = Arc::new(Orchestrator::new(pool.clone(), progress, CHUNK, 0, 0));
    let service = PipelineService::new(Arc::clone(&orchestrator));
    (orchestrator, service, pool, brand)
}

fn product_row(index: i64) -> RawRow {
    let mut row = RawRow::new();
    row.insert("upid".into(), format!("UP-{:04}", index));
    row.insert("product_name".into(), format!("Product {}", index));
    row.insert("category".into(), "Tops".into());
    row
}

/// 250 rows; rows 10 and 200 are missing the required product name.
fn rows_with_two_failures() -> Vec<RawRow> {
    (1..=250)
        .map(|i| {
            let mut row = product_row(i);
            if i == 10 || i == 200 {
                row.remove("product_name");
            }
            row
        })
        .collect()
}

#[tokio::test]
async fn import_validates_then_commits_with_row_failures() {
    let (orchestrator, service, pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let job_id = service
        .submit_import_job(
            &actor,
            SourceId::Manual,
            Arc::new(MemorySource::new(rows_with_two_failures())),
        )
        .await
        .unwrap();

    // submit returns immediately with a PENDING job
    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Pending);

    // validation pass
    orchestrator.advance(job_id).await.unwrap();
    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Validated);
    assert_eq!(details.job.processed, 250);
    assert_eq!(details.job.total, 250);
    assert_eq!(details.job.failed, 2);

    // nothing committed yet
    assert_eq!(db::count_products(&pool, brand).await.unwrap(), 0);

    // approval releases the commit pass, which re-validates
    service.approve_job(&actor, job_id).await.unwrap();
    orchestrator.advance(job_id).await.unwrap();

    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    assert_eq!(details.job.processed, 250);
    assert_eq!(details.job.created, 248);
    assert_eq!(details.job.failed, 2);

    // failure list still references the original 1-based row indices
    let error_rows: Vec<i64> = details
        .failures
        .iter()
        .filter(|f| f.severity == FailureSeverity::Error)
        .map(|f| f.row_index)
        .collect();
    assert_eq!(error_rows, vec![10, 200]);
    assert!(details
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::MissingField));

    assert_eq!(db::count_products(&pool, brand).await.unwrap(), 248);

    // terminal jobs are archived, not deleted
    assert!(details.job.archived_at.is_some());
}

#[tokio::test]
async fn approve_is_only_valid_from_validated() {
    let (_orchestrator, service, _pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let job_id = service
        .submit_import_job(
            &actor,
            SourceId::Manual,
            Arc::new(MemorySource::new(vec![product_row(1)])),
        )
        .await
        .unwrap();

    let err = service.approve_job(&actor, job_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition(_)));
}

#[tokio::test]
async fn duplicate_keys_warn_and_last_row_wins() {
    let (orchestrator, service, pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let mut rows = vec![product_row(1), product_row(2)];
    let mut dup = product_row(1);
    dup.insert("product_name".into(), "Product 1 (revised)".into());
    rows.push(dup);

    let job_id = service
        .submit_import_job(&actor, SourceId::Manual, Arc::new(MemorySource::new(rows)))
        .await
        .unwrap();
    orchestrator.advance(job_id).await.unwrap();
    service.approve_job(&actor, job_id).await.unwrap();
    orchestrator.advance(job_id).await.unwrap();

    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    // the duplicate is an update of the earlier create, flagged as warning
    assert_eq!(details.job.created, 2);
    assert_eq!(details.job.updated, 1);
    assert_eq!(details.job.failed, 0);
    let warnings: Vec<_> = details
        .failures
        .iter()
        .filter(|f| f.kind == FailureKind::Duplicate)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, FailureSeverity::Warning);
    assert_eq!(warnings[0].row_index, 3);

    let product = db::find_product(&pool, brand, "UP-0001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.name, "Product 1 (revised)");
}

#[tokio::test]
async fn wrong_header_set_fails_the_job_structurally() {
    let (orchestrator, service, _pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let mut row = RawRow::new();
    row.insert("columna_a".into(), "x".into());
    row.insert("columna_b".into(), "y".into());
    let job_id = service
        .submit_import_job(
            &actor,
            SourceId::Manual,
            Arc::new(MemorySource::new(vec![row])),
        )
        .await
        .unwrap();

    orchestrator.advance(job_id).await.unwrap();
    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Failed);
    assert!(details.job.message.contains("header"));
    // a single job-level error, no row failures
    assert!(details.failures.is_empty());
}

/// Source that requests cancellation of its own job during the given
/// fetch, emulating a user hitting cancel while a chunk is in flight.
struct CancellingSource {
    inner: MemorySource,
    pool: Pool,
    job_id: std::sync::Mutex<Option<Uuid>>,
    cancel_on_fetch: u32,
    fetches: AtomicU32,
}

impl CancellingSource {
    fn set_job(&self, job_id: Uuid) {
        *self.job_id.lock().unwrap() = Some(job_id);
    }
}

#[async_trait]
impl RowSource for CancellingSource {
    async fn total(&self) -> Result<u64> {
        self.inner.total().await
    }

    async fn fetch(&self, offset: u64, limit: u64) -> Result<Vec<RawRow>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.cancel_on_fetch {
            let job_id = self.job_id.lock().unwrap().expect("job id set");
            db::request_cancel(&self.pool, job_id).await?;
        }
        self.inner.fetch(offset, limit).await
    }
}

#[tokio::test]
async fn cancel_mid_commit_keeps_committed_rows_and_reaches_cancelled() {
    let (orchestrator, service, pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let rows: Vec<RawRow> = (1..=200).map(product_row).collect();
    let source = Arc::new(CancellingSource {
        inner: MemorySource::new(rows),
        pool: pool.clone(),
        job_id: std::sync::Mutex::new(None),
        // validation fetches 4 chunks + the final empty probe; the commit
        // pass cancels during its second chunk fetch
        cancel_on_fetch: 7,
        fetches: AtomicU32::new(0),
    });

    let source_arg: Arc<dyn RowSource> = source.clone();
    let job_id = service
        .submit_import_job(&actor, SourceId::Manual, source_arg)
        .await
        .unwrap();
    source.set_job(job_id);

    orchestrator.advance(job_id).await.unwrap();
    service.approve_job(&actor, job_id).await.unwrap();

    let (mut rx, _) = service.watch_job(&actor, job_id).await.unwrap();
    orchestrator.advance(job_id).await.unwrap();

    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Cancelled);

    // the chunk in flight completed; everything after it was never touched
    assert_eq!(details.job.processed, 100);
    assert_eq!(db::count_products(&pool, brand).await.unwrap(), 100);
    assert!(db::find_product(&pool, brand, "UP-0100")
        .await
        .unwrap()
        .is_some());
    assert!(db::find_product(&pool, brand, "UP-0101")
        .await
        .unwrap()
        .is_none());

    // observers still get a terminal event, and nothing after it
    let mut last = None;
    while let Ok(snapshot) = rx.try_recv() {
        last = Some(snapshot);
    }
    assert_eq!(last.unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn export_streams_catalog_through_the_sink() {
    let (orchestrator, service, pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    for i in 1..=120 {
        db::insert_product(
            &pool,
            brand,
            &format!("UP-{:04}", i),
            &format!("Product {}", i),
            Some("Tops"),
            "{}",
            &SourceId::Manual,
        )
        .await
        .unwrap();
    }

    let sink = Arc::new(MemorySink::new());
    let sink_arg: Arc<dyn ExportSink> = sink.clone();
    let job_id = service
        .submit_export_job(&actor, sink_arg)
        .await
        .unwrap();
    orchestrator.advance(job_id).await.unwrap();

    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    assert_eq!(details.job.processed, 120);
    assert_eq!(details.job.total, 120);

    let rows = sink.rows().await;
    assert_eq!(rows.len(), 120);
    assert_eq!(rows[0].get("upid").unwrap(), "UP-0001");
    assert_eq!(rows[0].get("product_name").unwrap(), "Product 1");
}

#[tokio::test]
async fn cancelling_a_pending_job_finalizes_immediately() {
    let (_orchestrator, service, _pool, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let job_id = service
        .submit_import_job(
            &actor,
            SourceId::Manual,
            Arc::new(MemorySource::new(vec![product_row(1)])),
        )
        .await
        .unwrap();

    service.cancel_job(&actor, job_id).await.unwrap();
    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Cancelled);

    // cancelling a terminal job is an invalid transition
    let err = service.cancel_job(&actor, job_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition(_)));
}
