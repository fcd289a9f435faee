//! Ordering guarantees on the live status stream: counters never regress
//! for a single observer, and a terminal snapshot is the last word.

use catalog_sync::db;
use catalog_sync::model::{JobSnapshot, JobStatus, RawRow, SourceId};
use catalog_sync::orchestrator::Orchestrator;
use catalog_sync::progress::ProgressChannel;
use catalog_sync::service::{Actor, PipelineService};
use catalog_sync::source::MemorySource;
use std::sync::Arc;
use tokio::sync::broadcast;

async fn setup() -> (Arc<Orchestrator>, PipelineService, i64) {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let brand = db::create_brand(&pool, "acme").await.unwrap();
    db::add_lookup(&pool, brand, db::LookupTable::Categories, "Tops")
        .await
        .unwrap();

    let progress = Arc::new(ProgressChannel::new(128));
    let orchestrator = Arc::new(Orchestrator::new(pool, progress, 50, 0, 0));
    let service = PipelineService::new(Arc::clone(&orchestrator));
    (orchestrator, service, brand)
}

fn rows(n: i64) -> Vec<RawRow> {
    (1..=n)
        .map(|i| {
            let mut row = RawRow::new();
            row.insert("upid".into(), format!("UP-{:04}", i));
            row.insert("product_name".into(), format!("Product {}", i));
            row
        })
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<JobSnapshot>) -> Vec<JobSnapshot> {
    let mut events = Vec::new();
    while let Ok(snapshot) = rx.try_recv() {
        events.push(snapshot);
    }
    events
}

#[tokio::test]
async fn counters_are_monotonic_and_bounded_by_total() {
    let (orchestrator, service, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let job_id = service
        .submit_import_job(&actor, SourceId::Manual, Arc::new(MemorySource::new(rows(250))))
        .await
        .unwrap();
    let (mut rx, observers) = service.watch_job(&actor, job_id).await.unwrap();
    assert_eq!(observers, 1);

    orchestrator.advance(job_id).await.unwrap();
    service.approve_job(&actor, job_id).await.unwrap();
    orchestrator.advance(job_id).await.unwrap();

    let events = drain(&mut rx);
    assert!(!events.is_empty());

    // processed never regresses within a phase and never exceeds total
    let mut last_processed = 0;
    let mut last_status = None;
    for event in &events {
        assert!(event.processed <= event.total);
        if last_status == Some(event.status) {
            assert!(event.processed >= last_processed);
        }
        last_processed = event.processed;
        last_status = Some(event.status);
    }

    // phases arrive in machine order
    let statuses: Vec<JobStatus> = events.iter().map(|e| e.status).collect();
    let validating = statuses
        .iter()
        .position(|s| *s == JobStatus::Validating)
        .unwrap();
    let validated = statuses
        .iter()
        .position(|s| *s == JobStatus::Validated)
        .unwrap();
    let committing = statuses
        .iter()
        .position(|s| *s == JobStatus::Committing)
        .unwrap();
    let completed = statuses
        .iter()
        .position(|s| *s == JobStatus::Completed)
        .unwrap();
    assert!(validating < validated);
    assert!(validated < committing);
    assert!(committing < completed);
}

#[tokio::test]
async fn exactly_one_terminal_event_closes_the_stream() {
    let (orchestrator, service, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let job_id = service
        .submit_import_job(&actor, SourceId::Manual, Arc::new(MemorySource::new(rows(60))))
        .await
        .unwrap();
    let (mut rx, _) = service.watch_job(&actor, job_id).await.unwrap();

    orchestrator.advance(job_id).await.unwrap();
    service.approve_job(&actor, job_id).await.unwrap();
    orchestrator.advance(job_id).await.unwrap();

    let events = drain(&mut rx);
    let terminal_count = events.iter().filter(|e| e.status.is_terminal()).count();
    assert_eq!(terminal_count, 1);
    assert_eq!(events.last().unwrap().status, JobStatus::Completed);

    // nothing more arrives after the terminal snapshot
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn late_observer_can_recover_from_status_fetch() {
    let (orchestrator, service, brand) = setup().await;
    let actor = Actor::member_of(brand);

    let job_id = service
        .submit_import_job(&actor, SourceId::Manual, Arc::new(MemorySource::new(rows(10))))
        .await
        .unwrap();

    // the whole job runs before anyone attaches; publishes are no-ops
    orchestrator.advance(job_id).await.unwrap();
    service.approve_job(&actor, job_id).await.unwrap();
    orchestrator.advance(job_id).await.unwrap();

    // a late observer sees no events but the record has the truth
    let (mut rx, _) = service.watch_job(&actor, job_id).await.unwrap();
    assert!(drain(&mut rx).is_empty());
    let details = service.get_job_status(&actor, job_id).await.unwrap();
    assert_eq!(details.job.status, JobStatus::Completed);
    assert_eq!(details.job.processed, 10);
}
