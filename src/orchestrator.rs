//! Job orchestration: the durable state machine driver.
//!
//! Each job advances on its own task, chunk by chunk, strictly
//! sequentially within the job. Between chunks the driver persists a
//! checkpoint, publishes one progress snapshot and honors cancellation.
//! Transient storage/connector errors retry with the bounded backoff
//! curve; exhausted retries end the job as FAILED with a structured
//! reason — never a silent partial COMPLETED.

use crate::db::{self, Pool};
use crate::error::{PipelineError, Result};
use crate::model::{
    FailureKind, Job, JobKind, JobStatus, RawRow, RowFailure, RowOutcome, SourceId,
};
use crate::ownership;
use crate::processor;
use crate::progress::ProgressChannel;
use crate::source::{ExportSink, RowSource};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Full job record plus its ordered failure list, as returned to callers.
#[derive(Debug, Clone)]
pub struct JobDetails {
    pub job: Job,
    pub failures: Vec<RowFailure>,
}

/// Outcome of one chunked drive loop.
enum Drive {
    Done,
    /// The job already reached a terminal state (cancelled or failed);
    /// nothing further to drive.
    Stopped,
}

pub struct Orchestrator {
    pool: Pool,
    progress: Arc<ProgressChannel>,
    chunk_size: u64,
    max_chunk_retries: u32,
    max_backoff_secs: u64,
    sources: Mutex<HashMap<Uuid, Arc<dyn RowSource>>>,
    sinks: Mutex<HashMap<Uuid, Arc<dyn ExportSink>>>,
    running: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    pub fn new(
        pool: Pool,
        progress: Arc<ProgressChannel>,
        chunk_size: u64,
        max_chunk_retries: u32,
        max_backoff_secs: u64,
    ) -> Self {
        Self {
            pool,
            progress,
            chunk_size: chunk_size.max(1),
            max_chunk_retries,
            max_backoff_secs,
            sources: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    // -----------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------

    /// Create an import job. Returns immediately; rows are processed by a
    /// worker. Rejects sources that are structurally unusable up front.
    #[instrument(skip(self, source))]
    pub async fn submit_import(
        &self,
        brand_id: i64,
        acting_source: SourceId,
        source: Arc<dyn RowSource>,
    ) -> Result<Uuid> {
        let total = source
            .total()
            .await
            .map_err(|err| PipelineError::InvalidInput(format!("unreadable source: {err}")))?;
        if total == 0 {
            return Err(PipelineError::InvalidInput("source is empty".into()));
        }

        let job_id = db::create_job(&self.pool, brand_id, JobKind::Import, &acting_source).await?;
        self.sources
            .lock()
            .expect("source registry poisoned")
            .insert(job_id, source);
        info!(%job_id, brand_id, "import job submitted");
        Ok(job_id)
    }

    #[instrument(skip(self, sink))]
    pub async fn submit_export(&self, brand_id: i64, sink: Arc<dyn ExportSink>) -> Result<Uuid> {
        let job_id = db::create_job(&self.pool, brand_id, JobKind::Export, &SourceId::Manual).await?;
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .insert(job_id, sink);
        info!(%job_id, brand_id, "export job submitted");
        Ok(job_id)
    }

    /// Promotion runs as a job too: same state machine, same progress
    /// channel, same chunk discipline.
    #[instrument(skip(self))]
    pub async fn submit_promotion(&self, brand_id: i64, new_primary: SourceId) -> Result<Uuid> {
        if new_primary.is_manual() {
            return Err(PipelineError::InvalidInput(
                "promotion target must be an integration source".into(),
            ));
        }
        let job_id = db::create_job(&self.pool, brand_id, JobKind::Promote, &new_primary).await?;
        info!(%job_id, brand_id, "promotion job submitted");
        Ok(job_id)
    }

    // -----------------------------------------------------------------
    // Caller operations
    // -----------------------------------------------------------------

    pub async fn status(&self, brand_id: i64, job_id: Uuid) -> Result<JobDetails> {
        let job = db::fetch_job_scoped(&self.pool, brand_id, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        let failures = db::list_failures(&self.pool, job_id).await?;
        Ok(JobDetails { job, failures })
    }

    /// Release a VALIDATED import into its commit phase. Counters and the
    /// failure list restart; commit re-validates every row rather than
    /// trusting the earlier pass.
    #[instrument(skip(self))]
    pub async fn approve(&self, job_id: Uuid) -> Result<()> {
        let job = db::fetch_job(&self.pool, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        if job.status != JobStatus::Validated || !job.kind.requires_approval() {
            return Err(PipelineError::InvalidTransition(format!(
                "cannot approve a {} job in status {}",
                job.kind.as_str(),
                job.status.as_str()
            )));
        }
        self.begin_commit(job_id).await?;
        Ok(())
    }

    /// Request cooperative cancellation. A chunk in flight completes
    /// first; jobs idle at PENDING or VALIDATED finalize immediately so
    /// observers always get their terminal event.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let job = db::fetch_job(&self.pool, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        if job.status.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "job already {}",
                job.status.as_str()
            )));
        }
        db::request_cancel(&self.pool, job_id).await?;
        let idle = matches!(job.status, JobStatus::Pending | JobStatus::Validated)
            && !self.is_running(job_id);
        if idle {
            self.finalize_cancelled(job_id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------

    /// Polling driver: picks up runnable jobs and advances each on its
    /// own task. Chunk processing within one job stays sequential.
    pub fn spawn_worker(self: Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match db::list_runnable_jobs(&self.pool).await {
                    Ok(ids) => {
                        for id in ids {
                            if self.is_running(id) {
                                continue;
                            }
                            let me = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = me.advance(id).await {
                                    error!(?err, job_id = %id, "job advance failed");
                                }
                            });
                        }
                    }
                    Err(err) => error!(?err, "worker poll failed"),
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }

    fn is_running(&self, job_id: Uuid) -> bool {
        self.running
            .lock()
            .expect("running set poisoned")
            .contains(&job_id)
    }

    fn claim_running(&self, job_id: Uuid) -> bool {
        self.running
            .lock()
            .expect("running set poisoned")
            .insert(job_id)
    }

    fn release_running(&self, job_id: Uuid) {
        self.running
            .lock()
            .expect("running set poisoned")
            .remove(&job_id);
    }

    /// Drive a job as far as it can go in one call. Safe to call
    /// repeatedly; a job already being driven elsewhere is left alone.
    pub async fn advance(&self, job_id: Uuid) -> Result<()> {
        if !self.claim_running(job_id) {
            return Ok(());
        }
        let result = self.advance_inner(job_id).await;
        self.release_running(job_id);
        result
    }

    async fn advance_inner(&self, job_id: Uuid) -> Result<()> {
        let job = db::fetch_job(&self.pool, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        if db::cancel_requested(&self.pool, job_id).await? {
            self.finalize_cancelled(job_id).await?;
            return Ok(());
        }
        match job.status {
            JobStatus::Pending | JobStatus::Validating => self.run_validation(job).await,
            JobStatus::Committing => match self.run_commit(job).await? {
                Drive::Done | Drive::Stopped => Ok(()),
            },
            // awaiting approval; nothing to drive
            JobStatus::Validated => Ok(()),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------

    async fn run_validation(&self, job: Job) -> Result<()> {
        let job_id = job.id;
        if job.status == JobStatus::Pending {
            self.transition(job_id, JobStatus::Pending, JobStatus::Validating, "validating")
                .await?;
        }
        // validation has no side effects, so a resumed VALIDATING job
        // simply restarts its pass
        db::reset_job_counters(&self.pool, job_id).await?;
        db::clear_failures(&self.pool, job_id).await?;

        let drive = match job.kind {
            JobKind::Import => self.validate_import(&job).await?,
            // planning passes: size the job, nothing row-level to check
            JobKind::Export => {
                let total = db::count_products(&self.pool, job.brand_id).await?;
                db::update_job_counters(&self.pool, job_id, 0, total, 0, 0, 0).await?;
                Drive::Done
            }
            JobKind::Promote => {
                let plan =
                    ownership::promotion_plan(&self.pool, job.brand_id, &job.source_id).await?;
                db::update_job_counters(&self.pool, job_id, 0, plan.len() as i64, 0, 0, 0).await?;
                Drive::Done
            }
        };
        if matches!(drive, Drive::Stopped) {
            return Ok(());
        }

        self.transition(job_id, JobStatus::Validating, JobStatus::Validated, "validated")
            .await?;
        if job.kind.requires_approval() {
            return Ok(());
        }

        self.begin_commit(job_id).await?;
        let job = db::fetch_job(&self.pool, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        self.run_commit(job).await?;
        Ok(())
    }

    async fn validate_import(&self, job: &Job) -> Result<Drive> {
        let job_id = job.id;
        let Some(source) = self.source_for(job_id) else {
            self.fail_job(job_id, "import source no longer available; resubmit the job")
                .await?;
            return Ok(Drive::Stopped);
        };

        let total = match self.total_with_retry(&source).await {
            Ok(t) => t,
            Err(err) => {
                self.fail_job(job_id, &format!("source unreadable: {err}")).await?;
                return Ok(Drive::Stopped);
            }
        };
        db::update_job_counters(&self.pool, job_id, 0, total as i64, 0, 0, 0).await?;

        let mut processed: i64 = 0;
        let mut failed: i64 = 0;
        let mut seen: HashMap<String, i64> = HashMap::new();

        loop {
            if db::cancel_requested(&self.pool, job_id).await? {
                self.finalize_cancelled(job_id).await?;
                return Ok(Drive::Stopped);
            }
            let rows = match self
                .fetch_with_retry(&source, processed as u64, self.chunk_size)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    self.fail_job(job_id, &format!("row fetch failed: {err}")).await?;
                    return Ok(Drive::Stopped);
                }
            };
            if rows.is_empty() {
                break;
            }
            // malformed header sets surface on the first chunk, as a
            // job-level error rather than per-row noise
            if processed == 0 {
                if let Err(msg) = processor::check_structure(&rows) {
                    self.fail_job(job_id, &msg).await?;
                    return Ok(Drive::Stopped);
                }
            }

            let lookups = db::load_lookups(&self.pool, job.brand_id).await?;
            let mut chunk_failures = Vec::new();
            for row in &rows {
                processed += 1;
                track_duplicate(&mut seen, row, processed, &mut chunk_failures);
                let report = processor::validate_row(row, &lookups, processed);
                if report.has_errors() {
                    failed += 1;
                }
                chunk_failures.extend(report.failures);
            }

            db::append_failures(&self.pool, job_id, &chunk_failures).await?;
            db::update_job_counters(&self.pool, job_id, processed, total as i64, 0, 0, failed)
                .await?;
            self.publish_state(job_id).await?;
        }
        Ok(Drive::Done)
    }

    /// Enter COMMITTING with fresh counters; the commit pass re-validates
    /// and re-counts everything, so the final record reflects it alone.
    /// Counters reset before the transition publishes, keeping the
    /// observer-visible sequence free of regressions within the phase.
    async fn begin_commit(&self, job_id: Uuid) -> Result<()> {
        db::reset_job_counters(&self.pool, job_id).await?;
        db::clear_failures(&self.pool, job_id).await?;
        self.transition(job_id, JobStatus::Validated, JobStatus::Committing, "committing")
            .await?;
        Ok(())
    }

    async fn run_commit(&self, job: Job) -> Result<Drive> {
        let drive = match job.kind {
            JobKind::Import => self.commit_import(&job).await?,
            JobKind::Export => self.commit_export(&job).await?,
            JobKind::Promote => self.commit_promotion(&job).await?,
        };
        if matches!(drive, Drive::Stopped) {
            return Ok(Drive::Stopped);
        }
        self.transition(job.id, JobStatus::Committing, JobStatus::Completed, "completed")
            .await?;
        Ok(Drive::Done)
    }

    async fn commit_import(&self, job: &Job) -> Result<Drive> {
        let job_id = job.id;
        let Some(source) = self.source_for(job_id) else {
            self.fail_job(job_id, "import source no longer available; resubmit the job")
                .await?;
            return Ok(Drive::Stopped);
        };

        // resume from the persisted checkpoint after a restart
        let mut processed = job.processed;
        let mut created = job.created;
        let mut updated = job.updated;
        let mut failed = job.failed;
        let total = job.total;
        let mut seen: HashMap<String, i64> = HashMap::new();

        loop {
            if db::cancel_requested(&self.pool, job_id).await? {
                self.finalize_cancelled(job_id).await?;
                return Ok(Drive::Stopped);
            }
            let rows = match self
                .fetch_with_retry(&source, processed as u64, self.chunk_size)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    self.fail_job(job_id, &format!("row fetch failed: {err}")).await?;
                    return Ok(Drive::Stopped);
                }
            };
            if rows.is_empty() {
                break;
            }

            let lookups = db::load_lookups(&self.pool, job.brand_id).await?;
            let mut chunk_failures = Vec::new();
            for row in &rows {
                processed += 1;
                track_duplicate(&mut seen, row, processed, &mut chunk_failures);
                let report = match self
                    .commit_row_with_retry(job.brand_id, row, &lookups, &job.source_id, processed)
                    .await
                {
                    Ok(report) => report,
                    Err(err) => {
                        self.fail_job(job_id, &format!("storage failure: {err}")).await?;
                        return Ok(Drive::Stopped);
                    }
                };
                match report.outcome {
                    RowOutcome::Created => created += 1,
                    RowOutcome::Updated => updated += 1,
                    RowOutcome::Failed => failed += 1,
                    RowOutcome::Skipped => {}
                }
                chunk_failures.extend(report.failures);
            }

            db::append_failures(&self.pool, job_id, &chunk_failures).await?;
            db::update_job_counters(&self.pool, job_id, processed, total, created, updated, failed)
                .await?;
            self.publish_state(job_id).await?;
        }
        Ok(Drive::Done)
    }

    async fn commit_export(&self, job: &Job) -> Result<Drive> {
        let job_id = job.id;
        let Some(sink) = self.sink_for(job_id) else {
            self.fail_job(job_id, "export sink no longer available; resubmit the job")
                .await?;
            return Ok(Drive::Stopped);
        };

        let mut processed = job.processed;
        let total = job.total;
        loop {
            if db::cancel_requested(&self.pool, job_id).await? {
                self.finalize_cancelled(job_id).await?;
                return Ok(Drive::Stopped);
            }
            let page = db::list_products_page(
                &self.pool,
                job.brand_id,
                processed,
                self.chunk_size as i64,
            )
            .await?;
            if page.is_empty() {
                break;
            }
            let rows: Vec<RawRow> = page.iter().map(processor::product_to_row).collect();
            if let Err(err) = self.write_rows_with_retry(&sink, &rows).await {
                self.fail_job(job_id, &format!("export write failed: {err}")).await?;
                return Ok(Drive::Stopped);
            }
            processed += page.len() as i64;
            db::update_job_counters(&self.pool, job_id, processed, total, 0, 0, 0).await?;
            self.publish_state(job_id).await?;
        }
        Ok(Drive::Done)
    }

    async fn commit_promotion(&self, job: &Job) -> Result<Drive> {
        let job_id = job.id;
        let new_primary = job.source_id.clone();

        // the plan shrinks as entities are promoted, which is exactly what
        // makes a resumed or re-run promotion touch only the remainder
        let plan = ownership::promotion_plan(&self.pool, job.brand_id, &new_primary).await?;
        let mut processed = job.processed;
        let mut updated = job.updated;
        let total = processed + plan.len() as i64;
        db::update_job_counters(&self.pool, job_id, processed, total, 0, updated, 0).await?;

        for chunk in plan.chunks(self.chunk_size as usize) {
            if db::cancel_requested(&self.pool, job_id).await? {
                self.finalize_cancelled(job_id).await?;
                return Ok(Drive::Stopped);
            }
            for candidate in chunk {
                let changed = match ownership::promote_product(
                    &self.pool,
                    job.brand_id,
                    candidate,
                    &new_primary,
                )
                .await
                {
                    Ok(changed) => changed,
                    Err(err) => {
                        self.fail_job(job_id, &format!("promotion failed: {err}")).await?;
                        return Ok(Drive::Stopped);
                    }
                };
                processed += 1;
                if changed {
                    updated += 1;
                }
            }
            db::update_job_counters(&self.pool, job_id, processed, total, 0, updated, 0).await?;
            self.publish_state(job_id).await?;
        }
        Ok(Drive::Done)
    }

    // -----------------------------------------------------------------
    // Terminal paths and plumbing
    // -----------------------------------------------------------------

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        message: &str,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition(format!(
                "{} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        db::set_job_status(&self.pool, job_id, to, message).await?;
        self.publish_state(job_id).await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, message: &str) -> Result<()> {
        warn!(%job_id, message, "job failed");
        db::set_job_status(&self.pool, job_id, JobStatus::Failed, message).await?;
        self.publish_state(job_id).await?;
        Ok(())
    }

    async fn finalize_cancelled(&self, job_id: Uuid) -> Result<()> {
        let job = db::fetch_job(&self.pool, job_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        info!(%job_id, "job cancelled");
        db::set_job_status(&self.pool, job_id, JobStatus::Cancelled, "cancelled").await?;
        self.publish_state(job_id).await?;
        Ok(())
    }

    async fn publish_state(&self, job_id: Uuid) -> Result<()> {
        if let Some(job) = db::fetch_job(&self.pool, job_id).await? {
            self.progress.publish(job.snapshot());
        }
        Ok(())
    }

    fn source_for(&self, job_id: Uuid) -> Option<Arc<dyn RowSource>> {
        self.sources
            .lock()
            .expect("source registry poisoned")
            .get(&job_id)
            .cloned()
    }

    fn sink_for(&self, job_id: Uuid) -> Option<Arc<dyn ExportSink>> {
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .get(&job_id)
            .cloned()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        // 5s * 2^attempt, capped
        let secs = 5u64.saturating_mul(1 << attempt.min(10));
        Duration::from_secs(secs.min(self.max_backoff_secs))
    }

    async fn total_with_retry(&self, source: &Arc<dyn RowSource>) -> anyhow::Result<u64> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(STORAGE_TIMEOUT, source.total()).await {
                Ok(Ok(total)) => return Ok(total),
                Ok(Err(err)) if attempt >= self.max_chunk_retries => return Err(err),
                Err(_) if attempt >= self.max_chunk_retries => {
                    return Err(anyhow::anyhow!("source timed out"));
                }
                other => {
                    warn!(attempt, timed_out = other.is_err(), "source total failed; backing off");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        source: &Arc<dyn RowSource>,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<RawRow>> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(STORAGE_TIMEOUT, source.fetch(offset, limit)).await {
                Ok(Ok(rows)) => return Ok(rows),
                Ok(Err(err)) if attempt >= self.max_chunk_retries => return Err(err),
                Err(_) if attempt >= self.max_chunk_retries => {
                    return Err(anyhow::anyhow!("row fetch timed out"));
                }
                other => {
                    warn!(attempt, timed_out = other.is_err(), "row fetch failed; backing off");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn write_rows_with_retry(
        &self,
        sink: &Arc<dyn ExportSink>,
        rows: &[RawRow],
    ) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            match sink.write_rows(rows).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= self.max_chunk_retries => return Err(err),
                Err(err) => {
                    warn!(?err, attempt, "export write failed; backing off");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn commit_row_with_retry(
        &self,
        brand_id: i64,
        row: &RawRow,
        lookups: &db::Lookups,
        acting_source: &SourceId,
        row_index: i64,
    ) -> anyhow::Result<crate::model::RowReport> {
        let mut attempt = 0;
        loop {
            match processor::commit_row(&self.pool, brand_id, row, lookups, acting_source, row_index)
                .await
            {
                Ok(report) => return Ok(report),
                Err(err) if attempt >= self.max_chunk_retries => return Err(err),
                Err(err) => {
                    warn!(?err, attempt, row_index, "row commit failed; backing off");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Duplicate identifying keys within one job resolve "last row wins"; the
/// later row carries a warning pointing back at the one it supersedes.
fn track_duplicate(
    seen: &mut HashMap<String, i64>,
    row: &RawRow,
    row_index: i64,
    failures: &mut Vec<RowFailure>,
) {
    let Some(key) = processor::identifying_key(row) else {
        return;
    };
    if let Some(first_index) = seen.insert(key.clone(), row_index) {
        failures.push(RowFailure::new(
            row_index,
            processor::COL_UPID,
            FailureKind::Duplicate,
            format!("duplicate key '{}' supersedes row {}", key, first_index),
        ));
    }
}
