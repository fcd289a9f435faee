//! Internal progress-push gateway.
//!
//! Server-to-server surface for workers reporting progress from outside
//! this process. Authenticated by a shared secret that is distinct from
//! end-user auth. Routing is by job id alone — caller-supplied brand
//! scoping is never trusted, and observers only hold job ids they already
//! obtained through brand-scoped authorization.

use crate::error::{PipelineError, Result};
use crate::model::JobSnapshot;
use crate::progress::ProgressChannel;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub struct PushGateway {
    secret: String,
    progress: Arc<ProgressChannel>,
}

impl PushGateway {
    pub fn new(secret: String, progress: Arc<ProgressChannel>) -> Self {
        Self { secret, progress }
    }

    fn authenticate(&self, secret: &str) -> Result<()> {
        if !constant_time_eq(secret.as_bytes(), self.secret.as_bytes()) {
            return Err(PipelineError::Unauthorized);
        }
        Ok(())
    }

    /// Fan a snapshot out to the job's observers. Publishing to a job
    /// nobody watches (or that finished before anyone attached) is a
    /// no-op, not an error.
    pub fn emit_progress(&self, secret: &str, snapshot: JobSnapshot) -> Result<()> {
        self.authenticate(secret)?;
        debug!(job_id = %snapshot.job_id, status = snapshot.status.as_str(), "push progress");
        self.progress.publish(snapshot);
        Ok(())
    }

    /// Detach all observers and free the per-job registry entry. Called
    /// once a terminal job has been drained, or after an idle timeout.
    pub fn cleanup_job(&self, secret: &str, job_id: Uuid) -> Result<()> {
        self.authenticate(secret)?;
        self.progress.cleanup(job_id);
        Ok(())
    }
}

/// Compare secrets without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobKind, JobStatus};
    use chrono::Utc;

    fn snapshot(job_id: Uuid) -> JobSnapshot {
        JobSnapshot {
            job_id,
            kind: JobKind::Import,
            status: JobStatus::Committing,
            processed: 10,
            total: 20,
            created: 10,
            updated: 0,
            failed: 0,
            message: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn secret_mismatch_is_rejected() {
        let progress = Arc::new(ProgressChannel::new(8));
        let gateway = PushGateway::new("s3cret".into(), Arc::clone(&progress));

        let job_id = Uuid::new_v4();
        assert!(matches!(
            gateway.emit_progress("wrong", snapshot(job_id)),
            Err(PipelineError::Unauthorized)
        ));
        assert!(matches!(
            gateway.cleanup_job("", job_id),
            Err(PipelineError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn valid_secret_routes_to_observers() {
        let progress = Arc::new(ProgressChannel::new(8));
        let gateway = PushGateway::new("s3cret".into(), Arc::clone(&progress));

        let job_id = Uuid::new_v4();
        let (mut rx, _) = progress.attach(job_id);

        gateway.emit_progress("s3cret", snapshot(job_id)).unwrap();
        assert_eq!(rx.recv().await.unwrap().processed, 10);

        // push for a job with no observers is a no-op
        gateway
            .emit_progress("s3cret", snapshot(Uuid::new_v4()))
            .unwrap();

        gateway.cleanup_job("s3cret", job_id).unwrap();
        assert_eq!(progress.observer_count(job_id), 0);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
