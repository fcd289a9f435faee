//! Per-job progress fan-out.
//!
//! An injected, explicitly-owned registry of broadcast channels, one per
//! job. Delivery is best-effort: the job record is the source of truth and
//! observers can always re-fetch status, so a missed event is superseded
//! by the next one. A slow observer lags on its own bounded buffer and
//! loses the oldest events first; publishing never blocks.

use crate::model::JobSnapshot;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

pub struct ProgressChannel {
    buffer: usize,
    senders: Mutex<HashMap<Uuid, broadcast::Sender<JobSnapshot>>>,
}

impl ProgressChannel {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Register an observer for a job. Returns the receiver and the number
    /// of observers now attached (this one included). Dropping the
    /// receiver detaches it; a job with zero observers runs unaffected.
    pub fn attach(&self, job_id: Uuid) -> (broadcast::Receiver<JobSnapshot>, usize) {
        let mut senders = self.senders.lock().expect("progress registry poisoned");
        let tx = senders
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        let rx = tx.subscribe();
        (rx, tx.receiver_count())
    }

    /// Push a snapshot to all attached observers. Publishing to a job with
    /// no registry entry is a no-op — the orchestrator may finish before
    /// any client attaches.
    pub fn publish(&self, snapshot: JobSnapshot) {
        let senders = self.senders.lock().expect("progress registry poisoned");
        if let Some(tx) = senders.get(&snapshot.job_id) {
            match tx.send(snapshot) {
                Ok(n) => debug!(observers = n, "published progress"),
                Err(_) => debug!("no live observers for job"),
            }
        }
    }

    pub fn observer_count(&self, job_id: Uuid) -> usize {
        let senders = self.senders.lock().expect("progress registry poisoned");
        senders.get(&job_id).map_or(0, |tx| tx.receiver_count())
    }

    /// Drop the per-job registry entry, detaching all observers. Called
    /// once a terminal job has been drained, or on idle cleanup.
    pub fn cleanup(&self, job_id: Uuid) {
        let mut senders = self.senders.lock().expect("progress registry poisoned");
        senders.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobKind, JobStatus};
    use chrono::Utc;

    fn snapshot(job_id: Uuid, processed: i64) -> JobSnapshot {
        JobSnapshot {
            job_id,
            kind: JobKind::Import,
            status: JobStatus::Validating,
            processed,
            total: 100,
            created: 0,
            updated: 0,
            failed: 0,
            message: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn attach_publish_receive() {
        let channel = ProgressChannel::new(8);
        let job_id = Uuid::new_v4();

        let (mut rx, count) = channel.attach(job_id);
        assert_eq!(count, 1);

        channel.publish(snapshot(job_id, 50));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.processed, 50);
    }

    #[tokio::test]
    async fn publish_without_observers_is_noop() {
        let channel = ProgressChannel::new(8);
        channel.publish(snapshot(Uuid::new_v4(), 1));
        // nothing to assert: must simply not panic or block
    }

    #[tokio::test]
    async fn counts_multiple_observers() {
        let channel = ProgressChannel::new(8);
        let job_id = Uuid::new_v4();

        let (_rx1, c1) = channel.attach(job_id);
        let (_rx2, c2) = channel.attach(job_id);
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
        assert_eq!(channel.observer_count(job_id), 2);

        drop(_rx1);
        drop(_rx2);
        assert_eq!(channel.observer_count(job_id), 0);
    }

    #[tokio::test]
    async fn slow_observer_loses_oldest_events() {
        let channel = ProgressChannel::new(2);
        let job_id = Uuid::new_v4();
        let (mut rx, _) = channel.attach(job_id);

        for i in 0..5 {
            channel.publish(snapshot(job_id, i));
        }

        // buffer of 2: the lag error reports the drop, then the two
        // newest events remain
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().processed, 3);
        assert_eq!(rx.recv().await.unwrap().processed, 4);
    }

    #[tokio::test]
    async fn cleanup_detaches_observers() {
        let channel = ProgressChannel::new(8);
        let job_id = Uuid::new_v4();
        let (mut rx, _) = channel.attach(job_id);

        channel.cleanup(job_id);
        assert_eq!(channel.observer_count(job_id), 0);

        // sender dropped: receiver sees Closed
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        // publishing after cleanup is a no-op
        channel.publish(snapshot(job_id, 9));
    }
}
