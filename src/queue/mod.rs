use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::orchestrator::{JobOutcome, JobReport, Orchestrator};
use crate::protocol::Job;
use crate::{HubError, Result};

/// Counters shared by the queue and the progress log line
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Waiting for a slot
    queued: AtomicUsize,
    /// Holding a slot
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl QueueStats {
    /// Jobs accepted but not yet released
    pub fn outstanding(&self) -> usize {
        self.queued.load(Ordering::Relaxed) + self.running.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<JobReport>) {
        let counter = match result {
            Ok(report) if matches!(report.outcome, JobOutcome::Skipped) => &self.skipped,
            Ok(_) => &self.completed,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Admission-controlled queue in front of the orchestrator
///
/// At most `concurrency` jobs hold a slot. A slot is released as soon as the
/// job's artifacts are final, so translation and bookkeeping of one job
/// overlap with the engine run of the next.
#[derive(Clone)]
pub struct JobQueue {
    orchestrator: Arc<Orchestrator>,
    semaphore: Arc<Semaphore>,
    stats: Arc<QueueStats>,
    concurrency: usize,
}

impl JobQueue {
    pub fn new(orchestrator: Arc<Orchestrator>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let stats = orchestrator.queue_stats();
        Self {
            orchestrator,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            stats,
            concurrency,
        }
    }

    /// Admit the job's client and schedule the job
    pub async fn submit(&self, job: Job) -> JoinHandle<Result<JobReport>> {
        self.orchestrator.registry().admit(&job.client_id).await;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        info!(
            "Queued job {} for client {} ({} outstanding)",
            job.id,
            job.client_id,
            self.stats.outstanding()
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let semaphore = Arc::clone(&self.semaphore);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    stats.queued.fetch_sub(1, Ordering::Relaxed);
                    warn!("Queue closed before job {} got a slot", job.id);
                    return Err(HubError::QueueClosed);
                }
            };
            stats.queued.fetch_sub(1, Ordering::Relaxed);
            stats.running.fetch_add(1, Ordering::Relaxed);

            let (finished_tx, finished_rx) = oneshot::channel();
            let release_stats = Arc::clone(&stats);
            let job_id = job.id;
            tokio::spawn(async move {
                // Fires on the finished signal, or when the job drops the sender
                let _ = finished_rx.await;
                drop(permit);
                release_stats.running.fetch_sub(1, Ordering::Relaxed);
                debug!("Released queue slot of job {}", job_id);
            });

            let result = orchestrator.run_with_signal(job, Some(finished_tx)).await;
            stats.record(&result);
            result
        })
    }

    /// Stop handing out slots; jobs already waiting fail with `QueueClosed`
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }
}
