// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Bounded job queue and the worker pool that drains it

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::aggregator::ResultAggregator;
use crate::db::Database;
use crate::{DeepTrackError, Result};

/// Point-in-time view of the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
}

#[derive(Debug, Default)]
struct QueueStats {
    queued: AtomicUsize,
    running: AtomicUsize,
}

/// Producer side, cloned into every request handler
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<String>,
    stats: Arc<QueueStats>,
}

/// Consumer side. Runs each job on its own task, at most `workers` at once.
pub struct JobWorkerPool {
    rx: mpsc::Receiver<String>,
    semaphore: Arc<Semaphore>,
    workers: usize,
    aggregator: Arc<ResultAggregator>,
    db: Database,
    stats: Arc<QueueStats>,
    shutdown: watch::Receiver<bool>,
}

/// Create a queue and its pool. The pool does nothing until [`JobWorkerPool::run`] is awaited.
pub fn job_queue(
    capacity: usize,
    workers: usize,
    aggregator: Arc<ResultAggregator>,
    db: Database,
    shutdown: watch::Receiver<bool>,
) -> (JobQueue, JobWorkerPool) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let workers = workers.max(1);
    let stats = Arc::new(QueueStats::default());

    let queue = JobQueue { tx, stats: stats.clone() };
    let pool = JobWorkerPool {
        rx,
        semaphore: Arc::new(Semaphore::new(workers)),
        workers,
        aggregator,
        db,
        stats,
        shutdown,
    };
    (queue, pool)
}

impl JobQueue {
    /// Enqueue a job id, waiting for room when the queue is full
    pub async fn submit(&self, job_id: String) -> Result<()> {
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job_id).await.is_err() {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(DeepTrackError::QueueClosed);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.stats.queued.load(Ordering::SeqCst),
            running: self.stats.running.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the running count when a job task ends, panics included
struct RunningGuard(Arc<QueueStats>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobWorkerPool {
    /// Dispatch jobs until shutdown is signalled or every producer is gone
    pub async fn run(mut self) {
        info!("Job worker pool started with {} workers", self.workers);

        loop {
            let permit = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job_id = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                job = self.rx.recv() => match job {
                    Some(job_id) => job_id,
                    None => break,
                },
            };

            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            self.stats.running.fetch_add(1, Ordering::SeqCst);
            debug!("Dispatching job {}", job_id);

            let aggregator = self.aggregator.clone();
            let guard = RunningGuard(self.stats.clone());
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                aggregator.run(&job_id).await;
            });
        }

        self.drain().await;
    }

    /// Fail everything still queued, then wait for running jobs
    async fn drain(mut self) {
        self.rx.close();

        let mut abandoned = 0;
        while let Some(job_id) = self.rx.recv().await {
            self.stats.queued.fetch_sub(1, Ordering::SeqCst);
            match self.db.fail_job(&job_id) {
                Ok(_) => abandoned += 1,
                Err(e) => error!("Could not mark queued job {} failed: {}", job_id, e),
            }
        }
        if abandoned > 0 {
            warn!("Marked {} queued jobs failed at shutdown", abandoned);
        }

        let running = self.stats.running.load(Ordering::SeqCst);
        if running > 0 {
            info!("Waiting for {} running jobs to finish", running);
        }
        // Every permit back means every job task has returned
        let _ = self.semaphore.acquire_many(self.workers as u32).await;
        info!("Job worker pool stopped");
    }
}

/// Resolves once the flag is set, or once its sender is dropped
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{EncodedImage, FileAnalyzer, TargetRecognizer};
    use crate::db::{new_id, AnalysisJob, FileRecord, JobStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Holds every call until released
    struct Gated {
        gate: Arc<Notify>,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl TargetRecognizer for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn recognize(&self, _prompt: &str, _image: &EncodedImage) -> crate::Result<String> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(r#"[{"type": "vehicle", "confidence": 0.9}]"#.to_string())
        }
    }

    struct Harness {
        db: Database,
        gate: Arc<Notify>,
        entered: Arc<Notify>,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        Harness {
            db: Database::in_memory().unwrap(),
            gate: Arc::new(Notify::new()),
            entered: Arc::new(Notify::new()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Harness {
        fn aggregator(&self) -> Arc<ResultAggregator> {
            let recognizer = Arc::new(Gated { gate: self.gate.clone(), entered: self.entered.clone() });
            let analyzer = FileAnalyzer::new(recognizer, "find targets", 1024);
            Arc::new(ResultAggregator::new(self.db.clone(), analyzer))
        }

        fn job_with_file(&self) -> String {
            let file_id = new_id();
            let path = self.dir.path().join(&file_id);
            std::fs::write(&path, b"frame").unwrap();
            self.db
                .insert_file(&FileRecord {
                    id: file_id.clone(),
                    filename: "frame.bin".to_string(),
                    file_type: "RGB".to_string(),
                    file_path: path.to_string_lossy().to_string(),
                    uploaded_at: Utc::now(),
                    metadata: None,
                })
                .unwrap();

            let job = AnalysisJob {
                id: new_id(),
                file_ids: vec![file_id],
                analysis_type: "single".to_string(),
                status: JobStatus::Processing,
                results: None,
                created_at: Utc::now(),
                completed_at: None,
            };
            self.db.insert_job(&job).unwrap();
            job.id
        }

        async fn wait_for_status(&self, job_id: &str, status: JobStatus) {
            for _ in 0..200 {
                if self.db.get_job(job_id).unwrap().unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {} never reached {}", job_id, status);
        }
    }

    #[tokio::test]
    async fn test_submitted_job_runs_to_completion() {
        let h = harness();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, pool) = job_queue(4, 2, h.aggregator(), h.db.clone(), stop_rx);
        let pool = tokio::spawn(pool.run());

        let job_id = h.job_with_file();
        queue.submit(job_id.clone()).await.unwrap();

        h.entered.notified().await;
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 0, running: 1 });
        h.gate.notify_one();

        h.wait_for_status(&job_id, JobStatus::Completed).await;
        drop(queue);
        pool.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_and_waits_for_running() {
        let h = harness();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (queue, pool) = job_queue(4, 1, h.aggregator(), h.db.clone(), stop_rx);
        let pool = tokio::spawn(pool.run());

        let running = h.job_with_file();
        let waiting = h.job_with_file();
        queue.submit(running.clone()).await.unwrap();
        h.entered.notified().await;
        queue.submit(waiting.clone()).await.unwrap();
        assert_eq!(queue.snapshot(), QueueSnapshot { queued: 1, running: 1 });

        stop_tx.send(true).unwrap();
        h.wait_for_status(&waiting, JobStatus::Failed).await;
        assert!(!pool.is_finished());

        h.gate.notify_one();
        pool.await.unwrap();

        assert_eq!(h.db.get_job(&running).unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(queue.snapshot(), QueueSnapshot::default());
        assert!(matches!(
            queue.submit(new_id()).await,
            Err(DeepTrackError::QueueClosed)
        ));
    }
}
