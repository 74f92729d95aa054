// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Job creation and hand-off to the background queue

use tracing::{error, info};

use super::queue::JobQueue;
use crate::db::{new_id, now, AnalysisJob, Database, JobStatus};
use crate::Result;

pub const DEFAULT_ANALYSIS_TYPE: &str = "single";

#[derive(Clone)]
pub struct JobOrchestrator {
    db: Database,
    queue: JobQueue,
}

impl JobOrchestrator {
    pub fn new(db: Database, queue: JobQueue) -> Self {
        Self { db, queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Persist a new job as `processing` and schedule it. Returns as soon as
    /// the job is queued; callers poll for the outcome.
    ///
    /// File ids are not checked here. Unknown ids are skipped when the job runs.
    pub async fn create_job(&self, file_ids: Vec<String>, analysis_type: Option<String>) -> Result<AnalysisJob> {
        let job = AnalysisJob {
            id: new_id(),
            file_ids,
            analysis_type: analysis_type.unwrap_or_else(|| DEFAULT_ANALYSIS_TYPE.to_string()),
            status: JobStatus::Processing,
            results: None,
            created_at: now(),
            completed_at: None,
        };
        self.db.insert_job(&job)?;

        if let Err(e) = self.queue.submit(job.id.clone()).await {
            error!("Could not schedule job {}: {}", job.id, e);
            if let Err(mark_err) = self.db.fail_job(&job.id) {
                error!("Could not mark job {} failed: {}", job.id, mark_err);
            }
            return Err(e);
        }

        info!("Scheduled job {} ({} files, {})", job.id, job.file_ids.len(), job.analysis_type);
        Ok(job)
    }
}
