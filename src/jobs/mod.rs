// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Background analysis jobs
//!
//! A request creates a job through [`JobOrchestrator`], which persists it and
//! pushes its id onto the [`JobQueue`]. The [`JobWorkerPool`] hands each id to
//! a [`ResultAggregator`], which analyzes the job's files one after another
//! and records the outcome.

pub mod aggregator;
pub mod orchestrator;
pub mod queue;

pub use aggregator::{build_detection, ResultAggregator};
pub use orchestrator::{JobOrchestrator, DEFAULT_ANALYSIS_TYPE};
pub use queue::{job_queue, wait_for_shutdown, JobQueue, JobWorkerPool, QueueSnapshot};
