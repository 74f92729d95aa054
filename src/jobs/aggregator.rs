// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Executes one analysis job and records its outcome

use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, error, info, warn, Instrument};

use crate::analysis::{DetectionCandidate, FileAnalyzer};
use crate::db::{new_id, now, AnalysisJob, BoundingBox, Database, Detection};
use crate::Result;

/// Walks a job's files in order, persisting each detection as it is produced,
/// then marks the job completed. Any store error marks it failed instead.
#[derive(Clone)]
pub struct ResultAggregator {
    db: Database,
    analyzer: FileAnalyzer,
}

impl ResultAggregator {
    pub fn new(db: Database, analyzer: FileAnalyzer) -> Self {
        Self { db, analyzer }
    }

    /// Run a job to a terminal state
    pub async fn run(&self, job_id: &str) {
        let span = tracing::info_span!("job", job_id = %job_id);
        async {
            let job = match self.db.get_job(job_id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!("Job vanished before it could run");
                    return;
                }
                Err(e) => {
                    error!("Could not load job: {}", e);
                    self.mark_failed(job_id);
                    return;
                }
            };

            if job.status.is_terminal() {
                debug!("Job already {}, skipping", job.status);
                return;
            }

            match self.process(&job).await {
                Ok(count) => info!("Job completed with {} detections", count),
                Err(e) => {
                    error!("Analysis job failed: {}", e);
                    self.mark_failed(job_id);
                }
            }
        }
        .instrument(span)
        .await
    }

    fn mark_failed(&self, job_id: &str) {
        if let Err(e) = self.db.fail_job(job_id) {
            error!("Could not mark job failed: {}", e);
        }
    }

    async fn process(&self, job: &AnalysisJob) -> Result<usize> {
        let mut results = Vec::new();
        let mut seen = HashSet::new();

        for file_id in &job.file_ids {
            if !seen.insert(file_id.as_str()) {
                continue;
            }

            let file = match self.db.get_file(file_id)? {
                Some(file) => file,
                None => {
                    debug!("Skipping unknown file {}", file_id);
                    continue;
                }
            };

            let candidates = self.analyzer.analyze(Path::new(&file.file_path)).await;
            for candidate in &candidates {
                let detection = build_detection(&file.id, candidate);
                self.db.insert_detection(&detection)?;
                results.push(detection);
            }
            debug!("File {} produced {} detections", file.id, candidates.len());
        }

        self.db.complete_job(&job.id, &results, now())?;
        Ok(results.len())
    }
}

/// Coerce a model-supplied candidate into a stored detection
pub fn build_detection(file_id: &str, candidate: &DetectionCandidate) -> Detection {
    let target_type = match &candidate.target_type {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => "unknown".to_string(),
        Some(other) => other.to_string(),
    };

    Detection {
        id: new_id(),
        file_id: file_id.to_string(),
        target_type,
        confidence: candidate.confidence.as_ref().map_or(0.0, coerce_f64),
        bounding_box: candidate.bbox.as_ref().map(coerce_bbox).unwrap_or_default(),
        description: candidate.description.clone(),
        timestamp: now(),
    }
}

/// Numbers and numeric strings become `f64`; anything else, or a non-finite
/// value, becomes 0.0
fn coerce_f64(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn coerce_bbox(value: &Value) -> BoundingBox {
    let Some(obj) = value.as_object() else {
        return BoundingBox::default();
    };
    let field = |key: &str| obj.get(key).map_or(0.0, coerce_f64);
    BoundingBox {
        x: field("x"),
        y: field("y"),
        width: field("width"),
        height: field("height"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{EncodedImage, TargetRecognizer};
    use crate::db::{FileRecord, JobStatus};
    use crate::DeepTrackError;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replies in order; the last reply repeats
    struct Scripted {
        replies: Vec<std::result::Result<&'static str, &'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TargetRecognizer for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn recognize(&self, _prompt: &str, _image: &EncodedImage) -> crate::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies[n.min(self.replies.len() - 1)];
            reply.map(String::from).map_err(|e| DeepTrackError::ModelUnavailable(e.to_string()))
        }
    }

    struct Fixture {
        db: Database,
        aggregator: ResultAggregator,
        recognizer: Arc<Scripted>,
        dir: tempfile::TempDir,
    }

    fn fixture(replies: Vec<std::result::Result<&'static str, &'static str>>) -> Fixture {
        let db = Database::in_memory().unwrap();
        let recognizer = Arc::new(Scripted { replies, calls: AtomicUsize::new(0) });
        let analyzer = FileAnalyzer::new(recognizer.clone(), "find targets", 1024);
        Fixture {
            aggregator: ResultAggregator::new(db.clone(), analyzer),
            db,
            recognizer,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Fixture {
        fn add_file(&self, id: &str) {
            let path = self.dir.path().join(format!("{}.bin", id));
            std::fs::write(&path, id.as_bytes()).unwrap();
            self.db
                .insert_file(&FileRecord {
                    id: id.to_string(),
                    filename: format!("{}.bin", id),
                    file_type: "RGB".to_string(),
                    file_path: path.to_string_lossy().to_string(),
                    uploaded_at: Utc::now(),
                    metadata: None,
                })
                .unwrap();
        }

        fn add_job(&self, file_ids: &[&str]) -> String {
            let job = AnalysisJob {
                id: new_id(),
                file_ids: file_ids.iter().map(|s| s.to_string()).collect(),
                analysis_type: "batch".to_string(),
                status: JobStatus::Processing,
                results: None,
                created_at: Utc::now(),
                completed_at: None,
            };
            self.db.insert_job(&job).unwrap();
            job.id
        }
    }

    #[test]
    fn test_build_detection_defaults() {
        let detection = build_detection("f1", &DetectionCandidate::default());
        assert_eq!(detection.target_type, "unknown");
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.bounding_box, BoundingBox::default());
        assert_eq!(detection.file_id, "f1");
    }

    #[test]
    fn test_build_detection_coerces_loose_values() {
        let candidate = DetectionCandidate {
            target_type: Some(json!("vehicle")),
            confidence: Some(json!(" 0.75 ")),
            bbox: Some(json!({"x": "0.1", "y": 0.2, "width": true})),
            description: Some("truck".to_string()),
        };
        let detection = build_detection("f1", &candidate);
        assert_eq!(detection.confidence, 0.75);
        assert_eq!(
            detection.bounding_box,
            BoundingBox { x: 0.1, y: 0.2, width: 0.0, height: 0.0 }
        );
        assert_eq!(detection.description.as_deref(), Some("truck"));

        let odd = DetectionCandidate {
            target_type: Some(json!(7)),
            confidence: Some(json!("high")),
            bbox: Some(json!([0.1, 0.2])),
            description: None,
        };
        let detection = build_detection("f1", &odd);
        assert_eq!(detection.target_type, "7");
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.bounding_box, BoundingBox::default());
    }

    #[test]
    fn test_non_finite_confidence_is_zero() {
        assert_eq!(coerce_f64(&json!("NaN")), 0.0);
        assert_eq!(coerce_f64(&json!("inf")), 0.0);
        assert_eq!(coerce_f64(&json!(1)), 1.0);
    }

    #[tokio::test]
    async fn test_job_completes_with_all_detections() {
        let fx = fixture(vec![
            Ok(r#"[{"type": "vehicle", "confidence": 0.9}, {"type": "building", "confidence": 0.6}]"#),
            Ok("Nothing recognisable here."),
        ]);
        fx.add_file("a");
        fx.add_file("b");
        let job_id = fx.add_job(&["a", "b"]);

        fx.aggregator.run(&job_id).await;

        let job = fx.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        let results = job.results.unwrap();
        let kinds: Vec<_> = results.iter().map(|d| d.target_type.as_str()).collect();
        assert_eq!(kinds, vec!["vehicle", "building", "generic_object"]);
        assert_eq!(results[2].file_id, "b");

        // Embedded results and the detection listing agree record for record
        let mut listed = fx.db.list_detections(None).unwrap();
        listed.sort_by_key(|d| results.iter().position(|r| r.id == d.id));
        assert_eq!(listed, results);
    }

    #[tokio::test]
    async fn test_model_error_does_not_fail_job() {
        let fx = fixture(vec![Err("timeout")]);
        fx.add_file("a");
        let job_id = fx.add_job(&["a"]);

        fx.aggregator.run(&job_id).await;

        let job = fx.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let results = job.results.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].target_type, "error");
        assert_eq!(results[0].confidence, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_ids() {
        let fx = fixture(vec![Ok(r#"[{"type": "vehicle"}]"#)]);
        fx.add_file("a");
        let job_id = fx.add_job(&["ghost", "a", "a"]);

        fx.aggregator.run(&job_id).await;

        let job = fx.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results.unwrap().len(), 1);
        assert_eq!(fx.recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_job_completes_instantly() {
        let fx = fixture(vec![Ok("[]")]);
        let job_id = fx.add_job(&[]);

        fx.aggregator.run(&job_id).await;

        let job = fx.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results, Some(vec![]));
    }

    #[tokio::test]
    async fn test_store_failure_marks_job_failed() {
        let fx = fixture(vec![Ok(r#"[{"type": "vehicle"}]"#)]);
        fx.add_file("a");
        let job_id = fx.add_job(&["a"]);
        fx.db.execute_raw("DROP TABLE detections").unwrap();

        fx.aggregator.run(&job_id).await;

        let job = fx.db.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.results.is_none());
    }

    #[tokio::test]
    async fn test_terminal_job_is_not_rerun() {
        let fx = fixture(vec![Ok("[]")]);
        fx.add_file("a");
        let job_id = fx.add_job(&["a"]);
        fx.db.fail_job(&job_id).unwrap();

        fx.aggregator.run(&job_id).await;

        assert_eq!(fx.db.get_job(&job_id).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(fx.recognizer.calls.load(Ordering::SeqCst), 0);
    }
}
