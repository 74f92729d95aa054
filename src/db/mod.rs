// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Database module for file records, detections, and analysis jobs

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::{DeepTrackError, Result};

const FILE_LIST_LIMIT: i64 = 1000;
const DETECTION_LIST_LIMIT: i64 = 1000;
const JOB_LIST_LIMIT: i64 = 100;

/// Database manager for DeepTrack (thread-safe wrapper)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// An uploaded image or sensor file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Original name as submitted by the client
    pub filename: String,
    /// Category label, e.g. the sensing modality (`RGB`, `thermal`, `radar`)
    pub file_type: String,
    pub file_path: String,
    pub uploaded_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Fractional coordinates relative to the image dimensions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One target annotation produced for a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub file_id: String,
    pub target_type: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of an analysis job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs are never revisited
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DeepTrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DeepTrackError::InvalidInput(format!("unknown job status '{}'", other))),
        }
    }
}

/// A batch request to analyze one or more files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub file_ids: Vec<String>,
    pub analysis_type: String,
    pub status: JobStatus,
    pub results: Option<Vec<Detection>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Database statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub file_count: i64,
    pub detection_count: i64,
    pub job_count: i64,
    pub jobs_processing: i64,
}

impl Database {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Close the connection once no other handle shares it
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex
                    .into_inner()
                    .map_err(|_| DeepTrackError::Config("Database lock poisoned".to_string()))?;
                conn.close().map_err(|(_, e)| e)?;
                Ok(())
            }
            Err(_) => {
                tracing::debug!("Database still shared, leaving connection to the last handle");
                Ok(())
            }
        }
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DeepTrackError::Config("Database lock poisoned".to_string()))
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                file_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS detections (
                id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                target_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                bbox_x REAL NOT NULL,
                bbox_y REAL NOT NULL,
                bbox_width REAL NOT NULL,
                bbox_height REAL NOT NULL,
                description TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS analysis_jobs (
                id TEXT PRIMARY KEY,
                file_ids TEXT NOT NULL,
                analysis_type TEXT NOT NULL,
                status TEXT NOT NULL,
                results TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_detections_file ON detections(file_id);
            CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON analysis_jobs(created_at);
        "#)?;
        Ok(())
    }

    // === Files ===

    /// Insert a new file record
    pub fn insert_file(&self, file: &FileRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        let metadata_json = file.metadata.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            r#"INSERT INTO files (id, filename, file_type, file_path, uploaded_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                file.id,
                file.filename,
                file.file_type,
                file.file_path,
                format_timestamp(&file.uploaded_at),
                metadata_json
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            r#"SELECT id, filename, file_type, file_path, uploaded_at, metadata
               FROM files WHERE id = ?1"#,
            params![id],
            file_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// All uploaded files in upload order
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, filename, file_type, file_path, uploaded_at, metadata
               FROM files ORDER BY uploaded_at, rowid LIMIT ?1"#,
        )?;
        let files = stmt
            .query_map(params![FILE_LIST_LIMIT], file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    /// Remove a file record and every detection that references it.
    ///
    /// Returns `false` when no record had that id.
    pub fn delete_file(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        if removed > 0 {
            tx.execute("DELETE FROM detections WHERE file_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    // === Detections ===

    pub fn insert_detection(&self, detection: &Detection) -> Result<()> {
        let conn = self.lock_conn()?;
        let bbox = &detection.bounding_box;
        conn.execute(
            r#"INSERT INTO detections
               (id, file_id, target_type, confidence, bbox_x, bbox_y, bbox_width, bbox_height, description, timestamp)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                detection.id,
                detection.file_id,
                detection.target_type,
                detection.confidence,
                bbox.x,
                bbox.y,
                bbox.width,
                bbox.height,
                detection.description,
                format_timestamp(&detection.timestamp)
            ],
        )?;
        Ok(())
    }

    /// Detections newest first, optionally restricted to one file
    pub fn list_detections(&self, file_id: Option<&str>) -> Result<Vec<Detection>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, file_id, target_type, confidence, bbox_x, bbox_y, bbox_width, bbox_height, description, timestamp
               FROM detections
               WHERE ?1 IS NULL OR file_id = ?1
               ORDER BY timestamp DESC, rowid DESC LIMIT ?2"#,
        )?;
        let detections = stmt
            .query_map(params![file_id, DETECTION_LIST_LIMIT], detection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(detections)
    }

    // === Jobs ===

    pub fn insert_job(&self, job: &AnalysisJob) -> Result<()> {
        let conn = self.lock_conn()?;
        let file_ids = serde_json::to_string(&job.file_ids)?;
        let results = job.results.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            r#"INSERT INTO analysis_jobs (id, file_ids, analysis_type, status, results, created_at, completed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                job.id,
                file_ids,
                job.analysis_type,
                job.status.as_str(),
                results,
                format_timestamp(&job.created_at),
                job.completed_at.as_ref().map(format_timestamp)
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            r#"SELECT id, file_ids, analysis_type, status, results, created_at, completed_at
               FROM analysis_jobs WHERE id = ?1"#,
            params![id],
            job_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Jobs newest first
    pub fn list_jobs(&self) -> Result<Vec<AnalysisJob>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, file_ids, analysis_type, status, results, created_at, completed_at
               FROM analysis_jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1"#,
        )?;
        let jobs = stmt
            .query_map(params![JOB_LIST_LIMIT], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Mark a job completed with its results. Terminal jobs are left untouched.
    ///
    /// Returns whether the job transitioned.
    pub fn complete_job(
        &self,
        id: &str,
        results: &[Detection],
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;
        let results_json = serde_json::to_string(results)?;
        let changed = conn.execute(
            r#"UPDATE analysis_jobs SET status = 'completed', results = ?2, completed_at = ?3
               WHERE id = ?1 AND status NOT IN ('completed', 'failed')"#,
            params![id, results_json, format_timestamp(&completed_at)],
        )?;
        Ok(changed > 0)
    }

    /// Mark a job failed. Results stay empty; terminal jobs are left untouched.
    pub fn fail_job(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            r#"UPDATE analysis_jobs SET status = 'failed'
               WHERE id = ?1 AND status NOT IN ('completed', 'failed')"#,
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.lock_conn()?;
        let file_count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        let detection_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        let job_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM analysis_jobs", [], |row| row.get(0))?;
        let jobs_processing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_jobs WHERE status = 'processing'",
            [],
            |row| row.get(0),
        )?;
        Ok(DbStats { file_count, detection_count, job_count, jobs_processing })
    }

    /// Run raw SQL against the store, used by tests to simulate storage faults
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

/// Generate a new identifier for any stored record
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time at the precision the store keeps, so a record handed back to
/// a caller matches the one read later
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// ISO-8601 with fixed precision so that text order matches time order
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let uploaded: String = row.get(4)?;
    let metadata: Option<String> = row.get(5)?;
    Ok(FileRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        file_type: row.get(2)?,
        file_path: row.get(3)?,
        uploaded_at: parse_timestamp(4, &uploaded)?,
        metadata: metadata.as_deref().map(|m| parse_json(5, m)).transpose()?,
    })
}

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
    let timestamp: String = row.get(9)?;
    Ok(Detection {
        id: row.get(0)?,
        file_id: row.get(1)?,
        target_type: row.get(2)?,
        confidence: row.get(3)?,
        bounding_box: BoundingBox {
            x: row.get(4)?,
            y: row.get(5)?,
            width: row.get(6)?,
            height: row.get(7)?,
        },
        description: row.get(8)?,
        timestamp: parse_timestamp(9, &timestamp)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisJob> {
    let file_ids: String = row.get(1)?;
    let status: String = row.get(3)?;
    let results: Option<String> = row.get(4)?;
    let created: String = row.get(5)?;
    let completed: Option<String> = row.get(6)?;
    Ok(AnalysisJob {
        id: row.get(0)?,
        file_ids: parse_json(1, &file_ids)?,
        analysis_type: row.get(2)?,
        status: status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        results: results.as_deref().map(|r| parse_json(4, r)).transpose()?,
        created_at: parse_timestamp(5, &created)?,
        completed_at: completed.as_deref().map(|c| parse_timestamp(6, c)).transpose()?,
    })
}
