// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Per-file analysis: load, encode, ask the model, normalize

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use super::image::encode_for_model;
use super::normalizer::{normalize, Normalized};
use super::{DetectionCandidate, TargetRecognizer};
use crate::{DeepTrackError, Result};

/// Runs one model call per file. Every call is independent; nothing carries
/// over between files.
#[derive(Clone)]
pub struct FileAnalyzer {
    recognizer: Arc<dyn TargetRecognizer>,
    prompt: String,
    max_image_dimension: u32,
}

impl FileAnalyzer {
    pub fn new(recognizer: Arc<dyn TargetRecognizer>, prompt: impl Into<String>, max_image_dimension: u32) -> Self {
        Self {
            recognizer,
            prompt: prompt.into(),
            max_image_dimension,
        }
    }

    /// Load the file and return the model's raw reply
    pub async fn raw_response(&self, path: &Path) -> Result<String> {
        let session_id = format!("analysis-{}", Uuid::new_v4());
        let span = tracing::info_span!("analysis", session = %session_id);

        async {
            let bytes = tokio::fs::read(path).await?;
            debug!("Loaded {} bytes from {:?}", bytes.len(), path);

            let max_dimension = self.max_image_dimension;
            let image = tokio::task::spawn_blocking(move || encode_for_model(bytes, max_dimension))
                .await
                .map_err(|e| DeepTrackError::Config(format!("Image encoding task failed: {}", e)))?;

            info!("Sending {:?} to {}", path, self.recognizer.name());
            self.recognizer.recognize(&self.prompt, &image).await
        }
        .instrument(span)
        .await
    }

    /// Analyze one file. Never fails: load, encode, and model errors become a
    /// single `error` candidate carrying the message.
    pub async fn analyze(&self, path: &Path) -> Vec<DetectionCandidate> {
        match self.raw_response(path).await {
            Ok(text) => {
                let normalized = normalize(&text);
                if let Normalized::Fallback(_) = normalized {
                    info!("Reply for {:?} held no parsable detections", path);
                }
                normalized.into_candidates()
            }
            Err(e) => {
                error!("AI analysis error for {:?}: {}", path, e);
                vec![DetectionCandidate::failed(&e.to_string())]
            }
        }
    }
}
