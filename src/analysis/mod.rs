// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Target recognition: model seam, image preparation, and response parsing

pub mod analyzer;
pub mod image;
pub mod normalizer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

pub use analyzer::FileAnalyzer;
pub use normalizer::{normalize, ExtractionTier, Normalized};

/// Image bytes ready for a vision model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    /// Standard base64 without a data-URI prefix
    pub base64: String,
    pub mime_type: String,
}

/// An external service that looks at an image and answers in free-form text
#[async_trait]
pub trait TargetRecognizer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Send one image with an instruction prompt and return the raw reply
    async fn recognize(&self, prompt: &str, image: &EncodedImage) -> Result<String>;
}

/// One detection as the model described it, before coercion into a [`crate::db::Detection`].
///
/// Fields keep their raw JSON so that loosely typed replies (`"0.9"` for a
/// confidence, missing boxes) can be coerced in one place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    #[serde(rename = "type", default)]
    pub target_type: Option<Value>,
    #[serde(default)]
    pub confidence: Option<Value>,
    #[serde(default)]
    pub bbox: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DetectionCandidate {
    /// Read the known keys of a model-supplied object; anything else is ignored
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        let description = match obj.get("description") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            target_type: obj.get("type").cloned(),
            confidence: obj.get("confidence").cloned(),
            bbox: obj.get("bbox").cloned(),
            description,
        }
    }

    /// Low-confidence stand-in for a reply that held no parsable detections
    pub fn unparsed(raw: &str) -> Self {
        let preview: String = raw.chars().take(100).collect();
        Self {
            target_type: Some(Value::from("generic_object")),
            confidence: Some(Value::from(0.8)),
            bbox: Some(bbox_value(0.4, 0.4, 0.2, 0.2)),
            description: Some(format!("AI Analysis Result: {}...", preview)),
        }
    }

    /// Zero-confidence record carrying the reason a file could not be analyzed
    pub fn failed(reason: &str) -> Self {
        Self {
            target_type: Some(Value::from("error")),
            confidence: Some(Value::from(0.0)),
            bbox: Some(bbox_value(0.0, 0.0, 0.0, 0.0)),
            description: Some(format!("Analysis failed: {}", reason)),
        }
    }
}

fn bbox_value(x: f64, y: f64, width: f64, height: f64) -> Value {
    serde_json::json!({ "x": x, "y": y, "width": width, "height": height })
}
