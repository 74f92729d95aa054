// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Turns free-form model replies into detection candidates.
//!
//! Replies are prose that may or may not contain JSON. The candidate JSON is
//! located with three tiers, first match wins:
//!
//! 1. a fenced block opened with ```` ```json ````, up to the next fence
//! 2. the span from the first `[` to the last `]`
//! 3. the whole reply
//!
//! If the selected text is not a JSON array of objects (a single object is
//! accepted as a one-element array), the reply degrades to one
//! `generic_object` placeholder rather than an error.

use serde_json::Value;
use tracing::{debug, warn};

use super::DetectionCandidate;

const FENCE_OPEN: &str = "```json";
const FENCE: &str = "```";

/// Which heuristic located the candidate JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionTier {
    FencedBlock,
    BracketSpan,
    Raw,
}

/// Outcome of normalizing one reply
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Parsed {
        tier: ExtractionTier,
        candidates: Vec<DetectionCandidate>,
    },
    Fallback(DetectionCandidate),
}

impl Normalized {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Normalized::Fallback(_))
    }

    pub fn into_candidates(self) -> Vec<DetectionCandidate> {
        match self {
            Normalized::Parsed { candidates, .. } => candidates,
            Normalized::Fallback(placeholder) => vec![placeholder],
        }
    }
}

/// Locate the JSON payload inside a reply
pub fn extract_json(raw: &str) -> (ExtractionTier, &str) {
    let text = raw.trim();

    // ASCII lowercasing keeps byte offsets, so indices map back onto `text`
    let lowered = text.to_ascii_lowercase();
    if let Some(open) = lowered.find(FENCE_OPEN) {
        let start = open + FENCE_OPEN.len();
        let end = text[start..].find(FENCE).map_or(text.len(), |i| start + i);
        return (ExtractionTier::FencedBlock, text[start..end].trim());
    }

    if let (Some(start), Some(last)) = (text.find('['), text.rfind(']')) {
        // "]...[" has no usable span; leave an empty payload to fail parsing
        let span = if last >= start { &text[start..=last] } else { "" };
        return (ExtractionTier::BracketSpan, span);
    }

    (ExtractionTier::Raw, text)
}

/// Normalize a raw model reply
pub fn normalize(raw: &str) -> Normalized {
    let (tier, payload) = extract_json(raw);

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Array(items)) => {
            let total = items.len();
            let candidates: Vec<DetectionCandidate> = items
                .iter()
                .filter_map(|item| item.as_object().map(DetectionCandidate::from_object))
                .collect();
            if candidates.len() < total {
                warn!("Skipped {} non-object entries in model reply", total - candidates.len());
            }
            debug!("Parsed {} detections ({:?})", candidates.len(), tier);
            Normalized::Parsed { tier, candidates }
        }
        Ok(Value::Object(obj)) => Normalized::Parsed {
            tier,
            candidates: vec![DetectionCandidate::from_object(&obj)],
        },
        Ok(_) => {
            debug!("Model reply JSON is not a list of detections, using placeholder");
            Normalized::Fallback(DetectionCandidate::unparsed(raw))
        }
        Err(e) => {
            debug!("Model reply is not JSON ({}), using placeholder", e);
            Normalized::Fallback(DetectionCandidate::unparsed(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_block_with_noise() {
        let raw = "noise ```json\n[{\"type\":\"vehicle\",\"confidence\":0.9,\"bbox\":{\"x\":0.1,\"y\":0.1,\"width\":0.2,\"height\":0.2}}]\n``` trailing";
        match normalize(raw) {
            Normalized::Parsed { tier, candidates } => {
                assert_eq!(tier, ExtractionTier::FencedBlock);
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].target_type, Some(json!("vehicle")));
                assert_eq!(candidates[0].confidence, Some(json!(0.9)));
            }
            other => panic!("expected parsed result, got {:?}", other),
        }
    }

    #[test]
    fn test_prose_falls_back_to_placeholder() {
        let raw = "I cannot determine targets in this image.";
        let result = normalize(raw);
        assert!(result.is_fallback());

        let candidates = result.into_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].target_type, Some(json!("generic_object")));
        assert_eq!(candidates[0].confidence, Some(json!(0.8)));
        assert_eq!(
            candidates[0].bbox,
            Some(json!({"x": 0.4, "y": 0.4, "width": 0.2, "height": 0.2}))
        );
        assert!(candidates[0].description.as_deref().unwrap().contains(raw));
    }

    #[test]
    fn test_placeholder_description_keeps_first_hundred_chars() {
        let raw = "é".repeat(150);
        let candidate = normalize(&raw).into_candidates().remove(0);
        let description = candidate.description.unwrap();
        assert_eq!(description, format!("AI Analysis Result: {}...", "é".repeat(100)));
    }

    #[test]
    fn test_bracket_span_inside_prose() {
        let raw = r#"Detected the following: [{"type": "personnel", "confidence": "0.7"}] end."#;
        let (tier, payload) = extract_json(raw);
        assert_eq!(tier, ExtractionTier::BracketSpan);
        assert!(payload.starts_with('[') && payload.ends_with(']'));

        let candidates = normalize(raw).into_candidates();
        assert_eq!(candidates[0].target_type, Some(json!("personnel")));
        assert_eq!(candidates[0].confidence, Some(json!("0.7")));
        assert_eq!(candidates[0].bbox, None);
    }

    #[test]
    fn test_raw_object_is_single_detection() {
        let raw = r#"{"type": "building", "confidence": 0.6}"#;
        match normalize(raw) {
            Normalized::Parsed { tier, candidates } => {
                assert_eq!(tier, ExtractionTier::Raw);
                assert_eq!(candidates.len(), 1);
            }
            other => panic!("expected parsed result, got {:?}", other),
        }
    }

    #[test]
    fn test_fence_wins_over_brackets() {
        let raw = "see [notes] below\n```JSON\n[]\n```";
        let (tier, payload) = extract_json(raw);
        assert_eq!(tier, ExtractionTier::FencedBlock);
        assert_eq!(payload, "[]");
        assert_eq!(normalize(raw).into_candidates().len(), 0);
    }

    #[test]
    fn test_unterminated_fence_runs_to_end() {
        let raw = "```json\n[{\"type\": \"vehicle\"}]";
        let candidates = normalize(raw).into_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].target_type, Some(json!("vehicle")));
    }

    #[test]
    fn test_invalid_fenced_json_does_not_try_brackets() {
        let raw = "```json\nnot json\n``` but here: [{\"type\": \"vehicle\"}]";
        assert!(normalize(raw).is_fallback());
    }

    #[test]
    fn test_reversed_brackets_fall_back() {
        let raw = "values ] then [ nothing";
        let (tier, payload) = extract_json(raw);
        assert_eq!(tier, ExtractionTier::BracketSpan);
        assert_eq!(payload, "");
        assert!(normalize(raw).is_fallback());
    }

    #[test]
    fn test_non_object_entries_are_skipped() {
        let raw = r#"[1, "two", {"type": "vehicle"}, null]"#;
        let candidates = normalize(raw).into_candidates();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_scalar_json_falls_back() {
        assert!(normalize("42").is_fallback());
        assert!(normalize("").is_fallback());
    }
}
