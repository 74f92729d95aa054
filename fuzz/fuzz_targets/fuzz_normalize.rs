// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use deeptrack::analysis::{normalize, normalizer::extract_json};
use deeptrack::jobs::build_detection;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let reply = String::from_utf8_lossy(data);

    let (_, payload) = extract_json(&reply);
    assert!(reply.contains(payload));

    let normalized = normalize(&reply);
    let fallback = normalized.is_fallback();
    let candidates = normalized.into_candidates();
    if fallback {
        assert_eq!(candidates.len(), 1);
    }

    for candidate in &candidates {
        let detection = build_detection("fuzz", candidate);
        assert!(detection.confidence.is_finite());
    }
});
