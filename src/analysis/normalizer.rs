//! Mapping of raw source results onto [`UnifiedResult`].

use crate::models::{PrimaryRaw, RawResult, ResultSource, SecondaryRaw, UnifiedResult};
use tracing::warn;

/// Normalize a single source's raw result.
pub fn normalize(raw: RawResult, latency_ms: u64) -> UnifiedResult {
    let source = ResultSource::from(raw.kind());
    match raw {
        RawResult::Primary(p) => UnifiedResult {
            prediction: p.label,
            confidence: p.confidence,
            probabilities: Some(p.probabilities),
            analysis: None,
            heatmap: p.heatmap,
            source,
            latency_ms,
        },
        RawResult::Secondary(s) => UnifiedResult {
            prediction: s.label,
            confidence: s.confidence,
            probabilities: None,
            analysis: Some(s.analysis).filter(|a| !a.is_empty()),
            heatmap: None,
            source,
            latency_ms,
        },
    }
}

/// Merge both sources.
///
/// Label, probabilities and heatmap come from the primary classifier, the
/// rationale from the vision model, and the confidence is the mean of both.
/// A label disagreement is logged but otherwise follows the primary.
pub fn combine(primary: PrimaryRaw, secondary: SecondaryRaw, latency_ms: u64) -> UnifiedResult {
    if primary.label != secondary.label {
        warn!(
            "Sources disagree: primary says {} ({:.2}), secondary says {} ({:.2}); keeping primary",
            primary.label, primary.confidence, secondary.label, secondary.confidence
        );
    }

    UnifiedResult {
        prediction: primary.label,
        confidence: (primary.confidence + secondary.confidence) / 2.0,
        probabilities: Some(primary.probabilities),
        analysis: Some(secondary.analysis).filter(|a| !a.is_empty()),
        heatmap: primary.heatmap,
        source: ResultSource::Combined,
        latency_ms,
    }
}
