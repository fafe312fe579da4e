//! Multi-source prediction aggregation.
//!
//! The aggregator decides which sources to call for a [`Mode`], runs them
//! with the right concurrency and fallback policy and hands back a single
//! [`UnifiedResult`].
//!
//! Under [`Mode::Both`] the two calls are joined, not raced: a failure on one
//! side never cancels the other, and the result degrades to whichever side
//! succeeded. Only when both fail does the aggregator itself fail.

use crate::analysis::normalizer::{combine, normalize};
use crate::error::SourceError;
use crate::models::{ImagePayload, Mode, PrimaryRaw, SecondaryRaw, UnifiedResult};
use crate::sources::SourceClient;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runs predictions against a primary and a secondary source.
pub struct Aggregator<P, S> {
    pub(crate) primary: P,
    pub(crate) secondary: S,
}

impl<P, S> Aggregator<P, S>
where
    P: SourceClient<Raw = PrimaryRaw>,
    S: SourceClient<Raw = SecondaryRaw>,
{
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }

    /// Classify an image with the sources selected by `mode`.
    ///
    /// Single-source modes pass that source's error through unchanged.
    /// `Mode::Both` fails only with `AllSourcesUnavailable`.
    pub async fn predict(
        &self,
        image: &ImagePayload,
        mode: Mode,
    ) -> Result<UnifiedResult, SourceError> {
        let started = Instant::now();
        debug!("Dispatching {} to mode {}", image.display_name(), mode);

        let result = match mode {
            Mode::Primary => {
                let raw = self.primary.classify(image).await?;
                normalize(raw.into(), elapsed_ms(started))
            }
            Mode::Secondary => {
                let raw = self.secondary.classify(image).await?;
                normalize(raw.into(), elapsed_ms(started))
            }
            Mode::Both => {
                let (primary, secondary) = tokio::join!(
                    self.primary.classify(image),
                    self.secondary.classify(image)
                );
                debug!("Both sources settled, combining");

                match (primary, secondary) {
                    (Ok(p), Ok(s)) => combine(p, s, elapsed_ms(started)),
                    (Ok(p), Err(e)) => {
                        warn!("Secondary source dropped out, using primary only: {}", e);
                        normalize(p.into(), elapsed_ms(started))
                    }
                    (Err(e), Ok(s)) => {
                        warn!("Primary source dropped out, using secondary only: {}", e);
                        normalize(s.into(), elapsed_ms(started))
                    }
                    (Err(p), Err(s)) => {
                        return Err(SourceError::AllSourcesUnavailable {
                            primary: p.to_string(),
                            secondary: s.to_string(),
                        });
                    }
                }
            }
        };

        info!(
            "{} -> {} ({:.1}%) via {} in {}ms",
            image.display_name(),
            result.prediction,
            result.confidence * 100.0,
            result.source,
            result.latency_ms
        );

        Ok(result)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Heatmap, Label, Probabilities, ResultSource, SourceKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted source used in place of the HTTP clients.
    pub(crate) struct FakeSource<R> {
        pub kind: SourceKind,
        pub delay: Duration,
        pub outcome: Result<R, SourceError>,
        pub healthy: bool,
        pub calls: AtomicUsize,
    }

    impl<R> FakeSource<R> {
        pub fn new(kind: SourceKind, outcome: Result<R, SourceError>) -> Self {
            Self {
                kind,
                delay: Duration::ZERO,
                outcome,
                healthy: true,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn with_health(mut self, healthy: bool) -> Self {
            self.healthy = healthy;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl<R> SourceClient for FakeSource<R>
    where
        R: Into<crate::models::RawResult> + Clone + Send + Sync,
    {
        type Raw = R;

        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn classify(&self, _image: &ImagePayload) -> Result<R, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }
    }

    pub(crate) fn primary_raw() -> PrimaryRaw {
        PrimaryRaw {
            label: Label::Malignant,
            confidence: 0.92,
            probabilities: Probabilities {
                benign: 0.08,
                malignant: 0.92,
            },
            heatmap: Some(Heatmap::from_data_url("data:image/png;base64,AAAA")),
        }
    }

    pub(crate) fn secondary_raw() -> SecondaryRaw {
        SecondaryRaw {
            label: Label::Malignant,
            confidence: 0.7,
            analysis: "Disorganized architecture with mitotic figures.".to_string(),
            heuristic: false,
        }
    }

    pub(crate) fn primary_ok() -> FakeSource<PrimaryRaw> {
        FakeSource::new(SourceKind::Primary, Ok(primary_raw()))
    }

    pub(crate) fn secondary_ok() -> FakeSource<SecondaryRaw> {
        FakeSource::new(SourceKind::Secondary, Ok(secondary_raw()))
    }

    pub(crate) fn primary_down() -> FakeSource<PrimaryRaw> {
        FakeSource::new(
            SourceKind::Primary,
            Err(SourceError::unavailable(SourceKind::Primary, "HTTP 503")),
        )
    }

    pub(crate) fn secondary_down() -> FakeSource<SecondaryRaw> {
        FakeSource::new(
            SourceKind::Secondary,
            Err(SourceError::Timeout {
                origin: SourceKind::Secondary,
                timeout: Duration::from_secs(60),
            }),
        )
    }

    fn image() -> ImagePayload {
        ImagePayload::new(vec![0; 16], "image/png")
    }

    #[tokio::test]
    async fn test_primary_mode() {
        let aggregator = Aggregator::new(primary_ok(), secondary_ok());
        let result = aggregator.predict(&image(), Mode::Primary).await.unwrap();

        assert_eq!(result.source, ResultSource::Primary);
        assert_eq!(result.prediction, Label::Malignant);
        assert_eq!(result.confidence, 0.92);
        let probs = result.probabilities.unwrap();
        assert_eq!(probs, primary_raw().probabilities);
        assert!(probs.is_normalized());
        assert_eq!(aggregator.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_primary_mode_has_no_fallback() {
        let aggregator = Aggregator::new(primary_down(), secondary_ok());
        let err = aggregator
            .predict(&image(), Mode::Primary)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SourceError::unavailable(SourceKind::Primary, "HTTP 503")
        );
        assert_eq!(aggregator.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_secondary_mode() {
        let aggregator = Aggregator::new(primary_ok(), secondary_ok());
        let result = aggregator
            .predict(&image(), Mode::Secondary)
            .await
            .unwrap();

        assert_eq!(result.source, ResultSource::Secondary);
        assert_eq!(result.confidence, 0.7);
        assert!(result.probabilities.is_none());
        assert!(result.heatmap.is_none());
        assert!(result.analysis.is_some());
        assert_eq!(aggregator.primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_secondary_mode_passes_error_through() {
        let aggregator = Aggregator::new(primary_ok(), secondary_down());
        let err = aggregator
            .predict(&image(), Mode::Secondary)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_both_succeed_are_combined() {
        let aggregator = Aggregator::new(primary_ok(), secondary_ok());
        let result = aggregator.predict(&image(), Mode::Both).await.unwrap();

        assert_eq!(result.source, ResultSource::Combined);
        assert!((result.confidence - (0.92 + 0.7) / 2.0).abs() < f64::EPSILON);
        assert_eq!(result.probabilities, Some(primary_raw().probabilities));
        assert_eq!(result.heatmap, primary_raw().heatmap);
        assert_eq!(result.analysis, Some(secondary_raw().analysis));
        assert_eq!(aggregator.primary.calls(), 1);
        assert_eq!(aggregator.secondary.calls(), 1);
    }

    #[tokio::test]
    async fn test_both_degrades_to_primary() {
        let aggregator = Aggregator::new(primary_ok(), secondary_down());
        let result = aggregator.predict(&image(), Mode::Both).await.unwrap();

        let primary_only = Aggregator::new(primary_ok(), secondary_ok())
            .predict(&image(), Mode::Primary)
            .await
            .unwrap();

        assert_eq!(result.source, ResultSource::Primary);
        assert_eq!(
            UnifiedResult {
                latency_ms: 0,
                ..result
            },
            UnifiedResult {
                latency_ms: 0,
                ..primary_only
            }
        );
    }

    #[tokio::test]
    async fn test_both_degrades_to_secondary() {
        let aggregator = Aggregator::new(primary_down(), secondary_ok());
        let result = aggregator.predict(&image(), Mode::Both).await.unwrap();

        assert_eq!(result.source, ResultSource::Secondary);
        assert_eq!(result.confidence, 0.7);
        assert!(result.probabilities.is_none());
    }

    #[tokio::test]
    async fn test_both_fail() {
        let aggregator = Aggregator::new(primary_down(), secondary_down());
        let err = aggregator.predict(&image(), Mode::Both).await.unwrap_err();

        match err {
            SourceError::AllSourcesUnavailable { primary, secondary } => {
                assert!(primary.contains("HTTP 503"));
                assert!(secondary.contains("timed out"));
            }
            other => panic!("expected AllSourcesUnavailable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_latency_is_join_not_sum() {
        let aggregator = Aggregator::new(
            primary_ok().with_delay(Duration::from_millis(100)),
            secondary_ok().with_delay(Duration::from_millis(150)),
        );

        let result = aggregator.predict(&image(), Mode::Both).await.unwrap();

        assert!(result.latency_ms >= 150, "latency {}", result.latency_ms);
        assert!(result.latency_ms < 250, "latency {}", result.latency_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_failure_does_not_delay_past_the_slower_call() {
        let aggregator = Aggregator::new(
            primary_ok().with_delay(Duration::from_millis(40)),
            secondary_down().with_delay(Duration::from_millis(120)),
        );

        let result = aggregator.predict(&image(), Mode::Both).await.unwrap();

        assert_eq!(result.source, ResultSource::Primary);
        assert!(result.latency_ms >= 120 && result.latency_ms < 160);
    }

    #[tokio::test]
    async fn test_heuristic_secondary_result_keeps_fallback_confidence() {
        let heuristic = SecondaryRaw {
            label: Label::Malignant,
            confidence: 0.7,
            analysis: "Findings suggest carcinoma.".to_string(),
            heuristic: true,
        };
        let aggregator = Aggregator::new(
            primary_ok(),
            FakeSource::new(SourceKind::Secondary, Ok(heuristic)),
        );

        let result = aggregator
            .predict(&image(), Mode::Secondary)
            .await
            .unwrap();
        assert_eq!(result.confidence, 0.7);
        assert_eq!(result.prediction, Label::Malignant);
    }
}
