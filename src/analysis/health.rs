//! Source liveness probes.
//!
//! Nothing is cached: every call re-probes the source.

use crate::analysis::Aggregator;
use crate::models::{Mode, PrimaryRaw, SecondaryRaw, SourceKind};
use crate::sources::SourceClient;
use tracing::debug;

/// Liveness of both sources at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub primary: bool,
    pub secondary: bool,
}

impl HealthReport {
    /// Modes worth offering to the user.
    ///
    /// `Both` stays available while either source is up, since it degrades.
    pub fn available_modes(&self) -> Vec<Mode> {
        let mut modes = Vec::new();
        if self.primary {
            modes.push(Mode::Primary);
        }
        if self.secondary {
            modes.push(Mode::Secondary);
        }
        if self.primary || self.secondary {
            modes.push(Mode::Both);
        }
        modes
    }

    pub fn is_available(&self, mode: Mode) -> bool {
        self.available_modes().contains(&mode)
    }
}

impl<P, S> Aggregator<P, S>
where
    P: SourceClient<Raw = PrimaryRaw>,
    S: SourceClient<Raw = SecondaryRaw>,
{
    pub async fn primary_healthy(&self) -> bool {
        probe(&self.primary).await
    }

    pub async fn secondary_healthy(&self) -> bool {
        probe(&self.secondary).await
    }

    #[allow(dead_code)] // Single-source probe for library callers
    pub async fn check_health(&self, source: SourceKind) -> bool {
        match source {
            SourceKind::Primary => self.primary_healthy().await,
            SourceKind::Secondary => self.secondary_healthy().await,
        }
    }

    /// Probe both sources concurrently.
    pub async fn health_report(&self) -> HealthReport {
        let (primary, secondary) = tokio::join!(self.primary_healthy(), self.secondary_healthy());
        HealthReport { primary, secondary }
    }
}

async fn probe<C: SourceClient>(client: &C) -> bool {
    let healthy = client.health_check().await;
    debug!("{} source healthy: {}", client.kind(), healthy);
    healthy
}
