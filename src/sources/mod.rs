//! Inference source clients.
//!
//! Each client wraps exactly one external inference capability behind the
//! [`SourceClient`] trait so the aggregator can be driven by real HTTP
//! clients or by fakes.

pub mod primary;
pub mod secondary;

pub use primary::{PrimaryClient, PrimaryConfig};
pub use secondary::{SecondaryClient, SecondaryConfig};

use crate::error::SourceError;
use crate::models::{ImagePayload, RawResult, SourceKind};

/// A single inference backend.
#[async_trait::async_trait]
pub trait SourceClient: Send + Sync {
    /// Source-specific raw result.
    type Raw: Into<RawResult> + Send;

    /// Which source this client talks to.
    fn kind(&self) -> SourceKind;

    /// Classify one image.
    async fn classify(&self, image: &ImagePayload) -> Result<Self::Raw, SourceError>;

    /// Probe liveness. Never fails; any internal error is reported as `false`.
    async fn health_check(&self) -> bool;
}
