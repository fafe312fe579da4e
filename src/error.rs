//! Error taxonomy for inference sources and the prediction aggregator.
//!
//! Every transport-level failure is converted into a [`SourceError`] at the
//! source client boundary, so the aggregator only ever sees typed errors.

use crate::models::SourceKind;
use std::time::Duration;
use thiserror::Error;

/// Failure raised by a source client or by the aggregator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// Network, authentication or HTTP-level failure reaching a source.
    #[error("{origin} source unavailable: {message}")]
    Unavailable { origin: SourceKind, message: String },

    /// The source did not answer within its bound.
    #[error("{origin} source timed out after {}s", timeout.as_secs_f64())]
    Timeout { origin: SourceKind, timeout: Duration },

    /// The source answered, but the payload could not be interpreted.
    #[error("{origin} source returned a malformed response: {message}")]
    MalformedResponse { origin: SourceKind, message: String },

    /// A credential or endpoint was never supplied.
    #[error("{origin} source is not configured: missing {setting}")]
    ConfigurationMissing {
        origin: SourceKind,
        setting: &'static str,
    },

    /// Every source requested by the mode failed.
    #[error("All requested sources are unavailable (primary: {primary}; secondary: {secondary})")]
    AllSourcesUnavailable { primary: String, secondary: String },
}

impl SourceError {
    pub fn unavailable(origin: SourceKind, message: impl Into<String>) -> Self {
        Self::Unavailable {
            origin,
            message: message.into(),
        }
    }

    pub fn malformed(origin: SourceKind, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            origin,
            message: message.into(),
        }
    }

    /// Convert a reqwest failure into the taxonomy.
    pub fn from_transport(origin: SourceKind, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { origin, timeout }
        } else if err.is_decode() {
            Self::malformed(origin, format!("failed to decode response body: {}", err))
        } else if err.is_connect() {
            Self::unavailable(origin, format!("cannot connect: {}", err))
        } else {
            Self::unavailable(origin, format!("request failed: {}", err))
        }
    }

    /// The source this error came from, `None` for the aggregate failure.
    pub fn origin(&self) -> Option<SourceKind> {
        match self {
            Self::Unavailable { origin, .. }
            | Self::Timeout { origin, .. }
            | Self::MalformedResponse { origin, .. }
            | Self::ConfigurationMissing { origin, .. } => Some(*origin),
            Self::AllSourcesUnavailable { .. } => None,
        }
    }

    /// True when retrying cannot help and the mode should be disabled instead.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationMissing { .. })
    }
}
