//! Data models for histopathology predictions.
//!
//! This module contains the request payload, the per-source raw results and
//! the unified result shape every caller depends on.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Tolerance used when checking that class probabilities sum to one.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Which inference source(s) a prediction should use.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// CNN classifier service only
    Primary,
    /// Vision language model only
    Secondary,
    /// Both sources, joined and combined (default)
    #[default]
    Both,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Primary => write!(f, "primary"),
            Mode::Secondary => write!(f, "secondary"),
            Mode::Both => write!(f, "both"),
        }
    }
}

/// Identity of a single inference source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Primary,
    Secondary,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Primary => write!(f, "primary"),
            SourceKind::Secondary => write!(f, "secondary"),
        }
    }
}

/// Which path produced a unified result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Primary,
    Secondary,
    Combined,
}

impl From<SourceKind> for ResultSource {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Primary => ResultSource::Primary,
            SourceKind::Secondary => ResultSource::Secondary,
        }
    }
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSource::Primary => write!(f, "primary"),
            ResultSource::Secondary => write!(f, "secondary"),
            ResultSource::Combined => write!(f, "combined"),
        }
    }
}

/// Binary classification label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Benign,
    Malignant,
}

impl Label {
    /// Parse the label vocabulary used by either source.
    ///
    /// Accepts `benign`/`malignant` and the `Non-Cancerous`/`Cancerous` wording
    /// the vision model is prompted with. Case and surrounding whitespace are ignored.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "benign" | "non-cancerous" | "noncancerous" | "non cancerous" => Some(Label::Benign),
            "malignant" | "cancerous" => Some(Label::Malignant),
            _ => None,
        }
    }

    /// Returns an emoji representation of the label.
    pub fn emoji(&self) -> &'static str {
        match self {
            Label::Benign => "🟢",
            Label::Malignant => "🔴",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Benign => write!(f, "benign"),
            Label::Malignant => write!(f, "malignant"),
        }
    }
}

/// Class probability distribution reported by the primary classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probabilities {
    pub benign: f64,
    pub malignant: f64,
}

impl Probabilities {
    pub fn sum(&self) -> f64 {
        self.benign + self.malignant
    }

    /// Whether the distribution sums to one within [`PROBABILITY_TOLERANCE`].
    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= PROBABILITY_TOLERANCE
    }

    /// Rescale so both entries sum to one.
    ///
    /// Returns `None` for negative, non-finite or all-zero inputs, and when
    /// the sum overflows.
    pub fn normalized(&self) -> Option<Self> {
        let valid = |p: f64| p.is_finite() && p >= 0.0;
        if !valid(self.benign) || !valid(self.malignant) {
            return None;
        }
        let sum = self.sum();
        if !sum.is_finite() || sum <= 0.0 {
            return None;
        }
        if self.is_normalized() {
            return Some(*self);
        }
        Some(Self {
            benign: self.benign / sum,
            malignant: self.malignant / sum,
        })
    }

    /// Probability assigned to the given label.
    pub fn of(&self, label: Label) -> f64 {
        match label {
            Label::Benign => self.benign,
            Label::Malignant => self.malignant,
        }
    }
}

/// An image submitted for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    /// Raw encoded image bytes.
    pub bytes: Vec<u8>,
    /// Declared media type, e.g. `image/png`.
    pub media_type: String,
    /// Original file name, if the image came from disk.
    pub file_name: Option<String>,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
            file_name: None,
        }
    }

    /// Read an image from disk, inferring the media type from its extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Ok(Self {
            bytes,
            media_type: media_type_for_extension(extension).to_string(),
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
        })
    }

    /// File name to present to remote services.
    pub fn display_name(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| {
            format!("upload.{}", extension_for_media_type(&self.media_type))
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

/// Map a file extension to an image media type.
pub fn media_type_for_extension(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Map an image media type back to a file extension.
pub fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/tiff" => "tiff",
        "image/bmp" => "bmp",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Explainability overlay returned by the primary classifier, as a `data:` URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heatmap(String);

impl Heatmap {
    pub fn from_data_url(data_url: impl Into<String>) -> Self {
        Self(data_url.into())
    }

    /// Wrap raw image bytes as a base64 `data:` URL.
    #[cfg(test)]
    pub fn from_image(image: &ImagePayload) -> Self {
        Self(format!(
            "data:{};base64,{}",
            image.media_type,
            image.to_base64()
        ))
    }

    pub fn as_data_url(&self) -> &str {
        &self.0
    }

    /// Decode the `data:` URL back into image bytes.
    ///
    /// A bare base64 string without the `data:` prefix is read as PNG.
    pub fn decode(&self) -> Result<ImagePayload, String> {
        let (media_type, encoded) = match self.0.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest
                    .split_once(',')
                    .ok_or_else(|| "heatmap data URL has no payload".to_string())?;
                let media_type = header
                    .strip_suffix(";base64")
                    .ok_or_else(|| "heatmap data URL is not base64-encoded".to_string())?;
                (media_type.to_string(), data)
            }
            None => ("image/png".to_string(), self.0.as_str()),
        };

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("invalid heatmap base64: {}", e))?;

        Ok(ImagePayload::new(bytes, media_type))
    }
}

/// Raw result of the primary classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryRaw {
    pub label: Label,
    pub confidence: f64,
    pub probabilities: Probabilities,
    pub heatmap: Option<Heatmap>,
}

/// Raw result of the secondary vision model.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryRaw {
    pub label: Label,
    pub confidence: f64,
    /// Free-text rationale.
    pub analysis: String,
    /// Whether the keyword fallback produced this result.
    pub heuristic: bool,
}

/// Source-tagged raw result.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Primary(PrimaryRaw),
    Secondary(SecondaryRaw),
}

impl RawResult {
    pub fn kind(&self) -> SourceKind {
        match self {
            RawResult::Primary(_) => SourceKind::Primary,
            RawResult::Secondary(_) => SourceKind::Secondary,
        }
    }
}

impl From<PrimaryRaw> for RawResult {
    fn from(raw: PrimaryRaw) -> Self {
        RawResult::Primary(raw)
    }
}

impl From<SecondaryRaw> for RawResult {
    fn from(raw: SecondaryRaw) -> Self {
        RawResult::Secondary(raw)
    }
}

/// The single result shape produced by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedResult {
    pub prediction: Label,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Probabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heatmap: Option<Heatmap>,
    pub source: ResultSource,
    pub latency_ms: u64,
}

/// Record shape handed to the analysis-history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub prediction: Label,
    pub confidence: f64,
    pub probabilities: Option<Probabilities>,
    pub heatmap: Option<Heatmap>,
    pub image_reference: String,
    pub timestamp: DateTime<Utc>,
    pub user_reference: Option<String>,
    pub source: ResultSource,
}

impl HistoryRecord {
    pub fn from_result(
        result: &UnifiedResult,
        image_reference: impl Into<String>,
        user_reference: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            prediction: result.prediction,
            confidence: result.confidence,
            probabilities: result.probabilities,
            heatmap: result.heatmap.clone(),
            image_reference: image_reference.into(),
            timestamp,
            user_reference,
            source: result.source,
        }
    }
}

/// Outcome of predicting one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionEntry {
    /// Image path, relative to the scanned root.
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<UnifiedResult>,
    /// Error message if the prediction failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionEntry {
    pub fn succeeded(image: impl Into<String>, result: UnifiedResult) -> Self {
        Self {
            image: image.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(image: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_malignant(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.prediction == Label::Malignant)
    }
}

/// Counts over a set of predictions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub total: usize,
    pub benign: usize,
    pub malignant: usize,
    pub failed: usize,
    /// Successful predictions grouped by producing source.
    pub by_source: std::collections::HashMap<String, usize>,
}

impl PredictionSummary {
    /// Creates a summary from a list of entries.
    pub fn from_entries(entries: &[PredictionEntry]) -> Self {
        let mut summary = Self {
            total: entries.len(),
            ..Self::default()
        };

        for entry in entries {
            match &entry.result {
                Some(result) => {
                    match result.prediction {
                        Label::Benign => summary.benign += 1,
                        Label::Malignant => summary.malignant += 1,
                    }
                    *summary
                        .by_source
                        .entry(result.source.to_string())
                        .or_insert(0) += 1;
                }
                None => summary.failed += 1,
            }
        }

        summary
    }
}

/// Metadata about a prediction report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub analysis_date: DateTime<Utc>,
    /// Requested mode.
    pub mode: Mode,
    /// Primary classifier endpoint, if configured.
    pub primary_endpoint: Option<String>,
    /// Secondary model name.
    pub secondary_model: String,
    pub images_analyzed: usize,
    pub images_failed: usize,
    pub duration_seconds: f64,
}

/// A complete prediction report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub entries: Vec<PredictionEntry>,
    pub summary: PredictionSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parse() {
        assert_eq!(Label::parse("benign"), Some(Label::Benign));
        assert_eq!(Label::parse(" Malignant "), Some(Label::Malignant));
        assert_eq!(Label::parse("Cancerous"), Some(Label::Malignant));
        assert_eq!(Label::parse("Non-Cancerous"), Some(Label::Benign));
        assert_eq!(Label::parse("maybe"), None);
    }

    #[test]
    fn test_probabilities_normalized() {
        let probs = Probabilities {
            benign: 0.2,
            malignant: 0.8,
        };
        assert!(probs.is_normalized());
        assert_eq!(probs.normalized(), Some(probs));

        let skewed = Probabilities {
            benign: 1.0,
            malignant: 3.0,
        };
        let fixed = skewed.normalized().unwrap();
        assert!(fixed.is_normalized());
        assert!((fixed.malignant - 0.75).abs() < 1e-12);

        let invalid = Probabilities {
            benign: -0.1,
            malignant: 1.1,
        };
        assert_eq!(invalid.normalized(), None);

        let zero = Probabilities {
            benign: 0.0,
            malignant: 0.0,
        };
        assert_eq!(zero.normalized(), None);
        let overflowing = Probabilities {
            benign: 1.5e308,
            malignant: 1.5e308,
        };
        assert_eq!(overflowing.normalized(), None);
    }

    #[test]
    fn test_media_type_for_extension() {
        assert_eq!(media_type_for_extension("PNG"), "image/png");
        assert_eq!(media_type_for_extension("jpeg"), "image/jpeg");
        assert_eq!(media_type_for_extension("tif"), "image/tiff");
        assert_eq!(media_type_for_extension("txt"), "application/octet-stream");
    }

    #[test]
    fn test_image_payload_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide_01.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF]).unwrap();

        let image = ImagePayload::from_path(&path).unwrap();
        assert_eq!(image.media_type, "image/jpeg");
        assert_eq!(image.file_name.as_deref(), Some("slide_01.jpg"));
        assert_eq!(image.bytes, vec![0xFF, 0xD8, 0xFF]);
        assert_eq!(image.display_name(), "slide_01.jpg");

        let anonymous = ImagePayload::new(vec![1, 2, 3], "image/png");
        assert_eq!(anonymous.display_name(), "upload.png");
    }

    #[test]
    fn test_heatmap_decode() {
        let original = ImagePayload::new(vec![137, 80, 78, 71], "image/png");
        let heatmap = Heatmap::from_image(&original);
        assert!(heatmap.as_data_url().starts_with("data:image/png;base64,"));

        let decoded = heatmap.decode().unwrap();
        assert_eq!(decoded.bytes, original.bytes);
        assert_eq!(decoded.media_type, "image/png");

        let bare = Heatmap::from_data_url("iVBORw==");
        assert_eq!(bare.decode().unwrap().media_type, "image/png");

        let broken = Heatmap::from_data_url("data:image/png,notbase64");
        assert!(broken.decode().is_err());
    }

    #[test]
    fn test_unified_result_serialization_skips_absent_fields() {
        let result = UnifiedResult {
            prediction: Label::Benign,
            confidence: 0.9,
            probabilities: None,
            analysis: Some("Regular glandular architecture.".to_string()),
            heatmap: None,
            source: ResultSource::Secondary,
            latency_ms: 1200,
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"prediction\":\"benign\""));
        assert!(json.contains("\"source\":\"secondary\""));
        assert!(!json.contains("probabilities"));
        assert!(!json.contains("heatmap"));
    }

    #[test]
    fn test_history_record_from_result() {
        let result = UnifiedResult {
            prediction: Label::Malignant,
            confidence: 0.88,
            probabilities: Some(Probabilities {
                benign: 0.12,
                malignant: 0.88,
            }),
            analysis: None,
            heatmap: Some(Heatmap::from_data_url("data:image/png;base64,AAAA")),
            source: ResultSource::Primary,
            latency_ms: 350,
        };
        let now = Utc::now();

        let record =
            HistoryRecord::from_result(&result, "slides/a.png", Some("user-42".to_string()), now);
        assert_eq!(record.prediction, Label::Malignant);
        assert_eq!(record.confidence, 0.88);
        assert_eq!(record.probabilities, result.probabilities);
        assert_eq!(record.heatmap, result.heatmap);
        assert_eq!(record.image_reference, "slides/a.png");
        assert_eq!(record.user_reference.as_deref(), Some("user-42"));
        assert_eq!(record.timestamp, now);
    }

    #[test]
    fn test_result_source_from_kind() {
        assert_eq!(ResultSource::from(SourceKind::Primary), ResultSource::Primary);
        assert_eq!(
            ResultSource::from(SourceKind::Secondary),
            ResultSource::Secondary
        );
        assert_eq!(ResultSource::Combined.to_string(), "combined");
    }

    #[test]
    fn test_prediction_summary() {
        let result = |prediction, source| UnifiedResult {
            prediction,
            confidence: 0.8,
            probabilities: None,
            analysis: None,
            heatmap: None,
            source,
            latency_ms: 10,
        };
        let entries = vec![
            PredictionEntry::succeeded("a.png", result(Label::Malignant, ResultSource::Combined)),
            PredictionEntry::succeeded("b.png", result(Label::Benign, ResultSource::Primary)),
            PredictionEntry::succeeded("c.png", result(Label::Benign, ResultSource::Combined)),
            PredictionEntry::failed("d.png", "All requested sources are unavailable"),
        ];

        let summary = PredictionSummary::from_entries(&entries);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.benign, 2);
        assert_eq!(summary.malignant, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.by_source.get("combined"), Some(&2));
        assert_eq!(summary.by_source.get("primary"), Some(&1));
        assert!(entries[0].is_malignant());
        assert!(!entries[3].is_malignant());
    }
}
