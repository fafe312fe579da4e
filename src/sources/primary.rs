//! Client for the CNN classifier service.
//!
//! The service accepts a multipart upload and answers with a label, a
//! confidence, the class probability distribution and, on the Grad-CAM
//! endpoint, a heatmap overlay encoded as a `data:` URL.

use crate::error::SourceError;
use crate::models::{Heatmap, ImagePayload, Label, PrimaryRaw, Probabilities, SourceKind};
use crate::sources::SourceClient;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const ORIGIN: SourceKind = SourceKind::Primary;

/// Configuration for the classifier client.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    /// Base URL of the service; `None` leaves the source unconfigured.
    pub url: Option<String>,
    /// Request the Grad-CAM heatmap along with the prediction.
    pub heatmap: bool,
    pub timeout_seconds: u64,
    pub health_timeout_seconds: u64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            url: Some("http://localhost:8000".to_string()),
            heatmap: true,
            timeout_seconds: 30,
            health_timeout_seconds: 5,
        }
    }
}

/// Prediction payload returned by the classifier service.
#[derive(Debug, Deserialize)]
struct PredictResponse {
    prediction: String,
    confidence: f64,
    probabilities: Probabilities,
    #[serde(default)]
    heatmap: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// HTTP client for the classifier service.
pub struct PrimaryClient {
    config: PrimaryConfig,
    http_client: reqwest::Client,
}

impl PrimaryClient {
    /// Build a client. Fails only if the HTTP client cannot be constructed.
    pub fn new(config: PrimaryConfig) -> Result<Self, SourceError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SourceError::unavailable(ORIGIN, format!("HTTP client: {}", e)))?;

        info!(
            "Primary classifier endpoint: {}",
            config.url.as_deref().unwrap_or("<not configured>")
        );

        Ok(Self {
            config,
            http_client,
        })
    }

    fn base_url(&self) -> Result<&str, SourceError> {
        match self.config.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.trim_end_matches('/')),
            _ => Err(SourceError::ConfigurationMissing {
                origin: ORIGIN,
                setting: "primary.url",
            }),
        }
    }

    fn predict_path(&self) -> &'static str {
        if self.config.heatmap {
            "/predict-with-gradcam"
        } else {
            "/predict"
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }
}

#[async_trait::async_trait]
impl SourceClient for PrimaryClient {
    type Raw = PrimaryRaw;

    fn kind(&self) -> SourceKind {
        ORIGIN
    }

    async fn classify(&self, image: &ImagePayload) -> Result<PrimaryRaw, SourceError> {
        let url = format!("{}{}", self.base_url()?, self.predict_path());

        let part = Part::bytes(image.bytes.clone())
            .file_name(image.display_name())
            .mime_str(&image.media_type)
            .map_err(|e| {
                SourceError::malformed(
                    ORIGIN,
                    format!("invalid media type {}: {}", image.media_type, e),
                )
            })?;
        let form = Form::new().part("file", part);

        debug!("POST {} ({} bytes)", url, image.bytes.len());

        let response = self
            .http_client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SourceError::from_transport(ORIGIN, self.timeout(), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_transport(ORIGIN, self.timeout(), e))?;

        parse_predict_response(&body)
    }

    async fn health_check(&self) -> bool {
        let base = match self.base_url() {
            Ok(base) => base,
            Err(e) => {
                debug!("Primary health check skipped: {}", e);
                return false;
            }
        };

        let response = self
            .http_client
            .get(format!("{}/health", base))
            .timeout(Duration::from_secs(self.config.health_timeout_seconds))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthResponse>().await {
                    Ok(health) => health.status == "healthy",
                    Err(e) => {
                        warn!("Primary health response unreadable: {}", e);
                        false
                    }
                }
            }
            Ok(response) => {
                warn!("Primary health check returned {}", response.status());
                false
            }
            Err(e) => {
                warn!("Primary health check failed: {}", e);
                false
            }
        }
    }
}

/// Map a non-success HTTP status to the error taxonomy.
///
/// Client-error statuses mean the service could not process the bytes it was given.
fn status_error(status: StatusCode, body: &str) -> SourceError {
    let detail = format!("HTTP {}: {}", status, body.trim());
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY => SourceError::malformed(ORIGIN, detail),
        _ => SourceError::unavailable(ORIGIN, detail),
    }
}

/// Parse and validate a prediction body.
fn parse_predict_response(body: &str) -> Result<PrimaryRaw, SourceError> {
    let response: PredictResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::malformed(ORIGIN, format!("invalid JSON: {}", e)))?;

    let label = Label::parse(&response.prediction).ok_or_else(|| {
        SourceError::malformed(ORIGIN, format!("unknown label '{}'", response.prediction))
    })?;

    if !(0.0..=1.0).contains(&response.confidence) {
        return Err(SourceError::malformed(
            ORIGIN,
            format!("confidence {} outside [0, 1]", response.confidence),
        ));
    }

    let probabilities = response.probabilities.normalized().ok_or_else(|| {
        SourceError::malformed(
            ORIGIN,
            format!("invalid probabilities {:?}", response.probabilities),
        )
    })?;
    if probabilities != response.probabilities {
        debug!(
            "Renormalized primary probabilities (sum was {})",
            response.probabilities.sum()
        );
    }

    Ok(PrimaryRaw {
        label,
        confidence: response.confidence,
        probabilities,
        heatmap: response
            .heatmap
            .filter(|h| !h.is_empty())
            .map(Heatmap::from_data_url),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn image() -> ImagePayload {
        ImagePayload::new(vec![137, 80, 78, 71, 13, 10, 26, 10], "image/png")
    }

    #[test]
    fn test_parse_predict_response() {
        let body = r#"{
            "prediction": "malignant",
            "confidence": 0.93,
            "probabilities": {"benign": 0.07, "malignant": 0.93},
            "heatmap": "data:image/png;base64,AAAA",
            "file_info": {"filename": "a.png", "content_type": "image/png", "size": 8}
        }"#;

        let raw = parse_predict_response(body).unwrap();
        assert_eq!(raw.label, Label::Malignant);
        assert_eq!(raw.confidence, 0.93);
        assert!(raw.probabilities.is_normalized());
        assert_eq!(
            raw.heatmap.as_ref().map(|h| h.as_data_url()),
            Some("data:image/png;base64,AAAA")
        );
    }

    #[test]
    fn test_parse_without_heatmap() {
        let body = r#"{"prediction": "benign", "confidence": 0.6,
                       "probabilities": {"benign": 0.6, "malignant": 0.4}}"#;
        let raw = parse_predict_response(body).unwrap();
        assert_eq!(raw.label, Label::Benign);
        assert!(raw.heatmap.is_none());
    }

    #[test]
    fn test_parse_renormalizes_probabilities() {
        let body = r#"{"prediction": "benign", "confidence": 0.6,
                       "probabilities": {"benign": 3.0, "malignant": 2.0}}"#;
        let raw = parse_predict_response(body).unwrap();
        assert!(raw.probabilities.is_normalized());
        assert!((raw.probabilities.benign - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        let cases = [
            "not json",
            r#"{"prediction": "benign", "confidence": 0.6}"#,
            r#"{"prediction": "unsure", "confidence": 0.6,
                "probabilities": {"benign": 0.6, "malignant": 0.4}}"#,
            r#"{"prediction": "benign", "confidence": 1.6,
                "probabilities": {"benign": 0.6, "malignant": 0.4}}"#,
            r#"{"prediction": "benign", "confidence": 0.6,
                "probabilities": {"benign": 0.0, "malignant": 0.0}}"#,
            r#"{"prediction": "benign", "confidence": 0.6,
                "probabilities": {"benign": 1.5e308, "malignant": 1.5e308}}"#,
        ];

        for body in cases {
            let err = parse_predict_response(body).unwrap_err();
            assert!(
                matches!(err, SourceError::MalformedResponse { .. }),
                "expected malformed for {}: {:?}",
                body,
                err
            );
        }
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "cannot identify image"),
            SourceError::MalformedResponse { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, ""),
            SourceError::Unavailable { .. }
        ));
    }

    #[test]
    fn test_predict_path_follows_heatmap_setting() {
        let client = PrimaryClient::new(PrimaryConfig::default()).unwrap();
        assert_eq!(client.predict_path(), "/predict-with-gradcam");

        let client = PrimaryClient::new(PrimaryConfig {
            heatmap: false,
            ..PrimaryConfig::default()
        })
        .unwrap();
        assert_eq!(client.predict_path(), "/predict");
    }

    #[tokio::test]
    async fn test_missing_url_is_configuration_error() {
        let client = PrimaryClient::new(PrimaryConfig {
            url: None,
            ..PrimaryConfig::default()
        })
        .unwrap();

        let err = client.classify(&image()).await.unwrap_err();
        assert_eq!(
            err,
            SourceError::ConfigurationMissing {
                origin: SourceKind::Primary,
                setting: "primary.url",
            }
        );
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PrimaryClient::new(PrimaryConfig {
            url: Some(format!("http://{}", addr)),
            ..PrimaryConfig::default()
        })
        .unwrap();

        let err = client.classify(&image()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }), "{:?}", err);
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn test_silent_service_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = PrimaryClient::new(PrimaryConfig {
            url: Some(format!("http://{}", addr)),
            timeout_seconds: 1,
            ..PrimaryConfig::default()
        })
        .unwrap();

        let err = client.classify(&image()).await.unwrap_err();
        assert_eq!(
            err,
            SourceError::Timeout {
                origin: SourceKind::Primary,
                timeout: Duration::from_secs(1),
            }
        );
    }
}
