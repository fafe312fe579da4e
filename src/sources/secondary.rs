//! Client for the Gemini vision model.
//!
//! The model is asked for a structured verdict. When its answer cannot be
//! read as that structure, the client degrades to a keyword scan of the
//! returned text instead of failing. The same client backs the assistant chat.

use crate::error::SourceError;
use crate::models::{ImagePayload, Label, SecondaryRaw, SourceKind};
use crate::sources::SourceClient;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const ORIGIN: SourceKind = SourceKind::Secondary;

/// Configuration for the Gemini client.
#[derive(Debug, Clone)]
pub struct SecondaryConfig {
    /// API key; `None` leaves the source unconfigured.
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    pub health_timeout_seconds: u64,
    pub temperature: f32,
    /// Confidence assigned to results recovered by the keyword scan.
    pub fallback_confidence: f64,
    /// System prompt used by `chat` when the caller gives none.
    pub chat_system_prompt: String,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            timeout_seconds: 60,
            health_timeout_seconds: 10,
            temperature: 0.1,
            fallback_confidence: 0.7,
            chat_system_prompt: DEFAULT_CHAT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Gemini `generateContent` request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl ContentPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    fn image(image: &ImagePayload) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: image.media_type.clone(),
                data: image.to_base64(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

/// Gemini `generateContent` response.
#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Structured verdict the model is prompted to return.
#[derive(Debug, Deserialize)]
struct Verdict {
    prediction: String,
    confidence: f64,
    #[serde(default)]
    analysis: String,
}

/// HTTP client for the Gemini API.
pub struct SecondaryClient {
    config: SecondaryConfig,
    http_client: reqwest::Client,
}

impl SecondaryClient {
    /// Build a client. Fails only if the HTTP client cannot be constructed.
    pub fn new(config: SecondaryConfig) -> Result<Self, SourceError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SourceError::unavailable(ORIGIN, format!("HTTP client: {}", e)))?;

        info!(
            "Secondary model: {} (api key {})",
            config.model,
            if config.api_key.is_some() {
                "set"
            } else {
                "missing"
            }
        );

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Whether an API key is present.
    pub fn is_configured(&self) -> bool {
        self.api_key().is_ok()
    }

    /// Ask the assistant a free-text question.
    ///
    /// `system_prompt` overrides the configured assistant prompt. Fails with
    /// `ConfigurationMissing` before any network call when no key is set.
    pub async fn chat(
        &self,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, SourceError> {
        self.api_key()?;

        let system = system_prompt.unwrap_or(&self.config.chat_system_prompt);
        debug!("Chat request ({} chars)", message.len());

        self.generate(vec![ContentPart::text(message)], Some(system), false, None)
            .await
    }

    fn api_key(&self) -> Result<&str, SourceError> {
        match self.config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(SourceError::ConfigurationMissing {
                origin: ORIGIN,
                setting: "secondary.api_key",
            }),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    /// Send one `generateContent` call and return the candidate text.
    async fn generate(
        &self,
        parts: Vec<ContentPart>,
        system_prompt: Option<&str>,
        json_output: bool,
        timeout: Option<Duration>,
    ) -> Result<String, SourceError> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            system_instruction: system_prompt.map(|prompt| Content {
                role: None,
                parts: vec![ContentPart::text(prompt)],
            }),
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                response_mime_type: json_output.then(|| "application/json".to_string()),
            },
        };

        let mut builder = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let effective_timeout = timeout.unwrap_or_else(|| self.timeout());
        let response = builder
            .send()
            .await
            .map_err(|e| SourceError::from_transport(ORIGIN, effective_timeout, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_transport(ORIGIN, effective_timeout, e))?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        extract_candidate_text(&body)
    }
}

#[async_trait::async_trait]
impl SourceClient for SecondaryClient {
    type Raw = SecondaryRaw;

    fn kind(&self) -> SourceKind {
        ORIGIN
    }

    async fn classify(&self, image: &ImagePayload) -> Result<SecondaryRaw, SourceError> {
        self.api_key()?;

        debug!(
            "Sending {} ({} bytes) to {}",
            image.display_name(),
            image.bytes.len(),
            self.config.model
        );

        let text = self
            .generate(
                vec![
                    ContentPart::text(CLASSIFY_PROMPT),
                    ContentPart::image(image),
                ],
                None,
                true,
                None,
            )
            .await?;

        classify_text(&text, self.config.fallback_confidence)
    }

    async fn health_check(&self) -> bool {
        if !self.is_configured() {
            debug!("Secondary health check skipped: no API key");
            return false;
        }

        let probe = self
            .generate(
                vec![ContentPart::text("Test")],
                None,
                false,
                Some(Duration::from_secs(self.config.health_timeout_seconds)),
            )
            .await;

        match probe {
            Ok(_) => true,
            Err(e) => {
                warn!("Secondary health check failed: {}", e);
                false
            }
        }
    }
}

/// Map a non-success HTTP status to the error taxonomy.
fn status_error(status: StatusCode, body: &str) -> SourceError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let detail = format!("HTTP {}: {}", status, message);

    // Gemini reports bad keys as 400 INVALID_ARGUMENT too.
    if status == StatusCode::BAD_REQUEST && !message.to_lowercase().contains("api key") {
        SourceError::malformed(ORIGIN, detail)
    } else {
        SourceError::unavailable(ORIGIN, detail)
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_candidate_text(body: &str) -> Result<String, SourceError> {
    let response: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::malformed(ORIGIN, format!("invalid response envelope: {}", e)))?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(SourceError::malformed(ORIGIN, "response contained no text"));
    }

    Ok(text)
}

/// Turn the model's answer into a raw result, falling back to a keyword scan.
fn classify_text(text: &str, fallback_confidence: f64) -> Result<SecondaryRaw, SourceError> {
    if text.trim().is_empty() {
        return Err(SourceError::malformed(ORIGIN, "response contained no text"));
    }

    if let Some(raw) = parse_verdict(text) {
        return Ok(raw);
    }

    let label = keyword_label(text);
    warn!(
        "Secondary answer is not a structured verdict; keyword scan says {}",
        label
    );

    Ok(SecondaryRaw {
        label,
        confidence: fallback_confidence,
        analysis: text.trim().to_string(),
        heuristic: true,
    })
}

fn parse_verdict(text: &str) -> Option<SecondaryRaw> {
    let verdict: Verdict = text
        .match_indices('{')
        .find_map(|(start, _)| first_json_value(&text[start..]))?;
    let label = Label::parse(&verdict.prediction)?;
    let confidence = normalize_confidence(verdict.confidence)?;

    Some(SecondaryRaw {
        label,
        confidence,
        analysis: verdict.analysis,
        heuristic: false,
    })
}

/// Deserialize the JSON value at the start of `text`, ignoring whatever follows it.
fn first_json_value<T: DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<T>()
        .next()?
        .ok()
}

/// Accept a probability, or a percentage in (1, 100].
fn normalize_confidence(confidence: f64) -> Option<f64> {
    if !confidence.is_finite() || confidence < 0.0 {
        None
    } else if confidence <= 1.0 {
        Some(confidence)
    } else if confidence <= 100.0 {
        Some(confidence / 100.0)
    } else {
        None
    }
}

const MALIGNANT_KEYWORDS: &[&str] = &["cancer", "malignan", "carcinoma", "metasta"];

/// Words that deny a following finding ("negative for", "absence of" match on their first word).
const NEGATION_CUES: &[&str] = &[
    "no", "not", "non", "without", "never", "negative", "absence", "absent", "lack", "lacks",
    "lacking", "free",
];

/// How many words before a keyword a negation cue still applies to.
const NEGATION_WINDOW: usize = 4;

/// Words that start a new assertion inside a clause.
const CLAUSE_BREAKS: &[&str] = &["but", "however", "although", "though", "yet", "whereas"];

/// Infer a label from free text by looking for malignancy keywords.
///
/// A keyword counts only when no negation cue precedes it within
/// [`NEGATION_WINDOW`] words of the same clause, and it is not itself
/// negated in-word (`nonmalignant`, `cancer-free`).
fn keyword_label(text: &str) -> Label {
    let lowered = text.to_lowercase();

    for clause in lowered.split(|c: char| matches!(c, '.' | ';' | ',' | ':' | '!' | '?' | '\n')) {
        let words: Vec<&str> = clause
            .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();

        let mut scope_start = 0;
        for (i, word) in words.iter().enumerate() {
            if CLAUSE_BREAKS.contains(word) {
                scope_start = i + 1;
                continue;
            }
            if MALIGNANT_KEYWORDS.iter().any(|k| word.contains(k))
                && !is_negated(&words[scope_start..i], word)
            {
                return Label::Malignant;
            }
        }
    }

    Label::Benign
}

fn is_negated(preceding: &[&str], keyword: &str) -> bool {
    if keyword.starts_with("non") || keyword.ends_with("-free") {
        return true;
    }
    preceding
        .iter()
        .rev()
        .take(NEGATION_WINDOW)
        .any(|w| NEGATION_CUES.contains(w) || w.ends_with("n't"))
}

const CLASSIFY_PROMPT: &str = r#"Analyze this histopathology image and determine if it shows signs of cancer.
Base your analysis on cellular patterns, tissue organization, and any abnormal features visible in the image.
Return only JSON in this exact format:
{"prediction": "Cancerous" or "Non-Cancerous", "confidence": number between 0 and 1, "analysis": "detailed explanation of findings"}"#;

/// Default assistant prompt for `chat`.
pub const DEFAULT_CHAT_SYSTEM_PROMPT: &str = r#"You are an intelligent assistant for Histoscope, a tool for histopathology image analysis.
Answer questions about the project, its technology, and its functionality.

Key details:
- Purpose: AI-assisted cancer screening of histopathology images.
- Core feature: an uploaded image is classified as benign or malignant with a confidence score.
- Visualization: Grad-CAM heatmaps show which regions the classifier focused on.
- Sources: a fine-tuned MobileNetV2 CNN service, optionally corroborated by a vision language model.

Be concise and helpful. Keep answers short. If you don't know the answer, say so."#;
