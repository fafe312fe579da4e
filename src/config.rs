//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.histoscope.toml` files.

use crate::models::Mode;
use crate::sources::secondary::DEFAULT_CHAT_SYSTEM_PROMPT;
use crate::sources::{PrimaryConfig, SecondaryConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = ".histoscope.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Primary classifier service.
    #[serde(default)]
    pub primary: PrimarySettings,

    /// Secondary vision model.
    #[serde(default)]
    pub secondary: SecondarySettings,

    /// Assistant chat settings.
    #[serde(default)]
    pub chat: ChatSettings,

    /// Image scanner settings.
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of images predicted concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default prediction mode.
    #[serde(default)]
    pub mode: Mode,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            concurrency: default_concurrency(),
            mode: Mode::default(),
        }
    }
}

fn default_output() -> String {
    "histoscope_report.md".to_string()
}

fn default_concurrency() -> usize {
    4
}

/// Primary classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimarySettings {
    /// Base URL of the classifier service.
    #[serde(default = "default_primary_url")]
    pub url: Option<String>,

    /// Request Grad-CAM heatmaps.
    #[serde(default = "default_true")]
    pub heatmap: bool,

    /// Prediction timeout in seconds.
    #[serde(default = "default_primary_timeout")]
    pub timeout_seconds: u64,

    /// Health probe timeout in seconds.
    #[serde(default = "default_primary_health_timeout")]
    pub health_timeout_seconds: u64,
}

impl Default for PrimarySettings {
    fn default() -> Self {
        Self {
            url: default_primary_url(),
            heatmap: true,
            timeout_seconds: default_primary_timeout(),
            health_timeout_seconds: default_primary_health_timeout(),
        }
    }
}

fn default_primary_url() -> Option<String> {
    Some("http://localhost:8000".to_string())
}

fn default_primary_timeout() -> u64 {
    30
}

fn default_primary_health_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// Secondary vision model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondarySettings {
    /// Gemini API key. Prefer the GEMINI_API_KEY environment variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model name.
    #[serde(default = "default_secondary_model")]
    pub model: String,

    /// API base URL.
    #[serde(default = "default_secondary_base_url")]
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_secondary_timeout")]
    pub timeout_seconds: u64,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Confidence reported when the answer had to be recovered by keyword scan.
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
}

impl Default for SecondarySettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_secondary_model(),
            base_url: default_secondary_base_url(),
            timeout_seconds: default_secondary_timeout(),
            temperature: default_temperature(),
            fallback_confidence: default_fallback_confidence(),
        }
    }
}

fn default_secondary_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_secondary_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_secondary_timeout() -> u64 {
    60
}

fn default_temperature() -> f32 {
    0.1
}

fn default_fallback_confidence() -> f64 {
    0.7
}

/// Assistant chat settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Replaces the built-in assistant system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Image scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum images per batch.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Image extensions to include.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Directory or file names to skip.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Maximum image size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            extensions: default_extensions(),
            excludes: default_excludes(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_max_files() -> usize {
    500
}

fn default_extensions() -> Vec<String> {
    vec!["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_excludes() -> Vec<String> {
    vec![".git", "target", "node_modules", "__pycache__", "heatmaps"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_file_size() -> usize {
    20 * 1024 * 1024 // 20MB
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were actually provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref url) = args.primary_url {
            self.primary.url = Some(url.clone());
        }
        if let Some(ref key) = args.api_key {
            self.secondary.api_key = Some(key.clone());
        }
        if let Some(ref model) = args.secondary_model {
            self.secondary.model = model.clone();
        }

        // A single timeout flag bounds both sources
        if let Some(timeout) = args.timeout {
            self.primary.timeout_seconds = timeout;
            self.secondary.timeout_seconds = timeout;
        }

        if args.verbose {
            self.general.verbose = true;
        }

        if let crate::cli::Command::Predict(ref predict) = args.command {
            if let Some(mode) = predict.mode {
                self.general.mode = mode;
            }
            if let Some(concurrency) = predict.concurrency {
                self.general.concurrency = concurrency;
            }
            if let Some(ref output) = predict.output {
                self.general.output = output.display().to_string();
            }
            if predict.no_heatmap {
                self.primary.heatmap = false;
            }
        }
    }

    /// Build the primary client configuration.
    pub fn primary_config(&self) -> PrimaryConfig {
        PrimaryConfig {
            url: self.primary.url.clone(),
            heatmap: self.primary.heatmap,
            timeout_seconds: self.primary.timeout_seconds,
            health_timeout_seconds: self.primary.health_timeout_seconds,
        }
    }

    /// Build the secondary client configuration.
    pub fn secondary_config(&self) -> SecondaryConfig {
        SecondaryConfig {
            api_key: self.secondary.api_key.clone(),
            model: self.secondary.model.clone(),
            base_url: self.secondary.base_url.clone(),
            timeout_seconds: self.secondary.timeout_seconds,
            temperature: self.secondary.temperature,
            fallback_confidence: self.secondary.fallback_confidence,
            chat_system_prompt: self
                .chat
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAT_SYSTEM_PROMPT.to_string()),
            ..SecondaryConfig::default()
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Args, Command, OutputFormat, PredictArgs};
    use std::path::PathBuf;

    fn predict_args() -> Args {
        Args {
            config: None,
            verbose: false,
            quiet: false,
            primary_url: None,
            api_key: None,
            secondary_model: None,
            timeout: None,
            command: Command::Predict(PredictArgs {
                path: PathBuf::from("slides"),
                mode: None,
                output: None,
                format: OutputFormat::Markdown,
                heatmap_dir: None,
                no_heatmap: false,
                user: None,
                concurrency: None,
                dry_run: false,
                fail_on_malignant: false,
            }),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.mode, Mode::Both);
        assert_eq!(config.primary.url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.secondary.model, "gemini-2.5-flash");
        assert_eq!(config.secondary.fallback_confidence, 0.7);
        assert!(config.secondary.api_key.is_none());
        assert!(config.scanner.extensions.contains(&"png".to_string()));
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "screening.md"
mode = "primary"

[primary]
url = "http://classifier.internal:8000"
heatmap = false

[secondary]
model = "gemini-2.5-pro"
fallback_confidence = 0.6

[chat]
system_prompt = "Answer in one sentence."

[scanner]
max_files = 50
extensions = ["png"]
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "screening.md");
        assert_eq!(config.general.mode, Mode::Primary);
        assert_eq!(
            config.primary.url.as_deref(),
            Some("http://classifier.internal:8000")
        );
        assert!(!config.primary.heatmap);
        assert_eq!(config.primary.timeout_seconds, 30);
        assert_eq!(config.secondary.model, "gemini-2.5-pro");
        assert_eq!(config.scanner.max_files, 50);
        assert_eq!(config.scanner.extensions, vec!["png"]);

        let secondary = config.secondary_config();
        assert_eq!(secondary.fallback_confidence, 0.6);
        assert_eq!(secondary.chat_system_prompt, "Answer in one sentence.");
    }

    #[test]
    fn test_merge_with_args() {
        let mut config = Config::default();
        let mut args = predict_args();
        args.primary_url = Some("http://10.0.0.5:8000".to_string());
        args.api_key = Some("key-123".to_string());
        args.timeout = Some(12);
        if let Command::Predict(ref mut predict) = args.command {
            predict.mode = Some(Mode::Secondary);
            predict.concurrency = Some(8);
            predict.no_heatmap = true;
        }

        config.merge_with_args(&args);

        assert_eq!(config.primary.url.as_deref(), Some("http://10.0.0.5:8000"));
        assert_eq!(config.secondary.api_key.as_deref(), Some("key-123"));
        assert_eq!(config.primary.timeout_seconds, 12);
        assert_eq!(config.secondary.timeout_seconds, 12);
        assert_eq!(config.general.mode, Mode::Secondary);
        assert_eq!(config.general.concurrency, 8);
        assert!(!config.primary_config().heatmap);
    }

    #[test]
    fn test_merge_keeps_file_values_without_flags() {
        let mut config: Config = toml::from_str("[general]\nmode = \"primary\"\n").unwrap();
        config.merge_with_args(&predict_args());
        assert_eq!(config.general.mode, Mode::Primary);
        assert_eq!(config.general.concurrency, 4);
    }

    #[test]
    fn test_verbose_from_file_sets_log_level() {
        let mut config: Config = toml::from_str("[general]\nverbose = true\n").unwrap();
        let mut args = predict_args();
        config.merge_with_args(&args);
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::DEBUG);

        args.quiet = true;
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::ERROR);

        let mut config = Config::default();
        args.quiet = false;
        config.merge_with_args(&args);
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::INFO);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[secondary]\ntimeout_seconds = 5\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.secondary.timeout_seconds, 5);

        std::fs::write(&path, "[secondary\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[primary]"));
        assert!(toml_str.contains("[secondary]"));
        assert!(toml_str.contains("[scanner]"));
        assert!(!toml_str.contains("api_key"));

        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.general.mode, Mode::Both);
    }
}
