//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::Mode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Histoscope - histopathology image screening from two sources
///
/// Classifies tissue images as benign or malignant using a CNN classifier
/// service, a Gemini vision model, or both combined.
///
/// Examples:
///   histoscope predict ./slides --mode both
///   histoscope predict sample.png --mode primary --heatmap-dir ./heatmaps
///   histoscope predict ./slides --format jsonl --user clinician-7 -o history.jsonl
///   histoscope health
///   histoscope chat "What does a high mitotic count suggest?"
///   histoscope init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .histoscope.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Base URL of the primary classifier service
    #[arg(long, value_name = "URL", env = "HISTOSCOPE_PRIMARY_URL", global = true)]
    pub primary_url: Option<String>,

    /// Gemini API key for the secondary source
    #[arg(
        long,
        value_name = "KEY",
        env = "GEMINI_API_KEY",
        hide_env_values = true,
        global = true
    )]
    pub api_key: Option<String>,

    /// Gemini model used by the secondary source
    #[arg(
        long,
        value_name = "MODEL",
        env = "HISTOSCOPE_SECONDARY_MODEL",
        global = true
    )]
    pub secondary_model: Option<String>,

    /// Request timeout in seconds, applied to both sources
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Classify one image or every image under a directory
    Predict(PredictArgs),

    /// Probe both sources and list the modes currently available
    Health,

    /// Ask the assistant a free-text question
    Chat(ChatArgs),

    /// Generate a default .histoscope.toml configuration file
    InitConfig,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PredictArgs {
    /// Image file or directory of images
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Which sources to consult
    #[arg(short, long, value_name = "MODE")]
    pub mode: Option<Mode>,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json, jsonl)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Write decoded Grad-CAM heatmaps into this directory
    #[arg(long, value_name = "DIR")]
    pub heatmap_dir: Option<PathBuf>,

    /// Do not request heatmaps from the primary classifier
    #[arg(long, conflicts_with = "heatmap_dir")]
    pub no_heatmap: bool,

    /// Reference of the user the predictions are recorded for
    #[arg(long, value_name = "ID")]
    pub user: Option<String>,

    /// Number of images predicted concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Dry run: list the images that would be classified and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Exit with code 2 when any image is predicted malignant
    ///
    /// Useful for screening pipelines that escalate positive findings.
    #[arg(long)]
    pub fail_on_malignant: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ChatArgs {
    /// Message to send
    #[arg(value_name = "MESSAGE")]
    pub message: String,

    /// Replace the configured system prompt for this message
    #[arg(long, value_name = "PROMPT")]
    pub system_prompt: Option<String>,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
    /// One history record per line
    Jsonl,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref url) = self.primary_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Primary URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        match self.command {
            Command::Predict(ref predict) => predict.validate(),
            Command::Chat(ref chat) => {
                if chat.message.trim().is_empty() {
                    return Err("Chat message must not be empty".to_string());
                }
                Ok(())
            }
            Command::Health | Command::InitConfig => Ok(()),
        }
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `--quiet` wins; otherwise `--verbose` or `general.verbose` from the
    /// config file enable debug output.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

impl PredictArgs {
    fn validate(&self) -> Result<(), String> {
        if !self.path.exists() {
            return Err(format!("Path does not exist: {}", self.path.display()));
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if let Some(ref user) = self.user {
            if user.trim().is_empty() {
                return Err("User reference must not be empty".to_string());
            }
        }

        Ok(())
    }
}
