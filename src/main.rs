//! Histoscope - multi-source histopathology prediction
//!
//! A CLI tool that classifies tissue images as benign or malignant using a
//! CNN classifier service, a Gemini vision model, or both combined, and
//! writes Markdown, JSON or history-line reports.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (configuration, I/O, every image failed, etc.)
//!   2 - A malignant prediction was found and --fail-on-malignant is set

mod analysis;
mod cli;
mod config;
mod error;
mod models;
mod report;
mod scanner;
mod sources;

use analysis::{Aggregator, HealthReport};
use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, ChatArgs, Command, OutputFormat, PredictArgs};
use config::{Config, CONFIG_FILE_NAME};
use indicatif::{ProgressBar, ProgressStyle};
use models::{Mode, PredictionSummary, Report, ReportMetadata};
use scanner::{ImageScanner, ScanConfig, ScanOutcome};
use sources::{PrimaryClient, SecondaryClient};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig = args.command {
        return handle_init_config();
    }

    // Configuration decides the log level, so it is loaded before logging starts
    let (mut config, origin) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(args.log_level(config.general.verbose));

    info!("Histoscope v{}", env!("CARGO_PKG_VERSION"));
    origin.log();
    debug!("Command: {:?}", args.command);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .histoscope.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Set GEMINI_API_KEY to enable the secondary source.");
    Ok(())
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Dispatch a subcommand. Returns the process exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    match args.command {
        Command::Predict(ref predict) => run_predict(predict, &config, args.quiet).await,
        Command::Health => run_health(&config).await,
        Command::Chat(ref chat) => run_chat(chat, &config).await,
        Command::InitConfig => handle_init_config().map(|_| 0),
    }
}

/// Build the aggregator over the real HTTP clients.
fn build_aggregator(config: &Config) -> Result<Aggregator<PrimaryClient, SecondaryClient>> {
    let primary =
        PrimaryClient::new(config.primary_config()).context("Failed to set up primary client")?;
    let secondary = SecondaryClient::new(config.secondary_config())
        .context("Failed to set up secondary client")?;
    Ok(Aggregator::new(primary, secondary))
}

/// Run the prediction workflow. Returns exit code (0 or 2).
async fn run_predict(predict: &PredictArgs, config: &Config, quiet: bool) -> Result<i32> {
    let start_time = Instant::now();
    let mode = config.general.mode;

    let scan_config = ScanConfig::from(&config.scanner);
    let outcome = ImageScanner::new(scan_config)
        .scan(&predict.path)
        .with_context(|| format!("Failed to scan {}", predict.path.display()))?;

    if outcome.oversized > 0 {
        warn!(
            "Skipped {} image(s) larger than {} bytes",
            outcome.oversized, config.scanner.max_file_size
        );
    }

    if predict.dry_run {
        return handle_dry_run(&outcome, mode);
    }

    if outcome.images.is_empty() {
        anyhow::bail!("No images found under {}", predict.path.display());
    }

    let aggregator = build_aggregator(config)?;

    println!("🔬 Classifying {} image(s)", outcome.images.len());
    println!("   Mode: {}", mode);
    if let Some(ref url) = config.primary.url {
        println!("   Primary: {}", url);
    }
    println!("   Secondary: {}", config.secondary.model);
    println!("   Concurrency: {}\n", config.general.concurrency);

    let progress = progress_bar(outcome.images.len() as u64, quiet);
    let entries = analysis::predict_batch(
        &aggregator,
        &outcome.root,
        &outcome.relative_paths(),
        mode,
        config.general.concurrency,
        &progress,
    )
    .await;
    progress.finish_and_clear();

    let duration = start_time.elapsed().as_secs_f64();
    let summary = PredictionSummary::from_entries(&entries);

    let report = Report {
        metadata: ReportMetadata {
            analysis_date: Utc::now(),
            mode,
            primary_endpoint: config.primary.url.clone(),
            secondary_model: config.secondary.model.clone(),
            images_analyzed: summary.total,
            images_failed: summary.failed,
            duration_seconds: duration,
        },
        entries,
        summary,
    };

    let output_path = output_path(predict, config);
    let output = match predict.format {
        OutputFormat::Markdown => report::generate_markdown_report(&report),
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Jsonl => report::generate_history_lines(
            &report.entries,
            predict.user.as_deref(),
            report.metadata.analysis_date,
        )?,
    };

    std::fs::write(&output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    if let Some(ref dir) = predict.heatmap_dir {
        let written = report::write_heatmaps(&report.entries, dir)?;
        println!("🗺️  Wrote {} heatmap(s) to {}", written.len(), dir.display());
    }

    let summary = &report.summary;
    println!("\n📊 Prediction Summary:");
    println!(
        "   {} Benign: {} | {} Malignant: {} | Failed: {}",
        models::Label::Benign.emoji(),
        summary.benign,
        models::Label::Malignant.emoji(),
        summary.malignant,
        summary.failed
    );
    println!("   Duration: {:.1}s", duration);

    if summary.failed == summary.total {
        anyhow::bail!(
            "Every image failed; report written to {}",
            output_path.display()
        );
    }

    println!(
        "\n✅ Prediction complete! Report saved to: {}",
        output_path.display()
    );

    if predict.fail_on_malignant && summary.malignant > 0 {
        eprintln!(
            "\n⛔ {} malignant prediction(s) found. Failing (exit code 2).",
            summary.malignant
        );
        return Ok(2);
    }

    Ok(0)
}

/// Handle --dry-run: print the images that would be classified, exit.
fn handle_dry_run(outcome: &ScanOutcome, mode: Mode) -> Result<i32> {
    println!("\n🔍 Dry run: scanning images (no source calls)...\n");

    if outcome.images.is_empty() {
        println!("   No matching images found.");
    } else {
        println!(
            "   Found {} image(s) that would be classified in {} mode:\n",
            outcome.images.len(),
            mode
        );
        for image in &outcome.images {
            println!("     🖼️  {} ({} bytes)", image.path, image.size);
        }
    }

    println!("\n✅ Dry run complete. No source calls were made.");
    Ok(0)
}

/// Probe both sources and print the modes that are currently usable.
async fn run_health(config: &Config) -> Result<i32> {
    let aggregator = build_aggregator(config)?;

    println!("🩺 Checking sources...");
    let health: HealthReport = aggregator.health_report().await;

    let status = |up: bool| if up { "✅ healthy" } else { "❌ unavailable" };
    println!("   Primary:   {}", status(health.primary));
    println!("   Secondary: {}", status(health.secondary));

    let modes = health.available_modes();
    if modes.is_empty() {
        eprintln!("\n⛔ No source is available.");
        return Ok(1);
    }

    let names: Vec<String> = modes.iter().map(Mode::to_string).collect();
    println!("\n   Available modes: {}", names.join(", "));
    if !health.is_available(config.general.mode) {
        warn!(
            "Configured mode '{}' is not currently available",
            config.general.mode
        );
    }

    Ok(0)
}

/// Send one chat message and print the reply.
async fn run_chat(chat: &ChatArgs, config: &Config) -> Result<i32> {
    let client = SecondaryClient::new(config.secondary_config())
        .context("Failed to set up secondary client")?;

    let reply = match client.chat(&chat.message, chat.system_prompt.as_deref()).await {
        Ok(reply) => reply,
        Err(e) if e.is_configuration() => {
            anyhow::bail!("{}. Set GEMINI_API_KEY or pass --api-key", e)
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Chat request failed")),
    };

    println!("{}", reply.trim());
    Ok(0)
}

/// Report path: explicit --output, else the configured output with the
/// format's extension.
fn output_path(predict: &PredictArgs, config: &Config) -> PathBuf {
    match predict.output {
        Some(ref path) => path.clone(),
        None => PathBuf::from(&config.general.output).with_extension(predict.format.extension()),
    }
}

fn progress_bar(len: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Where the active configuration came from.
enum ConfigOrigin {
    File(PathBuf),
    Defaults,
    /// The default file exists but could not be used.
    DefaultsAfterError(anyhow::Error),
}

impl ConfigOrigin {
    /// Report the origin once logging is up.
    fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!("Loaded config from {}", path.display()),
            ConfigOrigin::Defaults => debug!("No config file found, using defaults"),
            ConfigOrigin::DefaultsAfterError(e) => warn!("Failed to load config: {:#}", e),
        }
    }
}

/// Load configuration from file or use defaults.
///
/// An explicit `--config` path must load; a broken default file falls back
/// to defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigOrigin)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigOrigin::File(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigOrigin::File(PathBuf::from(CONFIG_FILE_NAME)))),
        Ok(None) => Ok((Config::default(), ConfigOrigin::Defaults)),
        Err(e) => Ok((Config::default(), ConfigOrigin::DefaultsAfterError(e))),
    }
}
