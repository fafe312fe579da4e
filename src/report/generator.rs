//! Markdown, JSON and history-line report generation.

use crate::models::{
    HistoryRecord, Label, PredictionEntry, PredictionSummary, Report, ReportMetadata,
};
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Longest analysis excerpt rendered in the Markdown table.
const ANALYSIS_EXCERPT_CHARS: usize = 160;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Histoscope Prediction Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary));
    output.push_str(&generate_predictions_section(&report.entries));
    output.push_str(&generate_failures_section(&report.entries));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Mode:** {}\n", metadata.mode));
    if let Some(ref endpoint) = metadata.primary_endpoint {
        section.push_str(&format!("- **Primary Classifier:** {}\n", endpoint));
    }
    section.push_str(&format!(
        "- **Secondary Model:** `{}`\n",
        metadata.secondary_model
    ));
    section.push_str(&format!(
        "- **Images Analyzed:** {}\n",
        metadata.images_analyzed
    ));
    if metadata.images_failed > 0 {
        section.push_str(&format!("- **Images Failed:** {}\n", metadata.images_failed));
    }
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the summary section.
fn generate_summary_section(summary: &PredictionSummary) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str(&format!(
        "| {} Benign | {} Malignant | Failed | **Total** |\n",
        Label::Benign.emoji(),
        Label::Malignant.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | **{}** |\n\n",
        summary.benign, summary.malignant, summary.failed, summary.total
    ));

    if !summary.by_source.is_empty() {
        section.push_str("### Results by Source\n\n");
        section.push_str("| Source | Images |\n");
        section.push_str("|:---|:---:|\n");

        let mut sources: Vec<_> = summary.by_source.iter().collect();
        sources.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        for (source, count) in sources {
            section.push_str(&format!("| {} | {} |\n", source, count));
        }
        section.push('\n');
    }

    section
}

/// Generate the per-image predictions table.
fn generate_predictions_section(entries: &[PredictionEntry]) -> String {
    let mut section = String::new();

    section.push_str("## Predictions\n\n");

    let succeeded: Vec<_> = entries
        .iter()
        .filter_map(|e| e.result.as_ref().map(|r| (e, r)))
        .collect();

    if succeeded.is_empty() {
        section.push_str("No image could be classified.\n\n");
        return section;
    }

    section.push_str("| Image | Prediction | Confidence | P(malignant) | Source | Latency | Analysis |\n");
    section.push_str("|:---|:---:|:---:|:---:|:---:|:---:|:---|\n");

    for (entry, result) in succeeded {
        let malignant_probability = result
            .probabilities
            .map(|p| format!("{:.1}%", p.of(Label::Malignant) * 100.0))
            .unwrap_or_else(|| "-".to_string());
        let analysis = result
            .analysis
            .as_deref()
            .map(excerpt)
            .unwrap_or_else(|| "-".to_string());

        section.push_str(&format!(
            "| `{}` | {} {} | {:.1}% | {} | {} | {} ms | {} |\n",
            entry.image,
            result.prediction.emoji(),
            result.prediction,
            result.confidence * 100.0,
            malignant_probability,
            result.source,
            result.latency_ms,
            analysis
        ));
    }
    section.push('\n');

    section
}

/// Generate the failures section.
fn generate_failures_section(entries: &[PredictionEntry]) -> String {
    let failures: Vec<_> = entries
        .iter()
        .filter_map(|e| e.error.as_ref().map(|err| (e, err)))
        .collect();

    if failures.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Failures\n\n");
    for (entry, error) in failures {
        section.push_str(&format!("- `{}`: {}\n", entry.image, error));
    }
    section.push('\n');

    section
}

/// Collapse an analysis to one table-safe line.
fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ").replace('|', "\\|");
    if flat.chars().count() <= ANALYSIS_EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(ANALYSIS_EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(
        "*Screening aid only. Predictions must be confirmed by a qualified pathologist.*\n",
    );

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Generate one JSON history record per successful prediction.
///
/// Failed entries produce no record.
pub fn generate_history_lines(
    entries: &[PredictionEntry],
    user_reference: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let mut output = String::new();

    for entry in entries {
        if let Some(ref result) = entry.result {
            let record = HistoryRecord::from_result(
                result,
                entry.image.as_str(),
                user_reference.map(str::to_string),
                timestamp,
            );
            output.push_str(&serde_json::to_string(&record)?);
            output.push('\n');
        }
    }

    Ok(output)
}
