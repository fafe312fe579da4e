//! Report generation.
//!
//! Markdown and JSON reports, history lines for the persistence store,
//! and heatmap export.

pub mod generator;
pub mod heatmaps;

pub use generator::{generate_history_lines, generate_json_report, generate_markdown_report};
pub use heatmaps::write_heatmaps;
