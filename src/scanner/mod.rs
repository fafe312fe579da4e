//! Image scanner for discovering histopathology images.
//!
//! Walks a directory (or accepts a single file) and keeps images whose
//! extension, name and size pass the configured filters.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Configuration for image scanning.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Image extensions to include, compared case-insensitively
    pub extensions: Vec<String>,
    /// Directory or file names to skip
    pub excludes: Vec<String>,
    /// Maximum image size in bytes
    pub max_file_size: usize,
    /// Maximum number of images to return
    pub max_files: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from(&crate::config::ScannerConfig::default())
    }
}

impl From<&crate::config::ScannerConfig> for ScanConfig {
    fn from(config: &crate::config::ScannerConfig) -> Self {
        Self {
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            excludes: config.excludes.clone(),
            max_file_size: config.max_file_size,
            max_files: Some(config.max_files),
        }
    }
}

/// Scanned image information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedImage {
    /// Path relative to the scan root
    pub path: String,
    /// File size in bytes
    pub size: u64,
}

/// Result of a scan: the directory images are relative to, plus the images.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub root: PathBuf,
    pub images: Vec<ScannedImage>,
    /// Images skipped for exceeding the size limit.
    pub oversized: usize,
}

impl ScanOutcome {
    pub fn relative_paths(&self) -> Vec<String> {
        self.images.iter().map(|i| i.path.clone()).collect()
    }
}

/// Image scanner.
pub struct ImageScanner {
    config: ScanConfig,
}

impl ImageScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Scan `target`, which may be a single image or a directory.
    ///
    /// A single file is returned as-is (relative to its parent) if it has
    /// an image extension, even when its name would be excluded.
    pub fn scan(&self, target: &Path) -> Result<ScanOutcome> {
        if target.is_file() {
            return self.scan_file(target);
        }

        let mut images = Vec::new();
        let mut oversized = 0;

        let walker = WalkDir::new(target)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_excluded(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.has_image_extension(entry.path()) {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > self.config.max_file_size as u64 {
                debug!("Skipping oversized image {} ({} bytes)", entry.path().display(), size);
                oversized += 1;
                continue;
            }

            let relative = entry.path().strip_prefix(target).unwrap_or(entry.path());
            images.push(ScannedImage {
                path: relative.to_string_lossy().to_string(),
                size,
            });

            if let Some(max) = self.config.max_files {
                if images.len() >= max {
                    debug!("Reached image limit of {}", max);
                    break;
                }
            }
        }

        Ok(ScanOutcome {
            root: target.to_path_buf(),
            images,
            oversized,
        })
    }

    fn scan_file(&self, file: &Path) -> Result<ScanOutcome> {
        let root = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = file
            .file_name()
            .context("Image path has no file name")?
            .to_string_lossy()
            .to_string();

        if !self.has_image_extension(file) {
            anyhow::bail!("Not a supported image type: {}", file.display());
        }

        let size = fs::metadata(file)
            .with_context(|| format!("Failed to read metadata for {}", file.display()))?
            .len();
        if size > self.config.max_file_size as u64 {
            return Ok(ScanOutcome {
                root,
                images: Vec::new(),
                oversized: 1,
            });
        }

        Ok(ScanOutcome {
            root,
            images: vec![ScannedImage { path: name, size }],
            oversized: 0,
        })
    }

    fn has_image_extension(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        self.config.extensions.contains(&ext)
    }

    /// Check if an entry matches exclusion patterns.
    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();

        // Hidden files
        if name.starts_with('.') {
            return true;
        }

        self.config.excludes.iter().any(|pattern| name == pattern.as_str())
    }
}
