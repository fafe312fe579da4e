//! Heatmap export.

use crate::models::{extension_for_media_type, PredictionEntry};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Decode every heatmap in `entries` and write it under `dir`.
///
/// Files are named after the image with a `_heatmap` suffix. When two images
/// flatten to the same name, later ones get a numeric suffix. Undecodable
/// heatmaps are logged and skipped. Returns the written paths.
pub fn write_heatmaps(entries: &[PredictionEntry], dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create heatmap directory {}", dir.display()))?;

    let mut written = Vec::new();
    let mut taken = HashSet::new();

    for entry in entries {
        let Some(heatmap) = entry.result.as_ref().and_then(|r| r.heatmap.as_ref()) else {
            continue;
        };

        let image = match heatmap.decode() {
            Ok(image) => image,
            Err(e) => {
                warn!("Skipping heatmap for {}: {}", entry.image, e);
                continue;
            }
        };

        let name = heatmap_file_name(&entry.image, extension_for_media_type(&image.media_type));
        let path = dir.join(unique_name(&name, &mut taken));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("Failed to write heatmap {}", path.display()))?;
        written.push(path);
    }

    Ok(written)
}

/// `nested/slide.png` becomes `nested_slide_heatmap.png`.
fn heatmap_file_name(image: &str, extension: &str) -> String {
    let stem = Path::new(image)
        .with_extension("")
        .to_string_lossy()
        .replace(['/', '\\'], "_");
    format!("{}_heatmap.{}", stem, extension)
}

/// Claim `name`, or the first free `<stem>_<n>.<ext>` variant of it.
fn unique_name(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }

    let (stem, extension) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 2;
    loop {
        let candidate = if extension.is_empty() {
            format!("{}_{}", stem, n)
        } else {
            format!("{}_{}.{}", stem, n, extension)
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
