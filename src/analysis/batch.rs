//! Batch prediction over many images with bounded concurrency.

use crate::analysis::Aggregator;
use crate::models::{ImagePayload, Mode, PredictionEntry, PrimaryRaw, SecondaryRaw};
use crate::sources::SourceClient;
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use std::path::Path;
use tracing::warn;

/// Predict every image, keeping at most `concurrency` requests in flight.
///
/// `images` are paths relative to `root`. A failing image is recorded in its
/// entry and does not stop the batch. Entries come back in input order.
pub async fn predict_batch<P, S>(
    aggregator: &Aggregator<P, S>,
    root: &Path,
    images: &[String],
    mode: Mode,
    concurrency: usize,
    progress: &ProgressBar,
) -> Vec<PredictionEntry>
where
    P: SourceClient<Raw = PrimaryRaw>,
    S: SourceClient<Raw = SecondaryRaw>,
{
    let mut entries: Vec<(usize, PredictionEntry)> = stream::iter(images.iter().enumerate())
        .map(|(index, relative)| async move {
            let entry = predict_one(aggregator, &root.join(relative), relative, mode).await;
            progress.inc(1);
            (index, entry)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    entries.sort_by_key(|(index, _)| *index);
    entries.into_iter().map(|(_, entry)| entry).collect()
}

async fn predict_one<P, S>(
    aggregator: &Aggregator<P, S>,
    path: &Path,
    reference: &str,
    mode: Mode,
) -> PredictionEntry
where
    P: SourceClient<Raw = PrimaryRaw>,
    S: SourceClient<Raw = SecondaryRaw>,
{
    let image = match ImagePayload::from_path(path) {
        Ok(image) => image,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            return PredictionEntry::failed(reference, format!("Failed to read image: {}", e));
        }
    };

    match aggregator.predict(&image, mode).await {
        Ok(result) => PredictionEntry::succeeded(reference, result),
        Err(e) => {
            match e.origin() {
                Some(origin) => warn!("Prediction failed for {} ({}): {}", reference, origin, e),
                None => warn!("Prediction failed for {}: {}", reference, e),
            }
            PredictionEntry::failed(reference, e.to_string())
        }
    }
}
