use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::debug;

const FILE_ATTRIBUTE_OFFLINE: u32 = 0x0000_1000;
const FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS: u32 = 0x0040_0000;
const FILE_ATTRIBUTE_UNPINNED: u32 = 0x0010_0000;

/// Cloud-sync placeholders report a size but have no local data.
pub fn is_cloud_placeholder(attributes: u32) -> bool {
    attributes
        & (FILE_ATTRIBUTE_OFFLINE | FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS | FILE_ATTRIBUTE_UNPINNED)
        != 0
}

/// Whether `path` is a regular file with data on local storage.
pub async fn is_present_locally(path: &Path) -> bool {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) => {
            debug!("dropping {}: {e}", path.display());
            return false;
        }
    };
    if !meta.is_file() || meta.len() == 0 {
        return false;
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        if is_cloud_placeholder(meta.file_attributes()) {
            debug!("dropping cloud-only {}", path.display());
            return false;
        }
    }
    true
}

/// Drain `candidates` and keep the paths that are really on disk.
///
/// Returns once the producer closes the queue, so the result is the complete
/// survivor list.
pub async fn filter_existing(mut candidates: mpsc::Receiver<PathBuf>) -> Vec<PathBuf> {
    let mut survivors = Vec::new();
    while let Some(path) = candidates.recv().await {
        if is_present_locally(&path).await {
            survivors.push(path);
        }
    }
    survivors
}
