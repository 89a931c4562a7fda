use std::path::{Path, PathBuf};
use anyhow::{bail, Result};
use walkdir::WalkDir;
use log::{debug, info, warn};

/// Media file extensions accepted as sources
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov"];

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| MEDIA_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Find source titles under `root`, sorted by path
pub fn discover_sources(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Source directory does not exist: {}", root.display());
    }

    info!("Scanning directory: {}", root.display());
    let mut sources = Vec::new();
    let mut files_checked = 0;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        files_checked += 1;

        if is_media_file(path) {
            debug!("Found media file: {}", path.display());
            sources.push(path.to_path_buf());
        }
    }

    sources.sort();
    info!(
        "Scan complete: checked {} files, found {} sources",
        files_checked,
        sources.len()
    );
    Ok(sources)
}
