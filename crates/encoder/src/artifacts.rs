use std::path::{Path, PathBuf};
use std::fs;
use serde::{Deserialize, Serialize};
use crate::error::Result;

/// Where every file of one job lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
    stem: String,
}

impl ArtifactLayout {
    pub fn new(output_root: &Path, source: &Path) -> Self {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "title".to_string());
        Self {
            root: output_root.join(&stem),
            stem,
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Per-job directory
    pub fn job_dir(&self) -> &Path {
        &self.root
    }

    /// Subtitles are shared by all resolutions of a title
    pub fn subtitles_dir(&self) -> PathBuf {
        self.root.join("subtitles")
    }

    pub fn subtitle_path(&self, position: usize, language: Option<&str>, ext: &str) -> PathBuf {
        self.subtitles_dir().join(format!(
            "{}.{:02}.{}.{}",
            self.stem,
            position,
            language.unwrap_or("und"),
            ext
        ))
    }

    pub fn resolution_dir(&self, resolution: &str) -> PathBuf {
        self.root.join(resolution)
    }

    /// Encoded video stream without audio or subtitles
    pub fn video_path(&self, resolution: &str) -> PathBuf {
        self.resolution_dir(resolution)
            .join(format!("{}.{}.video.mkv", self.stem, resolution))
    }

    pub fn audio_path(&self, resolution: &str, ext: &str) -> PathBuf {
        self.resolution_dir(resolution)
            .join(format!("{}.{}.audio.{}", self.stem, resolution, ext))
    }

    /// Final multiplexed container
    pub fn muxed_path(&self, resolution: &str) -> PathBuf {
        self.resolution_dir(resolution)
            .join(format!("{}.{}.mkv", self.stem, resolution))
    }

    pub fn screenshots_dir(&self, resolution: &str) -> PathBuf {
        self.resolution_dir(resolution).join("screenshots")
    }

    pub fn document_path(&self, resolution: &str) -> PathBuf {
        self.resolution_dir(resolution)
            .join(format!("{}.{}.txt", self.stem, resolution))
    }

    /// Preview segments, crop frames and audio intermediates
    pub fn scratch_dir(&self, resolution: &str) -> PathBuf {
        self.resolution_dir(resolution).join("tmp")
    }

    pub fn prepare(&self, resolution: &str) -> Result<()> {
        for dir in [self.subtitles_dir(), self.scratch_dir(resolution), self.screenshots_dir(resolution)] {
            fs::create_dir_all(&dir).map_err(|e| {
                std::io::Error::new(e.kind(), format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// An artifact from an earlier run can be reused when it exists and is non-empty
pub fn artifact_ready(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Where a tool writes before the result is committed:
/// `title.720p.video.mkv` -> `title.720p.video.partial.mkv`. The extension
/// stays last so tools can still pick the container from it.
pub fn partial_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    path.with_file_name(name)
}

/// Move a finished partial output into place
pub fn commit_partial(partial: &Path, path: &Path) -> Result<()> {
    fs::rename(partial, path).map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("failed to move {} to {}: {}", partial.display(), path.display(), e),
        )
    })?;
    Ok(())
}

/// Settings a video artifact was encoded with, kept beside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeStamp {
    pub quality: u8,
}

pub fn stamp_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("json")
}

/// Stamp of `artifact`, if one was written and is readable
pub fn read_stamp(artifact: &Path) -> Option<EncodeStamp> {
    let content = fs::read_to_string(stamp_path(artifact)).ok()?;
    serde_json::from_str(&content).ok()
}

pub fn write_stamp(artifact: &Path, stamp: &EncodeStamp) -> Result<()> {
    fs::write(stamp_path(artifact), serde_json::to_vec(stamp)?)?;
    Ok(())
}

pub fn clear_stamp(artifact: &Path) {
    let _ = fs::remove_file(stamp_path(artifact));
}
