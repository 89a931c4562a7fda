use std::path::{Path, PathBuf};
use image::GrayImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::config::ScreenshotConfig;
use crate::error::{EncodeError, Result};
use crate::tools::FrameGrabber;

/// Selected frame and how it scored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub timestamp_secs: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub path: PathBuf,
}

impl Screenshot {
    pub fn score(&self) -> f64 {
        self.brightness + self.contrast
    }
}

/// Brightness (mean intensity) and contrast (intensity standard deviation)
pub fn exposure(frame: &GrayImage) -> (f64, f64) {
    let n = (frame.width() as u64 * frame.height() as u64) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let (sum, sum_sq) = frame.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Candidate timestamps grouped per section.
///
/// The usable window drops `start_offset_secs` (shifted by the resolution
/// index so sibling resolutions land on different frames) and the last
/// `end_offset_secs`. Titles too short for the offsets use their full length.
pub fn section_candidates(duration_secs: f64, resolution_index: usize, settings: &ScreenshotConfig) -> Vec<Vec<f64>> {
    if duration_secs.is_nan() || duration_secs <= 0.0 || settings.count == 0 {
        return Vec::new();
    }
    let shift = settings.resolution_offset_secs * resolution_index as f64;
    let mut start = settings.start_offset_secs + shift;
    let mut end = duration_secs - settings.end_offset_secs;
    if end <= start {
        start = shift.min(duration_secs / 2.0);
        end = duration_secs;
    }

    let sections = settings.count as usize;
    let per_section = settings.candidates_per_section.max(1) as usize;
    let section_len = (end - start) / sections as f64;

    (0..sections)
        .map(|s| {
            let section_start = start + section_len * s as f64;
            (0..per_section)
                .map(|c| section_start + section_len * (c + 1) as f64 / (per_section + 1) as f64)
                .collect()
        })
        .collect()
}

/// Picks the best-exposed frame of each section
pub struct ScreenshotSelector<'a> {
    frames: &'a dyn FrameGrabber,
    settings: &'a ScreenshotConfig,
}

impl<'a> ScreenshotSelector<'a> {
    pub fn new(frames: &'a dyn FrameGrabber, settings: &'a ScreenshotConfig) -> Self {
        Self { frames, settings }
    }

    async fn grab_and_score(&self, video: &Path, ts: f64, path: &Path) -> Result<Screenshot> {
        let grabbed = self.frames.frame_at(video, ts, path).await?;
        let frame = image::open(&grabbed)?.to_luma8();
        let (brightness, contrast) = exposure(&frame);
        Ok(Screenshot {
            timestamp_secs: ts,
            brightness,
            contrast,
            path: grabbed,
        })
    }

    /// Write `shot_N.png` (N from 1) into `out_dir`, one per section.
    /// A section whose candidates all fail is skipped; an empty result is an error.
    pub async fn select(
        &self,
        video: &Path,
        duration_secs: f64,
        resolution_index: usize,
        out_dir: &Path,
    ) -> Result<Vec<Screenshot>> {
        std::fs::create_dir_all(out_dir)?;
        let mut shots = Vec::new();
        let mut last_error = None;

        for (s, candidates) in section_candidates(duration_secs, resolution_index, self.settings)
            .iter()
            .enumerate()
        {
            let mut best: Option<Screenshot> = None;
            for (c, ts) in candidates.iter().enumerate() {
                let path = out_dir.join(format!("candidate_{}_{}.png", s, c));
                match self.grab_and_score(video, *ts, &path).await {
                    Ok(shot) => {
                        debug!(
                            "Screenshot candidate {:.1}s: brightness {:.1}, contrast {:.1}",
                            ts, shot.brightness, shot.contrast
                        );
                        let better = best.as_ref().map_or(true, |current| shot.score() > current.score());
                        if better {
                            if let Some(previous) = best.replace(shot) {
                                let _ = std::fs::remove_file(&previous.path);
                            }
                        } else {
                            let _ = std::fs::remove_file(&shot.path);
                        }
                    }
                    Err(EncodeError::Stopped) => return Err(EncodeError::Stopped),
                    Err(e) => {
                        warn!("Screenshot candidate at {:.1}s failed: {}", ts, e);
                        let _ = std::fs::remove_file(&path);
                        last_error = Some(e);
                    }
                }
            }

            if let Some(mut shot) = best {
                let final_path = out_dir.join(format!("shot_{}.png", s + 1));
                std::fs::rename(&shot.path, &final_path)?;
                shot.path = final_path;
                shots.push(shot);
            }
        }

        if shots.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| EncodeError::tool("screenshots", "no usable frames in title")));
        }
        info!("Selected {} screenshots into {}", shots.len(), out_dir.display());
        Ok(shots)
    }
}
