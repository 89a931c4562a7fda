use std::fmt;
use std::path::Path;
use image::GrayImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::config::CropConfig;
use crate::error::{EncodeError, Result};
use crate::tools::FrameGrabber;

/// Pixels trimmed from each edge of the source frame.
///
/// Every value is even and no larger than the matching half-dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropGeometry {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

fn round_up_even(v: u32) -> u32 {
    v.saturating_add(v & 1)
}

fn even_half(dim: u32) -> u32 {
    (dim / 2) & !1
}

impl CropGeometry {
    /// Build from raw edge distances, rounding up to even and clamping to
    /// the frame's half-dimensions.
    pub fn aligned(top: u32, bottom: u32, left: u32, right: u32, width: u32, height: u32) -> Self {
        let max_v = even_half(height);
        let max_h = even_half(width);
        Self {
            top: round_up_even(top).min(max_v),
            bottom: round_up_even(bottom).min(max_v),
            left: round_up_even(left).min(max_h),
            right: round_up_even(right).min(max_h),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == CropGeometry::default()
    }

    /// Picture dimensions left after cropping a `width`x`height` frame
    pub fn cropped_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (
            width.saturating_sub(self.left + self.right),
            height.saturating_sub(self.top + self.bottom),
        )
    }

    /// Output size once the cropped picture is scaled down to fit inside
    /// `box_w`x`box_h`, aspect kept and both sides even
    pub fn fitted_dims(&self, width: u32, height: u32, box_w: u32, box_h: u32) -> (u32, u32) {
        let (w, h) = self.cropped_dims(width, height);
        if w == 0 || h == 0 {
            return (box_w & !1, box_h & !1);
        }
        let scale = (box_w as f64 / w as f64).min(box_h as f64 / h as f64).min(1.0);
        let even = |v: f64| ((v / 2.0).round() as u32 * 2).max(2);
        (even(w as f64 * scale), even(h as f64 * scale))
    }
}

impl fmt::Display for CropGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.top, self.bottom, self.left, self.right)
    }
}

/// Timestamps to sample, in seconds, ascending and deduplicated.
///
/// Points before `skip_secs` are pushed to `skip_secs` unless the title is
/// shorter than that, in which case the raw fractions are used.
pub fn sample_timestamps(duration_secs: f64, settings: &CropConfig) -> Vec<f64> {
    if duration_secs.is_nan() || duration_secs <= 0.0 {
        return Vec::new();
    }
    let skip = if duration_secs > settings.skip_secs * 2.0 {
        settings.skip_secs
    } else {
        0.0
    };

    let mut points: Vec<f64> = settings
        .sample_fractions
        .iter()
        .filter(|f| f.is_finite() && **f >= 0.0 && **f < 1.0)
        .map(|f| (f * duration_secs).max(skip))
        .filter(|t| *t < duration_secs)
        .collect();
    points.sort_by(|a, b| a.total_cmp(b));
    points.dedup_by(|a, b| (*a - *b).abs() < 0.5);
    points
}

/// Crop implied by one intensity frame, or `None` when the frame has no
/// picture content (all black).
pub fn analyze_frame(frame: &GrayImage, black_threshold: u8, min_content_fraction: f64) -> Option<CropGeometry> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let row_min = ((width as f64 * min_content_fraction).ceil() as u32).max(1);
    let col_min = ((height as f64 * min_content_fraction).ceil() as u32).max(1);

    let mut row_counts = vec![0u32; height as usize];
    let mut col_counts = vec![0u32; width as usize];
    for (x, y, pixel) in frame.enumerate_pixels() {
        if pixel.0[0] > black_threshold {
            row_counts[y as usize] += 1;
            col_counts[x as usize] += 1;
        }
    }

    let first_row = row_counts.iter().position(|c| *c >= row_min)?;
    let last_row = row_counts.iter().rposition(|c| *c >= row_min)?;
    let first_col = col_counts.iter().position(|c| *c >= col_min)?;
    let last_col = col_counts.iter().rposition(|c| *c >= col_min)?;

    Some(CropGeometry::aligned(
        first_row as u32,
        height - 1 - last_row as u32,
        first_col as u32,
        width - 1 - last_col as u32,
        width,
        height,
    ))
}

/// Element-wise median of the per-sample crops.
///
/// With an even number of samples the lower middle value is taken so the
/// result stays even and never crops more than half the samples asked for.
pub fn median_crop(samples: &[CropGeometry]) -> Option<CropGeometry> {
    if samples.is_empty() {
        return None;
    }
    let median = |pick: fn(&CropGeometry) -> u32| {
        let mut values: Vec<u32> = samples.iter().map(pick).collect();
        values.sort_unstable();
        values[(values.len() - 1) / 2]
    };
    Some(CropGeometry {
        top: median(|c| c.top),
        bottom: median(|c| c.bottom),
        left: median(|c| c.left),
        right: median(|c| c.right),
    })
}

/// Derives one crop rectangle from frames sampled across the title
pub struct CropDetector<'a> {
    frames: &'a dyn FrameGrabber,
    settings: &'a CropConfig,
}

impl<'a> CropDetector<'a> {
    pub fn new(frames: &'a dyn FrameGrabber, settings: &'a CropConfig) -> Self {
        Self { frames, settings }
    }

    fn analyze_file(&self, path: &Path) -> Result<Option<CropGeometry>> {
        let frame = image::open(path)?.to_luma8();
        Ok(analyze_frame(
            &frame,
            self.settings.black_threshold,
            self.settings.min_content_fraction,
        ))
    }

    /// Sample, analyze and combine. Frame files are removed as soon as
    /// they have been read.
    pub async fn detect(&self, source: &Path, duration_secs: f64, scratch_dir: &Path) -> Result<CropGeometry> {
        std::fs::create_dir_all(scratch_dir)?;
        let timestamps = sample_timestamps(duration_secs, self.settings);

        let mut valid = Vec::new();
        let mut degenerate = 0usize;
        let mut last_tool_error = None;

        for (i, ts) in timestamps.iter().enumerate() {
            let frame_path = scratch_dir.join(format!("crop_{:02}.png", i));
            let grabbed = self.frames.frame_at(source, *ts, &frame_path).await;
            let analysis = match grabbed {
                Ok(path) => {
                    let result = self.analyze_file(&path);
                    let _ = std::fs::remove_file(&path);
                    result
                }
                Err(EncodeError::Stopped) => return Err(EncodeError::Stopped),
                Err(e) => Err(e),
            };
            if frame_path.exists() {
                let _ = std::fs::remove_file(&frame_path);
            }

            match analysis {
                Ok(Some(crop)) => {
                    debug!("Crop sample at {:.1}s: {}", ts, crop);
                    valid.push(crop);
                }
                Ok(None) => {
                    debug!("Crop sample at {:.1}s is degenerate (no picture content)", ts);
                    degenerate += 1;
                }
                Err(e) => {
                    warn!("Crop sample at {:.1}s unusable: {}", ts, e);
                    last_tool_error = Some(e);
                }
            }
        }

        match median_crop(&valid) {
            Some(crop) => {
                info!(
                    "Crop detected: {} (top:bottom:left:right) from {} of {} samples",
                    crop,
                    valid.len(),
                    timestamps.len()
                );
                Ok(crop)
            }
            None => match last_tool_error {
                // nothing was even analyzed: surface the tool problem
                Some(e) if degenerate == 0 => Err(e),
                _ => Err(EncodeError::CropDetectionFailed {
                    samples: timestamps.len(),
                }),
            },
        }
    }
}
