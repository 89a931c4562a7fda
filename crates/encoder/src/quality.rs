use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use crate::config::{BitrateBand, QualitySearchConfig};
use crate::crop::CropGeometry;
use crate::error::{EncodeError, Result};
use crate::tools::{EncodeRequest, MediaInspector, Transcoder, TrimRange};

/// Where one iteration of the search stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualitySearchState {
    pub quality: u8,
    pub measured_kbps: Option<u64>,
    pub min_quality: u8,
    pub max_quality: u8,
    pub band: BitrateBand,
}

/// Next move of the linear search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStep {
    /// Measured bitrate is inside the band
    Done,
    /// Try this quality next
    Adjust(u8),
    /// The next quality would leave the configured bounds
    OutOfBounds,
}

impl QualitySearchState {
    /// Lower quality values mean more bits: under the band moves `q` down,
    /// over the band moves it up.
    pub fn next_step(&self, measured_kbps: u64, step: u8) -> SearchStep {
        let step = step.max(1);
        let next = if measured_kbps < self.band.min_kbps {
            self.quality.checked_sub(step)
        } else if measured_kbps > self.band.max_kbps {
            self.quality.checked_add(step)
        } else {
            return SearchStep::Done;
        };
        match next {
            Some(q) if q >= self.min_quality && q <= self.max_quality => SearchStep::Adjust(q),
            _ => SearchStep::OutOfBounds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Converged {
        quality: u8,
        bitrate_kbps: u64,
        iterations: u32,
    },
    /// Search gave up; `quality` is the configured fallback. Happens when the
    /// next step would leave `[min, max]`, or would revisit a quality already
    /// tried because the band sits between two adjacent steps.
    Fallback {
        quality: u8,
        last_quality: u8,
        last_bitrate_kbps: u64,
        iterations: u32,
    },
}

impl SearchOutcome {
    pub fn quality(&self) -> u8 {
        match self {
            SearchOutcome::Converged { quality, .. } | SearchOutcome::Fallback { quality, .. } => *quality,
        }
    }

    /// Last preview bitrate measured
    pub fn bitrate_kbps(&self) -> u64 {
        match self {
            SearchOutcome::Converged { bitrate_kbps, .. } => *bitrate_kbps,
            SearchOutcome::Fallback { last_bitrate_kbps, .. } => *last_bitrate_kbps,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, SearchOutcome::Fallback { .. })
    }
}

/// Inputs for one resolution's search
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub source: &'a Path,
    pub scratch_dir: &'a Path,
    pub width: u32,
    pub height: u32,
    pub crop: CropGeometry,
    pub initial_quality: u8,
    pub band: BitrateBand,
    pub duration_secs: f64,
}

/// Preview segments spread evenly over the title (early, middle, late for
/// the default of three). Short titles get a single segment from the start.
pub fn segment_ranges(duration_secs: f64, segments: u32, segment_secs: f64) -> Vec<TrimRange> {
    if duration_secs.is_nan() || duration_secs <= 0.0 || segments == 0 {
        return Vec::new();
    }
    if duration_secs <= segment_secs * segments as f64 {
        return vec![TrimRange {
            start_secs: 0.0,
            duration_secs: duration_secs.min(segment_secs),
        }];
    }

    (0..segments)
        .map(|i| {
            let centre = duration_secs * (i + 1) as f64 / (segments + 1) as f64;
            let start = (centre - segment_secs / 2.0).clamp(0.0, duration_secs - segment_secs);
            TrimRange {
                start_secs: start,
                duration_secs: segment_secs,
            }
        })
        .collect()
}

/// Bitrate-targeted, fixed-step linear quality search over preview segments
pub struct QualitySearch<'a> {
    transcoder: &'a dyn Transcoder,
    inspector: &'a dyn MediaInspector,
    settings: &'a QualitySearchConfig,
}

impl<'a> QualitySearch<'a> {
    pub fn new(
        transcoder: &'a dyn Transcoder,
        inspector: &'a dyn MediaInspector,
        settings: &'a QualitySearchConfig,
    ) -> Self {
        Self {
            transcoder,
            inspector,
            settings,
        }
    }

    fn segment_failure(e: EncodeError) -> EncodeError {
        match e {
            EncodeError::Stopped => EncodeError::Stopped,
            other => EncodeError::QualitySearchFailed(other.to_string()),
        }
    }

    /// Encode every preview segment at `quality` and average their bitrates.
    /// Preview files are deleted once measured.
    async fn measure(&self, request: &SearchRequest<'_>, quality: u8, ranges: &[TrimRange]) -> Result<u64> {
        let mut total = 0u64;
        for (i, range) in ranges.iter().enumerate() {
            let output: PathBuf = request.scratch_dir.join(format!("preview_q{}_{}.mkv", quality, i));
            let encode = EncodeRequest {
                input: request.source.to_path_buf(),
                output: output.clone(),
                crop: request.crop,
                quality,
                width: request.width,
                height: request.height,
                trim: Some(*range),
            };

            let measured = async {
                let encoded = self.transcoder.encode(&encode).await?;
                let info = self.inspector.probe(&encoded).await?;
                info.bit_rate_kbps.ok_or_else(|| {
                    EncodeError::QualitySearchFailed(format!("no bitrate reported for {}", encoded.display()))
                })
            }
            .await;
            if output.exists() {
                let _ = std::fs::remove_file(&output);
            }

            let kbps = measured.map_err(Self::segment_failure)?;
            debug!(
                "Preview segment {} at {:.0}s, q={}: {} kbps",
                i, range.start_secs, quality, kbps
            );
            total += kbps;
        }
        Ok(total / ranges.len() as u64)
    }

    pub async fn run(&self, request: &SearchRequest<'_>) -> Result<SearchOutcome> {
        std::fs::create_dir_all(request.scratch_dir)?;
        let ranges = segment_ranges(request.duration_secs, self.settings.segments, self.settings.segment_secs);
        if ranges.is_empty() {
            return Err(EncodeError::QualitySearchFailed(format!(
                "cannot place preview segments in a title of {:.1}s",
                request.duration_secs
            )));
        }

        let mut state = QualitySearchState {
            quality: request
                .initial_quality
                .clamp(self.settings.min_quality, self.settings.max_quality),
            measured_kbps: None,
            min_quality: self.settings.min_quality,
            max_quality: self.settings.max_quality,
            band: request.band,
        };
        let mut tried = BTreeSet::new();
        let mut iterations = 0u32;

        loop {
            tried.insert(state.quality);
            let kbps = self.measure(request, state.quality, &ranges).await?;
            state.measured_kbps = Some(kbps);
            info!(
                "Quality search: q={} averaged {} kbps (band {}-{})",
                state.quality, kbps, state.band.min_kbps, state.band.max_kbps
            );

            let next = match state.next_step(kbps, self.settings.step) {
                SearchStep::Done => {
                    return Ok(SearchOutcome::Converged {
                        quality: state.quality,
                        bitrate_kbps: kbps,
                        iterations,
                    });
                }
                SearchStep::Adjust(q) if !tried.contains(&q) => Some(q),
                // revisiting a value means the band sits between two steps
                SearchStep::Adjust(_) | SearchStep::OutOfBounds => None,
            };

            match next {
                Some(q) => {
                    state.quality = q;
                    iterations += 1;
                }
                None => {
                    let exhausted = EncodeError::QualitySearchExhausted {
                        last_quality: state.quality,
                        last_bitrate_kbps: kbps,
                        fallback: self.settings.fallback_quality,
                    };
                    warn!("{}", exhausted);
                    return Ok(SearchOutcome::Fallback {
                        quality: self.settings.fallback_quality,
                        last_quality: state.quality,
                        last_bitrate_kbps: kbps,
                        iterations,
                    });
                }
            }
        }
    }
}
