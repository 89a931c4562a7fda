use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Acceptable output bitrate range in kbps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateBand {
    pub min_kbps: u64,
    pub max_kbps: u64,
}

impl BitrateBand {
    pub fn new(min_kbps: u64, max_kbps: u64) -> Self {
        Self { min_kbps, max_kbps }
    }

    pub fn contains(&self, kbps: u64) -> bool {
        kbps >= self.min_kbps && kbps <= self.max_kbps
    }
}

/// Target settings for one output resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPreset {
    pub width: u32,
    pub height: u32,
    /// Starting quality value for the preview search
    pub initial_quality: u8,
    /// Without a band the search and the full-file check are skipped
    #[serde(default)]
    pub bitrate_band: Option<BitrateBand>,
    /// Bitrate for lossless multichannel sources transcoded to surround
    pub surround_kbps: u32,
    /// Bitrate for lossless stereo/mono sources compressed to stereo
    pub stereo_kbps: u32,
}

/// Preview-segment quality search tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySearchConfig {
    pub min_quality: u8,
    pub max_quality: u8,
    pub step: u8,
    pub fallback_quality: u8,
    /// Number of preview segments averaged per iteration
    pub segments: u32,
    pub segment_secs: f64,
}

impl Default for QualitySearchConfig {
    fn default() -> Self {
        Self {
            min_quality: 10,
            max_quality: 25,
            step: 2,
            fallback_quality: 17,
            segments: 3,
            segment_secs: 30.0,
        }
    }
}

/// Full-file bitrate correction loop tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalEncodeConfig {
    /// Re-encodes allowed after the first full encode
    pub max_retries: u32,
    pub step: u8,
}

impl Default for FinalEncodeConfig {
    fn default() -> Self {
        Self { max_retries: 5, step: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Sample points as fractions of the title duration
    pub sample_fractions: Vec<f64>,
    /// Samples never land before this offset (logos, fades from black)
    pub skip_secs: f64,
    /// Luma at or below this value counts as letterbox
    pub black_threshold: u8,
    /// Share of a row/column that must be bright for it to count as picture
    pub min_content_fraction: f64,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            sample_fractions: vec![0.10, 0.15, 0.20, 0.30, 0.40, 0.50],
            skip_secs: 180.0,
            black_threshold: 24,
            min_content_fraction: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    pub count: u32,
    pub candidates_per_section: u32,
    pub start_offset_secs: f64,
    pub end_offset_secs: f64,
    /// Shift applied per resolution index so titles don't repeat frames
    pub resolution_offset_secs: f64,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            count: 3,
            candidates_per_section: 5,
            start_offset_secs: 120.0,
            end_offset_secs: 300.0,
            resolution_offset_secs: 7.0,
        }
    }
}

/// Source tier to target resolution labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierMap {
    pub optical: Vec<String>,
    pub web: Vec<String>,
}

impl Default for TierMap {
    fn default() -> Self {
        Self {
            optical: vec!["720p".to_string(), "576p".to_string(), "480p".to_string()],
            web: vec!["720p".to_string()],
        }
    }
}

/// Configuration for the encoding pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub mkvextract_bin: PathBuf,
    pub mkvmerge_bin: PathBuf,
    /// Root directory for all produced artifacts
    pub output_root: PathBuf,
    /// Directory where job status JSON files are stored
    pub job_state_dir: PathBuf,
    pub video_encoder: String,
    pub encoder_preset: String,
    /// Extra encoder options passed through verbatim (x264 opts)
    pub encoder_params: Option<String>,
    pub resolutions: BTreeMap<String, ResolutionPreset>,
    pub tiers: TierMap,
    pub quality_search: QualitySearchConfig,
    pub final_encode: FinalEncodeConfig,
    pub crop: CropConfig,
    pub screenshots: ScreenshotConfig,
    /// ISO 639-2 language treated as "English" for track ordering and defaults
    pub preferred_language: String,
    /// Program run on job completion
    pub notify_command: Option<PathBuf>,
    pub stop_poll_secs: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

fn preset(width: u32, height: u32, band: Option<(u64, u64)>, surround_kbps: u32, stereo_kbps: u32) -> ResolutionPreset {
    ResolutionPreset {
        width,
        height,
        initial_quality: 17,
        bitrate_band: band.map(|(min, max)| BitrateBand::new(min, max)),
        surround_kbps,
        stereo_kbps,
    }
}

impl EncoderConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        let mut resolutions = BTreeMap::new();
        resolutions.insert("480p".to_string(), preset(854, 480, Some((1500, 2500)), 448, 192));
        resolutions.insert("576p".to_string(), preset(1024, 576, Some((2500, 3500)), 448, 192));
        resolutions.insert("720p".to_string(), preset(1280, 720, Some((5000, 7000)), 640, 256));
        resolutions.insert("1080p".to_string(), preset(1920, 1080, None, 640, 256));

        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            mkvextract_bin: PathBuf::from("mkvextract"),
            mkvmerge_bin: PathBuf::from("mkvmerge"),
            output_root: PathBuf::from("encodes"),
            job_state_dir: PathBuf::from("/tmp/autoenc-jobs"),
            video_encoder: "libx264".to_string(),
            encoder_preset: "slow".to_string(),
            encoder_params: Some(
                "subme=10:deblock=-3,-3:me=umh:merange=32:mbtree=0:dct-decimate=0:\
                 fast-pskip=0:aq-mode=2:aq-strength=1.0:qcomp=0.60:psy-rd=1.1,0.00"
                    .to_string(),
            ),
            resolutions,
            tiers: TierMap::default(),
            quality_search: QualitySearchConfig::default(),
            final_encode: FinalEncodeConfig::default(),
            crop: CropConfig::default(),
            screenshots: ScreenshotConfig::default(),
            preferred_language: "eng".to_string(),
            notify_command: None,
            stop_poll_secs: 2,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Directory polled for stop requests from other processes
    pub fn command_dir(&self) -> PathBuf {
        self.job_state_dir.join("commands")
    }

    pub fn preset(&self, label: &str) -> Option<&ResolutionPreset> {
        self.resolutions.get(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_bands() {
        let cfg = EncoderConfig::default_config();
        assert_eq!(cfg.preset("720p").unwrap().bitrate_band, Some(BitrateBand::new(5000, 7000)));
        assert_eq!(cfg.preset("576p").unwrap().bitrate_band, Some(BitrateBand::new(2500, 3500)));
        assert_eq!(cfg.preset("480p").unwrap().bitrate_band, Some(BitrateBand::new(1500, 2500)));
        assert!(cfg.preset("1080p").unwrap().bitrate_band.is_none());
        assert_eq!(cfg.quality_search.step, 2);
        assert_eq!(cfg.final_encode.max_retries, 5);
    }

    #[test]
    fn test_band_is_inclusive() {
        let band = BitrateBand::new(5000, 7000);
        assert!(band.contains(5000));
        assert!(band.contains(7000));
        assert!(!band.contains(4999));
        assert!(!band.contains(7001));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoenc.toml");
        std::fs::write(
            &path,
            "output_root = \"/srv/encodes\"\n[quality_search]\nstep = 3\n",
        )
        .unwrap();

        let cfg = EncoderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.output_root, PathBuf::from("/srv/encodes"));
        assert_eq!(cfg.quality_search.step, 3);
        assert_eq!(cfg.quality_search.min_quality, 10);
        assert_eq!(cfg.tiers.optical.len(), 3);
    }

    #[test]
    fn test_fractional_segment_length_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoenc.json");
        std::fs::write(&path, r#"{"quality_search": {"segment_secs": 12.5, "segments": 4}}"#).unwrap();

        let cfg = EncoderConfig::load_config(Some(&path)).unwrap();
        let expected = QualitySearchConfig {
            segments: 4,
            segment_secs: 12.5,
            ..QualitySearchConfig::default()
        };
        assert_eq!(cfg.quality_search, expected);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = EncoderConfig::load_config(Some(Path::new("/nonexistent/autoenc.json"))).unwrap();
        assert_eq!(cfg.video_encoder, "libx264");
        assert_eq!(cfg.command_dir(), PathBuf::from("/tmp/autoenc-jobs/commands"));
    }
}
