use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::audio::LosslessFamily;
use crate::config::EncoderConfig;
use crate::tools::{MediaInfo, StreamKind};

/// Where the source came from, which decides the output resolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    /// Disc-derived, high bitrate (BluRay, remux)
    Optical,
    /// Streaming download, already compressed
    Web,
    Unknown,
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceTier::Optical => "optical",
            SourceTier::Web => "web",
            SourceTier::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

const OPTICAL_TOKENS: &[&str] = &["bluray", "remux", "bdrip", "bdremux"];
const WEB_TOKENS: &[&str] = &["webdl", "webrip"];

fn normalized_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(|c| !matches!(c, '.' | '-' | '_' | ' '))
        .collect()
}

/// Tier from release tokens in the filename, if any
pub fn tier_from_filename(path: &Path) -> Option<(SourceTier, String)> {
    let name = normalized_name(path);
    if let Some(token) = OPTICAL_TOKENS.iter().find(|t| name.contains(*t)) {
        return Some((SourceTier::Optical, format!("filename token '{}'", token)));
    }
    if let Some(token) = WEB_TOKENS.iter().find(|t| name.contains(*t)) {
        return Some((SourceTier::Web, format!("filename token '{}'", token)));
    }
    None
}

/// Score the probed streams when the filename says nothing
pub fn tier_from_probe(media: &MediaInfo) -> (SourceTier, Vec<String>) {
    let mut reasons = Vec::new();
    let mut optical_score: f64 = 0.0;
    let mut web_score: f64 = 0.0;

    let video = media.video();

    if let (Some(kbps), Some(v)) = (media.bit_rate_kbps, video) {
        if let (Some(w), Some(h)) = (v.width, v.height) {
            let megapixels = (w as f64 * h as f64) / 1_000_000.0;
            if megapixels > 0.0 {
                let mbps_per_mp = (kbps as f64 / 1000.0) / megapixels;
                if mbps_per_mp > 7.0 {
                    optical_score += 0.5;
                    reasons.push(format!("high bitrate: {:.1} Mbps/MP for {}x{}", mbps_per_mp, w, h));
                } else {
                    web_score += 0.2;
                    reasons.push(format!("moderate bitrate: {:.1} Mbps/MP for {}x{}", mbps_per_mp, w, h));
                }
            }
        }
    }

    if let Some(v) = video {
        if matches!(v.codec.as_str(), "hevc" | "av1" | "vp9") {
            web_score += 0.3;
            reasons.push(format!("modern video codec: {}", v.codec));
        }
    }

    for audio in media.streams_of(StreamKind::Audio) {
        if LosslessFamily::of(&audio.codec, audio.profile.as_deref()).is_some() {
            optical_score += 0.4;
            reasons.push(format!("lossless audio codec: {}", audio.codec));
            break;
        }
        if matches!(audio.codec.as_str(), "eac3" | "aac" | "opus") {
            web_score += 0.2;
            reasons.push(format!("streaming audio codec: {}", audio.codec));
            break;
        }
    }

    let tier = if optical_score >= 0.4 && optical_score > web_score {
        SourceTier::Optical
    } else if web_score >= 0.3 && web_score > optical_score {
        SourceTier::Web
    } else {
        SourceTier::Unknown
    };
    debug!("Probe scores: optical {:.2}, web {:.2}", optical_score, web_score);
    (tier, reasons)
}

/// Source title with its tier and the resolutions it will be encoded to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub tier: SourceTier,
    pub resolutions: Vec<String>,
}

/// Everything learned about the source before encoding starts, passed
/// explicitly to every stage that needs it
#[derive(Debug, Clone)]
pub struct SourceAnalysis {
    pub source: SourceFile,
    pub duration_secs: f64,
    pub media: MediaInfo,
    pub reasons: Vec<String>,
}

impl SourceAnalysis {
    pub fn source_width(&self) -> Option<u32> {
        self.media.video().and_then(|v| v.width)
    }

    pub fn source_height(&self) -> Option<u32> {
        self.media.video().and_then(|v| v.height)
    }
}

/// Resolution labels configured for a tier, skipping labels with no preset
pub fn resolutions_for(tier: SourceTier, cfg: &EncoderConfig) -> Vec<String> {
    let labels = match tier {
        SourceTier::Optical => &cfg.tiers.optical,
        SourceTier::Web => &cfg.tiers.web,
        SourceTier::Unknown => return Vec::new(),
    };
    labels
        .iter()
        .filter(|label| {
            let known = cfg.resolutions.contains_key(label.as_str());
            if !known {
                warn!("Tier {} lists resolution {} with no preset; ignoring", tier, label);
            }
            known
        })
        .cloned()
        .collect()
}

impl SourceFile {
    /// Classify a probed source: filename tokens win, probe signals otherwise
    pub fn analyze(path: &Path, media: MediaInfo, cfg: &EncoderConfig) -> SourceAnalysis {
        info!("🔍 Classifying source: {}", path.display());

        let (tier, reasons) = match tier_from_filename(path) {
            Some((tier, reason)) => (tier, vec![reason]),
            None => tier_from_probe(&media),
        };
        let resolutions = resolutions_for(tier, cfg);

        info!(
            "Source tier: {} -> [{}] ({})",
            tier,
            resolutions.join(", "),
            if reasons.is_empty() { "no signals".to_string() } else { reasons.join("; ") }
        );

        SourceAnalysis {
            source: SourceFile {
                path: path.to_path_buf(),
                tier,
                resolutions,
            },
            duration_secs: media.duration_secs.unwrap_or(0.0),
            media,
            reasons,
        }
    }
}
