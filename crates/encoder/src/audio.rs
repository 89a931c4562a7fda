use serde::{Deserialize, Serialize};
use crate::config::ResolutionPreset;
use crate::tools::{AudioFormat, StreamInfo, StreamKind};

/// Lossless codec families in selection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LosslessFamily {
    TrueHd,
    DtsHdMa,
    Flac,
    Pcm,
    Alac,
}

impl LosslessFamily {
    /// Family of a codec (plus profile, which separates DTS-HD MA from lossy DTS)
    pub fn of(codec: &str, profile: Option<&str>) -> Option<Self> {
        let codec = codec.to_lowercase();
        match codec.as_str() {
            "truehd" | "mlp" => Some(LosslessFamily::TrueHd),
            "dts" => {
                let profile = profile.unwrap_or("").to_uppercase();
                if profile.contains("MA") {
                    Some(LosslessFamily::DtsHdMa)
                } else {
                    None
                }
            }
            "flac" => Some(LosslessFamily::Flac),
            "alac" => Some(LosslessFamily::Alac),
            c if c.starts_with("pcm") => Some(LosslessFamily::Pcm),
            _ => None,
        }
    }
}

/// Audio track considered for the output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrackCandidate {
    pub track_id: u32,
    pub codec: String,
    pub channels: u32,
    pub lossless: Option<LosslessFamily>,
    pub language: Option<String>,
}

impl AudioTrackCandidate {
    pub fn from_stream(stream: &StreamInfo) -> Option<Self> {
        if stream.kind != StreamKind::Audio {
            return None;
        }
        Some(Self {
            track_id: stream.index,
            codec: stream.codec.clone(),
            channels: stream.channels.unwrap_or(2),
            lossless: LosslessFamily::of(&stream.codec, stream.profile.as_deref()),
            language: stream.language.clone(),
        })
    }

    pub fn is_lossless(&self) -> bool {
        self.lossless.is_some()
    }

    /// Lower sorts first: lossless families by priority, then channel count
    fn rank(&self) -> (u8, std::cmp::Reverse<u32>) {
        let family = self.lossless.map(|f| f as u8).unwrap_or(u8::MAX);
        (family, std::cmp::Reverse(self.channels))
    }

    /// File extension for the raw demuxed track
    pub fn raw_extension(&self) -> &'static str {
        match self.codec.as_str() {
            "truehd" | "mlp" => "thd",
            "dts" => "dts",
            "flac" => "flac",
            "ac3" => "ac3",
            "eac3" => "eac3",
            "aac" => "aac",
            "opus" => "opus",
            "mp3" => "mp3",
            c if c.starts_with("pcm") => "wav",
            _ => "mka",
        }
    }
}

/// Pick the single best track.
///
/// Deterministic: among equally ranked tracks the first listed wins.
pub fn select_track(candidates: &[AudioTrackCandidate]) -> Option<&AudioTrackCandidate> {
    let mut best: Option<&AudioTrackCandidate> = None;
    for candidate in candidates {
        match best {
            Some(current) if candidate.rank() >= current.rank() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// What happens to the selected track before muxing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPlan {
    /// Lossless multichannel: straight to compressed surround
    Surround { bitrate_kbps: u32, channels: u32 },
    /// Lossless stereo/mono: decode to WAV, then compress to stereo
    DecodeThenStereo { bitrate_kbps: u32 },
    /// Lossy and already within surround channel limits
    PassThrough,
    /// Lossy with more channels than the surround format carries
    Downmix { bitrate_kbps: u32 },
}

/// Channel ceiling of the compressed surround format
pub const MAX_SURROUND_CHANNELS: u32 = 6;

pub fn plan_for(track: &AudioTrackCandidate, preset: &ResolutionPreset) -> AudioPlan {
    match (track.is_lossless(), track.channels) {
        (true, ch) if ch > 2 => AudioPlan::Surround {
            bitrate_kbps: preset.surround_kbps,
            channels: ch.min(MAX_SURROUND_CHANNELS),
        },
        (true, _) => AudioPlan::DecodeThenStereo {
            bitrate_kbps: preset.stereo_kbps,
        },
        (false, ch) if ch > MAX_SURROUND_CHANNELS => AudioPlan::Downmix {
            bitrate_kbps: preset.surround_kbps,
        },
        (false, _) => AudioPlan::PassThrough,
    }
}

impl AudioPlan {
    /// Conversion steps, in order, as (target format, output extension)
    pub fn steps(&self) -> Vec<(AudioFormat, &'static str)> {
        match self {
            AudioPlan::Surround { bitrate_kbps, channels } => vec![(
                AudioFormat::Surround {
                    bitrate_kbps: *bitrate_kbps,
                    channels: *channels,
                },
                "ac3",
            )],
            AudioPlan::DecodeThenStereo { bitrate_kbps } => vec![
                (AudioFormat::Wav, "wav"),
                (AudioFormat::Stereo { bitrate_kbps: *bitrate_kbps }, "m4a"),
            ],
            AudioPlan::Downmix { bitrate_kbps } => vec![(
                AudioFormat::Surround {
                    bitrate_kbps: *bitrate_kbps,
                    channels: MAX_SURROUND_CHANNELS,
                },
                "ac3",
            )],
            AudioPlan::PassThrough => Vec::new(),
        }
    }
}
