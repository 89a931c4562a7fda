use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use log::{info, warn};
use crate::config::EncoderConfig;
use crate::error::Result;
use crate::process::{ensure_output, run_tool};
use crate::tools::{AudioFormat, EncodeRequest, FrameGrabber, Transcoder};

/// Version reported by one of the external tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

impl ToolVersion {
    /// Parse the first dotted version number of a `-version` banner.
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> 6.1.1, "mkvmerge v80.0 ('Roundabout')" -> 80.0.0
    pub fn parse(banner: &str) -> anyhow::Result<Self> {
        let version_part = banner
            .split_whitespace()
            .map(|s| s.trim_start_matches(|c| c == 'v' || c == 'n'))
            .find(|s| s.contains('.') && s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", banner))?;

        let mut parts = version_part.split('.');
        let major = parts
            .next()
            .and_then(leading_number)
            .ok_or_else(|| anyhow!("Invalid version format: {}", banner))?;
        let minor = parts.next().and_then(leading_number).unwrap_or(0);
        let patch = parts.next().and_then(leading_number).unwrap_or(0);

        Ok(ToolVersion { major, minor, patch })
    }
}

impl std::fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

async fn tool_banner(bin: &Path, flag: &str) -> anyhow::Result<String> {
    let output = run_tool(bin, [flag])
        .await
        .with_context(|| format!("Failed to execute {}", bin.display()))?;
    output
        .stdout
        .lines()
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Empty output from {} {}", bin.display(), flag))
}

/// Check the external tools before any job starts.
///
/// ffmpeg and ffprobe are required; mkvtoolnix is only needed for subtitle
/// and audio extraction and muxing, so its absence is a warning.
pub async fn preflight(cfg: &EncoderConfig) -> anyhow::Result<()> {
    for bin in [&cfg.ffmpeg_bin, &cfg.ffprobe_bin] {
        let banner = tool_banner(bin, "-version").await?;
        match ToolVersion::parse(&banner) {
            Ok(version) => info!("🎬 {} {}", bin.display(), version),
            Err(_) => info!("🎬 {} ({})", bin.display(), banner),
        }
    }
    for bin in [&cfg.mkvextract_bin, &cfg.mkvmerge_bin] {
        match tool_banner(bin, "--version").await {
            Ok(banner) => match ToolVersion::parse(&banner) {
                Ok(version) => info!("📦 {} {}", bin.display(), version),
                Err(_) => info!("📦 {} ({})", bin.display(), banner),
            },
            Err(e) => warn!("⚠️  {} unavailable: {:#}", bin.display(), e),
        }
    }
    Ok(())
}

/// ffmpeg-backed video and audio transcoding
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    video_encoder: String,
    encoder_preset: String,
    encoder_params: Option<String>,
}

impl FfmpegTranscoder {
    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            video_encoder: cfg.video_encoder.clone(),
            encoder_preset: cfg.encoder_preset.clone(),
            encoder_params: cfg.encoder_params.clone(),
        }
    }

    /// Option name for the encoder's private parameter string
    fn params_flag(&self) -> Option<&'static str> {
        match self.video_encoder.as_str() {
            "libx264" => Some("-x264-params"),
            "libx265" => Some("-x265-params"),
            "libsvtav1" => Some("-svtav1-params"),
            _ => None,
        }
    }

    /// Video-only encode: crop, aspect-preserving downscale (never up), CRF rate control
    pub fn encode_args(&self, request: &EncodeRequest) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-y".to_string()];

        // seek before input for fast trimmed previews
        if let Some(trim) = request.trim {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", trim.start_secs));
            args.push("-t".to_string());
            args.push(format!("{:.3}", trim.duration_secs));
        }

        args.push("-i".to_string());
        args.push(request.input.to_string_lossy().to_string());
        args.push("-map".to_string());
        args.push("0:v:0".to_string());
        args.push("-an".to_string());
        args.push("-sn".to_string());

        let crop = request.crop;
        let mut filters = Vec::new();
        if !crop.is_zero() {
            filters.push(format!(
                "crop=iw-{}:ih-{}:{}:{}",
                crop.left + crop.right,
                crop.top + crop.bottom,
                crop.left,
                crop.top
            ));
        }
        // box clamped to the input so small sources are never upscaled
        filters.push(format!(
            "scale=w='min({},iw)':h='min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
            request.width, request.height
        ));
        args.push("-vf".to_string());
        args.push(filters.join(","));

        args.push("-c:v".to_string());
        args.push(self.video_encoder.clone());
        args.push("-preset".to_string());
        args.push(self.encoder_preset.clone());
        args.push("-crf".to_string());
        args.push(request.quality.to_string());
        if let (Some(flag), Some(params)) = (self.params_flag(), self.encoder_params.as_ref()) {
            args.push(flag.to_string());
            args.push(params.clone());
        }
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());

        args.push(request.output.to_string_lossy().to_string());
        args
    }

    pub fn audio_args(&self, input: &Path, output: &Path, format: &AudioFormat) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-sn".to_string(),
        ];
        match format {
            AudioFormat::Surround { bitrate_kbps, channels } => {
                args.extend(["-c:a".to_string(), "ac3".to_string()]);
                args.extend(["-b:a".to_string(), format!("{}k", bitrate_kbps)]);
                args.extend(["-ac".to_string(), channels.to_string()]);
            }
            AudioFormat::Stereo { bitrate_kbps } => {
                args.extend(["-c:a".to_string(), "aac".to_string()]);
                args.extend(["-b:a".to_string(), format!("{}k", bitrate_kbps)]);
                args.extend(["-ac".to_string(), "2".to_string()]);
            }
            AudioFormat::Wav => {
                args.extend(["-c:a".to_string(), "pcm_s16le".to_string()]);
            }
        }
        args.push(output.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf> {
        run_tool(&self.ffmpeg_bin, self.encode_args(request)).await?;
        ensure_output("ffmpeg", &request.output)?;
        Ok(request.output.clone())
    }

    async fn convert_audio(&self, input: &Path, output: &Path, format: &AudioFormat) -> Result<PathBuf> {
        run_tool(&self.ffmpeg_bin, self.audio_args(input, output, format)).await?;
        ensure_output("ffmpeg", output)?;
        Ok(output.to_path_buf())
    }
}

pub fn frame_args(file: &Path, timestamp_secs: f64, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-ss".to_string(),
        format!("{:.3}", timestamp_secs),
        "-i".to_string(),
        file.to_string_lossy().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Single PNG frame extraction through ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegFrameGrabber {
    ffmpeg_bin: PathBuf,
}

impl FfmpegFrameGrabber {
    pub fn new(ffmpeg_bin: PathBuf) -> Self {
        Self { ffmpeg_bin }
    }
}

#[async_trait]
impl FrameGrabber for FfmpegFrameGrabber {
    async fn frame_at(&self, file: &Path, timestamp_secs: f64, output: &Path) -> Result<PathBuf> {
        run_tool(&self.ffmpeg_bin, frame_args(file, timestamp_secs, output)).await?;
        ensure_output("ffmpeg", output)?;
        Ok(output.to_path_buf())
    }
}
