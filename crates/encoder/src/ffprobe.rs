use std::collections::HashMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use crate::error::{EncodeError, Result};
use crate::process::run_tool;
use crate::tools::{MediaInfo, MediaInspector, StreamInfo, StreamKind};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub bit_rate: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub profile: Option<String>,
    pub channels: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

impl FFProbeStream {
    fn tag(&self, key: &str) -> Option<String> {
        self.tags.as_ref().and_then(|tags| {
            tags.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        })
    }

    fn kind(&self) -> StreamKind {
        match self.codec_type.as_deref() {
            Some("video") => StreamKind::Video,
            Some("audio") => StreamKind::Audio,
            Some("subtitle") => StreamKind::Subtitle,
            _ => StreamKind::Other,
        }
    }
}

fn parse_kbps(bits: Option<&str>) -> Option<u64> {
    bits.and_then(|b| b.trim().parse::<u64>().ok()).map(|b| b / 1000)
}

impl FFProbeData {
    /// Parse raw `ffprobe -print_format json` output
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reduce to what the pipeline needs.
    ///
    /// Bitrate comes from the container; when absent the first video
    /// stream's bitrate is used instead.
    pub fn into_media_info(self) -> MediaInfo {
        let video_kbps = self
            .streams
            .iter()
            .find(|s| s.kind() == StreamKind::Video)
            .and_then(|s| parse_kbps(s.bit_rate.as_deref()));
        let bit_rate_kbps = parse_kbps(self.format.bit_rate.as_deref()).or(video_kbps);
        let duration_secs = self
            .format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok());

        let streams = self
            .streams
            .iter()
            .map(|s| StreamInfo {
                index: s.index,
                kind: s.kind(),
                codec: s.codec_name.clone().unwrap_or_default().to_lowercase(),
                profile: s.profile.clone(),
                channels: s.channels,
                language: s.tag("language"),
                title: s.tag("title"),
                width: s.width,
                height: s.height,
            })
            .collect();

        MediaInfo {
            bit_rate_kbps,
            duration_secs,
            streams,
        }
    }
}

/// ffprobe-backed media inspector
pub struct FfprobeInspector {
    ffprobe_bin: PathBuf,
}

impl FfprobeInspector {
    pub fn new(ffprobe_bin: PathBuf) -> Self {
        Self { ffprobe_bin }
    }
}

#[async_trait]
impl MediaInspector for FfprobeInspector {
    async fn probe(&self, file: &Path) -> Result<MediaInfo> {
        if !file.exists() {
            return Err(EncodeError::tool(
                "ffprobe",
                format!("file does not exist: {}", file.display()),
            ));
        }

        debug!("Executing FFprobe for: {}", file.display());
        let args: Vec<std::ffi::OsString> = vec![
            "-v".into(),
            "error".into(),
            "-print_format".into(),
            "json".into(),
            "-show_streams".into(),
            "-show_format".into(),
            file.as_os_str().to_owned(),
        ];
        let output = run_tool(&self.ffprobe_bin, args).await?;

        let data = FFProbeData::from_json(&output.stdout).map_err(|e| {
            EncodeError::tool("ffprobe", format!("unparseable output for {}: {}", file.display(), e))
        })?;
        Ok(data.into_media_info())
    }
}
