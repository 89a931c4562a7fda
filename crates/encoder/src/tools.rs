//! Seams to the external engines: transcoder, inspector, demuxer, muxer
//! and frame grabber. The pipeline only ever talks to these traits.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use crate::crop::CropGeometry;
use crate::error::Result;

/// Portion of the input to encode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimRange {
    pub start_secs: f64,
    pub duration_secs: f64,
}

/// One video encode invocation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub crop: CropGeometry,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
    pub trim: Option<TrimRange>,
}

/// Target format for an audio conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    /// Compressed surround (AC-3)
    Surround { bitrate_kbps: u32, channels: u32 },
    /// Compressed stereo (AAC)
    Stereo { bitrate_kbps: u32 },
    /// Uncompressed intermediate (16-bit PCM WAV)
    Wav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

/// Stream as reported by the inspection tool
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Track id as understood by the demuxer
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub profile: Option<String>,
    pub channels: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Summary of a probed media file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaInfo {
    pub bit_rate_kbps: Option<u64>,
    pub duration_secs: Option<f64>,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    pub fn video(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == StreamKind::Video)
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

/// A track handed to the muxer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxTrack {
    pub path: PathBuf,
    pub language: Option<String>,
    pub name: Option<String>,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxRequest {
    pub video: PathBuf,
    pub audio: Vec<MuxTrack>,
    pub subtitles: Vec<MuxTrack>,
    pub title: String,
    pub output: PathBuf,
}

/// Quality-controlled transcoding engine
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf>;

    async fn convert_audio(&self, input: &Path, output: &Path, format: &AudioFormat) -> Result<PathBuf>;
}

/// Media inspection tool, used for bitrate measurement and track enumeration
#[async_trait]
pub trait MediaInspector: Send + Sync {
    async fn probe(&self, file: &Path) -> Result<MediaInfo>;
}

#[async_trait]
pub trait Demuxer: Send + Sync {
    async fn extract(&self, file: &Path, track_id: u32, output: &Path) -> Result<PathBuf>;
}

#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, request: &MuxRequest) -> Result<PathBuf>;
}

/// Single-frame extraction to an image file
#[async_trait]
pub trait FrameGrabber: Send + Sync {
    async fn frame_at(&self, file: &Path, timestamp_secs: f64, output: &Path) -> Result<PathBuf>;
}

/// The set of engines a job runs against
#[derive(Clone)]
pub struct Toolchain {
    pub transcoder: Arc<dyn Transcoder>,
    pub inspector: Arc<dyn MediaInspector>,
    pub demuxer: Arc<dyn Demuxer>,
    pub muxer: Arc<dyn Muxer>,
    pub frames: Arc<dyn FrameGrabber>,
}
