//! In-memory collaborators shared by the pipeline and worker tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use image::{GrayImage, Luma};
use crate::config::EncoderConfig;
use crate::document::FilenameLookup;
use crate::error::{EncodeError, Result};
use crate::notify::{CompletionNotice, Notifier};
use crate::pipeline::JobRunner;
use crate::status::StatusStore;
use crate::tools::{
    AudioFormat, Demuxer, EncodeRequest, FrameGrabber, MediaInfo, MediaInspector, MuxRequest, Muxer, StreamInfo,
    StreamKind, Toolchain, Transcoder,
};

pub const SOURCE_NAME: &str = "Heat.1995.BluRay.mkv";

pub type RateFn = Box<dyn Fn(u8, u32, bool) -> u64 + Send + Sync>;

/// In-memory toolchain. Encodes write "quality width kind" into the
/// output; probing reads it back through `kbps`.
pub struct FakeTools {
    pub media: MediaInfo,
    pub kbps: RateFn,
    pub black_frames: bool,
    pub fail_audio_extract: bool,
    /// Full encodes write their output and then hang until stopped
    pub slow_full_encode: AtomicBool,
    pub encodes: Mutex<Vec<(u8, u32, bool)>>,
    pub extracts: Mutex<Vec<u32>>,
    pub muxes: Mutex<Vec<MuxRequest>>,
    pub conversions: Mutex<Vec<AudioFormat>>,
}

pub fn band_mid(width: u32) -> u64 {
    match width {
        1280 => 6000,
        1024 => 3000,
        854 => 2000,
        _ => 5000,
    }
}

pub fn stream(index: u32, kind: StreamKind, codec: &str, channels: Option<u32>, lang: Option<&str>) -> StreamInfo {
    StreamInfo {
        index,
        kind,
        codec: codec.to_string(),
        profile: None,
        channels,
        language: lang.map(str::to_string),
        title: None,
        width: None,
        height: None,
    }
}

pub fn source_media() -> MediaInfo {
    let mut video = stream(0, StreamKind::Video, "h264", None, None);
    video.width = Some(1920);
    video.height = Some(1080);
    MediaInfo {
        bit_rate_kbps: Some(30000),
        duration_secs: Some(5400.0),
        streams: vec![
            video,
            stream(1, StreamKind::Audio, "truehd", Some(8), Some("fre")),
            stream(2, StreamKind::Audio, "ac3", Some(6), Some("eng")),
            stream(3, StreamKind::Subtitle, "subrip", None, Some("fre")),
            stream(4, StreamKind::Subtitle, "subrip", None, Some("eng")),
        ],
    }
}

impl FakeTools {
    pub fn new(kbps: RateFn) -> Self {
        Self {
            media: source_media(),
            kbps,
            black_frames: false,
            fail_audio_extract: false,
            slow_full_encode: AtomicBool::new(false),
            encodes: Mutex::new(Vec::new()),
            extracts: Mutex::new(Vec::new()),
            muxes: Mutex::new(Vec::new()),
            conversions: Mutex::new(Vec::new()),
        }
    }

    pub fn in_band() -> Self {
        Self::new(Box::new(|_, width, _| band_mid(width)))
    }

    pub fn full_encodes(&self, width: u32) -> usize {
        self.encodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, w, preview)| *w == width && !preview)
            .count()
    }
}

#[async_trait]
impl Transcoder for FakeTools {
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf> {
        let preview = request.trim.is_some();
        let kind = if preview { "preview" } else { "full" };
        std::fs::write(&request.output, format!("{} {} {}", request.quality, request.width, kind))?;
        if !preview && self.slow_full_encode.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.encodes.lock().unwrap().push((request.quality, request.width, preview));
        Ok(request.output.clone())
    }

    async fn convert_audio(&self, _input: &Path, output: &Path, format: &AudioFormat) -> Result<PathBuf> {
        self.conversions.lock().unwrap().push(format.clone());
        std::fs::write(output, b"audio")?;
        Ok(output.to_path_buf())
    }
}

#[async_trait]
impl MediaInspector for FakeTools {
    async fn probe(&self, file: &Path) -> Result<MediaInfo> {
        if file.file_name().and_then(|n| n.to_str()) == Some(SOURCE_NAME) {
            return Ok(self.media.clone());
        }
        let content = std::fs::read_to_string(file)?;
        let parts: Vec<&str> = content.split_whitespace().collect();
        let quality: u8 = parts[0].parse().unwrap();
        let width: u32 = parts[1].parse().unwrap();
        Ok(MediaInfo {
            bit_rate_kbps: Some((self.kbps)(quality, width, parts[2] == "preview")),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Demuxer for FakeTools {
    async fn extract(&self, _file: &Path, track_id: u32, output: &Path) -> Result<PathBuf> {
        if self.fail_audio_extract && track_id == 1 {
            return Err(EncodeError::tool("mkvextract", "exit code 2"));
        }
        self.extracts.lock().unwrap().push(track_id);
        std::fs::write(output, b"track")?;
        Ok(output.to_path_buf())
    }
}

#[async_trait]
impl Muxer for FakeTools {
    async fn mux(&self, request: &MuxRequest) -> Result<PathBuf> {
        self.muxes.lock().unwrap().push(request.clone());
        std::fs::write(&request.output, b"container")?;
        Ok(request.output.clone())
    }
}

#[async_trait]
impl FrameGrabber for FakeTools {
    async fn frame_at(&self, _file: &Path, _ts: f64, output: &Path) -> Result<PathBuf> {
        let frame = GrayImage::from_fn(320, 180, |_, y| {
            if self.black_frames || !(20..160).contains(&y) {
                Luma([0])
            } else {
                Luma([128])
            }
        });
        frame.save(output)?;
        Ok(output.to_path_buf())
    }
}

#[derive(Default)]
pub struct Recorder {
    pub notices: Mutex<Vec<CompletionNotice>>,
}

impl Notifier for Recorder {
    fn notify(&self, notice: &CompletionNotice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

/// Runner over `fake` with artifacts and status under `root`
pub fn test_runner(root: &Path, fake: Arc<FakeTools>, notifier: Arc<dyn Notifier>) -> JobRunner {
    let mut cfg = EncoderConfig::default_config();
    cfg.output_root = root.join("out");
    cfg.job_state_dir = root.join("jobs");
    cfg.stop_poll_secs = 1;
    let store = StatusStore::from_config(&cfg);
    let tools = Toolchain {
        transcoder: fake.clone(),
        inspector: fake.clone(),
        demuxer: fake.clone(),
        muxer: fake.clone(),
        frames: fake,
    };
    JobRunner {
        cfg: Arc::new(cfg),
        tools,
        store: Arc::new(store),
        lookup: Arc::new(FilenameLookup::new().unwrap()),
        titles: Arc::new(FilenameLookup::new().unwrap()),
        notifier,
    }
}

/// Hook program that writes `$AUTOENC_STATUS` into `marker` after a short delay
#[cfg(unix)]
pub fn marker_hook(dir: &Path, marker: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("hook.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\nsleep 0.2\nprintf '%s' \"$AUTOENC_STATUS\" > '{}'\n", marker.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}
