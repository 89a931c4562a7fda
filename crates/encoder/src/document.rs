use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::crop::CropGeometry;
use crate::error::{EncodeError, Result};

/// Title and release year used to label the outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleInfo {
    pub title: String,
    pub year: Option<u16>,
}

impl std::fmt::Display for TitleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} ({})", self.title, year),
            None => f.write_str(&self.title),
        }
    }
}

/// Film-database style lookup by source filename
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, filename: &str) -> Result<TitleInfo>;
}

const RELEASE_TOKENS: &str =
    r"(?i)\b(2160p|1080p|720p|576p|480p|blu-?ray|remux|bdrip|web-?dl|webrip|hdrip|dvdrip|x264|x265|h\.?264|h\.?265|hevc|avc|aac|ac3|dts|truehd|atmos|hdr|hd)\b";

/// Title and year taken from the filename itself
pub struct FilenameLookup {
    year: Regex,
    release: Regex,
    separators: Regex,
}

impl FilenameLookup {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EncodeError::MetadataLookupFailed(format!("bad pattern: {}", e)))
        };
        Ok(Self {
            year: compile(r"\b(19|20)\d{2}\b")?,
            release: compile(RELEASE_TOKENS)?,
            separators: compile(r"[._\s]+")?,
        })
    }

    pub fn parse(&self, filename: &str) -> TitleInfo {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());
        let spaced = self.separators.replace_all(&stem, " ").trim().to_string();

        // a year at the very start is part of the title ("2001 A Space Odyssey")
        let year_match = self.year.find_iter(&spaced).filter(|m| m.start() > 0).last();
        let (head, year) = match year_match {
            Some(m) => (&spaced[..m.start()], m.as_str().parse::<u16>().ok()),
            None => {
                let cut = self.release.find(&spaced).map(|m| m.start()).unwrap_or(spaced.len());
                (&spaced[..cut], None)
            }
        };

        let title = head
            .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '(' | '[' | '-'))
            .trim()
            .to_string();
        TitleInfo {
            title: if title.is_empty() { spaced.clone() } else { title },
            year,
        }
    }
}

#[async_trait]
impl MetadataLookup for FilenameLookup {
    async fn lookup(&self, filename: &str) -> Result<TitleInfo> {
        Ok(self.parse(filename))
    }
}

/// Ask the lookup, falling back to the filename when it fails
pub async fn resolve_title(lookup: &dyn MetadataLookup, fallback: &FilenameLookup, filename: &str) -> TitleInfo {
    match lookup.lookup(filename).await {
        Ok(info) => info,
        Err(e) => {
            let err = match e {
                EncodeError::MetadataLookupFailed(_) => e,
                other => EncodeError::MetadataLookupFailed(other.to_string()),
            };
            warn!("{}; using filename-derived title", err);
            fallback.parse(filename)
        }
    }
}

/// Text summary of one encoded resolution
#[derive(Debug, Clone)]
pub struct SubmissionDocument {
    pub title: TitleInfo,
    pub source_name: String,
    pub resolution: String,
    pub width: u32,
    pub height: u32,
    pub crop: CropGeometry,
    pub quality: u8,
    pub bitrate_kbps: Option<u64>,
    pub audio: Option<String>,
    pub subtitles: Vec<PathBuf>,
    pub screenshots: Vec<PathBuf>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

impl SubmissionDocument {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.title);
        let _ = writeln!(out, "Source: {}", self.source_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "Resolution: {} ({}x{})", self.resolution, self.width, self.height);
        let _ = writeln!(out, "Crop (t:b:l:r): {}", self.crop);
        let _ = writeln!(out, "Quality: CRF {}", self.quality);
        match self.bitrate_kbps {
            Some(kbps) => {
                let _ = writeln!(out, "Video bitrate: {} kbps", kbps);
            }
            None => {
                let _ = writeln!(out, "Video bitrate: unknown");
            }
        }
        let _ = writeln!(out, "Audio: {}", self.audio.as_deref().unwrap_or("none"));

        let _ = writeln!(out);
        let _ = writeln!(out, "Subtitles:");
        if self.subtitles.is_empty() {
            let _ = writeln!(out, "  none");
        }
        for sub in &self.subtitles {
            let _ = writeln!(out, "  {}", file_name(sub));
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Screenshots:");
        if self.screenshots.is_empty() {
            let _ = writeln!(out, "  none");
        }
        for shot in &self.screenshots {
            let _ = writeln!(out, "  {}", shot.display());
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<PathBuf> {
        std::fs::write(path, self.render())?;
        Ok(path.to_path_buf())
    }
}
