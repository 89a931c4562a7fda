use std::path::{Path, PathBuf};
use async_trait::async_trait;
use crate::error::Result;
use crate::process::{ensure_output, run_tool, run_tool_accepting};
use crate::tools::{Demuxer, MuxRequest, MuxTrack, Muxer};

/// mkvmerge exits 1 when it only has warnings
const MKVMERGE_WARNING_EXIT: i32 = 1;

/// Track extraction through `mkvextract`
#[derive(Debug, Clone)]
pub struct MkvExtract {
    bin: PathBuf,
}

impl MkvExtract {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    pub fn extract_args(file: &Path, track_id: u32, output: &Path) -> Vec<String> {
        vec![
            file.to_string_lossy().to_string(),
            "tracks".to_string(),
            format!("{}:{}", track_id, output.to_string_lossy()),
        ]
    }
}

#[async_trait]
impl Demuxer for MkvExtract {
    async fn extract(&self, file: &Path, track_id: u32, output: &Path) -> Result<PathBuf> {
        run_tool(&self.bin, Self::extract_args(file, track_id, output)).await?;
        ensure_output("mkvextract", output)?;
        Ok(output.to_path_buf())
    }
}

/// Container assembly through `mkvmerge`
#[derive(Debug, Clone)]
pub struct MkvMerge {
    bin: PathBuf,
}

fn push_track(args: &mut Vec<String>, track: &MuxTrack) {
    if let Some(lang) = &track.language {
        args.push("--language".to_string());
        args.push(format!("0:{}", lang));
    }
    if let Some(name) = &track.name {
        args.push("--track-name".to_string());
        args.push(format!("0:{}", name));
    }
    args.push("--default-track-flag".to_string());
    args.push(format!("0:{}", if track.default { "yes" } else { "no" }));
    args.push(track.path.to_string_lossy().to_string());
}

impl MkvMerge {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    pub fn merge_args(request: &MuxRequest) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            request.output.to_string_lossy().to_string(),
            "--title".to_string(),
            request.title.clone(),
            request.video.to_string_lossy().to_string(),
        ];
        for track in request.audio.iter().chain(request.subtitles.iter()) {
            push_track(&mut args, track);
        }
        args
    }
}

#[async_trait]
impl Muxer for MkvMerge {
    async fn mux(&self, request: &MuxRequest) -> Result<PathBuf> {
        run_tool_accepting(&self.bin, Self::merge_args(request), &[0, MKVMERGE_WARNING_EXIT]).await?;
        ensure_output("mkvmerge", &request.output)?;
        Ok(request.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_args() {
        let args = MkvExtract::extract_args(Path::new("/in/t.mkv"), 3, Path::new("/out/t.eng.srt"));
        assert_eq!(args, vec!["/in/t.mkv", "tracks", "3:/out/t.eng.srt"]);
    }

    #[test]
    fn test_merge_args_tag_languages_and_defaults() {
        let request = MuxRequest {
            video: PathBuf::from("v.mkv"),
            audio: vec![MuxTrack {
                path: PathBuf::from("a.ac3"),
                language: Some("fre".to_string()),
                name: Some("AC-3 5.1".to_string()),
                default: true,
            }],
            subtitles: vec![MuxTrack {
                path: PathBuf::from("s.srt"),
                language: Some("eng".to_string()),
                name: None,
                default: true,
            }],
            title: "Movie (2010)".to_string(),
            output: PathBuf::from("out.mkv"),
        };
        let args = MkvMerge::merge_args(&request);
        let joined = args.join(" ");
        assert!(joined.starts_with("-o out.mkv --title Movie (2010) v.mkv"));
        assert!(joined.contains("--language 0:fre --track-name 0:AC-3 5.1 --default-track-flag 0:yes a.ac3"));
        assert!(joined.ends_with("--language 0:eng --default-track-flag 0:yes s.srt"));
    }
}
