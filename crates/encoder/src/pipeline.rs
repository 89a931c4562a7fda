//! Per-resolution state machine and the job driver around it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{error, info, warn};
use crate::artifacts::{
    artifact_ready, clear_stamp, commit_partial, partial_path, read_stamp, write_stamp, ArtifactLayout, EncodeStamp,
};
use crate::audio::{plan_for, select_track, AudioPlan, AudioTrackCandidate};
use crate::classifier::{SourceAnalysis, SourceFile};
use crate::config::{BitrateBand, EncoderConfig, FinalEncodeConfig, QualitySearchConfig, ResolutionPreset};
use crate::crop::{CropDetector, CropGeometry};
use crate::document::{resolve_title, FilenameLookup, MetadataLookup, SubmissionDocument, TitleInfo};
use crate::error::{EncodeError, Fate, Result};
use crate::job::{EncodeJob, ResolutionTask, Stage};
use crate::notify::{CompletionNotice, JobOutcome, Notifier};
use crate::quality::{QualitySearch, SearchOutcome, SearchRequest};
use crate::screenshot::ScreenshotSelector;
use crate::status::StatusStore;
use crate::stop::StopSignal;
use crate::tools::{
    AudioFormat, EncodeRequest, MediaInspector, MuxRequest, MuxTrack, StreamInfo, StreamKind, Toolchain, Transcoder,
};

/// `eng` matches `eng`, `ENG` and `en`
pub fn is_language(lang: Option<&str>, preferred: &str) -> bool {
    match lang {
        Some(l) if l.eq_ignore_ascii_case(preferred) => true,
        Some(l) if l.len() == 2 => preferred.len() == 3 && preferred.to_lowercase().starts_with(&l.to_lowercase()),
        _ => false,
    }
}

fn subtitle_extension(codec: &str) -> Option<&'static str> {
    match codec {
        "subrip" | "srt" | "mov_text" => Some("srt"),
        "ass" | "ssa" => Some("ass"),
        "hdmv_pgs_subtitle" | "pgssub" => Some("sup"),
        "dvd_subtitle" | "dvdsub" => Some("sub"),
        _ => None,
    }
}

/// Subtitle streams with the preferred language first, otherwise in file order
pub fn order_subtitles<'a>(streams: impl Iterator<Item = &'a StreamInfo>, preferred: &str) -> Vec<&'a StreamInfo> {
    let mut subs: Vec<&StreamInfo> = streams.filter(|s| s.kind == StreamKind::Subtitle).collect();
    subs.sort_by_key(|s| !is_language(s.language.as_deref(), preferred));
    subs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleFile {
    pub path: PathBuf,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOutput {
    pub path: PathBuf,
    pub language: Option<String>,
    pub description: String,
}

fn describe_audio(track: &AudioTrackCandidate, plan: &AudioPlan) -> String {
    match plan {
        AudioPlan::Surround { bitrate_kbps, channels } => format!("AC-3 {}ch {} kbps", channels, bitrate_kbps),
        AudioPlan::Downmix { bitrate_kbps } => format!("AC-3 6ch {} kbps (downmixed)", bitrate_kbps),
        AudioPlan::DecodeThenStereo { bitrate_kbps } => format!("AAC 2ch {} kbps", bitrate_kbps),
        AudioPlan::PassThrough => format!("{} {}ch (original)", track.codec.to_uppercase(), track.channels),
    }
}

/// Result of the full-file correction loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalEncodeOutcome {
    pub quality: u8,
    pub bitrate_kbps: Option<u64>,
    pub attempts: u32,
}

/// Full-file encode with bitrate verification.
///
/// Encodes at the searched quality, measures the whole file and, while the
/// bitrate is outside the band, moves quality one step and encodes again.
/// `1 + max_retries` encodes are allowed in total.
///
/// Encodes land in a partial file that is moved into place only once the
/// tool succeeds, with the quality stamped beside it. A rerun reuses the
/// video only when that stamp exists and reports the stamped quality.
pub struct FinalEncoder<'a> {
    pub transcoder: &'a dyn Transcoder,
    pub inspector: &'a dyn MediaInspector,
    pub bounds: &'a QualitySearchConfig,
    pub settings: &'a FinalEncodeConfig,
    pub stop: &'a StopSignal,
    pub log_prefix: &'a str,
}

impl FinalEncoder<'_> {
    pub async fn run(
        &self,
        template: &EncodeRequest,
        band: Option<BitrateBand>,
        reuse_existing: bool,
    ) -> Result<FinalEncodeOutcome> {
        let max_attempts = self.settings.max_retries + 1;
        let step = self.settings.step.max(1);
        let output = &template.output;
        let mut quality = template.quality;
        let mut reused = false;
        let mut attempts = 0u32;

        if reuse_existing && artifact_ready(output) {
            match read_stamp(output) {
                Some(stamp) => {
                    info!(
                        "{}: reusing existing encode {} (q={})",
                        self.log_prefix,
                        output.display(),
                        stamp.quality
                    );
                    quality = stamp.quality;
                    reused = true;
                }
                None => info!(
                    "{}: {} has no quality record, encoding again",
                    self.log_prefix,
                    output.display()
                ),
            }
        }

        loop {
            if !(attempts == 0 && reused) {
                let request = EncodeRequest {
                    quality,
                    trim: None,
                    output: partial_path(output),
                    ..template.clone()
                };
                clear_stamp(output);
                info!("{}: final encode attempt {} at q={}", self.log_prefix, attempts + 1, quality);
                self.stop.guard(self.transcoder.encode(&request)).await?;
                commit_partial(&request.output, output)?;
                write_stamp(output, &EncodeStamp { quality })?;
            }
            attempts += 1;

            let info = self.stop.guard(self.inspector.probe(output)).await?;
            let Some(band) = band else {
                return Ok(FinalEncodeOutcome {
                    quality,
                    bitrate_kbps: info.bit_rate_kbps,
                    attempts,
                });
            };
            let measured = info
                .bit_rate_kbps
                .ok_or_else(|| EncodeError::tool("ffprobe", format!("no bitrate for {}", output.display())))?;

            if band.contains(measured) {
                info!(
                    "{}: full-file bitrate {} kbps within {}-{} after {} encode(s)",
                    self.log_prefix, measured, band.min_kbps, band.max_kbps, attempts
                );
                return Ok(FinalEncodeOutcome {
                    quality,
                    bitrate_kbps: Some(measured),
                    attempts,
                });
            }

            let out_of_band = EncodeError::BitrateOutOfBandAfterFinalEncode {
                measured_kbps: measured,
                min_kbps: band.min_kbps,
                max_kbps: band.max_kbps,
                attempts,
            };
            if attempts >= max_attempts {
                return Err(out_of_band);
            }

            let next = if measured < band.min_kbps {
                quality.saturating_sub(step)
            } else {
                quality.saturating_add(step)
            }
            .clamp(self.bounds.min_quality, self.bounds.max_quality);
            if next == quality {
                // pinned at a quality bound: another encode would measure the same
                return Err(out_of_band);
            }
            warn!(
                "{}: full-file bitrate {} kbps outside {}-{}, re-encoding at q={}",
                self.log_prefix, measured, band.min_kbps, band.max_kbps, next
            );
            quality = next;
        }
    }
}

/// Everything a resolution pipeline runs against
pub struct PipelineContext<'a> {
    pub job_id: &'a str,
    pub cfg: &'a EncoderConfig,
    pub tools: &'a Toolchain,
    pub store: &'a StatusStore,
    pub layout: &'a ArtifactLayout,
    pub analysis: &'a SourceAnalysis,
    pub title: &'a TitleInfo,
    pub stop: &'a StopSignal,
}

/// Drives one resolution from Pending to a terminal stage
pub struct ResolutionPipeline<'a> {
    ctx: &'a PipelineContext<'a>,
    preset: &'a ResolutionPreset,
    resolution_index: usize,
    log_prefix: String,
}

impl<'a> ResolutionPipeline<'a> {
    pub fn new(ctx: &'a PipelineContext<'a>, preset: &'a ResolutionPreset, resolution: &str, resolution_index: usize) -> Self {
        Self {
            ctx,
            preset,
            resolution_index,
            log_prefix: format!("Job {} [{}]", ctx.job_id, resolution),
        }
    }

    fn source(&self) -> &Path {
        &self.ctx.analysis.source.path
    }

    /// Record the stage and persist it before anything else happens
    fn transition(&self, task: &mut ResolutionTask, stage: Stage) -> Result<()> {
        task.advance(stage)?;
        self.ctx.store.update_resolution(self.ctx.job_id, task)?;
        info!("{}: {} ({}%)", self.log_prefix, stage, task.progress);
        Ok(())
    }

    /// Run every stage, leaving `task` terminal. Errors are folded into the
    /// task; only a stop request is returned so the job can wind down.
    pub async fn run(&self, task: &mut ResolutionTask) -> Result<()> {
        match self.run_stages(task).await {
            Ok(()) => Ok(()),
            Err(EncodeError::Stopped) => {
                self.finish(task, Stage::Failed, "stopped");
                Err(EncodeError::Stopped)
            }
            Err(e) => {
                let stage = match e.fate() {
                    Fate::Failed => Stage::Failed,
                    Fate::Skipped => Stage::Skipped,
                };
                error!("{}: {} at {}: {}", self.log_prefix, stage, task.stage, e);
                self.finish(task, stage, &e.to_string());
                Ok(())
            }
        }
    }

    fn finish(&self, task: &mut ResolutionTask, stage: Stage, reason: &str) {
        if task.stage.is_terminal() {
            return;
        }
        if let Err(e) = task.terminate(stage, reason) {
            error!("{}: {}", self.log_prefix, e);
            return;
        }
        if let Err(e) = self.ctx.store.update_resolution(self.ctx.job_id, task) {
            error!("{}: failed to persist {} state: {}", self.log_prefix, stage, e);
        }
    }

    async fn run_stages(&self, task: &mut ResolutionTask) -> Result<()> {
        let resolution = task.resolution.clone();
        self.ctx.layout.prepare(&resolution)?;
        let scratch = self.ctx.layout.scratch_dir(&resolution);

        let subtitles = self.extract_subtitles(task).await?;
        self.transition(task, Stage::SubtitlesExtracted)?;

        let audio = match self.extract_audio(&resolution).await {
            Ok(audio) => audio,
            Err(EncodeError::Stopped) => return Err(EncodeError::Stopped),
            Err(e) => {
                warn!("{}: {}; muxing without audio", self.log_prefix, e);
                task.warn(e.to_string());
                None
            }
        };
        self.transition(task, Stage::AudioExtracted)?;

        let detector = CropDetector::new(self.ctx.tools.frames.as_ref(), &self.ctx.cfg.crop);
        let crop = self
            .ctx
            .stop
            .guard(detector.detect(self.source(), self.ctx.analysis.duration_secs, &scratch))
            .await?;
        task.crop = Some(crop);
        self.transition(task, Stage::CropDetected)?;

        let quality = self.search_quality(task, crop, &scratch).await?;
        task.quality = Some(quality);
        self.transition(task, Stage::QualityFound)?;

        self.transition(task, Stage::FinalEncoding)?;
        let video = self.ctx.layout.video_path(&resolution);
        let template = EncodeRequest {
            input: self.source().to_path_buf(),
            output: video.clone(),
            crop,
            quality,
            width: self.preset.width,
            height: self.preset.height,
            trim: None,
        };
        let final_encoder = FinalEncoder {
            transcoder: self.ctx.tools.transcoder.as_ref(),
            inspector: self.ctx.tools.inspector.as_ref(),
            bounds: &self.ctx.cfg.quality_search,
            settings: &self.ctx.cfg.final_encode,
            stop: self.ctx.stop,
            log_prefix: &self.log_prefix,
        };
        let encoded = final_encoder.run(&template, self.preset.bitrate_band, true).await?;
        task.quality = Some(encoded.quality);
        task.measured_kbps = encoded.bitrate_kbps;
        task.encode_attempts = encoded.attempts;
        self.transition(task, Stage::FinalEncoded)?;

        self.multiplex(&resolution, &video, audio.as_ref(), &subtitles).await?;
        self.transition(task, Stage::Multiplexed)?;

        let screenshots_dir = self.ctx.layout.screenshots_dir(&resolution);
        let selector = ScreenshotSelector::new(self.ctx.tools.frames.as_ref(), &self.ctx.cfg.screenshots);
        let screenshots = match self
            .ctx
            .stop
            .guard(selector.select(&video, self.ctx.analysis.duration_secs, self.resolution_index, &screenshots_dir))
            .await
        {
            Ok(shots) => shots.into_iter().map(|s| s.path).collect(),
            Err(EncodeError::Stopped) => return Err(EncodeError::Stopped),
            Err(e) => {
                warn!("{}: screenshots failed: {}", self.log_prefix, e);
                task.warn(format!("screenshots: {}", e));
                Vec::new()
            }
        };
        self.transition(task, Stage::ScreenshotsExtracted)?;

        let (src_w, src_h) = (
            self.ctx.analysis.source_width().unwrap_or(self.preset.width),
            self.ctx.analysis.source_height().unwrap_or(self.preset.height),
        );
        let (width, height) = crop.fitted_dims(src_w, src_h, self.preset.width, self.preset.height);
        let document = SubmissionDocument {
            title: self.ctx.title.clone(),
            source_name: self
                .source()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            resolution: resolution.clone(),
            width,
            height,
            crop,
            quality: encoded.quality,
            bitrate_kbps: encoded.bitrate_kbps,
            audio: audio.as_ref().map(|a| a.description.clone()),
            subtitles: subtitles.iter().map(|s| s.path.clone()).collect(),
            screenshots,
        };
        if let Err(e) = document.write(&self.ctx.layout.document_path(&resolution)) {
            warn!("{}: document failed: {}", self.log_prefix, e);
            task.warn(format!("document: {}", e));
        }
        self.transition(task, Stage::DocumentGenerated)?;

        self.transition(task, Stage::Completed)?;
        if task.completed_with_warnings() {
            info!("{}: completed with {} warning(s)", self.log_prefix, task.warnings.len());
        }
        Ok(())
    }

    async fn extract_subtitles(&self, task: &mut ResolutionTask) -> Result<Vec<SubtitleFile>> {
        let preferred = &self.ctx.cfg.preferred_language;
        let streams = order_subtitles(self.ctx.analysis.media.streams.iter(), preferred);
        let mut files = Vec::new();

        for (position, stream) in streams.into_iter().enumerate() {
            let Some(ext) = subtitle_extension(&stream.codec) else {
                warn!("{}: skipping subtitle track {} ({})", self.log_prefix, stream.index, stream.codec);
                continue;
            };
            let path = self.ctx.layout.subtitle_path(position, stream.language.as_deref(), ext);
            if !artifact_ready(&path) {
                let partial = partial_path(&path);
                let extracted = match self
                    .ctx
                    .stop
                    .guard(self.ctx.tools.demuxer.extract(self.source(), stream.index, &partial))
                    .await
                {
                    Ok(_) => commit_partial(&partial, &path),
                    Err(e) => Err(e),
                };
                match extracted {
                    Ok(()) => {}
                    Err(EncodeError::Stopped) => return Err(EncodeError::Stopped),
                    Err(e) => {
                        warn!("{}: subtitle track {} failed: {}", self.log_prefix, stream.index, e);
                        task.warn(format!("subtitle track {}: {}", stream.index, e));
                        continue;
                    }
                }
            }
            files.push(SubtitleFile {
                path,
                language: stream.language.clone(),
            });
        }
        Ok(files)
    }

    /// Select, extract and convert the audio track. Any failure comes back as
    /// `AudioExtractionFailed`.
    async fn extract_audio(&self, resolution: &str) -> Result<Option<AudioOutput>> {
        let candidates: Vec<AudioTrackCandidate> = self
            .ctx
            .analysis
            .media
            .streams
            .iter()
            .filter_map(AudioTrackCandidate::from_stream)
            .collect();
        let Some(track) = select_track(&candidates) else {
            return Err(EncodeError::AudioExtractionFailed("source has no audio tracks".to_string()));
        };
        let plan = plan_for(track, self.preset);
        let steps = plan.steps();
        let final_ext = steps.last().map(|(_, ext)| *ext).unwrap_or_else(|| track.raw_extension());
        let output = self.ctx.layout.audio_path(resolution, final_ext);
        let description = describe_audio(track, &plan);
        info!(
            "{}: audio track {} ({} {}ch) -> {}",
            self.log_prefix, track.track_id, track.codec, track.channels, description
        );

        let done = AudioOutput {
            path: output.clone(),
            language: track.language.clone(),
            description,
        };
        if artifact_ready(&output) {
            return Ok(Some(done));
        }

        let failed = |e: EncodeError| match e {
            EncodeError::Stopped => EncodeError::Stopped,
            EncodeError::AudioExtractionFailed(_) => e,
            other => EncodeError::AudioExtractionFailed(other.to_string()),
        };

        let scratch = self.ctx.layout.scratch_dir(resolution);
        let partial = partial_path(&output);
        let raw = if steps.is_empty() {
            partial.clone()
        } else {
            scratch.join(format!("audio_src.{}", track.raw_extension()))
        };
        self.ctx
            .stop
            .guard(self.ctx.tools.demuxer.extract(self.source(), track.track_id, &raw))
            .await
            .map_err(failed)?;

        let mut current = raw;
        let count = steps.len();
        for (i, (format, ext)) in steps.iter().enumerate() {
            let target = if i + 1 == count {
                partial.clone()
            } else {
                scratch.join(format!("audio_step{}.{}", i, ext))
            };
            self.convert(&current, &target, format).await.map_err(failed)?;
            if current != target && current.starts_with(&scratch) {
                let _ = std::fs::remove_file(&current);
            }
            current = target;
        }
        commit_partial(&partial, &output).map_err(failed)?;
        Ok(Some(done))
    }

    async fn convert(&self, input: &Path, output: &Path, format: &AudioFormat) -> Result<PathBuf> {
        self.ctx
            .stop
            .guard(self.ctx.tools.transcoder.convert_audio(input, output, format))
            .await
    }

    async fn search_quality(&self, task: &mut ResolutionTask, crop: CropGeometry, scratch: &Path) -> Result<u8> {
        let Some(band) = self.preset.bitrate_band else {
            info!(
                "{}: no bitrate band, using initial quality {}",
                self.log_prefix, self.preset.initial_quality
            );
            return Ok(self.preset.initial_quality);
        };
        let search = QualitySearch::new(
            self.ctx.tools.transcoder.as_ref(),
            self.ctx.tools.inspector.as_ref(),
            &self.ctx.cfg.quality_search,
        );
        let request = SearchRequest {
            source: self.source(),
            scratch_dir: scratch,
            width: self.preset.width,
            height: self.preset.height,
            crop,
            initial_quality: self.preset.initial_quality,
            band,
            duration_secs: self.ctx.analysis.duration_secs,
        };
        let outcome = self.ctx.stop.guard(search.run(&request)).await?;
        match outcome {
            SearchOutcome::Converged { iterations, .. } => task.search_iterations = iterations,
            SearchOutcome::Fallback {
                last_quality,
                last_bitrate_kbps,
                iterations,
                quality,
            } => {
                task.search_iterations = iterations;
                task.warn(
                    EncodeError::QualitySearchExhausted {
                        last_quality,
                        last_bitrate_kbps,
                        fallback: quality,
                    }
                    .to_string(),
                );
            }
        }
        Ok(outcome.quality())
    }

    async fn multiplex(
        &self,
        resolution: &str,
        video: &Path,
        audio: Option<&AudioOutput>,
        subtitles: &[SubtitleFile],
    ) -> Result<PathBuf> {
        let preferred = &self.ctx.cfg.preferred_language;
        let audio_is_preferred = audio
            .map(|a| is_language(a.language.as_deref(), preferred))
            .unwrap_or(false);

        let audio_tracks = audio
            .map(|a| {
                vec![MuxTrack {
                    path: a.path.clone(),
                    language: a.language.clone(),
                    name: Some(a.description.clone()),
                    default: true,
                }]
            })
            .unwrap_or_default();

        let subtitle_tracks = subtitles
            .iter()
            .enumerate()
            .map(|(i, sub)| MuxTrack {
                path: sub.path.clone(),
                language: sub.language.clone(),
                name: None,
                default: i == 0 && !audio_is_preferred && is_language(sub.language.as_deref(), preferred),
            })
            .collect();

        let request = MuxRequest {
            video: video.to_path_buf(),
            audio: audio_tracks,
            subtitles: subtitle_tracks,
            title: format!("{} [{}]", self.ctx.title, resolution),
            output: self.ctx.layout.muxed_path(resolution),
        };
        self.ctx.stop.guard(self.ctx.tools.muxer.mux(&request)).await
    }
}

/// Overall outcome from the terminal resolution states
pub fn job_outcome(tasks: &[&ResolutionTask], stopped: bool) -> JobOutcome {
    if stopped {
        return JobOutcome::Stopped;
    }
    if tasks.iter().any(|t| t.stage == Stage::Failed) {
        return JobOutcome::Failed;
    }
    let completed = tasks.iter().filter(|t| t.stage == Stage::Completed).count();
    if completed == 0 {
        return JobOutcome::Skipped;
    }
    if completed < tasks.len() || tasks.iter().any(|t| !t.warnings.is_empty()) {
        JobOutcome::CompletedWithWarnings
    } else {
        JobOutcome::Completed
    }
}

/// Shared collaborators for running whole jobs
#[derive(Clone)]
pub struct JobRunner {
    pub cfg: Arc<EncoderConfig>,
    pub tools: Toolchain,
    pub store: Arc<StatusStore>,
    pub lookup: Arc<dyn MetadataLookup>,
    pub titles: Arc<FilenameLookup>,
    pub notifier: Arc<dyn Notifier>,
}

impl JobRunner {
    /// Probe and classify the source, returning the job with its status record created
    pub async fn prepare(&self, source: &Path) -> Result<(EncodeJob, SourceAnalysis)> {
        let media = self.tools.inspector.probe(source).await?;
        let analysis = SourceFile::analyze(source, media, &self.cfg);
        let job = EncodeJob::new(analysis.source.clone());
        self.store.create(&job)?;
        info!(
            "Job {}: created for {} with {} resolution(s)",
            job.id,
            job.source_filename(),
            job.tasks.len()
        );
        Ok((job, analysis))
    }

    /// Process every resolution in order. One resolution failing never stops
    /// its siblings; a stop request ends the job.
    pub async fn run(&self, mut job: EncodeJob, analysis: SourceAnalysis, stop: StopSignal) -> JobOutcome {
        let layout = ArtifactLayout::new(&self.cfg.output_root, &analysis.source.path);
        let filename = job.source_filename();
        let title = resolve_title(self.lookup.as_ref(), &self.titles, &filename).await;
        info!("Job {}: title {}", job.id, title);

        let job_id = job.id.clone();
        let ctx = PipelineContext {
            job_id: &job_id,
            cfg: &self.cfg,
            tools: &self.tools,
            store: &self.store,
            layout: &layout,
            analysis: &analysis,
            title: &title,
            stop: &stop,
        };

        let order: Vec<String> = job.resolution_order().to_vec();
        let mut stopped = false;
        for (index, resolution) in order.iter().enumerate() {
            let Some(task) = job.tasks.get_mut(resolution) else {
                continue;
            };
            if stopped || stop.is_stopped() {
                stopped = true;
                skip_task(&self.store, &job_id, task, "stopped");
                continue;
            }
            let Some(preset) = self.cfg.preset(resolution) else {
                skip_task(&self.store, &job_id, task, "no preset configured");
                continue;
            };

            let pipeline = ResolutionPipeline::new(&ctx, preset, resolution, index);
            if let Err(EncodeError::Stopped) = pipeline.run(task).await {
                warn!("Job {}: stopped during {}", job_id, resolution);
                stopped = true;
            }
        }

        job.updated_at = chrono::Utc::now();
        let tasks: Vec<&ResolutionTask> = order.iter().filter_map(|r| job.tasks.get(r)).collect();
        let outcome = job_outcome(&tasks, stopped);
        if let Err(e) = self.store.set_outcome(&job_id, outcome) {
            error!("Job {}: failed to persist outcome: {}", job_id, e);
        }
        self.notifier.notify(&CompletionNotice {
            job_id: job_id.clone(),
            source_filename: filename,
            outcome,
        });
        outcome
    }
}

fn skip_task(store: &StatusStore, job_id: &str, task: &mut ResolutionTask, reason: &str) {
    if task.terminate(Stage::Skipped, reason).is_ok() {
        if let Err(e) = store.update_resolution(job_id, task) {
            error!("Job {}: failed to persist skip of {}: {}", job_id, task.resolution, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use crate::stop::stop_channel;
    use crate::testing::{band_mid, stream, test_runner, FakeTools, Recorder, SOURCE_NAME};

    struct Harness {
        runner: JobRunner,
        fake: Arc<FakeTools>,
        recorder: Arc<Recorder>,
        source: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness(fake: FakeTools) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(fake);
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(dir.path(), fake.clone(), recorder.clone());
        Harness {
            runner,
            fake,
            recorder,
            source: dir.path().join(SOURCE_NAME),
            _dir: dir,
        }
    }

    impl Harness {
        async fn run(&self) -> (String, JobOutcome) {
            let (job, analysis) = self.runner.prepare(&self.source).await.unwrap();
            let id = job.id.clone();
            let outcome = self.runner.run(job, analysis, StopSignal::never()).await;
            (id, outcome)
        }

        fn record(&self, job_id: &str) -> crate::status::JobRecord {
            self.runner.store.get(job_id).unwrap().unwrap()
        }
    }

    fn final_encoder<'a>(fake: &'a FakeTools, cfg: &'a EncoderConfig, stop: &'a StopSignal) -> FinalEncoder<'a> {
        FinalEncoder {
            transcoder: fake,
            inspector: fake,
            bounds: &cfg.quality_search,
            settings: &cfg.final_encode,
            stop,
            log_prefix: "Job test [720p]",
        }
    }

    fn template(dir: &Path) -> EncodeRequest {
        EncodeRequest {
            input: dir.join(SOURCE_NAME),
            output: dir.join("video.mkv"),
            crop: CropGeometry::default(),
            quality: 17,
            width: 1280,
            height: 720,
            trim: None,
        }
    }

    #[test]
    fn test_language_matching() {
        assert!(is_language(Some("eng"), "eng"));
        assert!(is_language(Some("EN"), "eng"));
        assert!(!is_language(Some("fre"), "eng"));
        assert!(!is_language(None, "eng"));
    }

    #[test]
    fn test_preferred_subtitles_first_in_stable_order() {
        let streams = vec![
            stream(3, StreamKind::Subtitle, "subrip", None, Some("fre")),
            stream(4, StreamKind::Subtitle, "subrip", None, Some("eng")),
            stream(5, StreamKind::Subtitle, "ass", None, Some("spa")),
            stream(6, StreamKind::Subtitle, "hdmv_pgs_subtitle", None, Some("eng")),
        ];
        let ids: Vec<u32> = order_subtitles(streams.iter(), "eng").iter().map(|s| s.index).collect();
        assert_eq!(ids, vec![4, 6, 3, 5]);
    }

    #[test]
    fn test_job_outcome_rules() {
        let mut done = ResolutionTask::new("720p");
        done.stage = Stage::Completed;
        let mut failed = ResolutionTask::new("576p");
        failed.stage = Stage::Failed;
        let mut skipped = ResolutionTask::new("480p");
        skipped.stage = Stage::Skipped;

        assert_eq!(job_outcome(&[&done], false), JobOutcome::Completed);
        assert_eq!(job_outcome(&[&done, &failed], false), JobOutcome::Failed);
        assert_eq!(job_outcome(&[&done, &skipped], false), JobOutcome::CompletedWithWarnings);
        assert_eq!(job_outcome(&[&skipped], false), JobOutcome::Skipped);
        assert_eq!(job_outcome(&[], false), JobOutcome::Skipped);
        assert_eq!(job_outcome(&[&done], true), JobOutcome::Stopped);
    }

    /// Five retries after the first encode, all out of band: six encodes, then failure
    #[tokio::test]
    async fn test_final_encode_budget_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig::default_config();
        let stop = StopSignal::never();
        let fake = FakeTools::new(Box::new(|_, _, _| 9000));

        let result = final_encoder(&fake, &cfg, &stop)
            .run(&template(dir.path()), Some(BitrateBand::new(5000, 7000)), false)
            .await;

        match result {
            Err(EncodeError::BitrateOutOfBandAfterFinalEncode { measured_kbps, attempts, .. }) => {
                assert_eq!(measured_kbps, 9000);
                assert_eq!(attempts, 6);
            }
            other => panic!("expected out-of-band failure, got {:?}", other),
        }
        let qualities: Vec<u8> = fake.encodes.lock().unwrap().iter().map(|e| e.0).collect();
        assert_eq!(qualities, vec![17, 18, 19, 20, 21, 22]);
    }

    #[tokio::test]
    async fn test_final_encode_corrects_toward_band() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig::default_config();
        let stop = StopSignal::never();
        // q=17 -> 8000, each step up removes 400 kbps
        let fake = FakeTools::new(Box::new(|q, _, _| 8000 - 400 * (q as u64 - 17)));

        let outcome = final_encoder(&fake, &cfg, &stop)
            .run(&template(dir.path()), Some(BitrateBand::new(5000, 7000)), false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FinalEncodeOutcome { quality: 20, bitrate_kbps: Some(6800), attempts: 4 }
        );
    }

    #[tokio::test]
    async fn test_final_encode_without_band_measures_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig::default_config();
        let stop = StopSignal::never();
        let fake = FakeTools::new(Box::new(|_, _, _| 12000));

        let outcome = final_encoder(&fake, &cfg, &stop)
            .run(&template(dir.path()), None, false)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.bitrate_kbps, Some(12000));
    }

    #[tokio::test]
    async fn test_final_encode_reuses_stamped_quality() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig::default_config();
        let stop = StopSignal::never();
        let fake = FakeTools::new(Box::new(|q, _, _| if q == 19 { 6500 } else { 8000 }));
        let video = dir.path().join("video.mkv");
        std::fs::write(&video, "19 1280 full").unwrap();
        write_stamp(&video, &EncodeStamp { quality: 19 }).unwrap();

        let outcome = final_encoder(&fake, &cfg, &stop)
            .run(&template(dir.path()), Some(BitrateBand::new(5000, 7000)), true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FinalEncodeOutcome { quality: 19, bitrate_kbps: Some(6500), attempts: 1 }
        );
        assert!(fake.encodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_final_encode_without_stamp_encodes_again() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig::default_config();
        let stop = StopSignal::never();
        let fake = FakeTools::in_band();
        let video = dir.path().join("video.mkv");
        std::fs::write(&video, "19 1280 full").unwrap();

        let outcome = final_encoder(&fake, &cfg, &stop)
            .run(&template(dir.path()), Some(BitrateBand::new(5000, 7000)), true)
            .await
            .unwrap();
        assert_eq!(outcome.quality, 17);
        assert_eq!(fake.encodes.lock().unwrap().as_slice(), &[(17, 1280, false)]);
        assert_eq!(read_stamp(&video), Some(EncodeStamp { quality: 17 }));
        assert!(!partial_path(&video).exists());
    }

    #[tokio::test]
    async fn test_full_run_completes_every_resolution() {
        let h = harness(FakeTools::in_band());
        let (job_id, outcome) = h.run().await;
        assert_eq!(outcome, JobOutcome::Completed);

        let record = h.record(&job_id);
        assert_eq!(record.outcome, Some(JobOutcome::Completed));
        assert_eq!(record.resolutions.len(), 3);
        for status in record.resolutions.values() {
            assert_eq!(status.stage, Stage::Completed);
            assert_eq!(status.progress, 100);
        }

        // subtitles once for the title, audio once per resolution
        let extracts = h.fake.extracts.lock().unwrap().clone();
        assert_eq!(extracts.iter().filter(|t| **t == 1).count(), 3);
        assert_eq!(extracts.iter().filter(|t| **t == 3 || **t == 4).count(), 2);

        let conversions = h.fake.conversions.lock().unwrap().clone();
        assert_eq!(conversions[0], AudioFormat::Surround { bitrate_kbps: 640, channels: 6 });
        assert_eq!(conversions[1], AudioFormat::Surround { bitrate_kbps: 448, channels: 6 });

        let muxes = h.fake.muxes.lock().unwrap().clone();
        assert_eq!(muxes.len(), 3);
        let first = &muxes[0];
        assert_eq!(first.title, "Heat (1995) [720p]");
        assert!(first.audio[0].default);
        assert_eq!(first.audio[0].language.as_deref(), Some("fre"));
        // English subtitle leads and is default because the audio is French
        assert_eq!(first.subtitles[0].language.as_deref(), Some("eng"));
        assert!(first.subtitles[0].default);
        assert!(!first.subtitles[1].default);

        let layout = ArtifactLayout::new(&h.runner.cfg.output_root, &h.source);
        for res in ["720p", "576p", "480p"] {
            assert!(artifact_ready(&layout.muxed_path(res)));
            assert!(artifact_ready(&layout.document_path(res)));
            assert!(layout.screenshots_dir(res).join("shot_3.png").exists());
        }
        let doc = std::fs::read_to_string(layout.document_path("720p")).unwrap();
        assert!(doc.contains("Crop (t:b:l:r): 20:20:0:0"));

        let notices = h.recorder.notices.lock().unwrap().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].source_filename, SOURCE_NAME);
        assert_eq!(notices[0].outcome, JobOutcome::Completed);
    }

    /// One resolution exhausting its encode budget leaves its siblings alone
    #[tokio::test]
    async fn test_failed_resolution_does_not_abort_siblings() {
        let h = harness(FakeTools::new(Box::new(|_, width, preview| {
            if width == 1280 && !preview {
                9000
            } else {
                band_mid(width)
            }
        })));
        let (job_id, outcome) = h.run().await;
        assert_eq!(outcome, JobOutcome::Failed);
        assert_eq!(h.fake.full_encodes(1280), 6);

        let record = h.record(&job_id);
        let failed = &record.resolutions["720p"];
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.progress, 50);
        assert!(failed.reason.as_deref().unwrap().contains("after 6 encodes"));
        assert_eq!(record.resolutions["576p"].stage, Stage::Completed);
        assert_eq!(record.resolutions["480p"].stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_black_source_skips_resolutions() {
        let mut fake = FakeTools::in_band();
        fake.black_frames = true;
        let h = harness(fake);
        let (job_id, outcome) = h.run().await;
        assert_eq!(outcome, JobOutcome::Skipped);

        let record = h.record(&job_id);
        for status in record.resolutions.values() {
            assert_eq!(status.stage, Stage::Skipped);
            assert_eq!(status.progress, 20);
        }
        assert!(h.fake.encodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audio_failure_muxes_without_audio() {
        let mut fake = FakeTools::in_band();
        fake.fail_audio_extract = true;
        let h = harness(fake);
        let (job_id, outcome) = h.run().await;
        assert_eq!(outcome, JobOutcome::CompletedWithWarnings);

        let muxes = h.fake.muxes.lock().unwrap().clone();
        assert!(muxes.iter().all(|m| m.audio.is_empty()));
        let record = h.record(&job_id);
        let status = &record.resolutions["720p"];
        assert_eq!(status.stage, Stage::Completed);
        assert!(status.warnings.iter().any(|w| w.starts_with("audio extraction failed")));
    }

    #[tokio::test]
    async fn test_stop_during_final_encode() {
        let fake = FakeTools::in_band();
        fake.slow_full_encode.store(true, Ordering::SeqCst);
        let h = harness(fake);
        let (job, analysis) = h.runner.prepare(&h.source).await.unwrap();
        let job_id = job.id.clone();

        let (handle, signal) = stop_channel();
        let runner = h.runner.clone();
        let running = tokio::spawn(async move { runner.run(job, analysis, signal).await });

        let mut reached = false;
        for _ in 0..500 {
            let record = h.record(&job_id);
            if record.resolutions["720p"].stage == Stage::FinalEncoding {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reached);
        handle.stop();

        assert_eq!(running.await.unwrap(), JobOutcome::Stopped);
        let record = h.record(&job_id);
        assert_eq!(record.resolutions["720p"].stage, Stage::Failed);
        assert_eq!(record.resolutions["720p"].reason.as_deref(), Some("stopped"));
        assert_eq!(record.resolutions["576p"].stage, Stage::Skipped);
        assert_eq!(record.resolutions["480p"].stage, Stage::Skipped);
        assert_eq!(record.outcome, Some(JobOutcome::Stopped));
    }

    /// A stop mid-encode leaves only a partial file; the rerun encodes again
    #[tokio::test]
    async fn test_rerun_after_stop_encodes_again() {
        let fake = FakeTools::in_band();
        fake.slow_full_encode.store(true, Ordering::SeqCst);
        let h = harness(fake);
        let (job, analysis) = h.runner.prepare(&h.source).await.unwrap();
        let job_id = job.id.clone();

        let (handle, signal) = stop_channel();
        let runner = h.runner.clone();
        let running = tokio::spawn(async move { runner.run(job, analysis, signal).await });

        let layout = ArtifactLayout::new(&h.runner.cfg.output_root, &h.source);
        let video = layout.video_path("720p");
        let mut reached = false;
        for _ in 0..500 {
            if h.record(&job_id).resolutions["720p"].stage == Stage::FinalEncoding
                && partial_path(&video).exists()
            {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reached);
        handle.stop();
        assert_eq!(running.await.unwrap(), JobOutcome::Stopped);
        assert!(!video.exists());
        assert!(read_stamp(&video).is_none());

        h.fake.slow_full_encode.store(false, Ordering::SeqCst);
        let (job_id, outcome) = h.run().await;
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(h.fake.full_encodes(1280), 1);
        assert!(artifact_ready(&video));
        assert!(!partial_path(&video).exists());
        assert_eq!(h.record(&job_id).resolutions["720p"].stage, Stage::Completed);
        assert!(read_stamp(&video).is_some());
    }

    #[tokio::test]
    async fn test_rerun_reuses_finished_artifacts() {
        let h = harness(FakeTools::in_band());
        let (_, first) = h.run().await;
        assert_eq!(first, JobOutcome::Completed);
        let extracts_before = h.fake.extracts.lock().unwrap().len();
        assert_eq!(h.fake.full_encodes(1280), 1);

        let (_, second) = h.run().await;
        assert_eq!(second, JobOutcome::Completed);
        assert_eq!(h.fake.full_encodes(1280), 1);
        assert_eq!(h.fake.extracts.lock().unwrap().len(), extracts_before);
    }
}
