//! Background job driver. Jobs are queued on a single permit so only one
//! encodes at a time, while status stays readable from the store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::{watch, Semaphore};
use crate::config::EncoderConfig;
use crate::document::FilenameLookup;
use crate::error::Result;
use crate::ffmpeg::{FfmpegFrameGrabber, FfmpegTranscoder};
use crate::ffprobe::FfprobeInspector;
use crate::mkvtoolnix::{MkvExtract, MkvMerge};
use crate::notify::{JobOutcome, Notifier, NotifierSet};
use crate::pipeline::JobRunner;
use crate::status::{CommandAction, JobRecord, StatusStore};
use crate::stop::{stop_channel, StopHandle};
use crate::tools::Toolchain;

type ActiveJobs = Arc<Mutex<HashMap<String, ActiveJob>>>;

/// A job running in this process. The entry lives exactly as long as the
/// job's task.
struct ActiveJob {
    stop: StopHandle,
    finished: watch::Receiver<Option<JobOutcome>>,
}

/// Drops the job's entry when its task ends, panics included
struct Deregister {
    jobs: ActiveJobs,
    job_id: String,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        lock_jobs(&self.jobs).remove(&self.job_id);
    }
}

fn lock_jobs(jobs: &Mutex<HashMap<String, ActiveJob>>) -> std::sync::MutexGuard<'_, HashMap<String, ActiveJob>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct JobManager {
    runner: JobRunner,
    permits: Arc<Semaphore>,
    jobs: ActiveJobs,
}

impl JobManager {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(1)),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Manager over the real external tools named in `cfg`
    pub fn from_config(cfg: EncoderConfig) -> Result<Self> {
        let tools = Toolchain {
            transcoder: Arc::new(FfmpegTranscoder::from_config(&cfg)),
            inspector: Arc::new(FfprobeInspector::new(cfg.ffprobe_bin.clone())),
            demuxer: Arc::new(MkvExtract::new(cfg.mkvextract_bin.clone())),
            muxer: Arc::new(MkvMerge::new(cfg.mkvmerge_bin.clone())),
            frames: Arc::new(FfmpegFrameGrabber::new(cfg.ffmpeg_bin.clone())),
        };
        let titles = Arc::new(FilenameLookup::new()?);
        let notifier = Arc::new(NotifierSet::from_command(cfg.notify_command.clone()));
        let store = Arc::new(StatusStore::from_config(&cfg));
        Ok(Self::new(JobRunner {
            cfg: Arc::new(cfg),
            tools,
            store,
            lookup: titles.clone(),
            titles,
            notifier,
        }))
    }

    pub fn store(&self) -> &StatusStore {
        &self.runner.store
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveJob>> {
        lock_jobs(&self.jobs)
    }

    /// Jobs of this process that have not finished yet
    pub fn active_jobs(&self) -> usize {
        self.jobs().len()
    }

    /// Probe and register `source`, then run it in the background. Returns
    /// as soon as the status record exists.
    pub async fn start_job(&self, source: &Path) -> Result<String> {
        let (job, analysis) = self.runner.prepare(source).await?;
        let job_id = job.id.clone();
        let (handle, signal) = stop_channel();

        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let poller = tokio::spawn(poll_commands(
            self.runner.store.clone(),
            job_id.clone(),
            handle.clone(),
            Duration::from_secs(self.runner.cfg.stop_poll_secs.max(1)),
        ));
        let (done, finished) = watch::channel(None);
        self.jobs().insert(
            job_id.clone(),
            ActiveJob {
                stop: handle,
                finished,
            },
        );
        let deregister = Deregister {
            jobs: self.jobs.clone(),
            job_id: job_id.clone(),
        };
        let id = job_id.clone();
        tokio::spawn(async move {
            let deregister = deregister;
            // a closed semaphore never happens; run unqueued if it does
            let _permit = permits.acquire_owned().await.ok();
            debug!("Job {}: acquired worker slot", id);
            let outcome = runner.run(job, analysis, signal).await;
            poller.abort();
            // gone from the table before waiters wake; they read the store from here on
            drop(deregister);
            done.send_replace(Some(outcome));
        });
        Ok(job_id)
    }

    pub fn get_status(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.runner.store.get(job_id)
    }

    /// Request a stop. Jobs owned by this process are signalled directly;
    /// unfinished jobs of another process get a command file. Returns
    /// whether a request was made.
    pub fn stop_job(&self, job_id: &str, reason: Option<String>) -> Result<bool> {
        if let Some(active) = self.jobs().get(job_id) {
            info!(
                "Job {}: stop requested ({})",
                job_id,
                reason.as_deref().unwrap_or("no reason given")
            );
            active.stop.stop();
            return Ok(true);
        }
        match self.runner.store.get(job_id)? {
            Some(record) if !record.is_finished() => {
                self.runner.store.write_stop_command(job_id, reason)?;
                info!("Job {}: stop command written", job_id);
                Ok(true)
            }
            Some(_) => {
                warn!("Job {}: already finished", job_id);
                Ok(false)
            }
            None => {
                warn!("Job {}: unknown job", job_id);
                Ok(false)
            }
        }
    }

    /// Wait for a job to finish, including its completion hooks. Jobs that
    /// already finished answer from the store. `None` when the job is
    /// unknown, or its task ended without an outcome.
    pub async fn wait(&self, job_id: &str) -> Option<JobOutcome> {
        let finished = self.jobs().get(job_id).map(|a| a.finished.clone());
        let outcome = match finished {
            Some(mut finished) => match finished.wait_for(Option::is_some).await {
                Ok(outcome) => *outcome,
                // sender dropped without an outcome: the task panicked
                Err(_) => self.recorded_outcome(job_id),
            },
            None => self.recorded_outcome(job_id),
        };
        self.runner.notifier.flush().await;
        outcome
    }

    fn recorded_outcome(&self, job_id: &str) -> Option<JobOutcome> {
        match self.runner.store.get(job_id) {
            Ok(record) => record.and_then(|r| r.outcome),
            Err(e) => {
                warn!("Job {}: unreadable status record: {}", job_id, e);
                None
            }
        }
    }
}

/// Turn a stop command file for `job_id` into an in-process stop
async fn poll_commands(store: Arc<StatusStore>, job_id: String, handle: StopHandle, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        match store.take_command(&job_id) {
            Ok(Some(command)) if command.action == CommandAction::Stop => {
                info!(
                    "Job {}: stop command received ({})",
                    job_id,
                    command.reason.as_deref().unwrap_or("no reason given")
                );
                handle.stop();
                return;
            }
            Ok(_) => {}
            Err(e) => warn!("Job {}: unreadable command file: {}", job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Stage;
    use std::sync::atomic::Ordering;
    use crate::testing::{test_runner, FakeTools, Recorder, SOURCE_NAME};

    struct Setup {
        manager: JobManager,
        recorder: Arc<Recorder>,
        source: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn setup(fake: FakeTools) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(dir.path(), Arc::new(fake), recorder.clone());
        Setup {
            manager: JobManager::new(runner),
            recorder,
            source: dir.path().join(SOURCE_NAME),
            _dir: dir,
        }
    }

    async fn wait_for_stage(manager: &JobManager, job_id: &str, resolution: &str, stage: Stage) -> bool {
        for _ in 0..500 {
            let record = manager.get_status(job_id).unwrap().unwrap();
            if record.resolutions[resolution].stage == stage {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_returns_before_completion() {
        let s = setup(FakeTools::in_band());
        let job_id = s.manager.start_job(&s.source).await.unwrap();

        let record = s.manager.get_status(&job_id).unwrap().unwrap();
        assert_eq!(record.filename, SOURCE_NAME);
        assert_eq!(record.resolutions.len(), 3);

        assert_eq!(s.manager.wait(&job_id).await, Some(JobOutcome::Completed));
        let record = s.manager.get_status(&job_id).unwrap().unwrap();
        assert!(record.is_finished());
        assert!(record.resolutions.values().all(|r| r.progress == 100));
        assert_eq!(s.recorder.notices.lock().unwrap().len(), 1);
        // answered from the store once the job is gone
        assert_eq!(s.manager.wait(&job_id).await, Some(JobOutcome::Completed));
        assert_eq!(s.manager.wait("missing").await, None);
    }

    #[tokio::test]
    async fn test_finished_job_leaves_active_table() {
        let s = setup(FakeTools::in_band());
        let job_id = s.manager.start_job(&s.source).await.unwrap();
        assert_eq!(s.manager.active_jobs(), 1);

        // nobody waits; the task clears its own entry
        let mut cleared = false;
        for _ in 0..500 {
            if s.manager.active_jobs() == 0 {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cleared);
        assert!(s.manager.get_status(&job_id).unwrap().unwrap().is_finished());
        assert!(!s.manager.stop_job(&job_id, None).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_includes_completion_hook() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("notified");
        let hook = crate::testing::marker_hook(dir.path(), &marker);
        let notifier = Arc::new(NotifierSet::from_command(Some(hook)));
        let manager = JobManager::new(test_runner(dir.path(), Arc::new(FakeTools::in_band()), notifier));

        let job_id = manager.start_job(&dir.path().join(SOURCE_NAME)).await.unwrap();
        assert_eq!(manager.wait(&job_id).await, Some(JobOutcome::Completed));
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "completed");
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time() {
        let fake = FakeTools::in_band();
        fake.slow_full_encode.store(true, Ordering::SeqCst);
        let s = setup(fake);
        let first = s.manager.start_job(&s.source).await.unwrap();
        let second = s.manager.start_job(&s.source).await.unwrap();

        assert!(wait_for_stage(&s.manager, &first, "720p", Stage::FinalEncoding).await);
        let queued = s.manager.get_status(&second).unwrap().unwrap();
        assert!(queued.resolutions.values().all(|r| r.stage == Stage::Pending));

        assert!(s.manager.stop_job(&first, None).unwrap());
        assert!(s.manager.stop_job(&second, None).unwrap());
        assert_eq!(s.manager.wait(&first).await, Some(JobOutcome::Stopped));
        assert_eq!(s.manager.wait(&second).await, Some(JobOutcome::Stopped));

        let second = s.manager.get_status(&second).unwrap().unwrap();
        assert!(second.resolutions.values().all(|r| r.stage == Stage::Skipped));
    }

    #[tokio::test]
    async fn test_command_file_stops_running_job() {
        let fake = FakeTools::in_band();
        fake.slow_full_encode.store(true, Ordering::SeqCst);
        let s = setup(fake);
        let job_id = s.manager.start_job(&s.source).await.unwrap();
        assert!(wait_for_stage(&s.manager, &job_id, "720p", Stage::FinalEncoding).await);

        // as written by `autoenc stop` from another process
        s.manager
            .store()
            .write_stop_command(&job_id, Some("disk full".to_string()))
            .unwrap();
        assert_eq!(s.manager.wait(&job_id).await, Some(JobOutcome::Stopped));

        let record = s.manager.get_status(&job_id).unwrap().unwrap();
        assert_eq!(record.resolutions["720p"].stage, Stage::Failed);
        assert_eq!(record.resolutions["720p"].reason.as_deref(), Some("stopped"));
        assert!(s.manager.store().take_command(&job_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_or_finished_job() {
        let s = setup(FakeTools::in_band());
        assert!(!s.manager.stop_job("missing", None).unwrap());

        let job_id = s.manager.start_job(&s.source).await.unwrap();
        s.manager.wait(&job_id).await;
        assert!(!s.manager.stop_job(&job_id, None).unwrap());
    }
}
