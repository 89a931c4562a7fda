use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::classifier::SourceTier;
use crate::config::EncoderConfig;
use crate::error::Result;
use crate::job::{EncodeJob, ResolutionTask, Stage};
use crate::notify::JobOutcome;

/// Last known state of one resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStatus {
    pub stage: Stage,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ResolutionStatus {
    fn from_task(task: &ResolutionTask) -> Self {
        Self {
            stage: task.stage,
            progress: task.progress,
            updated_at: Utc::now(),
            warnings: task.warnings.clone(),
            reason: task.reason.clone(),
        }
    }
}

/// Persisted record of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub filename: String,
    pub source_path: PathBuf,
    pub tier: SourceTier,
    pub resolutions: BTreeMap<String, ResolutionStatus>,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Stop,
}

/// Cross-process request dropped into the command directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFile {
    pub action: CommandAction,
    pub job_id: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Job status JSON files, one per job id
pub struct StatusStore {
    dir: PathBuf,
    command_dir: PathBuf,
    write_lock: Mutex<()>,
}

/// Write through a temp file so readers never see a half-written record
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl StatusStore {
    pub fn new(dir: PathBuf, command_dir: PathBuf) -> Self {
        Self {
            dir,
            command_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self::new(cfg.job_state_dir.clone(), cfg.command_dir())
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    fn command_path(&self, job_id: &str) -> PathBuf {
        self.command_dir.join(format!("{}.json", job_id))
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(&record.job_id), &json)
    }

    /// Read-modify-write of one record under the store lock
    fn modify<F>(&self, job_id: &str, change: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.get(job_id)?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no status record for job {}", job_id))
        })?;
        change(&mut record);
        record.updated_at = Utc::now();
        self.save(&record)?;
        Ok(record)
    }

    /// Initial record: every resolution Pending at 0%
    pub fn create(&self, job: &EncodeJob) -> Result<JobRecord> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let record = JobRecord {
            job_id: job.id.clone(),
            filename: job.source_filename(),
            source_path: job.source.path.clone(),
            tier: job.source.tier,
            resolutions: job
                .tasks
                .iter()
                .map(|(label, task)| (label.clone(), ResolutionStatus::from_task(task)))
                .collect(),
            outcome: None,
            created_at: job.created_at,
            updated_at: Utc::now(),
        };
        self.save(&record)?;
        debug!("Job {}: status record created", job.id);
        Ok(record)
    }

    pub fn update_resolution(&self, job_id: &str, task: &ResolutionTask) -> Result<()> {
        self.modify(job_id, |record| {
            record
                .resolutions
                .insert(task.resolution.clone(), ResolutionStatus::from_task(task));
        })?;
        Ok(())
    }

    pub fn set_outcome(&self, job_id: &str, outcome: JobOutcome) -> Result<()> {
        self.modify(job_id, |record| record.outcome = Some(outcome))?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let path = self.record_path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// All readable records, oldest first; unreadable files are skipped
    pub fn load_all(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        if !self.dir.exists() {
            return Ok(records);
        }

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") || !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(crate::error::EncodeError::from)
                .and_then(|c| serde_json::from_str::<JobRecord>(&c).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable status file {}: {}", path.display(), e),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub fn write_stop_command(&self, job_id: &str, reason: Option<String>) -> Result<()> {
        fs::create_dir_all(&self.command_dir)?;
        let command = CommandFile {
            action: CommandAction::Stop,
            job_id: job_id.to_string(),
            reason,
            timestamp: Utc::now(),
        };
        write_atomic(&self.command_path(job_id), &serde_json::to_vec_pretty(&command)?)
    }

    /// Read and remove a pending command for this job
    pub fn take_command(&self, job_id: &str) -> Result<Option<CommandFile>> {
        let path = self.command_path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        fs::remove_file(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SourceFile;

    fn store(dir: &Path) -> StatusStore {
        StatusStore::new(dir.join("jobs"), dir.join("jobs/commands"))
    }

    fn job() -> EncodeJob {
        EncodeJob::new(SourceFile {
            path: PathBuf::from("/in/Heat.1995.BluRay.mkv"),
            tier: SourceTier::Optical,
            resolutions: vec!["720p".to_string(), "576p".to_string()],
        })
    }

    #[test]
    fn test_create_then_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let job = job();
        store.create(&job).unwrap();

        let record = store.get(&job.id).unwrap().unwrap();
        assert_eq!(record.filename, "Heat.1995.BluRay.mkv");
        assert_eq!(record.resolutions.len(), 2);
        assert!(record.resolutions.values().all(|r| r.stage == Stage::Pending && r.progress == 0));

        let mut task = job.tasks["720p"].clone();
        task.advance(Stage::CropDetected).unwrap();
        store.update_resolution(&job.id, &task).unwrap();

        let record = store.get(&job.id).unwrap().unwrap();
        assert_eq!(record.resolutions["720p"].stage, Stage::CropDetected);
        assert_eq!(record.resolutions["720p"].progress, 30);
        assert_eq!(record.resolutions["576p"].stage, Stage::Pending);
        assert!(!record.is_finished());

        store.set_outcome(&job.id, JobOutcome::Failed).unwrap();
        assert_eq!(store.get(&job.id).unwrap().unwrap().outcome, Some(JobOutcome::Failed));
        assert!(!dir.path().join("jobs").join(format!("{}.json.tmp", job.id)).exists());
    }

    #[test]
    fn test_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.get("missing").unwrap().is_none());
        let task = ResolutionTask::new("720p");
        assert!(store.update_resolution("missing", &task).is_err());
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let first = job();
        let second = job();
        store.create(&first).unwrap();
        store.create(&second).unwrap();
        fs::write(dir.path().join("jobs/broken.json"), "{not json").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_stop_command_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write_stop_command("job-1", Some("user request".to_string())).unwrap();

        let command = store.take_command("job-1").unwrap().unwrap();
        assert_eq!(command.action, CommandAction::Stop);
        assert_eq!(command.reason.as_deref(), Some("user request"));
        assert!(store.take_command("job-1").unwrap().is_none());
    }
}
