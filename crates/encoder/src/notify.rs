use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinSet;

/// Terminal outcome of a whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    CompletedWithWarnings,
    /// At least one resolution failed
    Failed,
    /// Nothing was encoded
    Skipped,
    Stopped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::CompletedWithWarnings => "completed_with_warnings",
            JobOutcome::Failed => "failed",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionNotice {
    pub job_id: String,
    pub source_filename: String,
    pub outcome: JobOutcome,
}

/// Completion hook; implementations never fail the job. Work started by
/// `notify` must be finished once `flush` returns.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &CompletionNotice);

    async fn flush(&self) {}
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &CompletionNotice) {
        let icon = match notice.outcome {
            JobOutcome::Completed => "✅",
            JobOutcome::CompletedWithWarnings => "⚠️",
            JobOutcome::Failed => "❌",
            JobOutcome::Skipped => "⏭️",
            JobOutcome::Stopped => "🛑",
        };
        info!(
            "{} Job {}: {} finished: {}",
            icon, notice.job_id, notice.source_filename, notice.outcome
        );
    }
}

/// Runs a user program with the notice in its environment. Runs are
/// tracked until `flush` collects them.
pub struct CommandNotifier {
    program: PathBuf,
    pending: Mutex<JoinSet<()>>,
}

impl CommandNotifier {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn command(&self, notice: &CompletionNotice) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("AUTOENC_JOB_ID", &notice.job_id)
            .env("AUTOENC_SOURCE", &notice.source_filename)
            .env("AUTOENC_STATUS", notice.outcome.as_str());
        cmd
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    fn notify(&self, notice: &CompletionNotice) {
        let mut cmd = self.command(notice);
        let program = self.program.clone();
        let job_id = notice.job_id.clone();
        self.pending().spawn(async move {
            match cmd.status().await {
                Ok(status) if status.success() => {
                    debug!("Job {}: notify command {} done", job_id, program.display())
                }
                Ok(status) => warn!(
                    "Job {}: notify command {} exited with {}",
                    job_id,
                    program.display(),
                    status
                ),
                Err(e) => warn!(
                    "Job {}: failed to run notify command {}: {}",
                    job_id,
                    program.display(),
                    e
                ),
            }
        });
    }

    async fn flush(&self) {
        let mut runs = std::mem::take(&mut *self.pending());
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                warn!("Notify command {} task failed: {}", self.program.display(), e);
            }
        }
    }
}

/// Delivers one notice to several notifiers
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Log plus the configured hook program, if any
    pub fn from_command(command: Option<PathBuf>) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if let Some(program) = command {
            notifiers.push(Arc::new(CommandNotifier::new(program)));
        }
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    fn notify(&self, notice: &CompletionNotice) {
        for notifier in &self.notifiers {
            notifier.notify(notice);
        }
    }

    async fn flush(&self) {
        for notifier in &self.notifiers {
            notifier.flush().await;
        }
    }
}
