pub mod artifacts;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod crop;
pub mod document;
pub mod error;
pub mod ffmpeg;
pub mod ffprobe;
pub mod job;
pub mod mkvtoolnix;
pub mod notify;
pub mod pipeline;
pub mod process;
pub mod quality;
pub mod scan;
pub mod screenshot;
pub mod status;
pub mod stop;
pub mod tools;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::EncoderConfig;
pub use error::{EncodeError, Result};
pub use job::{EncodeJob, ResolutionTask, Stage};
pub use notify::JobOutcome;
pub use status::{JobRecord, StatusStore};
pub use worker::JobManager;
