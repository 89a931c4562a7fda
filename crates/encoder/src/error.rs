use thiserror::Error;

/// Errors raised while driving a job through its resolutions
#[derive(Debug, Error)]
pub enum EncodeError {
    /// External tool exited nonzero, could not be spawned, or produced no output
    #[error("{tool} failed: {detail}")]
    ToolInvocationFailed { tool: String, detail: String },

    /// Every crop sample was degenerate (no picture content found)
    #[error("crop detection failed: all {samples} sampled frames were degenerate")]
    CropDetectionFailed { samples: usize },

    /// A preview segment could not be encoded or measured
    #[error("quality search failed: {0}")]
    QualitySearchFailed(String),

    /// Search left the quality bounds without converging (non-fatal)
    #[error("quality search exhausted at q={last_quality} ({last_bitrate_kbps} kbps), falling back to q={fallback}")]
    QualitySearchExhausted {
        last_quality: u8,
        last_bitrate_kbps: u64,
        fallback: u8,
    },

    #[error("full-file bitrate {measured_kbps} kbps outside [{min_kbps}, {max_kbps}] after {attempts} encodes")]
    BitrateOutOfBandAfterFinalEncode {
        measured_kbps: u64,
        min_kbps: u64,
        max_kbps: u64,
        attempts: u32,
    },

    #[error("audio extraction failed: {0}")]
    AudioExtractionFailed(String),

    #[error("metadata lookup failed: {0}")]
    MetadataLookupFailed(String),

    #[error("stopped by request")]
    Stopped,

    #[error(transparent)]
    Transition(#[from] crate::job::InvalidTransition),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How an error settles the resolution it happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Failed,
    Skipped,
}

impl EncodeError {
    pub fn tool(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        EncodeError::ToolInvocationFailed {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    /// Crop detection failures skip the resolution; everything else fails it.
    pub fn fate(&self) -> Fate {
        match self {
            EncodeError::CropDetectionFailed { .. } => Fate::Skipped,
            _ => Fate::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, EncodeError>;
