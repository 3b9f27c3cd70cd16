use thiserror::Error;

use crate::llm::SafetyCategory;
use crate::style::StoreError;

/// Terminal outcomes of the style and generation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("style extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("prompt sanitization failed: {0}")]
    SanitizationFailed(String),
    #[error("image generation failed: {0}")]
    GenerationFailed(String),
    #[error("image blocked by safety filter after {attempts} attempts ({category}): {reason}")]
    SafetyBlockExhausted {
        attempts: usize,
        category: SafetyCategory,
        reason: String,
    },
    #[error("generation deadline expired after {attempts} attempts")]
    Timeout { attempts: usize },
    #[error("style profile is corrupt: {0}")]
    StyleCorrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("upload failed: {0}")]
    Upload(String),
}

impl PipelineError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "INVALID_REQUEST",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::ExtractionFailed(_) => "EXTRACTION_FAILED",
            PipelineError::SanitizationFailed(_) => "SANITIZATION_FAILED",
            PipelineError::GenerationFailed(_) => "GENERATION_FAILED",
            PipelineError::SafetyBlockExhausted { .. } => "IMAGE_BLOCKED",
            PipelineError::Timeout { .. } => "TIMEOUT",
            PipelineError::StyleCorrupt(_) => "STYLE_CORRUPT",
            PipelineError::Storage(_) => "STORAGE_ERROR",
            PipelineError::Upload(_) => "UPLOAD_FAILED",
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(story_id) => {
                PipelineError::NotFound(format!("no style profile for story `{story_id}`"))
            }
            StoreError::InvalidId(_) => PipelineError::InvalidRequest(err.to_string()),
            StoreError::Corrupt { .. } => PipelineError::StyleCorrupt(err.to_string()),
            StoreError::Io { .. } => PipelineError::Storage(err.to_string()),
        }
    }
}
