//! Capability interfaces for the external model services.
//!
//! The pipeline only talks to these traits; `gemini` binds them to Google's
//! Generative Language API and tests bind them to deterministic stubs.

pub mod gemini;
pub mod media;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use gemini::GeminiClient;

/// Content categories the image service may block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    Violence,
    Sexual,
    Derogatory,
    Toxic,
    /// The service refused without naming one of the four categories.
    Unspecified,
}

impl SafetyCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyCategory::Violence => "violence",
            SafetyCategory::Sexual => "sexual",
            SafetyCategory::Derogatory => "derogatory",
            SafetyCategory::Toxic => "toxic",
            SafetyCategory::Unspecified => "unspecified",
        }
    }

    /// Maps a free-text filter reason onto a category.
    pub fn classify(reason: &str) -> Self {
        const RULES: &[(SafetyCategory, &[&str])] = &[
            (
                SafetyCategory::Violence,
                &["violen", "gore", "gory", "weapon", "blood", "dangerous"],
            ),
            (
                SafetyCategory::Sexual,
                &["sexual", "sexually", "nudity", "explicit", "adult content"],
            ),
            (
                SafetyCategory::Derogatory,
                &["derogatory", "hate", "harass", "insult", "discriminat"],
            ),
            (SafetyCategory::Toxic, &["toxic", "profanity", "vulgar", "obscen"]),
        ];

        let lowered = reason.to_lowercase();
        RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|keyword| lowered.contains(keyword)))
            .map(|(category, _)| *category)
            .unwrap_or(SafetyCategory::Unspecified)
    }
}

impl std::fmt::Display for SafetyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmSeverity {
    Low,
    Medium,
    High,
}

/// Sensitivity requested from the image service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyThreshold {
    BlockLowAndAbove,
    BlockMediumAndAbove,
    BlockOnlyHigh,
}

impl SafetyThreshold {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "block_low_and_above" | "block_most" => Some(SafetyThreshold::BlockLowAndAbove),
            "block_medium_and_above" | "block_some" => Some(SafetyThreshold::BlockMediumAndAbove),
            "block_only_high" | "block_few" => Some(SafetyThreshold::BlockOnlyHigh),
            _ => None,
        }
    }

    pub fn as_api_str(self) -> &'static str {
        match self {
            SafetyThreshold::BlockLowAndAbove => "block_low_and_above",
            SafetyThreshold::BlockMediumAndAbove => "block_medium_and_above",
            SafetyThreshold::BlockOnlyHigh => "block_only_high",
        }
    }

    /// Lowest severity the service rejects at this threshold.
    pub fn blocked_severity(self) -> HarmSeverity {
        match self {
            SafetyThreshold::BlockLowAndAbove => HarmSeverity::Low,
            SafetyThreshold::BlockMediumAndAbove => HarmSeverity::Medium,
            SafetyThreshold::BlockOnlyHigh => HarmSeverity::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyRejection {
    pub category: SafetyCategory,
    pub severity: HarmSeverity,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StyleAnalysis {
    #[serde(default)]
    pub mood: Vec<String>,
    #[serde(default)]
    pub visual_style: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Request(String),
    #[error("inference service returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("inference prompt was blocked: {0}")]
    Blocked(String),
    #[error("inference service returned an empty response")]
    EmptyResponse,
    #[error("inference response could not be parsed: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ImageGenerationError {
    #[error("image blocked by safety filter ({}): {}", .0.category, .0.reason)]
    SafetyBlocked(SafetyRejection),
    #[error("image generation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait StyleInference: Send + Sync {
    async fn infer_style(
        &self,
        text: &str,
        title: Option<&str>,
    ) -> Result<StyleAnalysis, InferenceError>;
}

#[async_trait]
pub trait PromptRewriter: Send + Sync {
    async fn infer_sanitized_prompt(
        &self,
        prompt: &str,
        reason: Option<&str>,
    ) -> Result<String, InferenceError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> Result<ImageBytes, ImageGenerationError>;
}
