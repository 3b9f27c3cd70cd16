//! Deterministic stand-ins for the model services and the profile store.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::llm::{
    HarmSeverity, ImageBytes, ImageGenerationError, ImageGenerator, InferenceError,
    PromptRewriter, SafetyCategory, SafetyRejection, StyleAnalysis, StyleInference,
};
use crate::style::{StoreError, StyleProfile, StyleStore};

pub const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub fn gothic_profile(story_id: &str) -> StyleProfile {
    StyleProfile {
        story_id: story_id.to_string(),
        title: Some("Nightfall".to_string()),
        mood_descriptors: vec!["brooding".to_string(), "ominous".to_string()],
        visual_style_descriptors: vec![
            "gothic architecture".to_string(),
            "moonlit fog".to_string(),
        ],
        raw_analysis: "A dark gothic tale of a haunted manor.".to_string(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct MemoryStyleStore {
    profiles: Mutex<HashMap<String, StyleProfile>>,
    pub loads: Mutex<usize>,
}

impl MemoryStyleStore {
    pub fn with(profiles: impl IntoIterator<Item = StyleProfile>) -> Self {
        let store = MemoryStyleStore::default();
        store.profiles.lock().extend(
            profiles
                .into_iter()
                .map(|profile| (profile.story_id.clone(), profile)),
        );
        store
    }

    pub fn get(&self, story_id: &str) -> Option<StyleProfile> {
        self.profiles.lock().get(story_id).cloned()
    }
}

#[async_trait]
impl StyleStore for MemoryStyleStore {
    async fn save(&self, profile: &StyleProfile) -> Result<(), StoreError> {
        self.profiles
            .lock()
            .insert(profile.story_id.clone(), profile.clone());
        Ok(())
    }

    async fn load(&self, story_id: &str) -> Result<StyleProfile, StoreError> {
        *self.loads.lock() += 1;
        self.get(story_id)
            .ok_or_else(|| StoreError::NotFound(story_id.to_string()))
    }

    async fn delete(&self, story_id: &str) -> Result<(), StoreError> {
        self.profiles
            .lock()
            .remove(story_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(story_id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Image,
    Block(SafetyCategory),
    Fail(&'static str),
}

/// Plays back a fixed sequence of generation outcomes. Runs past the end
/// of the script are treated as successes.
#[derive(Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    delay: Duration,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        ScriptedGenerator {
            steps: Mutex::new(steps.into_iter().collect()),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Each call takes `delay` before answering.
    pub fn slow(steps: impl IntoIterator<Item = Step>, delay: Duration) -> Self {
        ScriptedGenerator {
            delay,
            ..ScriptedGenerator::new(steps)
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate_image(&self, prompt: &str) -> Result<ImageBytes, ImageGenerationError> {
        self.prompts.lock().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self.steps.lock().pop_front().unwrap_or(Step::Image);
        match step {
            Step::Image => Ok(ImageBytes {
                bytes: PNG_MAGIC.to_vec(),
                mime_type: "image/png".to_string(),
            }),
            Step::Block(category) => {
                Err(ImageGenerationError::SafetyBlocked(SafetyRejection {
                    category,
                    severity: HarmSeverity::High,
                    reason: format!("blocked for {category}"),
                }))
            }
            Step::Fail(message) => Err(ImageGenerationError::Failed(message.to_string())),
        }
    }
}

/// Rewrites every prompt to a numbered safe variant, or always fails.
#[derive(Default)]
pub struct NumberingRewriter {
    pub fail: bool,
    pub delay: Duration,
    pub inputs: Mutex<Vec<String>>,
}

impl NumberingRewriter {
    pub fn failing() -> Self {
        NumberingRewriter {
            fail: true,
            ..NumberingRewriter::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        NumberingRewriter {
            delay,
            ..NumberingRewriter::default()
        }
    }
}

#[async_trait]
impl PromptRewriter for NumberingRewriter {
    async fn infer_sanitized_prompt(
        &self,
        prompt: &str,
        _reason: Option<&str>,
    ) -> Result<String, InferenceError> {
        let seen = {
            let mut inputs = self.inputs.lock();
            inputs.push(prompt.to_string());
            inputs.len()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(InferenceError::Request("rewriter unavailable".to_string()));
        }
        Ok(format!("safe variant {seen}"))
    }
}

pub struct FixedStyleInference(pub StyleAnalysis);

impl FixedStyleInference {
    pub fn gothic() -> Self {
        FixedStyleInference(StyleAnalysis {
            mood: vec!["brooding".to_string(), "ominous".to_string()],
            visual_style: vec!["gothic architecture".to_string(), "moonlit fog".to_string()],
            summary: "A dark gothic tale.".to_string(),
        })
    }
}

#[async_trait]
impl StyleInference for FixedStyleInference {
    async fn infer_style(
        &self,
        _text: &str,
        _title: Option<&str>,
    ) -> Result<StyleAnalysis, InferenceError> {
        Ok(self.0.clone())
    }
}
