use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::{ImageBytes, ImageGenerationError, ImageGenerator, SafetyRejection};
use crate::pipeline::sanitizer::PromptSanitizer;
use crate::style::{compose, StoreError, StyleStore};
use crate::utils::text::truncate_for_log;

/// Retries allowed after the first attempt; at most `MAX_RETRIES + 1` calls.
pub const MAX_RETRIES: usize = 2;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub story_id: String,
    pub node_id: String,
    pub user_prompt: String,
    pub node_text: Option<String>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    SafetyBlocked { category: String, reason: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt_index: usize,
    pub prompt_used: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub story_id: String,
    pub node_id: String,
    pub attempt_index: usize,
    pub enhanced_prompt: String,
    pub prompt_used: String,
    pub attempts: Vec<AttemptRecord>,
}

enum State {
    Generating {
        attempt_index: usize,
        prompt: String,
    },
    Sanitizing {
        attempt_index: usize,
        blocked_prompt: String,
        rejection: SafetyRejection,
    },
    Succeeded {
        attempt_index: usize,
        prompt: String,
        image: ImageBytes,
    },
    Failed(PipelineError),
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Runs `call`, giving up with `None` once `deadline` passes.
async fn bounded<F: Future>(deadline: Option<Instant>, call: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, call).await.ok(),
        None => Some(call.await),
    }
}

/// Compose, generate, and on a safety block sanitize and retry.
pub struct GenerationOrchestrator {
    store: Arc<dyn StyleStore>,
    generator: Arc<dyn ImageGenerator>,
    sanitizer: PromptSanitizer,
}

impl GenerationOrchestrator {
    pub fn new(
        store: Arc<dyn StyleStore>,
        generator: Arc<dyn ImageGenerator>,
        sanitizer: PromptSanitizer,
    ) -> Self {
        GenerationOrchestrator {
            store,
            generator,
            sanitizer,
        }
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GeneratedImage, PipelineError> {
        let user_prompt = request.user_prompt.trim();
        if user_prompt.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "user_prompt must not be empty".to_string(),
            ));
        }

        let profile = match self.store.load(&request.story_id).await {
            Ok(profile) => profile,
            Err(StoreError::NotFound(story_id)) => {
                return Err(PipelineError::InvalidRequest(format!(
                    "no style profile for story `{story_id}`; learn the style first"
                )))
            }
            Err(err) => return Err(err.into()),
        };

        let enhanced_prompt = compose(&profile, user_prompt, request.node_text.as_deref());
        info!(
            story_id = %request.story_id,
            node_id = %request.node_id,
            "Composed prompt: {}",
            truncate_for_log(&enhanced_prompt, 200)
        );

        self.generate_with_prompt(
            &request.story_id,
            &request.node_id,
            enhanced_prompt,
            request.deadline,
        )
        .await
    }

    /// Runs the retry loop on an already composed prompt.
    pub async fn generate_with_prompt(
        &self,
        story_id: &str,
        node_id: &str,
        enhanced_prompt: String,
        deadline: Option<Instant>,
    ) -> Result<GeneratedImage, PipelineError> {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut state = State::Generating {
            attempt_index: 0,
            prompt: enhanced_prompt.clone(),
        };

        loop {
            state = match state {
                State::Generating {
                    attempt_index,
                    prompt,
                } => {
                    if deadline_passed(deadline) {
                        State::Failed(PipelineError::Timeout {
                            attempts: attempts.len(),
                        })
                    } else {
                        info!(story_id, node_id, attempt_index, "Generating image");
                        match bounded(deadline, self.generator.generate_image(&prompt)).await {
                            None => State::Failed(PipelineError::Timeout {
                                attempts: attempts.len() + 1,
                            }),
                            Some(result) => {
                                self.after_generation(&mut attempts, attempt_index, prompt, result)
                            }
                        }
                    }
                }
                State::Sanitizing {
                    attempt_index,
                    blocked_prompt,
                    rejection,
                } => {
                    if deadline_passed(deadline) {
                        State::Failed(PipelineError::Timeout {
                            attempts: attempts.len(),
                        })
                    } else {
                        info!(story_id, node_id, attempt_index, "Sanitizing blocked prompt");
                        let sanitized = bounded(
                            deadline,
                            self.sanitizer
                                .sanitize(&blocked_prompt, Some(rejection.reason.as_str())),
                        )
                        .await;
                        match sanitized {
                            None => State::Failed(PipelineError::Timeout {
                                attempts: attempts.len(),
                            }),
                            Some(Ok(prompt)) => State::Generating {
                                attempt_index: attempt_index + 1,
                                prompt,
                            },
                            Some(Err(err)) => State::Failed(err),
                        }
                    }
                }
                State::Succeeded {
                    attempt_index,
                    prompt,
                    image,
                } => {
                    info!(story_id, node_id, attempt_index, "Image generated");
                    return Ok(GeneratedImage {
                        bytes: image.bytes,
                        mime_type: image.mime_type,
                        story_id: story_id.to_string(),
                        node_id: node_id.to_string(),
                        attempt_index,
                        enhanced_prompt,
                        prompt_used: prompt,
                        attempts,
                    });
                }
                State::Failed(err) => {
                    warn!(
                        story_id,
                        node_id,
                        attempts = attempts.len(),
                        "Image generation failed: {err}"
                    );
                    return Err(err);
                }
            };
        }
    }

    fn after_generation(
        &self,
        attempts: &mut Vec<AttemptRecord>,
        attempt_index: usize,
        prompt: String,
        result: Result<ImageBytes, ImageGenerationError>,
    ) -> State {
        match result {
            Ok(image) => {
                attempts.push(AttemptRecord {
                    attempt_index,
                    prompt_used: prompt.clone(),
                    outcome: AttemptOutcome::Success,
                });
                State::Succeeded {
                    attempt_index,
                    prompt,
                    image,
                }
            }
            Err(ImageGenerationError::SafetyBlocked(rejection)) => {
                warn!(
                    attempt_index,
                    category = %rejection.category,
                    "Prompt blocked by safety filter: {}",
                    rejection.reason
                );
                attempts.push(AttemptRecord {
                    attempt_index,
                    prompt_used: prompt.clone(),
                    outcome: AttemptOutcome::SafetyBlocked {
                        category: rejection.category.to_string(),
                        reason: rejection.reason.clone(),
                    },
                });
                if attempt_index < MAX_RETRIES {
                    State::Sanitizing {
                        attempt_index,
                        blocked_prompt: prompt,
                        rejection,
                    }
                } else {
                    State::Failed(PipelineError::SafetyBlockExhausted {
                        attempts: attempt_index + 1,
                        category: rejection.category,
                        reason: rejection.reason,
                    })
                }
            }
            Err(ImageGenerationError::Failed(message)) => {
                attempts.push(AttemptRecord {
                    attempt_index,
                    prompt_used: prompt,
                    outcome: AttemptOutcome::Failed {
                        message: message.clone(),
                    },
                });
                State::Failed(PipelineError::GenerationFailed(message))
            }
        }
    }
}
