pub mod orchestrator;
pub mod sanitizer;

pub use orchestrator::{AttemptRecord, GenerationOrchestrator, GenerationRequest};
pub use sanitizer::PromptSanitizer;
