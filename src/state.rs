use std::sync::Arc;

use crate::config::Config;
use crate::handlers::tracker::RequestTracker;
use crate::llm::{ImageGenerator, PromptRewriter, StyleInference};
use crate::pipeline::{GenerationOrchestrator, PromptSanitizer};
use crate::storage::{ImageSink, LocalDirSink};
use crate::style::{StyleExtractor, StyleStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn StyleStore>,
    pub extractor: Arc<StyleExtractor>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub local_sink: Arc<dyn ImageSink>,
    pub tracker: RequestTracker,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn StyleStore>,
        inference: Arc<dyn StyleInference>,
        rewriter: Arc<dyn PromptRewriter>,
        generator: Arc<dyn ImageGenerator>,
    ) -> Self {
        let extractor = StyleExtractor::new(inference, config.style_sample_chars);
        let orchestrator = GenerationOrchestrator::new(
            Arc::clone(&store),
            generator,
            PromptSanitizer::new(rewriter),
        );
        let local_sink = LocalDirSink::new(config.images_dir.clone());

        AppState {
            config: Arc::new(config),
            store,
            extractor: Arc::new(extractor),
            orchestrator: Arc::new(orchestrator),
            local_sink: Arc::new(local_sink),
            tracker: RequestTracker::default(),
        }
    }
}
