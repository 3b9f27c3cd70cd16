use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::llm::StyleInference;
use crate::style::StyleProfile;

const SAMPLE_SEPARATOR: &str = "\n...\n";
const SAMPLE_EXCERPTS: usize = 4;

/// Bounded, deterministic sample of a long novel.
///
/// Text within `budget` chars is used whole. Longer text yields a prefix of
/// 60% of the budget followed by `SAMPLE_EXCERPTS` evenly spaced excerpts
/// that share the remaining 40%.
pub fn sample_novel_text(text: &str, budget: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= budget {
        return text.to_string();
    }

    let prefix_len = budget * 3 / 5;
    let excerpt_len = (budget - prefix_len) / SAMPLE_EXCERPTS;
    let mut sample: String = chars[..prefix_len].iter().collect();

    let rest = &chars[prefix_len..];
    let stride = rest.len() / SAMPLE_EXCERPTS;
    for index in 0..SAMPLE_EXCERPTS {
        let start = index * stride + stride.saturating_sub(excerpt_len) / 2;
        let end = (start + excerpt_len).min(rest.len());
        if start >= end {
            continue;
        }
        sample.push_str(SAMPLE_SEPARATOR);
        sample.extend(&rest[start..end]);
    }
    sample
}

fn clean_descriptors(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.to_lowercase()))
        .collect()
}

pub struct StyleExtractor {
    inference: Arc<dyn StyleInference>,
    sample_chars: usize,
}

impl StyleExtractor {
    pub fn new(inference: Arc<dyn StyleInference>, sample_chars: usize) -> Self {
        StyleExtractor {
            inference,
            sample_chars,
        }
    }

    pub async fn extract(
        &self,
        story_id: &str,
        novel_text: &str,
        title: Option<&str>,
    ) -> Result<StyleProfile, PipelineError> {
        if novel_text.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "novel text must not be empty".to_string(),
            ));
        }
        let title = title.map(str::trim).filter(|value| !value.is_empty());

        let sample = sample_novel_text(novel_text, self.sample_chars);
        info!(
            story_id = story_id,
            novel_chars = novel_text.chars().count(),
            sample_chars = sample.chars().count(),
            "Extracting style profile"
        );

        let analysis = self
            .inference
            .infer_style(&sample, title)
            .await
            .map_err(|err| PipelineError::ExtractionFailed(err.to_string()))?;

        let mood_descriptors = clean_descriptors(analysis.mood);
        let visual_style_descriptors = clean_descriptors(analysis.visual_style);
        if mood_descriptors.is_empty() || visual_style_descriptors.is_empty() {
            warn!(
                story_id = story_id,
                mood = mood_descriptors.len(),
                visual_style = visual_style_descriptors.len(),
                "Style analysis came back without descriptors"
            );
            return Err(PipelineError::ExtractionFailed(
                "style analysis returned no mood or visual style descriptors".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(StyleProfile {
            story_id: story_id.to_string(),
            title: title.map(str::to_string),
            mood_descriptors,
            visual_style_descriptors,
            raw_analysis: analysis.summary.trim().to_string(),
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{InferenceError, StyleAnalysis};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct CannedInference {
        reply: Result<StyleAnalysis, String>,
        seen: Mutex<Vec<String>>,
    }

    impl CannedInference {
        fn new(reply: Result<StyleAnalysis, String>) -> Arc<Self> {
            Arc::new(CannedInference {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StyleInference for CannedInference {
        async fn infer_style(
            &self,
            text: &str,
            _title: Option<&str>,
        ) -> Result<StyleAnalysis, InferenceError> {
            self.seen.lock().push(text.to_string());
            self.reply.clone().map_err(InferenceError::Request)
        }
    }

    fn gothic() -> StyleAnalysis {
        StyleAnalysis {
            mood: vec!["brooding".into(), " ".into(), "Brooding".into(), "ominous".into()],
            visual_style: vec!["gothic architecture".into(), "moonlit fog".into()],
            summary: "A dark gothic tale.".into(),
        }
    }

    #[test]
    fn short_text_is_used_whole() {
        assert_eq!(sample_novel_text("짧은 글", 5000), "짧은 글");
    }

    #[test]
    fn long_text_sample_is_bounded_and_deterministic() {
        let text: String = (0..20_000)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        let first = sample_novel_text(&text, 5000);
        let second = sample_novel_text(&text, 5000);
        assert_eq!(first, second);
        assert!(first.starts_with(&text[..3000]));
        assert_eq!(first.matches(SAMPLE_SEPARATOR).count(), SAMPLE_EXCERPTS);
        assert!(first.chars().count() <= 5000 + SAMPLE_EXCERPTS * SAMPLE_SEPARATOR.len());
    }

    #[tokio::test]
    async fn extracts_profile_from_gothic_novel() {
        let inference = CannedInference::new(Ok(gothic()));
        let extractor = StyleExtractor::new(inference.clone(), 5000);

        let profile = extractor
            .extract(
                "s1",
                "The crumbling abbey stood under a bruised moon; ravens circled the spires.",
                Some("  Nightfall "),
            )
            .await
            .unwrap();

        assert_eq!(profile.story_id, "s1");
        assert_eq!(profile.title.as_deref(), Some("Nightfall"));
        assert_eq!(profile.mood_descriptors, vec!["brooding", "ominous"]);
        assert!(!profile.visual_style_descriptors.is_empty());
        assert_eq!(profile.raw_analysis, "A dark gothic tale.");
        assert_eq!(inference.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn empty_descriptors_fail_extraction() {
        let extractor = StyleExtractor::new(
            CannedInference::new(Ok(StyleAnalysis {
                mood: vec!["calm".into()],
                visual_style: vec![],
                summary: String::new(),
            })),
            5000,
        );
        let err = extractor.extract("s1", "text", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn inference_errors_become_extraction_failures() {
        let extractor =
            StyleExtractor::new(CannedInference::new(Err("quota".to_string())), 5000);
        let err = extractor.extract("s1", "text", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionFailed(message) if message.contains("quota")));
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_inference() {
        let inference = CannedInference::new(Ok(gothic()));
        let extractor = StyleExtractor::new(inference.clone(), 5000);
        let err = extractor.extract("s1", "   \n", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert!(inference.seen.lock().is_empty());
    }
}
