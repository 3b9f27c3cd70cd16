pub mod compose;
pub mod extractor;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use compose::{compose, compose_thumbnail};
pub use extractor::StyleExtractor;
pub use store::{JsonFileStyleStore, StoreError, StyleStore};

/// Learned visual style of one novel. One profile per `story_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StyleProfile {
    pub story_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub mood_descriptors: Vec<String>,
    pub visual_style_descriptors: Vec<String>,
    pub raw_analysis: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StyleProfile {
    pub fn is_complete(&self) -> bool {
        !self.story_id.trim().is_empty()
            && self.mood_descriptors.iter().any(|d| !d.trim().is_empty())
            && self
                .visual_style_descriptors
                .iter()
                .any(|d| !d.trim().is_empty())
    }

    /// Keeps the first-learned timestamp when a profile is re-learned.
    pub fn replacing(mut self, previous: Option<&StyleProfile>) -> Self {
        if let Some(previous) = previous {
            self.created_at = previous.created_at;
        }
        self
    }
}
