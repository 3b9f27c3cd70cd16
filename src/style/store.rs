use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::style::StyleProfile;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no style profile stored for story `{0}`")]
    NotFound(String),
    #[error("invalid story id `{0}`")]
    InvalidId(String),
    #[error("stored style profile for `{story_id}` is corrupt: {reason}")]
    Corrupt { story_id: String, reason: String },
    #[error("io error at `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Persistence for style profiles, one per story id, last write wins.
#[async_trait]
pub trait StyleStore: Send + Sync {
    async fn save(&self, profile: &StyleProfile) -> Result<(), StoreError>;
    async fn load(&self, story_id: &str) -> Result<StyleProfile, StoreError>;
    async fn delete(&self, story_id: &str) -> Result<(), StoreError>;
}

pub fn validate_story_id(story_id: &str) -> Result<(), StoreError> {
    let trimmed = story_id.trim();
    let valid = !trimmed.is_empty()
        && trimmed == story_id
        && story_id.len() <= 200
        && !story_id.starts_with('.')
        && !story_id.contains("..")
        && !story_id
            .chars()
            .any(|ch| ch == '/' || ch == '\\' || ch == ':' || ch.is_control());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(story_id.to_string()))
    }
}

/// One pretty-printed JSON document per story under `dir`.
#[derive(Debug)]
pub struct JsonFileStyleStore {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl JsonFileStyleStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;
        info!("Style profiles stored in {}", dir.display());
        Ok(JsonFileStyleStore {
            dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn path_for(&self, story_id: &str) -> Result<PathBuf, StoreError> {
        validate_story_id(story_id)?;
        Ok(self.dir.join(format!("{story_id}.json")))
    }
}

#[async_trait]
impl StyleStore for JsonFileStyleStore {
    async fn save(&self, profile: &StyleProfile) -> Result<(), StoreError> {
        let path = self.path_for(&profile.story_id)?;
        let body = serde_json::to_vec_pretty(profile).map_err(|err| StoreError::Corrupt {
            story_id: profile.story_id.clone(),
            reason: err.to_string(),
        })?;

        // Write-then-rename so readers never observe a half-written document.
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self.dir.join(format!(
            ".{}.json.{}-{}.tmp",
            profile.story_id,
            std::process::id(),
            seq
        ));
        fs::write(&tmp_path, &body)
            .await
            .map_err(|err| StoreError::io(&tmp_path, err))?;
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::io(&path, err));
        }

        debug!(story_id = %profile.story_id, path = %path.display(), "Saved style profile");
        Ok(())
    }

    async fn load(&self, story_id: &str) -> Result<StyleProfile, StoreError> {
        let path = self.path_for(story_id)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(story_id.to_string()))
            }
            Err(err) => return Err(StoreError::io(&path, err)),
        };

        let profile: StyleProfile =
            serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
                story_id: story_id.to_string(),
                reason: err.to_string(),
            })?;
        if profile.story_id != story_id || !profile.is_complete() {
            return Err(StoreError::Corrupt {
                story_id: story_id.to_string(),
                reason: "missing story id or descriptors".to_string(),
            });
        }
        Ok(profile)
    }

    async fn delete(&self, story_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(story_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(story_id = story_id, "Deleted style profile");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(story_id.to_string()))
            }
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    pub(crate) fn sample_profile(story_id: &str) -> StyleProfile {
        StyleProfile {
            story_id: story_id.to_string(),
            title: Some("Nightfall".to_string()),
            mood_descriptors: vec!["brooding".to_string(), "ominous".to_string()],
            visual_style_descriptors: vec![
                "gothic architecture".to_string(),
                "moonlit fog".to_string(),
            ],
            raw_analysis: "A dark gothic tale.".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStyleStore::open(dir.path()).await.unwrap();
        let profile = sample_profile("s1");

        store.save(&profile).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), profile);
        assert!(dir.path().join("s1.json").exists());
    }

    #[tokio::test]
    async fn resave_overwrites_instead_of_appending() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStyleStore::open(dir.path()).await.unwrap();
        store.save(&sample_profile("s1")).await.unwrap();

        let mut updated = sample_profile("s1");
        updated.mood_descriptors = vec!["serene".to_string()];
        store.save(&updated).await.unwrap();

        assert_eq!(store.load("s1").await.unwrap().mood_descriptors, vec!["serene"]);
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn delete_missing_and_load_deleted_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStyleStore::open(dir.path()).await.unwrap();

        assert!(matches!(store.delete("ghost").await, Err(StoreError::NotFound(_))));

        store.save(&sample_profile("s1")).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(matches!(store.load("s1").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejects_path_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStyleStore::open(dir.path()).await.unwrap();
        for bad in ["../escape", "a/b", "", " padded", ".hidden"] {
            assert!(
                matches!(store.load(bad).await, Err(StoreError::InvalidId(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn partial_documents_are_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStyleStore::open(dir.path()).await.unwrap();

        std::fs::write(
            dir.path().join("partial.json"),
            r#"{"story_id": "partial", "atmosphere": "dark"}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load("partial").await,
            Err(StoreError::Corrupt { .. })
        ));

        let mut empty = sample_profile("empty");
        empty.visual_style_descriptors.clear();
        std::fs::write(
            dir.path().join("empty.json"),
            serde_json::to_vec(&empty).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            store.load("empty").await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
