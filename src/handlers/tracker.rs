use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

/// Requests currently being processed, keyed by what they would produce.
/// Presigned URLs differ per signature; the object is what matters.
fn upload_object(target: Option<&str>) -> Option<&str> {
    let target = target.map(str::trim).filter(|value| !value.is_empty())?;
    target.split(['?', '#']).next()
}

#[derive(Clone, Default)]
pub struct RequestTracker {
    in_flight: Arc<Mutex<HashMap<String, Instant>>>,
}

impl RequestTracker {
    /// One learn-style per story, or per thumbnail object when one is named.
    pub fn learn_style_key(story_id: &str, thumbnail_target: Option<&str>) -> String {
        match upload_object(thumbnail_target) {
            Some(target) => format!("learn-style:{story_id}:{target}"),
            None => format!("learn-style:{story_id}"),
        }
    }

    /// Keyed by the upload object, or by node and prompt for local output.
    pub fn generate_image_key(
        story_id: &str,
        node_id: &str,
        upload_target: Option<&str>,
        user_prompt: &str,
    ) -> String {
        match upload_object(upload_target) {
            Some(target) => format!("generate-image:{story_id}:{target}"),
            None => format!("generate-image:{story_id}:{node_id}:{}", user_prompt.trim()),
        }
    }

    /// Registers `key`, or returns `None` while an identical request runs.
    pub fn try_begin(&self, key: String) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&key) {
            return None;
        }
        in_flight.insert(key.clone(), Instant::now());
        Some(InFlightGuard {
            key,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

pub struct InFlightGuard {
    key: String,
    in_flight: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(started) = self.in_flight.lock().remove(&self.key) {
            debug!(
                "Request {} finished after {} ms",
                self.key,
                started.elapsed().as_millis()
            );
        }
    }
}
