use crate::style::StyleProfile;
use crate::utils::text::take_chars;

pub const SCENE_CONTEXT_CHARS: usize = 500;
const QUALITY_CUES: &str = "digital painting, highly detailed, professional artwork, sharp focus";
const COVER_CUES: &str =
    "book cover art, professional illustration, dramatic composition, cinematic lighting";

/// Builds the generation prompt for one story node.
///
/// The user's prompt is kept verbatim as the subject. Node text only adds
/// scene context and is clipped to `SCENE_CONTEXT_CHARS`.
pub fn compose(profile: &StyleProfile, user_prompt: &str, node_text: Option<&str>) -> String {
    let mut parts = vec![user_prompt.trim().to_string()];

    if let Some(scene) = node_text.map(str::trim).filter(|text| !text.is_empty()) {
        let scene = take_chars(scene, SCENE_CONTEXT_CHARS).trim_end();
        parts.push(format!("Scene context: {scene}"));
    }
    if !profile.visual_style_descriptors.is_empty() {
        parts.push(format!(
            "Visual style: {}",
            profile.visual_style_descriptors.join(", ")
        ));
    }
    if !profile.mood_descriptors.is_empty() {
        parts.push(format!("Mood: {}", profile.mood_descriptors.join(", ")));
    }
    parts.push(QUALITY_CUES.to_string());

    parts.join(". ")
}

/// Cover image prompt for a freshly learned profile. Asks for no lettering
/// since the title is rendered by the client.
pub fn compose_thumbnail(profile: &StyleProfile) -> String {
    let title = profile
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or("a novel");

    let mut parts = vec![format!("Book cover illustration for '{title}'")];
    if !profile.visual_style_descriptors.is_empty() {
        parts.push(profile.visual_style_descriptors.join(", "));
    }
    if !profile.mood_descriptors.is_empty() {
        parts.push(format!("{} mood", profile.mood_descriptors.join(", ")));
    }
    parts.push(COVER_CUES.to_string());
    parts.push("no text, no letters, no typography".to_string());

    parts.join(", ")
}
