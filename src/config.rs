use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::llm::SafetyThreshold;

const DEFAULT_NOVEL_TEXT_MAX_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub logs_dir: PathBuf,
    pub styles_dir: PathBuf,
    pub images_dir: PathBuf,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub imagen_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_max_retry_attempts: usize,
    pub image_safety_setting: SafetyThreshold,
    pub image_aspect_ratio: String,
    pub image_width: u32,
    pub image_height: u32,
    pub style_sample_chars: usize,
    pub novel_text_max_bytes: usize,
    pub generation_timeout_seconds: u64,
    pub generate_thumbnails: bool,
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_string(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    lookup(name)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn normalize_safety_setting(value: String) -> SafetyThreshold {
    match SafetyThreshold::parse(&value) {
        Some(threshold) => threshold,
        None => {
            warn!(
                "Unknown IMAGE_SAFETY_SETTING value '{}'; defaulting to block_only_high.",
                value
            );
            SafetyThreshold::BlockOnlyHigh
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let gemini_api_key = env_string(&lookup, "GEMINI_API_KEY", "");
        if gemini_api_key.trim().is_empty() {
            return Err(anyhow!("GEMINI_API_KEY is required"));
        }

        Ok(Config {
            host: env_string(&lookup, "HOST", "0.0.0.0"),
            port: env_parse(&lookup, "PORT", 8001),
            log_level: env_string(&lookup, "LOG_LEVEL", "info").to_lowercase(),
            logs_dir: PathBuf::from(env_string(&lookup, "LOGS_DIR", "logs")),
            styles_dir: PathBuf::from(env_string(&lookup, "STYLES_DIR", "styles")),
            images_dir: PathBuf::from(env_string(&lookup, "IMAGES_DIR", "images")),
            gemini_api_key,
            gemini_base_url: env_string(
                &lookup,
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            )
            .trim_end_matches('/')
            .to_string(),
            gemini_model: env_string(&lookup, "GEMINI_MODEL", "gemini-2.0-flash"),
            imagen_model: env_string(&lookup, "IMAGEN_MODEL", "imagen-4.0-fast-generate-001"),
            gemini_temperature: env_parse(&lookup, "GEMINI_TEMPERATURE", 0.7),
            gemini_top_k: env_parse(&lookup, "GEMINI_TOP_K", 40),
            gemini_top_p: env_parse(&lookup, "GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_parse(&lookup, "GEMINI_MAX_OUTPUT_TOKENS", 2048),
            gemini_max_retry_attempts: env_parse(&lookup, "GEMINI_MAX_RETRY_ATTEMPTS", 2usize)
                .max(1),
            image_safety_setting: normalize_safety_setting(env_string(
                &lookup,
                "IMAGE_SAFETY_SETTING",
                "block_only_high",
            )),
            image_aspect_ratio: env_string(&lookup, "IMAGE_ASPECT_RATIO", "16:9"),
            image_width: env_parse(&lookup, "IMAGE_WIDTH", 1280),
            image_height: env_parse(&lookup, "IMAGE_HEIGHT", 720),
            style_sample_chars: env_parse(&lookup, "STYLE_SAMPLE_CHARS", 5000usize).max(1000),
            novel_text_max_bytes: env_parse(
                &lookup,
                "NOVEL_TEXT_MAX_BYTES",
                DEFAULT_NOVEL_TEXT_MAX_BYTES,
            )
            .max(1024),
            generation_timeout_seconds: env_parse(&lookup, "GENERATION_TIMEOUT_SECONDS", 180),
            generate_thumbnails: env_bool(&lookup, "GENERATE_THUMBNAILS", true),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds.max(1))
    }
}

pub const STYLE_ANALYSIS_SYSTEM_PROMPT: &str = r#"You analyze the style and atmosphere of novels so an illustrator can paint scenes from them.

Read the novel excerpt supplied by the user and answer with a single JSON object:

{
  "mood": ["3-5 short English tone words or phrases, e.g. 'melancholic', 'quietly ominous'"],
  "visual_style": ["5-8 short English phrases usable directly in an image prompt: art style, colour palette, lighting, setting, time of day, weather"],
  "summary": "2-3 sentences describing the overall style and tone of the novel"
}

Rules:
- Every entry must be safe for image generation: no violent, sexual, hateful or gory terms.
- Prefer concrete visual language ("moonlit gothic architecture", "cool blue tones with violet accents") over abstractions.
- Respond ONLY with the JSON object. No markdown, no commentary."#;

pub const PROMPT_SANITIZE_SYSTEM_PROMPT: &str = r#"You rewrite image generation prompts that were rejected by a content safety filter.

The filter blocks four categories: violence, sexual content, derogatory content and toxicity.
Rewrite the user's prompt so that it avoids all four categories while keeping the scene's core subject, setting and visual composition as close to the original as possible.

Guidelines:
- Replace graphic or violent actions with their dramatic aftermath, tension or symbolism ("a sword fight" -> "two rivals facing each other, blades raised, dynamic pose").
- Replace gore with colour and light ("blood" -> "crimson accents").
- Remove anything sexual or demeaning; keep characters fully and respectfully depicted.
- Keep art style, lighting, palette and quality keywords unchanged.
- Write in English, 60-150 words.

Respond with ONLY the rewritten prompt. No quotes, no explanations, no prefixes."#;
