use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, PROMPT_SANITIZE_SYSTEM_PROMPT, STYLE_ANALYSIS_SYSTEM_PROMPT};
use crate::llm::media::{detect_mime_type, resize_to_target};
use crate::llm::{
    ImageBytes, ImageGenerationError, ImageGenerator, InferenceError, PromptRewriter,
    SafetyCategory, SafetyRejection, SafetyThreshold, StyleAnalysis, StyleInference,
};
use crate::utils::http::get_http_client;
use crate::utils::text::{strip_code_fence, strip_wrapping_quotes, truncate_for_log};
use crate::utils::timing::log_llm_timing;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagenResponse {
    #[serde(default)]
    predictions: Vec<ImagenPrediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagenPrediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
    rai_filtered_reason: Option<String>,
}

#[derive(Debug)]
enum PostError {
    Transport(String),
    Status {
        status: StatusCode,
        message: String,
    },
    Decode(String),
}

impl From<PostError> for InferenceError {
    fn from(err: PostError) -> Self {
        match err {
            PostError::Transport(message) => InferenceError::Request(message),
            PostError::Status { status, message } => InferenceError::Status {
                status: status.as_u16(),
                message,
            },
            PostError::Decode(message) => InferenceError::Malformed(message),
        }
    }
}

const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;
const SAFETY_ERROR_KEYWORDS: &[&str] = &[
    "SENSITIVE",
    "SAFETY",
    "BLOCKED",
    "FILTER",
    "VIOLATION",
    "POLICY",
    "RESPONSIBLE AI",
];

fn gemini_should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn looks_like_safety_error(message: &str) -> bool {
    let upper = message.to_uppercase();
    SAFETY_ERROR_KEYWORDS
        .iter()
        .any(|keyword| upper.contains(keyword))
}

fn build_text_safety_settings() -> Vec<Value> {
    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_ONLY_HIGH" }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_ONLY_HIGH" }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_ONLY_HIGH" }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_ONLY_HIGH" }),
    ]
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn extract_text_from_response(response: GeminiResponse) -> Result<String, InferenceError> {
    if let Some(reason) = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Err(InferenceError::Blocked(reason));
    }

    let mut text_parts = Vec::new();
    let mut finish_reason = None;
    for candidate in response.candidates.unwrap_or_default() {
        if finish_reason.is_none() {
            finish_reason = candidate.finish_reason;
        }
        let parts = candidate
            .content
            .and_then(|content| content.parts)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.text {
                if !text.trim().is_empty() {
                    text_parts.push(text);
                }
            }
        }
    }

    if text_parts.is_empty() {
        return match finish_reason.as_deref() {
            Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("BLOCKLIST") => Err(
                InferenceError::Blocked(finish_reason.unwrap_or_default()),
            ),
            _ => Err(InferenceError::EmptyResponse),
        };
    }
    Ok(text_parts.join("\n"))
}

fn parse_style_analysis(text: &str) -> Result<StyleAnalysis, InferenceError> {
    let body = strip_code_fence(text);
    serde_json::from_str::<StyleAnalysis>(body).map_err(|err| {
        debug!(target: "llm.gemini", response = %truncate_for_log(text, 200), "unparseable style analysis");
        InferenceError::Malformed(err.to_string())
    })
}

fn rejection_from_reason(reason: &str, threshold: SafetyThreshold) -> SafetyRejection {
    SafetyRejection {
        category: SafetyCategory::classify(reason),
        severity: threshold.blocked_severity(),
        reason: reason.to_string(),
    }
}

/// Decode, resample and re-encode on the blocking pool.
async fn resize_off_runtime(bytes: Vec<u8>, width: u32, height: u32) -> Vec<u8> {
    let original = bytes.clone();
    match tokio::task::spawn_blocking(move || resize_to_target(bytes, width, height)).await {
        Ok(resized) => resized,
        Err(err) => {
            warn!("Image resize task failed, keeping original bytes: {err}");
            original
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: String,
    text_model: String,
    image_model: String,
    temperature: f32,
    top_k: i32,
    top_p: f32,
    max_output_tokens: i32,
    max_retry_attempts: usize,
    safety_setting: SafetyThreshold,
    aspect_ratio: String,
    output_size: Option<(u32, u32)>,
}

impl GeminiClient {
    pub fn from_config(config: &Config) -> Self {
        GeminiClient {
            http: get_http_client().clone(),
            base_url: config.gemini_base_url.clone(),
            api_key: config.gemini_api_key.clone(),
            text_model: config.gemini_model.clone(),
            image_model: config.imagen_model.clone(),
            temperature: config.gemini_temperature,
            top_k: config.gemini_top_k,
            top_p: config.gemini_top_p,
            max_output_tokens: config.gemini_max_output_tokens,
            max_retry_attempts: config.gemini_max_retry_attempts,
            safety_setting: config.image_safety_setting,
            aspect_ratio: config.image_aspect_ratio.clone(),
            output_size: if config.image_width > 0 && config.image_height > 0 {
                Some((config.image_width, config.image_height))
            } else {
                None
            },
        }
    }

    fn redact_api_key(&self, text: &str) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        payload: &Value,
    ) -> Result<T, PostError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(url)
                .header("x-goog-api-key", &self.api_key)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err_text = self.redact_api_key(&err.to_string());
                    let should_retry =
                        gemini_should_retry_error(&err) && attempt < self.max_retry_attempts;
                    warn!(
                        "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                        err_text,
                        err.is_timeout(),
                        err.is_connect(),
                        should_retry
                    );
                    if should_retry {
                        tokio::time::sleep(gemini_retry_delay(attempt)).await;
                        continue;
                    }
                    return Err(PostError::Transport(err_text));
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let (message, body_summary) = summarize_error_body(&body);
                let should_retry =
                    gemini_should_retry_status(status) && attempt < self.max_retry_attempts;
                warn!(
                    "Gemini API error: status={}, body={}, retrying={}",
                    status, body_summary, should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(PostError::Status {
                    status,
                    message: message.unwrap_or(body_summary),
                });
            }

            return response
                .json::<T>()
                .await
                .map_err(|err| PostError::Decode(self.redact_api_key(&err.to_string())));
        }
    }

    async fn generate_text(
        &self,
        operation: &str,
        system_prompt: &str,
        user_content: &str,
        json_output: bool,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.text_model);
        let mut generation_config = json!({
            "temperature": self.temperature,
            "topK": self.top_k,
            "topP": self.top_p,
            "maxOutputTokens": self.max_output_tokens,
        });
        if json_output {
            generation_config["responseMimeType"] = json!("application/json");
        }
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": system_prompt }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_content }] }],
            "generationConfig": generation_config,
            "safetySettings": build_text_safety_settings(),
        });

        debug!(
            target: "llm.gemini",
            model = %self.text_model,
            operation = operation,
            content = %truncate_for_log(user_content, 200)
        );

        log_llm_timing("gemini", &self.text_model, operation, || async {
            let response = self.post_json::<GeminiResponse>(&url, &payload).await?;
            extract_text_from_response(response)
        })
        .await
    }

    async fn predict_image(&self, prompt: &str) -> Result<ImageBytes, ImageGenerationError> {
        let url = format!("{}/models/{}:predict", self.base_url, self.image_model);
        let payload = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": self.aspect_ratio,
                "personGeneration": "allow_adult",
                "safetySetting": self.safety_setting.as_api_str(),
                "includeRaiReason": true,
            },
        });

        let response = match self.post_json::<ImagenResponse>(&url, &payload).await {
            Ok(response) => response,
            Err(PostError::Status { status, message })
                if status == StatusCode::BAD_REQUEST && looks_like_safety_error(&message) =>
            {
                return Err(ImageGenerationError::SafetyBlocked(rejection_from_reason(
                    &message,
                    self.safety_setting,
                )));
            }
            Err(PostError::Transport(message)) | Err(PostError::Decode(message)) => {
                return Err(ImageGenerationError::Failed(message));
            }
            Err(PostError::Status { status, message }) => {
                return Err(ImageGenerationError::Failed(format!(
                    "status {}: {}",
                    status, message
                )));
            }
        };

        let mut filtered_reason = None;
        for prediction in response.predictions {
            if let Some(encoded) = prediction.bytes_base64_encoded {
                let bytes = general_purpose::STANDARD.decode(encoded).map_err(|err| {
                    ImageGenerationError::Failed(format!("invalid image payload: {}", err))
                })?;
                let bytes = match self.output_size {
                    Some((width, height)) => resize_off_runtime(bytes, width, height).await,
                    None => bytes,
                };
                let mime_type = detect_mime_type(&bytes)
                    .or(prediction.mime_type)
                    .unwrap_or_else(|| "image/png".to_string());
                return Ok(ImageBytes { bytes, mime_type });
            }
            if filtered_reason.is_none() {
                filtered_reason = prediction.rai_filtered_reason;
            }
        }

        // Imagen drops filtered samples from the list, so an empty answer is a block too.
        let reason = filtered_reason
            .unwrap_or_else(|| "image service returned no images (filtered)".to_string());
        Err(ImageGenerationError::SafetyBlocked(rejection_from_reason(
            &reason,
            self.safety_setting,
        )))
    }
}

#[async_trait]
impl StyleInference for GeminiClient {
    async fn infer_style(
        &self,
        text: &str,
        title: Option<&str>,
    ) -> Result<StyleAnalysis, InferenceError> {
        let content = format!(
            "NOVEL TITLE: {}\n\nNOVEL CONTENT (excerpt):\n{}",
            title.unwrap_or("Untitled"),
            text
        );
        let reply = self
            .generate_text("infer_style", STYLE_ANALYSIS_SYSTEM_PROMPT, &content, true)
            .await?;
        parse_style_analysis(&reply)
    }
}

#[async_trait]
impl PromptRewriter for GeminiClient {
    async fn infer_sanitized_prompt(
        &self,
        prompt: &str,
        reason: Option<&str>,
    ) -> Result<String, InferenceError> {
        let mut content = format!("BLOCKED PROMPT:\n{}", prompt);
        if let Some(reason) = reason.filter(|value| !value.trim().is_empty()) {
            content.push_str(&format!("\n\nFILTER REASON: {}", reason));
        }
        let reply = self
            .generate_text(
                "infer_sanitized_prompt",
                PROMPT_SANITIZE_SYSTEM_PROMPT,
                &content,
                false,
            )
            .await?;
        Ok(strip_wrapping_quotes(strip_code_fence(&reply)).to_string())
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate_image(&self, prompt: &str) -> Result<ImageBytes, ImageGenerationError> {
        log_llm_timing("imagen", &self.image_model, "generate_image", || {
            self.predict_image(prompt)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HarmSeverity;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_with_size(server: &MockServer, width: &str, height: &str) -> GeminiClient {
        let config = Config::from_lookup(|name| match name {
            "GEMINI_API_KEY" => Some("test-key".to_string()),
            "GEMINI_BASE_URL" => Some(server.uri()),
            "GEMINI_MAX_RETRY_ATTEMPTS" => Some("1".to_string()),
            "IMAGE_WIDTH" => Some(width.to_string()),
            "IMAGE_HEIGHT" => Some(height.to_string()),
            _ => None,
        })
        .unwrap();
        GeminiClient::from_config(&config)
    }

    fn client_for(server: &MockServer) -> GeminiClient {
        client_with_size(server, "0", "0")
    }

    fn text_reply(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    #[tokio::test]
    async fn parses_fenced_style_analysis() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply(
                "```json\n{\"mood\": [\"brooding\"], \"visual_style\": [\"gothic architecture\"], \"summary\": \"Dark.\"}\n```",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let analysis = client_for(&server)
            .infer_style("The castle loomed.", Some("Nightfall"))
            .await
            .unwrap();
        assert_eq!(analysis.mood, vec!["brooding"]);
        assert_eq!(analysis.visual_style, vec!["gothic architecture"]);
        assert_eq!(analysis.summary, "Dark.");
    }

    #[tokio::test]
    async fn unparseable_style_reply_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("I cannot help.")))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .infer_style("text", None)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
    }

    #[tokio::test]
    async fn rewrite_strips_wrapping_quotes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(text_reply("\"two rivals facing off at dusk\"")),
            )
            .mount(&server)
            .await;

        let rewritten = client_for(&server)
            .infer_sanitized_prompt("a bloody sword fight", Some("violence"))
            .await
            .unwrap();
        assert_eq!(rewritten, "two rivals facing off at dusk");
    }

    #[tokio::test]
    async fn decodes_generated_image() {
        let server = MockServer::start().await;
        let encoded = general_purpose::STANDARD.encode(b"raw-image");
        Mock::given(method("POST"))
            .and(path("/models/imagen-4.0-fast-generate-001:predict"))
            .and(body_partial_json(json!({
                "parameters": { "safetySetting": "block_only_high", "sampleCount": 1 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [{ "bytesBase64Encoded": encoded, "mimeType": "image/png" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let image = client_for(&server)
            .generate_image("a quiet forest")
            .await
            .unwrap();
        assert_eq!(image.bytes, b"raw-image");
        assert_eq!(image.mime_type, "image/png");
    }

    #[tokio::test]
    async fn generated_image_is_resized_to_output_size() {
        let mut png = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image::RgbImage::new(64, 32))
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [{ "bytesBase64Encoded": general_purpose::STANDARD.encode(png.into_inner()) }]
            })))
            .mount(&server)
            .await;

        let image = client_with_size(&server, "16", "9")
            .generate_image("a quiet forest")
            .await
            .unwrap();
        let decoded = image::load_from_memory(&image.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 9));
        assert_eq!(image.mime_type, "image/png");
    }

    #[tokio::test]
    async fn filtered_prediction_is_a_safety_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [{ "raiFilteredReason": "Your prompt may contain violence. Support codes: 12345" }]
            })))
            .mount(&server)
            .await;

        match client_for(&server).generate_image("battle").await {
            Err(ImageGenerationError::SafetyBlocked(rejection)) => {
                assert_eq!(rejection.category, SafetyCategory::Violence);
                assert_eq!(rejection.severity, HarmSeverity::High);
            }
            other => panic!("expected safety block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_prediction_list_is_an_unspecified_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        match client_for(&server).generate_image("anything").await {
            Err(ImageGenerationError::SafetyBlocked(rejection)) => {
                assert_eq!(rejection.category, SafetyCategory::Unspecified);
            }
            other => panic!("expected safety block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn quota_errors_are_generic_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": { "message": "Quota exceeded for aiplatform requests" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        match client_for(&server).generate_image("anything").await {
            Err(ImageGenerationError::Failed(message)) => assert!(message.contains("Quota")),
            other => panic!("expected generic failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_request_mentioning_policy_is_a_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "Image generation failed with the following error: The prompt could not be submitted. This prompt contains sensitive words that violate Google's Responsible AI practices (sexual)." }
            })))
            .mount(&server)
            .await;

        match client_for(&server).generate_image("anything").await {
            Err(ImageGenerationError::SafetyBlocked(rejection)) => {
                assert_eq!(rejection.category, SafetyCategory::Sexual);
            }
            other => panic!("expected safety block, got {:?}", other),
        }
    }
}
