use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::handlers::tracker::RequestTracker;
use crate::llm::media::download_text;
use crate::pipeline::{AttemptRecord, GenerationRequest};
use crate::state::AppState;
use crate::storage::{ImageSink, PresignedUrlSink};
use crate::style::store::validate_story_id;
use crate::style::{compose_thumbnail, StoreError, StyleProfile};
use crate::utils::timing::RequestTimer;

const THUMBNAIL_NODE_ID: &str = "thumbnail";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{seq}", Utc::now().timestamp_millis())
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/learn-style", post(learn_style))
        .route("/style/{story_id}", get(get_style).delete(delete_style))
        .route("/generate-image", post(generate_image));

    Router::new()
        .route("/", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                attempts: None,
                category: None,
                action: None,
            },
        }
    }

    fn duplicate() -> Self {
        ApiError::new(
            StatusCode::CONFLICT,
            "DUPLICATE_REQUEST",
            "an identical request is already being processed",
        )
    }

    fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::SafetyBlockExhausted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::ExtractionFailed(_)
            | PipelineError::SanitizationFailed(_)
            | PipelineError::GenerationFailed(_)
            | PipelineError::Upload(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::StyleCorrupt(_) | PipelineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut api_error = ApiError::new(status, err.code(), err.to_string());
        match err {
            PipelineError::SafetyBlockExhausted {
                attempts, category, ..
            } => {
                api_error.body.attempts = Some(attempts);
                api_error.body.category = Some(category.to_string());
                api_error.body.action = Some("UPLOAD_IMAGE");
            }
            PipelineError::Timeout { attempts } => api_error.body.attempts = Some(attempts),
            _ => {}
        }
        api_error
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        PipelineError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Records the outcome on the timing log before handing the result back.
fn finish<T>(mut timer: RequestTimer, result: Result<T, ApiError>) -> Result<T, ApiError> {
    if let Err(err) = &result {
        timer.mark_status(err.body.code, Some(err.body.message.clone()));
    }
    timer.complete();
    result
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

#[derive(Debug, Deserialize)]
pub struct LearnStyleRequest {
    pub story_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub novel_text: Option<String>,
    #[serde(default)]
    pub novel_text_url: Option<String>,
    #[serde(default)]
    pub thumbnail_upload_url: Option<String>,
    #[serde(default)]
    pub generate_thumbnail: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StyleView {
    pub story_id: String,
    pub title: Option<String>,
    pub mood_descriptors: Vec<String>,
    pub visual_style_descriptors: Vec<String>,
    pub style_summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl From<StyleProfile> for StyleView {
    fn from(profile: StyleProfile) -> Self {
        StyleView {
            story_id: profile.story_id,
            title: profile.title,
            mood_descriptors: profile.mood_descriptors,
            visual_style_descriptors: profile.visual_style_descriptors,
            style_summary: profile.raw_analysis,
            created_at: profile.created_at,
            updated_at: profile.updated_at,
            thumbnail_url: None,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn upload_sink(state: &AppState, upload_url: Option<&str>) -> Result<Arc<dyn ImageSink>, ApiError> {
    match non_blank(upload_url) {
        Some(url) => {
            let sink: Arc<dyn ImageSink> = Arc::new(
                PresignedUrlSink::new(url).map_err(|err| ApiError::bad_request(err.to_string()))?,
            );
            Ok(sink)
        }
        None => Ok(Arc::clone(&state.local_sink)),
    }
}

async fn learn_style(
    State(state): State<AppState>,
    body: Result<Json<LearnStyleRequest>, JsonRejection>,
) -> Result<Json<StyleView>, ApiError> {
    let Json(request) = body?;
    let timer = RequestTimer::start("learn_style", &next_request_id(), &request.story_id);
    let result = learn_style_inner(&state, request).await;
    finish(timer, result).map(Json)
}

async fn learn_style_inner(
    state: &AppState,
    request: LearnStyleRequest,
) -> Result<StyleView, ApiError> {
    validate_story_id(&request.story_id)?;
    let thumbnail_sink = upload_sink(state, request.thumbnail_upload_url.as_deref())?;

    let key = RequestTracker::learn_style_key(
        &request.story_id,
        request.thumbnail_upload_url.as_deref(),
    );
    let _guard = state.tracker.try_begin(key).ok_or_else(ApiError::duplicate)?;

    let novel_text = match (
        non_blank(request.novel_text.as_deref()),
        non_blank(request.novel_text_url.as_deref()),
    ) {
        (Some(text), _) => text.to_string(),
        (None, Some(url)) => download_text(url, state.config.novel_text_max_bytes)
            .await
            .map_err(|err| ApiError::bad_request(format!("could not download novel text: {err}")))?,
        (None, None) => {
            return Err(ApiError::bad_request(
                "either novel_text or novel_text_url is required",
            ))
        }
    };

    let profile = state
        .extractor
        .extract(&request.story_id, &novel_text, request.title.as_deref())
        .await?;
    let previous = match state.store.load(&request.story_id).await {
        Ok(previous) => Some(previous),
        Err(StoreError::NotFound(_)) => None,
        Err(err) => {
            warn!("Replacing unreadable style profile for {}: {err}", request.story_id);
            None
        }
    };
    let profile = profile.replacing(previous.as_ref());
    state.store.save(&profile).await?;
    info!(story_id = %profile.story_id, "Style profile saved");

    let wants_thumbnail = request
        .generate_thumbnail
        .unwrap_or(state.config.generate_thumbnails);
    let thumbnail_url = if wants_thumbnail {
        render_thumbnail(state, &profile, thumbnail_sink.as_ref()).await
    } else {
        None
    };

    let mut view = StyleView::from(profile);
    view.thumbnail_url = thumbnail_url;
    Ok(view)
}

/// Best effort; a failed cover never fails learn-style.
async fn render_thumbnail(
    state: &AppState,
    profile: &StyleProfile,
    sink: &dyn ImageSink,
) -> Option<String> {
    let deadline = Instant::now() + state.config.generation_timeout();
    let image = match state
        .orchestrator
        .generate_with_prompt(
            &profile.story_id,
            THUMBNAIL_NODE_ID,
            compose_thumbnail(profile),
            Some(deadline),
        )
        .await
    {
        Ok(image) => image,
        Err(err) => {
            warn!("Thumbnail generation failed for {}: {err}", profile.story_id);
            return None;
        }
    };

    match sink
        .store(
            &profile.story_id,
            THUMBNAIL_NODE_ID,
            &image.bytes,
            &image.mime_type,
        )
        .await
    {
        Ok(url) => Some(url),
        Err(err) => {
            warn!("Thumbnail upload failed for {}: {err}", profile.story_id);
            None
        }
    }
}

async fn get_style(
    State(state): State<AppState>,
    Path(story_id): Path<String>,
) -> Result<Json<StyleView>, ApiError> {
    let profile = state.store.load(&story_id).await?;
    Ok(Json(StyleView::from(profile)))
}

async fn delete_style(
    State(state): State<AppState>,
    Path(story_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete(&story_id).await?;
    Ok(Json(serde_json::json!({
        "message": format!("style profile for `{story_id}` deleted"),
    })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateImageRequest {
    pub story_id: String,
    pub node_id: String,
    pub user_prompt: String,
    #[serde(default)]
    pub node_text: Option<String>,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GenerateImageResponse {
    pub image_url: String,
    pub enhanced_prompt: String,
    pub prompt_used: String,
    pub story_id: String,
    pub node_id: String,
    pub attempt_index: usize,
    pub attempts: Vec<AttemptRecord>,
}

async fn generate_image(
    State(state): State<AppState>,
    body: Result<Json<GenerateImageRequest>, JsonRejection>,
) -> Result<Json<GenerateImageResponse>, ApiError> {
    let Json(request) = body?;
    let timer = RequestTimer::start("generate_image", &next_request_id(), &request.story_id);
    let result = generate_image_inner(&state, request).await;
    finish(timer, result).map(Json)
}

async fn generate_image_inner(
    state: &AppState,
    request: GenerateImageRequest,
) -> Result<GenerateImageResponse, ApiError> {
    validate_story_id(&request.story_id)?;
    validate_story_id(&request.node_id)
        .map_err(|_| ApiError::bad_request(format!("invalid node id `{}`", request.node_id)))?;
    let sink = upload_sink(state, request.upload_url.as_deref())?;

    let key = RequestTracker::generate_image_key(
        &request.story_id,
        &request.node_id,
        request.upload_url.as_deref(),
        &request.user_prompt,
    );
    let _guard = state.tracker.try_begin(key).ok_or_else(ApiError::duplicate)?;

    let timeout = match request.timeout_seconds {
        Some(seconds) => Duration::from_secs(seconds).min(state.config.generation_timeout()),
        None => state.config.generation_timeout(),
    };
    let image = state
        .orchestrator
        .generate(GenerationRequest {
            story_id: request.story_id,
            node_id: request.node_id,
            user_prompt: request.user_prompt,
            node_text: request.node_text,
            deadline: Some(Instant::now() + timeout),
        })
        .await?;

    let image_url = sink
        .store(&image.story_id, &image.node_id, &image.bytes, &image.mime_type)
        .await
        .map_err(|err| PipelineError::Upload(err.to_string()))?;

    Ok(GenerateImageResponse {
        image_url,
        enhanced_prompt: image.enhanced_prompt,
        prompt_used: image.prompt_used,
        story_id: image.story_id,
        node_id: image.node_id,
        attempt_index: image.attempt_index,
        attempts: image.attempts,
    })
}
