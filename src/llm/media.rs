use std::io::Cursor;
use std::time::Duration;

use encoding_rs::{Encoding, EUC_KR};
use futures_util::StreamExt;
use image::imageops::FilterType;
use image::ImageFormat;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, StatusCode};
use tracing::{info, warn};

use crate::utils::http::get_http_client;
use crate::utils::text::truncate_for_log;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Resizes to the target resolution and re-encodes as PNG.
///
/// Bytes that cannot be decoded are returned unchanged.
pub fn resize_to_target(image_bytes: Vec<u8>, width: u32, height: u32) -> Vec<u8> {
    let decoded = match image::load_from_memory(&image_bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!("Skipping resize, image could not be decoded: {}", err);
            return image_bytes;
        }
    };

    if decoded.width() == width && decoded.height() == height {
        return image_bytes;
    }

    let original = (decoded.width(), decoded.height());
    let resized = decoded.resize_exact(width, height, FilterType::Lanczos3);
    let mut buffer = Cursor::new(Vec::new());
    if let Err(err) = resized.write_to(&mut buffer, ImageFormat::Png) {
        warn!("Failed to encode resized image: {}", err);
        return image_bytes;
    }

    let resized_bytes = buffer.into_inner();
    info!(
        "Resized image {:?} -> ({}, {}), {} bytes -> {} bytes",
        original,
        width,
        height,
        image_bytes.len(),
        resized_bytes.len()
    );
    resized_bytes
}

const TEXT_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const TEXT_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const TEXT_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches('"').as_bytes())
    })
}

/// Decodes with the declared charset, then UTF-8, then EUC-KR (cp949).
pub fn decode_text(bytes: &[u8], content_type: Option<&str>) -> String {
    if let Some(encoding) = content_type.and_then(charset_from_content_type) {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return text.into_owned();
        }
        warn!(
            "Novel text is not valid {}; trying UTF-8 and EUC-KR",
            encoding.name()
        );
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    let (text, _, had_errors) = EUC_KR.decode(bytes);
    if had_errors {
        warn!("Novel text is neither UTF-8 nor EUC-KR; undecodable bytes replaced");
    }
    text.into_owned()
}

async fn read_capped(response: Response, max_bytes: usize) -> Result<Vec<u8>, String> {
    if let Some(length) = response.content_length() {
        if length > max_bytes as u64 {
            return Err(format!(
                "novel text is {length} bytes, limit is {max_bytes} bytes"
            ));
        }
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        if body.len() + chunk.len() > max_bytes {
            return Err(format!("novel text exceeds the {max_bytes} byte limit"));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Downloads a novel's text, refusing bodies larger than `max_bytes`.
pub async fn download_text(url: &str, max_bytes: usize) -> Result<String, String> {
    let client = get_http_client();
    let mut last_error = String::new();
    for attempt in 0..TEXT_DOWNLOAD_MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = TEXT_DOWNLOAD_BASE_DELAY_MS.saturating_mul(attempt as u64);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    "Failed to fetch novel text: {} (timeout={}, connect={}, attempt={}/{})",
                    err,
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    TEXT_DOWNLOAD_MAX_ATTEMPTS
                );
                last_error = err.to_string();
                if should_retry_error(&err) {
                    continue;
                }
                return Err(last_error);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            last_error = format!(
                "status {}: {}",
                status,
                truncate_for_log(&body, TEXT_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            warn!(
                "Novel text download failed with {} (attempt={}/{})",
                last_error,
                attempt + 1,
                TEXT_DOWNLOAD_MAX_ATTEMPTS
            );
            if should_retry_status(status) {
                continue;
            }
            return Err(last_error);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = read_capped(response, max_bytes).await?;
        return Ok(decode_text(&body, content_type.as_deref()));
    }

    Err(last_error)
}
