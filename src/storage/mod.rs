//! Hand-off of finished images to object storage or a local directory.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use url::Url;

use crate::llm::media::{detect_mime_type, extension_for_mime};
use crate::style::store::validate_story_id;
use crate::utils::http::get_http_client;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid upload url: {0}")]
    InvalidUrl(String),
    #[error("invalid path segment `{0}`")]
    InvalidPath(String),
    #[error("upload request failed: {0}")]
    Request(String),
    #[error("upload rejected with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to write image: {0}")]
    Io(String),
}

/// Receives the final image bytes and returns where they can be fetched.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn store(
        &self,
        story_id: &str,
        node_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, SinkError>;
}

/// PUTs bytes to a caller-issued presigned URL.
#[derive(Debug, Clone)]
pub struct PresignedUrlSink {
    upload_url: Url,
}

impl PresignedUrlSink {
    pub fn new(upload_url: &str) -> Result<Self, SinkError> {
        let parsed = Url::parse(upload_url.trim())
            .map_err(|err| SinkError::InvalidUrl(format!("{upload_url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SinkError::InvalidUrl(format!(
                "unsupported scheme `{}`",
                parsed.scheme()
            )));
        }
        Ok(PresignedUrlSink { upload_url: parsed })
    }

    /// The object URL without the signature query.
    pub fn public_url(&self) -> String {
        let mut public = self.upload_url.clone();
        public.set_query(None);
        public.set_fragment(None);
        public.to_string()
    }
}

#[async_trait]
impl ImageSink for PresignedUrlSink {
    async fn store(
        &self,
        story_id: &str,
        node_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, SinkError> {
        let content_type = detect_mime_type(bytes).unwrap_or_else(|| mime_type.to_string());
        let response = get_http_client()
            .put(self.upload_url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|err| SinkError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Presigned upload failed with status {}", status);
            return Err(SinkError::Status {
                status: status.as_u16(),
                message: message.chars().take(300).collect(),
            });
        }

        let url = self.public_url();
        info!(story_id, node_id, "Uploaded image to {}", url);
        Ok(url)
    }
}

/// Writes `{root}/{story_id}/{node_id}.{ext}`.
#[derive(Debug, Clone)]
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirSink { root: root.into() }
    }
}

fn checked_segment(value: &str) -> Result<&str, SinkError> {
    validate_story_id(value)
        .map(|_| value)
        .map_err(|_| SinkError::InvalidPath(value.to_string()))
}

#[async_trait]
impl ImageSink for LocalDirSink {
    async fn store(
        &self,
        story_id: &str,
        node_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, SinkError> {
        let dir = self.root.join(checked_segment(story_id)?);
        let mime_type = detect_mime_type(bytes).unwrap_or_else(|| mime_type.to_string());
        let path = dir.join(format!(
            "{}.{}",
            checked_segment(node_id)?,
            extension_for_mime(&mime_type)
        ));

        fs::create_dir_all(&dir)
            .await
            .map_err(|err| SinkError::Io(format!("{}: {err}", dir.display())))?;
        fs::write(&path, bytes)
            .await
            .map_err(|err| SinkError::Io(format!("{}: {err}", path.display())))?;

        info!(story_id, node_id, "Saved image to {}", path.display());
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PNG_MAGIC;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn public_url_drops_signature() {
        let sink =
            PresignedUrlSink::new("https://bucket.example.com/s1/n1.png?X-Amz-Signature=abc#x")
                .unwrap();
        assert_eq!(sink.public_url(), "https://bucket.example.com/s1/n1.png");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            PresignedUrlSink::new("file:///etc/passwd"),
            Err(SinkError::InvalidUrl(_))
        ));
        assert!(matches!(
            PresignedUrlSink::new("not a url"),
            Err(SinkError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn puts_bytes_with_sniffed_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/s1/n1.png"))
            .and(query_param("sig", "abc"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = PresignedUrlSink::new(&format!("{}/s1/n1.png?sig=abc", server.uri())).unwrap();
        let url = sink
            .store("s1", "n1", PNG_MAGIC, "application/octet-stream")
            .await
            .unwrap();

        assert_eq!(url, format!("{}/s1/n1.png", server.uri()));
    }

    #[tokio::test]
    async fn upload_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("SignatureDoesNotMatch"))
            .mount(&server)
            .await;

        let sink = PresignedUrlSink::new(&format!("{}/s1/n1.png", server.uri())).unwrap();
        let err = sink
            .store("s1", "n1", PNG_MAGIC, "image/png")
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn local_sink_writes_under_story_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalDirSink::new(dir.path());

        let location = sink.store("s1", "n1", PNG_MAGIC, "image/png").await.unwrap();

        let expected = dir.path().join("s1").join("n1.png");
        assert_eq!(location, expected.display().to_string());
        assert_eq!(std::fs::read(expected).unwrap(), PNG_MAGIC);
    }

    #[tokio::test]
    async fn local_sink_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalDirSink::new(dir.path());

        let err = sink
            .store("s1", "../n1", PNG_MAGIC, "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::InvalidPath(_)));
    }
}
