use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use reqwest::{
    multipart::{Form, Part},
    Body, Client,
};
use shared::{
    domain::{FilePayload, PayloadSource},
    error::UploadError,
    protocol::{UploadOptions, UploadResponse},
};
use tracing::{debug, warn};

pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Receives upload progress as a whole percentage in `0..=100`.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Performs exactly one upload. Implementations never touch queue state;
/// the caller decides what a result means.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(
        &self,
        file: &FilePayload,
        options: &UploadOptions,
        progress: ProgressCallback,
    ) -> Result<UploadResponse, UploadError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransportConfig {
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// Multipart upload over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUploadTransport {
    http: Client,
}

impl HttpUploadTransport {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub fn from_config(config: &HttpTransportConfig) -> reqwest::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self::with_client(builder.build()?))
    }
}

impl Default for HttpUploadTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn upload(
        &self,
        file: &FilePayload,
        options: &UploadOptions,
        progress: ProgressCallback,
    ) -> Result<UploadResponse, UploadError> {
        let bytes = read_payload(file).await?;
        let total = bytes.len() as u64;
        let mime_type = mime_type_for(file);

        let part = Part::stream_with_length(progress_body(bytes, Arc::clone(&progress)), total)
            .file_name(file.file_name.clone())
            .mime_str(&mime_type)
            .map_err(|e| UploadError::payload(format!("invalid mime type '{mime_type}': {e}")))?;

        let mut form = Form::new().part(options.field_name.clone(), part);
        for (key, value) in &options.extra {
            form = form.text(key.clone(), value.clone());
        }

        let mut request = self.http.post(&options.endpoint).multipart(form);
        if let Some(token) = options.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        debug!(
            endpoint = %options.endpoint,
            file = %file.file_name,
            size_bytes = total,
            "sending upload"
        );

        let response = request.send().await.map_err(|e| {
            warn!(endpoint = %options.endpoint, error = %e, "upload request did not complete");
            UploadError::network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::upload_failed(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
            ));
        }
        progress(100);

        let body = response
            .text()
            .await
            .map_err(|e| UploadError::network(format!("failed to read response body: {e}")))?;
        Ok(UploadResponse::from_body(body))
    }
}

async fn read_payload(file: &FilePayload) -> Result<Bytes, UploadError> {
    match &file.source {
        PayloadSource::Bytes(bytes) => Ok(bytes.clone()),
        PayloadSource::Path(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| UploadError::payload(format!("{}: {e}", path.display()))),
    }
}

fn mime_type_for(file: &FilePayload) -> String {
    match &file.mime_type {
        Some(mime_type) if !mime_type.trim().is_empty() => mime_type.clone(),
        _ => mime_guess::from_path(&file.file_name)
            .first_raw()
            .unwrap_or(FALLBACK_MIME_TYPE)
            .to_string(),
    }
}

/// Streams `bytes` as zero-copy chunks. A chunk is only pulled once the
/// previous one has been taken by the connection, so progress trails by one
/// chunk; the caller reports 100 after the server has answered.
fn progress_body(bytes: Bytes, progress: ProgressCallback) -> Body {
    let total = bytes.len();
    let chunks = stream::iter((0..total).step_by(UPLOAD_CHUNK_SIZE)).map(move |start| {
        if start > 0 {
            progress(progress_percent(start as u64, total as u64));
        }
        let end = (start + UPLOAD_CHUNK_SIZE).min(total);
        Ok::<_, std::io::Error>(bytes.slice(start..end))
    });
    Body::wrap_stream(chunks)
}

/// `round(sent * 100 / total)`, clamped to 100. An empty payload counts as
/// fully sent.
pub fn progress_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let sent = u128::from(sent.min(total));
    let total = u128::from(total);
    ((sent * 100 + total / 2) / total) as u8
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
