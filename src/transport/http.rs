use super::{OutcomeFuture, SendRequest, Transport, TransportError};
use crate::batch::{FailureReason, OperationId, Outcome, PayloadRef};
use crate::{Error, ErrorContext, Result};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Proxy};
use std::env;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpPutConfig {
    pub endpoint: Url,
    pub bucket: String,
    /// Object key is `{key_prefix}{operation index}`.
    pub key_prefix: String,
    pub timeout: Duration,
}

impl HttpPutConfig {
    pub fn new(endpoint: Url, bucket: impl Into<String>) -> Self {
        Self {
            endpoint,
            bucket: bucket.into(),
            key_prefix: "object-".to_string(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Uploads each payload with a single streaming `PUT`.
///
/// Any 2xx status is a success; every other status (e.g. `507 Insufficient
/// Storage` from a full store) and every connection error is a transport
/// failure of that one operation.
pub struct HttpPutTransport {
    client: reqwest::Client,
    config: HttpPutConfig,
}

impl HttpPutTransport {
    pub fn new(config: HttpPutConfig) -> Result<Self> {
        // Env knobs mirror the config so deployments can tune without rebuilding.
        let timeout = env::var("UPLOAD_BATCH_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(config.timeout);

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(
                env::var("UPLOAD_BATCH_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            );

        if let Ok(proxy_url) = env::var("UPLOAD_BATCH_PROXY_URL") {
            let proxy = Proxy::all(&proxy_url).map_err(|e| {
                Error::configuration_with_context(
                    "invalid proxy URL",
                    ErrorContext::new()
                        .with_field_path("UPLOAD_BATCH_PROXY_URL")
                        .with_details(e.to_string())
                        .with_source("http_transport"),
                )
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(TransportError::Http)?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpPutConfig {
        &self.config
    }

    pub fn object_key(&self, id: OperationId) -> String {
        format!("{}{}", self.config.key_prefix, id.index())
    }

    pub fn object_url(&self, id: OperationId) -> std::result::Result<Url, TransportError> {
        let mut url = self.config.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidRequest {
                id,
                message: format!("endpoint {} cannot carry a path", self.config.endpoint),
            })?
            .pop_if_empty()
            .push(&self.config.bucket)
            .push(&self.object_key(id));
        Ok(url)
    }
}

impl Transport for HttpPutTransport {
    fn send(&self, request: SendRequest) -> std::result::Result<OutcomeFuture, TransportError> {
        let url = self.object_url(request.id)?;
        let client = self.client.clone();
        let id = request.id;
        let payload = request.payload;

        Ok(Box::pin(async move {
            let (body, len) = match open_body(payload).await {
                Ok(b) => b,
                Err(e) => {
                    return Outcome::failure(FailureReason::transport(format!(
                        "cannot read payload: {e}"
                    )))
                }
            };

            debug!(operation = %id, %url, bytes = len, "PUT");
            let resp = match client
                .put(url)
                .header(CONTENT_LENGTH, len)
                .body(body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => return Outcome::failure(FailureReason::transport(e.to_string())),
            };

            let status = resp.status();
            if status.is_success() {
                Outcome::Success
            } else {
                let text = resp.text().await.unwrap_or_default();
                Outcome::failure(FailureReason::transport(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    text.trim()
                )))
            }
        }))
    }
}

async fn open_body(payload: PayloadRef) -> std::io::Result<(Body, u64)> {
    match payload {
        PayloadRef::File(path) => {
            let file = tokio::fs::File::open(&path).await?;
            let len = file.metadata().await?.len();
            Ok((Body::wrap_stream(ReaderStream::new(file)), len))
        }
        PayloadRef::Bytes(b) => {
            let len = b.len() as u64;
            Ok((Body::from(b), len))
        }
    }
}
