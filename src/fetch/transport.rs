use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;

/// Opens transfers against a backend instance
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn TransferBody>, FetchError>;
}

/// Body of one response, read incrementally
#[async_trait]
pub trait TransferBody: Send {
    /// Length announced by the backend, if any
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the body, `None` once it is complete
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError>;
}

/// Resolve a locator against a backend instance base URL
pub fn resolve_url(instance: &str, locator: &str) -> String {
    format!(
        "{}/{}",
        instance.trim_end_matches('/'),
        locator.trim_start_matches('/')
    )
}

/// HTTP transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("streamplay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::TransientNetwork(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransferBody>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::MalformedResponse(format!("HTTP {} from {}", status.as_u16(), url)));
        }

        Ok(Box::new(HttpBody { response }))
    }
}

struct HttpBody {
    response: reqwest::Response,
}

#[async_trait]
impl TransferBody for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        match self.response.chunk().await {
            Ok(chunk) => Ok(chunk.map(|bytes| bytes.to_vec())),
            Err(e) => Err(FetchError::TransientNetwork(e.to_string())),
        }
    }
}
