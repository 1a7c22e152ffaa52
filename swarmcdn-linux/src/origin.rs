//! Origin (CDN) fetch over HTTP.

use std::time::Duration;

/// HTTP client for whole-chunk GETs against the origin.
#[derive(Clone)]
pub struct OriginClient {
    http: reqwest::Client,
}

impl OriginClient {
    pub fn new(timeout: Duration) -> Result<Self, OriginError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(OriginError::Http)?;
        Ok(Self { http })
    }

    /// GET the resource URL and return the body. Non-2xx responses are errors; no retry.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, OriginError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OriginError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Error fetching from the origin.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("origin returned status {0}")]
    Status(u16),
}
