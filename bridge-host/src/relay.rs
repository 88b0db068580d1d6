//! Staged-image retrieval from the external relay.
//!
//! The browser side uploads image bytes to the relay and only sends the
//! resulting id over the bridge; the host fetches the bytes back here.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;

/// Error fetching a staged image.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay error: {0}")]
    Rejected(String),
    #[error("invalid image payload: {0}")]
    BadPayload(String),
}

/// Source of staged image bytes. Seam for tests; production uses
/// [`HttpImageSource`].
pub trait ImageSource: Send + Sync {
    /// Fetch and decode the PNG bytes staged under `image_id`.
    fn fetch(&self, image_id: &str) -> Result<Vec<u8>, RelayError>;
}

#[derive(Debug, Deserialize)]
struct StagedImage {
    success: bool,
    #[serde(rename = "imageData")]
    image_data: Option<String>,
    error: Option<String>,
}

/// Fetches `GET <base_url>?id=<image_id>` and decodes the data-URL payload.
pub struct HttpImageSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpImageSource {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, image_id: &str) -> Result<Vec<u8>, RelayError> {
        let url = format!("{}?id={}", self.base_url, image_id);
        log::debug!("fetching staged image from {url}");
        let staged: StagedImage = self
            .client
            .get(&url)
            .send()?
            .error_for_status()?
            .json()?;
        if !staged.success {
            return Err(RelayError::Rejected(
                staged.error.unwrap_or_else(|| "image download failed".to_string()),
            ));
        }
        let data = staged
            .image_data
            .ok_or_else(|| RelayError::BadPayload("missing imageData".to_string()))?;
        decode_data_url(&data)
    }
}

/// Decode a `data:image/png;base64,...` payload. Bare base64 without the
/// data-URL prefix is accepted too.
pub fn decode_data_url(data: &str) -> Result<Vec<u8>, RelayError> {
    let b64 = match data.split_once(',') {
        Some((_, rest)) => rest,
        None => data,
    };
    BASE64
        .decode(b64.trim())
        .map_err(|e| RelayError::BadPayload(e.to_string()))
}
