use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::traits::FetchDocument;
use crate::types::RawDocument;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self { client, config })
    }

    fn too_large(&self, url: &str) -> FetchError {
        FetchError::TooLarge {
            url: url.to_string(),
            limit: self.config.max_body_bytes,
        }
    }
}

#[async_trait]
impl FetchDocument for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::ConnectionFailure {
            url: url.to_string(),
            message: format!("invalid url: {}", e),
        })?;

        debug!("Fetching feed document: {}", url);
        let fetched_at = Utc::now();

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(content_length) = response.content_length() {
            if content_length > self.config.max_body_bytes as u64 {
                return Err(self.too_large(url));
            }
        }

        // Content-Length can be absent or wrong, so the cap is enforced while reading.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?
        {
            if body.len() + chunk.len() > self.config.max_body_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }

        info!("Fetched feed document: {} ({} bytes)", url, body.len());

        Ok(RawDocument {
            url: url.to_string(),
            status: status.as_u16(),
            content_length: body.len(),
            fetched_at,
            body,
        })
    }
}
