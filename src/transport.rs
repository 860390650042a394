use std::time::Duration;

use reqwest::{header::CONTENT_TYPE, Client};

use crate::error::FetchError;

pub const DEFAULT_USER_AGENT: &str = concat!(
    "feedsync/",
    env!("CARGO_PKG_VERSION"),
    " (feed synchronizer)"
);

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Fetched {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
            .unwrap_or(false)
    }
}

/// Outbound HTTP GET shared by feed and favicon retrieval.
///
/// Every request carries the same identifying user agent. Cloning is cheap;
/// the underlying connection pool is shared.
#[derive(Clone)]
pub struct Transport {
    client: Client,
}

impl Transport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }

    pub async fn get(&self, url: &str) -> Result<Fetched, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?.to_vec();

        Ok(Fetched { content_type, body })
    }
}
