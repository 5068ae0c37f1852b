//! Network access used by the interceptor and the install step.
//!
//! A transport only reports whether the backend could be reached. Non-2xx
//! statuses come back as ordinary responses; judging them is the caller's job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::http::{self, Request, Response};

/// Maximum number of retries for rate-limited (429) idempotent requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay for rate limiting.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// `reqwest`-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    initial_backoff: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    pub fn with_rate_limit_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    async fn send_once(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Request(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Request(e.to_string()))?;
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();
        Ok(Response::new(status, headers, body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.send_once(request).await?;
            // Only replay requests that are safe to send twice
            if response.status != 429 || !http::is_idempotent(&request.method) {
                debug!(method = %request.method, url = %request.url, status = response.status, "Fetched");
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Ok(response);
            }
            warn!(url = %request.url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}
