//! Outbound JSON HTTP client.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::HttpClientConfig;
use crate::error::Result;

/// A completed outbound call, whatever its status.
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl HttpResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body as JSON.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared `reqwest` client with the configured timeout and default headers.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "invalid default header, skipped"),
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }

    /// GET `url`, with `query` encoded into the query string.
    pub async fn get<Q>(&self, url: &str, query: Option<&Q>, headers: &[(&str, &str)]) -> Result<HttpResult>
    where
        Q: Serialize + ?Sized,
    {
        let mut builder = self.client.get(url);
        if let Some(query) = query {
            builder = builder.query(query);
        }
        self.send(Method::GET, url, builder, headers).await
    }

    /// POST `url` with `body` as JSON.
    pub async fn post<B>(&self, url: &str, body: Option<&B>, headers: &[(&str, &str)]) -> Result<HttpResult>
    where
        B: Serialize + ?Sized,
    {
        let mut builder = self.client.post(url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(Method::POST, url, builder, headers).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        mut builder: RequestBuilder,
        headers: &[(&str, &str)],
    ) -> Result<HttpResult> {
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let start = Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let elapsed = start.elapsed();

        debug!(%method, url, status, elapsed_ms = elapsed.as_millis() as u64, "outbound request");
        Ok(HttpResult { status, headers, body, elapsed })
    }
}
