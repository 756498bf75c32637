//! HTTP client plumbing shared by the services: JSON helpers that forward
//! the caller's auth cookie verbatim, upstream error mapping, bounded
//! retries with exponential backoff, and an SSE consumer.

use std::future::Future;
use std::time::Duration;

use futures::Stream;
use reqwest::header::{COOKIE, ETAG, IF_MATCH};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{DepotError, Result};

/// Default retry budget for recoverable upstream failures.
pub const RETRY_ATTEMPTS: u32 = 3;
/// First backoff delay; doubles per attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Deadline for unary upstream requests. Streaming requests (SSE) are
/// exempt; their liveness comes from keep-alive events.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A reqwest wrapper that carries an opaque auth cookie end-to-end.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    cookie: Option<String>,
}

impl ApiClient {
    pub fn new(http: reqwest::Client) -> ApiClient {
        ApiClient { http, cookie: None }
    }

    /// Same client, carrying the given cookie on every request.
    pub fn with_cookie(&self, cookie: Option<String>) -> ApiClient {
        ApiClient {
            http: self.http.clone(),
            cookie,
        }
    }

    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.cookie {
            Some(cookie) => builder.header(COOKIE, cookie),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = self
            .apply(builder)
            .send()
            .await
            .map_err(|err| DepotError::UpstreamUnavailable(err.to_string()))?;
        check_status(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.send(self.http.get(url).timeout(REQUEST_TIMEOUT)).await?;
        response
            .json()
            .await
            .map_err(|err| DepotError::UpstreamUnavailable(format!("{url}: {err}")))
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .send(self.http.post(url).json(body).timeout(REQUEST_TIMEOUT))
            .await?;
        response
            .json()
            .await
            .map_err(|err| DepotError::UpstreamUnavailable(format!("{url}: {err}")))
    }

    /// GET raw bytes, optionally conditional on an ETag. Returns the
    /// response's ETag header alongside the payload.
    pub async fn get_bytes(
        &self,
        url: &str,
        if_match: Option<&str>,
    ) -> Result<(Option<String>, Vec<u8>)> {
        let mut builder = self.http.get(url).timeout(REQUEST_TIMEOUT);
        if let Some(etag) = if_match {
            builder = builder.header(IF_MATCH, etag);
        }
        let response = self.send(builder).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| DepotError::UpstreamUnavailable(format!("{url}: {err}")))?;
        Ok((etag, bytes.to_vec()))
    }

    /// GET a streaming response (SSE) without buffering the body.
    pub async fn get_stream(&self, url: &str) -> Result<Response> {
        self.send(self.http.get(url)).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => DepotError::AuthRejected,
        StatusCode::NOT_FOUND => DepotError::NotFound(format!("{url}: {body}")),
        StatusCode::CONFLICT => DepotError::EtagMismatch {
            path: url,
            recorded: String::new(),
            current: etag.unwrap_or_default(),
        },
        _ => DepotError::UpstreamUnavailable(format!("{url}: {status}: {body}")),
    })
}

/// Run an upstream operation with bounded retries and exponential backoff.
/// Only transient failures ([`DepotError::UpstreamUnavailable`]) are
/// retried; everything else propagates immediately.
pub async fn with_retries<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(DepotError::UpstreamUnavailable(reason)) if attempt < RETRY_ATTEMPTS => {
                debug!(attempt, %reason, "retrying upstream request");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Turn an SSE response body into a stream of `data:` payloads, one item
/// per event. Comment lines and keep-alives are skipped.
pub fn sse_data(response: Response) -> impl Stream<Item = Result<String>> {
    async_stream::try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut data_lines: Vec<String> = Vec::new();

        use futures::StreamExt;
        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|err| DepotError::UpstreamUnavailable(format!("event stream: {err}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline).collect();
                let text = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
                let line = text.strip_suffix('\r').unwrap_or(&text);

                if line.is_empty() {
                    if !data_lines.is_empty() {
                        yield data_lines.join("\n");
                        data_lines.clear();
                    }
                } else if let Some(data) = line.strip_prefix("data:") {
                    data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_owned());
                }
                // Other fields (event, id, retry) and comments are ignored.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_only_transient_failures() {
        let mut calls = 0;
        let result: Result<()> = with_retries(|| {
            calls += 1;
            async move { Err(DepotError::UpstreamUnavailable("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(DepotError::UpstreamUnavailable(_))));
        assert_eq!(calls, RETRY_ATTEMPTS);

        let mut calls = 0;
        let result: Result<()> = with_retries(|| {
            calls += 1;
            async move { Err(DepotError::NotFound("gone".into())) }
        })
        .await;
        assert!(matches!(result, Err(DepotError::NotFound(_))));
        assert_eq!(calls, 1);
    }
}
