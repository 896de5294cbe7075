//! Single-attempt HTTP fetch utilities for SheetShelf.

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
        }
    }

    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Pulls a human-readable message out of a structured error body.
///
/// Recognizes `{"error": {"message": ..}}` (Google APIs), `{"error": ".."}`
/// and `{"message": ..}`. Returns `None` for non-JSON or blank messages.
pub fn diagnostic_message(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    let candidates = [
        json_str(&value, &["error", "message"]),
        json_str(&value, &["error"]),
        json_str(&value, &["message"]),
    ];
    let found = candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string);
    found
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Issues one GET. No retries: the caller inspects
    /// [`FetchError::retry_disposition`] and decides.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("sheet_fetch", %run_id, source_id);
        async move {
            // reqwest errors embed the full URL, query string (API key) included.
            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    let err = err.without_url();
                    warn!(error = %err, "request failed");
                    return Err(FetchError::Request(err));
                }
            };

            let status = resp.status();
            // Query strings may carry API keys; keep them out of errors and logs.
            let mut final_url = resp.url().clone();
            final_url.set_query(None);
            let final_url = final_url.to_string();
            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = match resp.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(err) => {
                    let err = err.without_url();
                    warn!(error = %err, "reading body failed");
                    return Err(FetchError::Request(err));
                }
            };

            if status.is_success() {
                debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    content_type,
                    body,
                    fetched_at: Utc::now(),
                });
            }

            let message = diagnostic_message(&body)
                .unwrap_or_else(|| format!("http status {} for {}", status.as_u16(), final_url));
            warn!(status = status.as_u16(), %message, "non-success response");
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                message,
            })
        }
        .instrument(span)
        .await
    }
}
