// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Paginated GitLab REST v4 client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const PAGE_CAP: u32 = 20;
pub const PER_PAGE: u32 = 100;

const NEXT_PAGE_HEADER: &str = "x-next-page";
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),

    #[error("invalid url {url}: {reason}")]
    Url { url: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },

    #[error("HTTP {status} {url} :: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

/// Retry schedule for 429, 5xx and transport failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// `min(cap, base * 2^attempt)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Items collected across pages. `error` is set when a page failed; the
/// items gathered before it are kept.
#[derive(Debug, Default)]
pub struct Listing {
    pub items: Vec<Value>,
    pub error: Option<ApiError>,
}

#[async_trait]
pub trait GitlabApi: Send + Sync {
    /// GET `/api/v4/<segments>` following `x-next-page` for at most `max_pages`.
    async fn list(&self, segments: &[String], query: &[(&str, String)], max_pages: u32)
        -> Listing;
}

/// Header carrying the token, chosen from its shape.
pub fn auth_header(token: &str) -> Option<(HeaderName, String)> {
    if token.is_empty() {
        None
    } else if token.starts_with("glpat-") {
        Some((HeaderName::from_static("private-token"), token.to_string()))
    } else if token == "$CI_JOB_TOKEN" || token.starts_with("gljob-") {
        Some((HeaderName::from_static("job-token"), token.to_string()))
    } else {
        Some((AUTHORIZATION, format!("Bearer {token}")))
    }
}

/// Turns a response body into items: arrays are flattened, any other value
/// is one item, and an unparseable body is an empty page.
pub fn page_items(body: &str) -> Vec<Value> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Null) => Vec::new(),
        Ok(item) => vec![item],
        Err(e) => {
            debug!("GITLAB | Ignoring malformed page body: {e}");
            Vec::new()
        }
    }
}

pub struct GitlabClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    retry: RetryPolicy,
}

impl GitlabClient {
    pub fn new(base_url: &str, token: &str, retry: RetryPolicy) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(ApiError::Client)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some((name, value)) = auth_header(token) {
            let value = HeaderValue::from_str(&value).map_err(|e| ApiError::Url {
                url: base_url.to_string(),
                reason: format!("token is not a valid header value: {e}"),
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            retry,
        })
    }

    fn page_url(&self, segments: &[String], query: &[(&str, String)], page: u32) -> Result<Url, ApiError> {
        let raw = format!("{}/api/v4", self.base_url);
        let mut url = Url::parse(&raw).map_err(|e| ApiError::Url {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|()| ApiError::Url {
                url: raw.clone(),
                reason: "cannot be a base".to_string(),
            })?
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if !query.iter().any(|(key, _)| *key == "per_page") {
                pairs.append_pair("per_page", &PER_PAGE.to_string());
            }
            pairs.append_pair("page", &page.to_string());
        }
        Ok(url)
    }

    /// One GET with the retry schedule applied. Returns the body and the next page, if any.
    async fn fetch_page(&self, url: &Url) -> Result<(String, Option<u32>), ApiError> {
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .get(url.clone())
                .headers(self.headers.clone())
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(source) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    debug!("GITLAB | Request to {url} failed ({source}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(source) => {
                    return Err(ApiError::Request {
                        url: url.to_string(),
                        source,
                    })
                }
            };

            let status = response.status();
            if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
                && attempt < self.retry.max_retries
            {
                let delay = retry_after(response.headers(), self.retry.cap)
                    .unwrap_or_else(|| self.retry.backoff(attempt));
                debug!("GITLAB | HTTP {status} from {url}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let next_page = response
                .headers()
                .get(NEXT_PAGE_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u32>().ok())
                .filter(|page| *page > 0);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) if !status.is_success() => {
                    debug!("GITLAB | Cannot read error body from {url}: {e}");
                    String::new()
                }
                Err(source) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    debug!("GITLAB | Reading {url} failed ({source}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(source) => {
                    return Err(ApiError::Request {
                        url: url.to_string(),
                        source,
                    })
                }
            };

            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body: body.chars().take(ERROR_BODY_PREVIEW).collect(),
                });
            }
            return Ok((body, next_page));
        }
    }
}

/// Positive `Retry-After` in seconds, never longer than `max`.
fn retry_after(headers: &HeaderMap, max: Duration) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs > 0.0)?;
    Some(Duration::try_from_secs_f64(secs).map_or(max, |delay| delay.min(max)))
}

#[async_trait]
impl GitlabApi for GitlabClient {
    async fn list(
        &self,
        segments: &[String],
        query: &[(&str, String)],
        max_pages: u32,
    ) -> Listing {
        let mut listing = Listing::default();
        let mut page = 1;
        let mut fetched = 0;
        while fetched < max_pages {
            let url = match self.page_url(segments, query, page) {
                Ok(url) => url,
                Err(e) => {
                    listing.error = Some(e);
                    break;
                }
            };
            match self.fetch_page(&url).await {
                Ok((body, next_page)) => {
                    listing.items.extend(page_items(&body));
                    fetched += 1;
                    match next_page {
                        Some(next) => page = next,
                        None => break,
                    }
                }
                Err(e) => {
                    warn!("GITLAB | {e}");
                    listing.error = Some(e);
                    break;
                }
            }
        }
        listing
    }
}
