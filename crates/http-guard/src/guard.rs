//! Guarded fetch runtime.
//!
//! Redirects are never delegated to the HTTP client: the guard resolves each
//! `Location` itself and re-runs the outbound policy check on every hop.

use crate::policy::{OutboundPolicy, sanitize_reqwest_error};
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Applied when the caller does not supply a per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("outbound request blocked: {0}")]
    SsrfBlocked(String),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("request cancelled")]
    Cancelled,
    #[error("response too large: {0}")]
    ResponseTooLarge(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(sanitize_reqwest_error(&value))
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: Option<Method>,
    pub headers: Vec<(String, String)>,
    /// JSON request body.
    pub body: Option<Value>,
    /// Per-round-trip timeout; [`DEFAULT_TIMEOUT`] when unset.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation for the whole fetch (all hops).
    pub cancel: Option<CancellationToken>,
}

/// Response with the body fully read (and size-capped by the policy).
#[derive(Debug)]
pub struct GuardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl GuardedResponse {
    /// Body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid UTF-8.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| FetchError::Network("response body is not valid UTF-8".to_string()))
    }

    /// Body parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON.
    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| FetchError::Network(format!("response body is not valid JSON: {e}")))
    }
}

/// SSRF-safe, timeout-bounded HTTP fetch primitive.
///
/// Safe to clone and share across tasks.
#[derive(Clone)]
pub struct FetchGuard {
    client: Client,
    policy: OutboundPolicy,
    default_timeout: Duration,
}

impl FetchGuard {
    /// Build a guard for the given policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(policy: OutboundPolicy) -> Result<Self> {
        Self::with_default_timeout(policy, DEFAULT_TIMEOUT)
    }

    /// Build a guard with an explicit default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn with_default_timeout(policy: OutboundPolicy, default_timeout: Duration) -> Result<Self> {
        // Redirects are handled manually so every hop is re-validated.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            policy,
            default_timeout,
        })
    }

    #[must_use]
    pub fn policy(&self) -> &OutboundPolicy {
        &self.policy
    }

    /// Perform a guarded fetch.
    ///
    /// # Errors
    ///
    /// Fails with [`FetchError::SsrfBlocked`] when any hop is disallowed by
    /// the policy, [`FetchError::Timeout`] when a round trip exceeds the
    /// timeout, [`FetchError::TooManyRedirects`] when the redirect budget is
    /// exhausted, [`FetchError::Cancelled`] when the caller's token fires,
    /// and [`FetchError::Network`] for transport failures.
    pub async fn fetch(&self, url: &Url, opts: FetchOptions) -> Result<GuardedResponse> {
        let cancel = opts.cancel.clone();
        let fut = self.fetch_hops(url.clone(), opts);
        match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => Err(FetchError::Cancelled),
                    res = fut => res,
                }
            }
            None => fut.await,
        }
    }

    async fn fetch_hops(&self, mut url: Url, opts: FetchOptions) -> Result<GuardedResponse> {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let mut method = opts.method.clone().unwrap_or(Method::GET);
        let mut body = opts.body.clone();
        let mut headers = opts.headers.clone();

        for _hop in 0..=self.policy.max_redirects {
            self.policy.check_url(&url).await?;

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .timeout(timeout);
            for (key, value) in &headers {
                request = request.header(key, value);
            }
            if let Some(payload) = &body {
                request = request.json(payload);
            }

            let response = request.send().await?;

            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(FetchError::Network(
                        "redirect response without a Location header".to_string(),
                    ));
                };
                let next = url.join(location).map_err(|e| {
                    FetchError::Network(format!("invalid redirect location '{location}': {e}"))
                })?;
                // 303 switches the follow-up request to a body-less GET.
                if response.status() == StatusCode::SEE_OTHER {
                    method = Method::GET;
                    body = None;
                }
                // Credentials never travel to a different host.
                if next.host_str() != url.host_str() {
                    headers.retain(|(name, _)| !is_sensitive_header(name));
                }
                url = next;
                continue;
            }

            let status = response.status();
            let headers = response.headers().clone();
            let bytes =
                read_response_body_limited(response, self.policy.max_response_bytes).await?;
            return Ok(GuardedResponse {
                status,
                headers,
                body: bytes,
            });
        }

        Err(FetchError::TooManyRedirects)
    }
}

fn is_sensitive_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("authorization")
        || name.eq_ignore_ascii_case("cookie")
        || name.eq_ignore_ascii_case("proxy-authorization")
}

async fn read_response_body_limited(
    mut response: reqwest::Response,
    max_bytes: Option<usize>,
) -> Result<Vec<u8>> {
    let Some(max) = max_bytes else {
        let bytes = response.bytes().await?;
        return Ok(bytes.to_vec());
    };

    if let Some(len) = response.content_length()
        && len > max as u64
    {
        return Err(FetchError::ResponseTooLarge(format!(
            "{len} bytes (limit {max})"
        )));
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if out.len().saturating_add(chunk.len()) > max {
            return Err(FetchError::ResponseTooLarge(format!(
                "exceeded {max} bytes"
            )));
        }
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}
