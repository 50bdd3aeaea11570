//! Error types for the OpenTools client core.

use opentools_http_guard::FetchError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for discovery, parsing, and tool invocation.
///
/// Approval denial is deliberately **not** here: a denied call is a
/// successful [`crate::tools::InvokeOutcome::Denied`] result, so the calling
/// model can react to it in conversation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failures (SSRF block, timeout, redirect budget, cancellation).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// No discovery document at the well-known location.
    #[error("no discovery document at '{0}'")]
    DiscoveryNotFound(String),

    /// Discovery document or OpenAPI document violates the expected shape.
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Discovery document declares an auth scheme this client does not know.
    #[error("unsupported auth scheme '{0}'")]
    UnsupportedAuthScheme(String),

    /// The OpenAPI document carries no root `x-llm` block: the app does not
    /// participate. Expected and non-fatal; callers must handle it.
    #[error("document does not participate (no root x-llm extension)")]
    NoLlmExtension,

    /// The OpenAPI document is not a supported spec version.
    #[error("unsupported OpenAPI version '{0}'")]
    UnsupportedSpecVersion(String),

    /// Tool arguments failed input-schema validation.
    #[error("invalid params: {}", violations.join("; "))]
    InvalidParams { violations: Vec<String> },

    /// Per-operation token bucket is exhausted; retry after the window.
    #[error("rate limited (retry after {})", format_retry_after(*retry_after))]
    RateLimited { retry_after: Duration },

    /// OAuth2 token rejected even after the single refresh-and-retry.
    #[error("authorization expired")]
    AuthExpired,

    /// Credential provider failed to produce a token.
    #[error("credential error: {0}")]
    Credential(String),

    /// The remote endpoint answered with a non-success status.
    #[error("endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
}

fn format_retry_after(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

/// Result type alias for client-core operations.
pub type Result<T> = std::result::Result<T, ClientError>;
