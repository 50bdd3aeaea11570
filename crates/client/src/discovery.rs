//! Discovery resolver.
//!
//! Resolves a base URL to a [`DiscoveryDocument`] by fetching the well-known
//! manifest and validating its shape.

use crate::error::{ClientError, Result};
use opentools_http_guard::{FetchGuard, FetchOptions};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

/// Well-known path of the discovery manifest, relative to the app base URL.
pub const WELL_KNOWN_PATH: &str = "/.well-known/llm.json";

/// Auth scheme declared by the discovery document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    ApiKey,
    Oauth2,
}

/// Resolved discovery document. Immutable once resolved; cached per
/// connection with a TTL (see [`crate::connection::Connection`]).
#[derive(Debug, Clone)]
pub struct DiscoveryDocument {
    /// Absolute URL of the OpenAPI document.
    pub spec_url: Url,
    /// Declared auth scheme.
    pub auth: AuthScheme,
}

#[derive(Debug, Deserialize)]
struct RawDiscovery {
    /// Path or URL of the OpenAPI document.
    openapi: Option<String>,
    auth: Option<String>,
}

/// Fetch and validate `{base_url}/.well-known/llm.json`.
///
/// # Errors
///
/// - [`ClientError::DiscoveryNotFound`] when the manifest is missing (404/410)
/// - [`ClientError::MalformedDocument`] when it is not the expected JSON shape
/// - [`ClientError::UnsupportedAuthScheme`] for unknown `auth` values
/// - [`ClientError::Fetch`] for transport failures
pub async fn discover(guard: &FetchGuard, base_url: &Url) -> Result<DiscoveryDocument> {
    let url = base_url
        .join(WELL_KNOWN_PATH)
        .map_err(|e| ClientError::MalformedDocument(format!("invalid base URL: {e}")))?;

    let response = guard.fetch(&url, FetchOptions::default()).await?;

    if response.status == StatusCode::NOT_FOUND || response.status == StatusCode::GONE {
        return Err(ClientError::DiscoveryNotFound(url.to_string()));
    }
    if !response.status.is_success() {
        return Err(ClientError::Endpoint {
            status: response.status.as_u16(),
            body: response.text().unwrap_or("").to_string(),
        });
    }

    let raw: RawDiscovery = serde_json::from_slice(&response.body)
        .map_err(|e| ClientError::MalformedDocument(format!("discovery document: {e}")))?;

    let spec_ref = raw.openapi.ok_or_else(|| {
        ClientError::MalformedDocument("discovery document is missing 'openapi'".to_string())
    })?;
    let auth_value = raw.auth.ok_or_else(|| {
        ClientError::MalformedDocument("discovery document is missing 'auth'".to_string())
    })?;

    let auth = match auth_value.as_str() {
        "api-key" => AuthScheme::ApiKey,
        "oauth2" => AuthScheme::Oauth2,
        other => return Err(ClientError::UnsupportedAuthScheme(other.to_string())),
    };

    // A relative spec reference resolves against the base URL; an absolute
    // one passes through unchanged.
    let spec_url = base_url.join(&spec_ref).map_err(|e| {
        ClientError::MalformedDocument(format!("invalid spec reference '{spec_ref}': {e}"))
    })?;

    Ok(DiscoveryDocument { spec_url, auth })
}
