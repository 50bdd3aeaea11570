//! Credential attacher.
//!
//! One variant per discovery auth scheme. The OAuth2 variant delegates token
//! storage and the refresh grant to a host-supplied [`TokenProvider`]; the
//! core only decides *when* to refresh (exactly once, on an authorization
//! failure).

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Host-supplied source of OAuth2 access tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token.
    async fn access_token(&self) -> Result<String>;

    /// Run the refresh grant and return the new access token.
    async fn refresh(&self) -> Result<String>;
}

/// Stored credential for one connection, tagged by auth scheme.
#[derive(Clone)]
pub enum Credential {
    ApiKey { key: String },
    OAuth2 { provider: Arc<dyn TokenProvider> },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { .. } => f.write_str("Credential::ApiKey"),
            Self::OAuth2 { .. } => f.write_str("Credential::OAuth2"),
        }
    }
}

impl Credential {
    /// Produce the `Authorization` header for a request.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClientError::Credential`] when the token
    /// provider fails.
    pub(crate) async fn authorization_header(&self) -> Result<(String, String)> {
        let token = match self {
            Self::ApiKey { key } => key.clone(),
            Self::OAuth2 { provider } => provider.access_token().await?,
        };
        Ok(("Authorization".to_string(), format!("Bearer {token}")))
    }

    /// Refresh after an authorization failure and produce a replacement
    /// header; `None` means the scheme has no refresh path (a 401 is final).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ClientError::Credential`] when the refresh
    /// grant fails.
    pub(crate) async fn refreshed_header(&self) -> Result<Option<(String, String)>> {
        match self {
            Self::ApiKey { .. } => Ok(None),
            Self::OAuth2 { provider } => {
                let token = provider.refresh().await?;
                Ok(Some((
                    "Authorization".to_string(),
                    format!("Bearer {token}"),
                )))
            }
        }
    }
}
