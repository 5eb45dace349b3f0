//! ACL token resolution against the upstream.
//!
//! When a stage opts into token resolution, the caller's `X-Nomad-Token` is
//! exchanged for its token descriptor via Nomad's self endpoint, reusing the
//! proxy's upstream transport. Failures here are never fatal: Nomad's
//! bootstrap call is issued without a token, so the pipeline context simply
//! stays anonymous.

use http::StatusCode;
use url::Url;

use crate::nomad::AclToken;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    Status(StatusCode),
}

/// Resolves caller tokens via `GET /v1/acl/token/self`.
pub struct TokenResolver {
    client: reqwest::Client,
    address: Url,
}

impl TokenResolver {
    /// `client` must carry the upstream TLS configuration; `address` is the
    /// Nomad base URL.
    pub fn new(client: reqwest::Client, address: Url) -> Self {
        Self { client, address }
    }

    pub async fn resolve(&self, token: &str) -> Result<AclToken, ResolveError> {
        let mut url = self.address.clone();
        url.set_path("/v1/acl/token/self");

        let response = self
            .client
            .get(url)
            .header("X-Nomad-Token", token)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ResolveError::Status(response.status()));
        }

        Ok(response.json().await?)
    }
}
