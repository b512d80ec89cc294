//! Keystone v2 password authentication

use std::fmt;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use hvwatch_core::ApiError;

use crate::wire::{self, TokenResponse};

/// Authenticated session against the compute API
#[derive(Clone)]
pub struct Session {
    /// Value for the `X-Auth-Token` header
    pub token: String,
    /// Compute API base URL
    pub compute_endpoint: Url,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("compute_endpoint", &self.compute_endpoint.as_str())
            .finish()
    }
}

/// Keystone credentials
#[derive(Clone)]
pub struct KeystoneAuth {
    pub auth_url: Url,
    pub username: String,
    pub password: String,
    pub project_name: String,
    /// Catalog region to pick the compute endpoint from
    pub region: Option<String>,
    /// Skip the catalog lookup and use this endpoint
    pub compute_endpoint: Option<Url>,
}

impl fmt::Debug for KeystoneAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoneAuth")
            .field("auth_url", &self.auth_url.as_str())
            .field("username", &self.username)
            .field("project_name", &self.project_name)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl KeystoneAuth {
    /// Request a token and resolve the compute endpoint
    pub async fn authenticate(&self, http: &Client) -> Result<Session, ApiError> {
        let url = wire::join_path(&self.auth_url, &["tokens"])?;
        debug!(url = %url, user = %self.username, "Requesting token");

        let body = json!({
            "auth": {
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password,
                },
                "tenantName": self.project_name,
            }
        });

        let response = http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(wire::transport)?;
        let response = wire::error_for_status(response, "identity tokens").await?;
        let tokens: TokenResponse = wire::decode(response).await?;

        let compute_endpoint = match &self.compute_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.catalog_endpoint(&tokens)?,
        };

        info!(
            user = %self.username,
            project = %self.project_name,
            endpoint = %compute_endpoint,
            "Authenticated with identity service"
        );

        Ok(Session {
            token: tokens.access.token.id,
            compute_endpoint,
        })
    }

    fn catalog_endpoint(&self, tokens: &TokenResponse) -> Result<Url, ApiError> {
        let endpoint = tokens
            .access
            .service_catalog
            .iter()
            .filter(|entry| entry.service_type == "compute")
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| match &self.region {
                Some(region) => endpoint.region.as_deref() == Some(region.as_str()),
                None => true,
            })
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!(
                    "No compute endpoint in service catalog for region {}",
                    self.region.as_deref().unwrap_or("<any>")
                ))
            })?;

        Url::parse(&endpoint.public_url).map_err(|e| {
            ApiError::InvalidResponse(format!("Invalid compute endpoint {}: {}", endpoint.public_url, e))
        })
    }
}
