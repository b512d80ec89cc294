//! Compute API wire format
//!
//! Serde shapes for the Nova and Keystone JSON payloads, plus the response
//! helpers shared by the session and the client.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Deserializer};
use url::Url;

use hvwatch_core::ApiError;

/// Hypervisor ids are integers on older deployments and UUIDs on newer ones
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Str(String),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Int(id) => id.to_string(),
        RawId::Str(id) => id,
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct HypervisorList {
    pub hypervisors: Vec<Hypervisor>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hypervisor {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub hypervisor_hostname: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub servers: Option<Vec<HypervisorServer>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HypervisorServer {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HypervisorShow {
    pub hypervisor: HypervisorWithService,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HypervisorWithService {
    #[serde(default)]
    pub service: Option<Service>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Service {
    pub host: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MigrationList {
    pub migrations: Vec<Migration>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Migration {
    pub instance_uuid: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access: Access,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Access {
    pub token: Token,
    #[serde(default, rename = "serviceCatalog")]
    pub service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Token {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEndpoint {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "publicURL")]
    pub public_url: String,
}

/// Parse a migration timestamp.
///
/// Accepts RFC 3339 and the naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` form the
/// compute API emits, which is UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Append path segments to a base URL, keeping its existing path
pub(crate) fn join_path(base: &Url, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::Other(format!("Cannot use {} as a base URL", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}

/// Map non-2xx responses onto [`ApiError`]
pub(crate) async fn error_for_status(response: Response, what: &str) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized(body),
        _ => ApiError::Status {
            status: status.as_u16(),
            body,
        },
    })
}

/// Decode a JSON response body
pub(crate) async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
}
