//! Compute API client
//!
//! Implements [`ClusterApi`] over the Nova REST API. The Keystone token is
//! cached and shared across calls; any 401 drops it so the next call
//! authenticates again.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use hvwatch_core::{
    ApiError, ClusterApi, ComputeNode, MigrationRecord, NodeDetail, NodeState, ServerRef,
    ServiceRecord,
};

use crate::auth::{KeystoneAuth, Session};
use crate::wire::{self, HypervisorList, HypervisorShow, MigrationList};

/// Connection settings for the compute API
#[derive(Debug, Clone)]
pub struct NovaConfig {
    /// Identity credentials and endpoint selection
    pub auth: KeystoneAuth,
    /// Evacuate onto shared storage
    pub on_shared_storage: bool,
    /// Timeout applied to every HTTP request
    pub request_timeout: Duration,
}

impl NovaConfig {
    /// Config with default timeout and no region or endpoint override
    pub fn new(auth_url: Url, username: &str, password: &str, project_name: &str) -> Self {
        Self {
            auth: KeystoneAuth {
                auth_url,
                username: username.to_string(),
                password: password.to_string(),
                project_name: project_name.to_string(),
                region: None,
                compute_endpoint: None,
            },
            on_shared_storage: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Nova client
pub struct NovaClient {
    http: Client,
    auth: KeystoneAuth,
    session: RwLock<Option<Session>>,
    on_shared_storage: bool,
}

impl NovaClient {
    /// Create a client; no request is made until the first call
    pub fn new(config: NovaConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            auth: config.auth,
            session: RwLock::new(None),
            on_shared_storage: config.on_shared_storage,
        })
    }

    /// Cached session, authenticating if there is none
    async fn session(&self) -> Result<Session, ApiError> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.auth.authenticate(&self.http).await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate(&self) {
        if self.session.write().await.take().is_some() {
            warn!("Compute API rejected token, session dropped");
        }
    }

    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: Option<(&str, &str)>,
        body: Option<Value>,
        what: &str,
    ) -> Result<Response, ApiError> {
        let session = self.session().await?;
        let mut url = wire::join_path(&session.compute_endpoint, segments)?;
        if let Some((key, value)) = query {
            url.query_pairs_mut().append_pair(key, value);
        }
        debug!(method = %method, url = %url, "Compute API request");

        let mut request = self
            .http
            .request(method, url)
            .header("X-Auth-Token", session.token.as_str())
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(wire::transport)?;
        match wire::error_for_status(response, what).await {
            Err(e) if e.is_unauthorized() => {
                self.invalidate().await;
                Err(e)
            }
            other => other,
        }
    }

    async fn server_action(&self, server_id: &str, action: Value) -> Result<(), ApiError> {
        self.send(
            Method::POST,
            &["servers", server_id, "action"],
            None,
            Some(action),
            &format!("server {}", server_id),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for NovaClient {
    async fn ensure_session(&self) -> Result<(), ApiError> {
        self.session().await.map(|_| ())
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, ApiError> {
        let response = self
            .send(Method::GET, &["os-hypervisors"], None, None, "hypervisors")
            .await?;
        let list: HypervisorList = wire::decode(response).await?;

        Ok(list
            .hypervisors
            .into_iter()
            .map(|h| ComputeNode::new(h.id, h.hypervisor_hostname, &h.state))
            .collect())
    }

    async fn node_detail(&self, node_id: &str, hostname: &str) -> Result<NodeDetail, ApiError> {
        let what = format!("hypervisor {}", hostname);

        // Hostname search may match several hypervisors; pick ours by id
        let response = self
            .send(
                Method::GET,
                &["os-hypervisors", hostname, "servers"],
                None,
                None,
                &what,
            )
            .await?;
        let list: HypervisorList = wire::decode(response).await?;
        let hypervisor = list
            .hypervisors
            .into_iter()
            .find(|h| h.id == node_id)
            .ok_or_else(|| ApiError::NotFound(what.clone()))?;

        let response = self
            .send(Method::GET, &["os-hypervisors", node_id], None, None, &what)
            .await?;
        let show: HypervisorShow = wire::decode(response).await?;

        Ok(NodeDetail {
            id: hypervisor.id,
            hostname: hypervisor.hypervisor_hostname,
            state: NodeState::from_reported(&hypervisor.state),
            servers: hypervisor.servers.map(|servers| {
                servers
                    .into_iter()
                    .map(|s| ServerRef::new(s.uuid, s.name))
                    .collect()
            }),
            service: show
                .hypervisor
                .service
                .map(|service| ServiceRecord { host: service.host }),
        })
    }

    async fn evacuate(&self, server_id: &str) -> Result<(), ApiError> {
        self.server_action(
            server_id,
            json!({"evacuate": {"onSharedStorage": self.on_shared_storage}}),
        )
        .await
    }

    async fn list_migrations(&self, host: &str) -> Result<Vec<MigrationRecord>, ApiError> {
        let response = self
            .send(
                Method::GET,
                &["os-migrations"],
                Some(("host", host)),
                None,
                "migrations",
            )
            .await?;
        let list: MigrationList = wire::decode(response).await?;

        let records = list
            .migrations
            .into_iter()
            .filter_map(|m| match wire::parse_timestamp(&m.created_at) {
                Some(created_at) => Some(MigrationRecord::new(m.instance_uuid, m.status, created_at)),
                None => {
                    warn!(
                        server = %m.instance_uuid,
                        created_at = %m.created_at,
                        "Ignoring migration with unparseable timestamp"
                    );
                    None
                }
            })
            .collect();
        Ok(records)
    }

    async fn start_server(&self, server_id: &str) -> Result<(), ApiError> {
        self.server_action(server_id, json!({"os-start": null})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Mount a token endpoint whose catalog points back at the mock server
    async fn keystone(server: &MockServer, expected_logins: u64) {
        Mock::given(method("POST"))
            .and(path("/v2.0/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": {
                    "token": {"id": "tok-1"},
                    "serviceCatalog": [{
                        "type": "compute",
                        "endpoints": [{
                            "region": "RegionOne",
                            "publicURL": format!("{}/v2.1/ops", server.uri())
                        }]
                    }]
                }
            })))
            .expect(expected_logins)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> NovaClient {
        let auth_url = Url::parse(&format!("{}/v2.0", server.uri())).unwrap();
        let mut config = NovaConfig::new(auth_url, "admin", "secret", "ops");
        config.auth.region = Some("RegionOne".to_string());
        config.request_timeout = Duration::from_secs(5);
        NovaClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let server = MockServer::start().await;
        keystone(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors"))
            .and(header("X-Auth-Token", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hypervisors": [
                    {"id": 1, "hypervisor_hostname": "hv1", "state": "up", "status": "enabled"},
                    {"id": "c5b3-uuid", "hypervisor_hostname": "hv2", "state": "down", "status": "enabled"}
                ]
            })))
            .mount(&server)
            .await;

        let nova = client(&server);
        let nodes = nova.list_nodes().await.unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "1");
        assert!(!nodes[0].state.is_down());
        assert_eq!(nodes[1].id, "c5b3-uuid");
        assert!(nodes[1].state.is_down());

        // Token is reused
        tokio_test::assert_ok!(nova.list_nodes().await);
    }

    #[tokio::test]
    async fn test_node_detail_selects_matching_id() {
        let server = MockServer::start().await;
        keystone(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors/hv1/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hypervisors": [
                    {"id": 10, "hypervisor_hostname": "hv10", "state": "up"},
                    {"id": 1, "hypervisor_hostname": "hv1", "state": "down", "servers": [
                        {"uuid": "v1", "name": "web"},
                        {"uuid": "v2", "name": "db"}
                    ]}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hypervisor": {"id": 1, "service": {"host": "compute-1", "id": 5}}
            })))
            .mount(&server)
            .await;

        let detail = client(&server).node_detail("1", "hv1").await.unwrap();

        assert_eq!(detail.hostname, "hv1");
        assert!(detail.state.is_down());
        let servers = detail.servers.unwrap();
        assert_eq!(servers, vec![ServerRef::new("v1", "web"), ServerRef::new("v2", "db")]);
        assert_eq!(detail.service.unwrap().host, "compute-1");
    }

    #[tokio::test]
    async fn test_node_detail_without_servers_or_service() {
        let server = MockServer::start().await;
        keystone(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors/hv1/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hypervisors": [{"id": 1, "hypervisor_hostname": "hv1", "state": "down"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hypervisor": {"id": 1}
            })))
            .mount(&server)
            .await;

        let detail = client(&server).node_detail("1", "hv1").await.unwrap();
        assert!(detail.servers.is_none());
        assert!(detail.service.is_none());
    }

    #[tokio::test]
    async fn test_node_detail_not_found() {
        let server = MockServer::start().await;
        keystone(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors/gone/servers"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors/hv1/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hypervisors": [{"id": 2, "hypervisor_hostname": "hv1", "state": "down"}]
            })))
            .mount(&server)
            .await;

        let nova = client(&server);
        assert!(nova.node_detail("9", "gone").await.unwrap_err().is_not_found());
        // Search matched, but not the node we asked for
        assert!(nova.node_detail("1", "hv1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_evacuate_and_start_actions() {
        let server = MockServer::start().await;
        keystone(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v2.1/ops/servers/v1/action"))
            .and(body_json(json!({"evacuate": {"onSharedStorage": false}})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.1/ops/servers/v1/action"))
            .and(body_json(json!({"os-start": null})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.1/ops/servers/v2/action"))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .mount(&server)
            .await;

        let nova = client(&server);
        tokio_test::assert_ok!(nova.evacuate("v1").await);
        tokio_test::assert_ok!(nova.start_server("v1").await);

        match nova.evacuate("v2").await {
            Err(ApiError::Status { status, body }) => {
                assert_eq!(status, 409);
                assert_eq!(body, "conflict");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_migrations() {
        let server = MockServer::start().await;
        keystone(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-migrations"))
            .and(query_param("host", "compute-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "migrations": [
                    {"instance_uuid": "v1", "status": "migrating", "created_at": "2024-03-01T12:00:05.000000"},
                    {"instance_uuid": "v2", "status": "completed", "created_at": "2024-03-01T12:00:06Z"},
                    {"instance_uuid": "v3", "status": "error", "created_at": "not a time"}
                ]
            })))
            .mount(&server)
            .await;

        let records = client(&server).list_migrations("compute-1").await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].instance_id, "v1");
        assert_eq!(records[0].status, "migrating");
        assert_eq!(records[0].created_at.to_rfc3339(), "2024-03-01T12:00:05+00:00");
        assert_eq!(records[1].instance_id, "v2");
    }

    #[tokio::test]
    async fn test_unauthorized_drops_session() {
        let server = MockServer::start().await;
        keystone(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/ops/os-hypervisors"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hypervisors": []})))
            .mount(&server)
            .await;

        let nova = client(&server);
        assert!(nova.list_nodes().await.unwrap_err().is_unauthorized());
        assert!(nova.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_session_fails_without_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/tokens"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).ensure_session().await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 503, .. }));
    }
}
