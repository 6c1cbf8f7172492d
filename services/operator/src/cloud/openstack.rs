//! OpenStack client (Keystone v3 password auth + Nova compute).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use super::{AuthToken, CloudClient, CloudError, CloudServer, InstanceSpec};
use crate::config::CloudConfig;

/// Token lifetime assumed when Keystone omits `expires_at`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// OpenStack API client.
pub struct OpenStackClient {
    http: reqwest::Client,
    config: CloudConfig,
}

impl OpenStackClient {
    /// Create a new OpenStack client.
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CloudError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn servers_url(&self) -> String {
        format!("{}/servers", self.config.compute_url.trim_end_matches('/'))
    }

    async fn list_by_name_filter(&self, token: &str, filter: &str) -> Result<Vec<CloudServer>, CloudError> {
        let response = self
            .http
            .get(self.servers_url())
            .header("X-Auth-Token", token)
            .query(&[("name", filter)])
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CloudError::Auth(error_message(status, &response.text().await.unwrap_or_default())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list servers");
            return Err(CloudError::Decode(error_message(status, &body)));
        }

        let list: ServerList = response
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        Ok(list
            .servers
            .into_iter()
            .map(|s| CloudServer { id: s.id, name: s.name })
            .collect())
    }
}

#[async_trait]
impl CloudClient for OpenStackClient {
    async fn authenticate(&self) -> Result<AuthToken, CloudError> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        debug!(url = %url, user = %self.config.username, "Authenticating with Keystone");

        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "id": self.config.domain_id },
                            "password": self.config.password.expose(),
                        }
                    }
                },
                "scope": {
                    "project": { "id": self.config.project_id }
                }
            }
        });

        let response = self.http.post(&url).json(&body).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "Keystone rejected credentials");
            return Err(CloudError::Auth(error_message(status, &body)));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Decode("missing X-Subject-Token header".into()))?;

        let expires_at = response
            .json::<TokenResponse>()
            .await
            .ok()
            .and_then(|body| body.token.expires_at)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS));

        Ok(AuthToken { token, expires_at })
    }

    async fn create_server(&self, token: &str, spec: &InstanceSpec) -> Result<CloudServer, CloudError> {
        let request = CreateServerRequest {
            server: ServerCreate {
                name: &spec.name,
                image_ref: &spec.image_ref,
                flavor_ref: &spec.flavor_ref,
                networks: vec![NetworkRef { uuid: &spec.network_id }],
            },
        };

        let response = self
            .http
            .post(self.servers_url())
            .header("X-Auth-Token", token)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CloudError::Auth(error_message(status, &response.text().await.unwrap_or_default())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, name = %spec.name, "Nova rejected server create");
            return Err(CloudError::Provision(error_message(status, &body)));
        }

        let created: CreateServerResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        Ok(CloudServer {
            id: created.server.id,
            name: spec.name.clone(),
        })
    }

    async fn find_server(&self, token: &str, name: &str) -> Result<Option<CloudServer>, CloudError> {
        // Nova treats `name` as a regex; anchor it and re-check equality.
        let servers = self.list_by_name_filter(token, &format!("^{name}$")).await?;
        Ok(servers.into_iter().find(|s| s.name == name))
    }

    async fn list_servers(&self, token: &str, prefix: &str) -> Result<Vec<CloudServer>, CloudError> {
        let servers = self.list_by_name_filter(token, &format!("^{prefix}")).await?;
        Ok(servers.into_iter().filter(|s| s.name.starts_with(prefix)).collect())
    }

    async fn delete_server(&self, token: &str, id: &str) -> Result<(), CloudError> {
        let url = format!("{}/{id}", self.servers_url());
        let response = self
            .http
            .delete(&url)
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CloudError::Auth(error_message(status, &response.text().await.unwrap_or_default())));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(id = %id, "Server already gone");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, id = %id, "Nova rejected server delete");
            return Err(CloudError::Provision(error_message(status, &body)));
        }
        Ok(())
    }
}

fn transport(err: reqwest::Error) -> CloudError {
    CloudError::Transport(err.to_string())
}

/// Pulls the human-readable message out of an OpenStack error body, e.g.
/// `{"forbidden": {"code": 403, "message": "Quota exceeded for instances"}}`.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value.as_object().and_then(|obj| {
                obj.values()
                    .find_map(|inner| inner.get("message").and_then(|m| m.as_str()))
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {body}")
            }
        })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateServerRequest<'a> {
    server: ServerCreate<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerCreate<'a> {
    name: &'a str,
    image_ref: &'a str,
    flavor_ref: &'a str,
    networks: Vec<NetworkRef<'a>>,
}

#[derive(Debug, Serialize)]
struct NetworkRef<'a> {
    uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: CreatedServer,
}

#[derive(Debug, Deserialize)]
struct CreatedServer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<ServerSummary>,
}

#[derive(Debug, Deserialize)]
struct ServerSummary {
    id: String,
    name: String,
}
