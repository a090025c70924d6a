use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::agent::action_log::ActionLogEntry;

#[derive(Debug, Clone, Error)]
pub enum ControlPlaneError {
    #[error("control plane unreachable: {0}")]
    Unreachable(String),

    #[error("control plane rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ControlPlaneError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => ControlPlaneError::Unreachable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestListQuery {
    pub host_id: String,
    pub scope: String,
    pub pending_delete: bool,
    pub ids: Vec<String>,
}

impl GuestListQuery {
    pub fn for_host(host_id: impl Into<String>, pending_delete: bool, ids: Vec<String>) -> Self {
        Self {
            host_id: host_id.into(),
            scope: "system".to_string(),
            pending_delete,
            ids,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyServerVerdict {
    pub guest_unknown_need_clean: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub guest_id: String,
    pub kind: String,
    pub success: bool,
    #[serde(default)]
    pub body: Value,
}

/// What the agent needs from the region's control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Ids of guests the control plane places on this host, out of `query.ids`.
    async fn list_guests(&self, query: &GuestListQuery) -> Result<Vec<String>, ControlPlaneError>;

    async fn put_host_online(&self, host_id: &str) -> Result<(), ControlPlaneError>;

    async fn verify_dirty_server(
        &self,
        guest_id: &str,
        host_id: &str,
    ) -> Result<DirtyServerVerdict, ControlPlaneError>;

    async fn report_task(&self, report: &TaskReport) -> Result<(), ControlPlaneError>;

    async fn update_status(&self, guest_id: &str, status: &str) -> Result<(), ControlPlaneError>;

    async fn record_action(&self, entry: &ActionLogEntry) -> Result<(), ControlPlaneError>;

    async fn update_migration_progress(
        &self,
        guest_id: &str,
        progress: f32,
    ) -> Result<(), ControlPlaneError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControlPlaneConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct ListGuestsResponse {
    #[serde(default)]
    servers: Vec<ListedGuest>,
}

#[derive(Debug, Deserialize)]
struct ListedGuest {
    id: String,
}

#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    auth_header: Option<String>,
}

impl HttpControlPlane {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ControlPlaneError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: config.token.as_ref().map(|t| format!("Bearer {t}")),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, url);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ControlPlaneError> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Rejected { status, message });
        }

        Ok(response)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T, ControlPlaneError> {
        let response = self
            .send(self.request(reqwest::Method::POST, path).json(body))
            .await?;
        Ok(response.json().await?)
    }

    async fn post_unit(&self, path: &str, body: &impl Serialize) -> Result<(), ControlPlaneError> {
        self.send(self.request(reqwest::Method::POST, path).json(body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_guests(&self, query: &GuestListQuery) -> Result<Vec<String>, ControlPlaneError> {
        let mut params = vec![
            ("scope", query.scope.clone()),
            ("host", query.host_id.clone()),
            ("pending_delete", query.pending_delete.to_string()),
        ];
        params.extend(query.ids.iter().map(|id| ("id", id.clone())));

        debug!(pending_delete = query.pending_delete, count = query.ids.len(), "listing guests");
        let response = self
            .send(self.request(reqwest::Method::GET, "/servers").query(&params))
            .await?;
        let body: ListGuestsResponse = response.json().await?;

        Ok(body.servers.into_iter().map(|s| s.id).collect())
    }

    async fn put_host_online(&self, host_id: &str) -> Result<(), ControlPlaneError> {
        self.post_unit(&format!("/hosts/{host_id}/online"), &json!({}))
            .await
    }

    async fn verify_dirty_server(
        &self,
        guest_id: &str,
        host_id: &str,
    ) -> Result<DirtyServerVerdict, ControlPlaneError> {
        self.post(
            &format!("/servers/{guest_id}/verify-dirty"),
            &json!({ "host_id": host_id }),
        )
        .await
    }

    async fn report_task(&self, report: &TaskReport) -> Result<(), ControlPlaneError> {
        self.post_unit(&format!("/tasks/{}/complete", report.task_id), report)
            .await
    }

    async fn update_status(&self, guest_id: &str, status: &str) -> Result<(), ControlPlaneError> {
        self.post_unit(
            &format!("/servers/{guest_id}/status"),
            &json!({ "status": status }),
        )
        .await
    }

    async fn record_action(&self, entry: &ActionLogEntry) -> Result<(), ControlPlaneError> {
        self.post_unit("/actionlogs", entry).await
    }

    async fn update_migration_progress(
        &self,
        guest_id: &str,
        progress: f32,
    ) -> Result<(), ControlPlaneError> {
        self.post_unit(
            &format!("/servers/{guest_id}/migrate-progress"),
            &json!({ "progress": progress }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_is_distinguished() {
        let cp = HttpControlPlane::new(&ControlPlaneConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            token: None,
            timeout_secs: 2,
        })
        .unwrap();

        let err = cp.put_host_online("host-1").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unreachable(_)));
    }

    #[test]
    fn test_query_for_host_uses_system_scope() {
        let q = GuestListQuery::for_host("h1", true, vec!["a".to_string()]);
        assert_eq!(q.scope, "system");
        assert!(q.pending_delete);
    }
}
