use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
};
use tracing::{debug, error};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("forwarding daemon unreachable: {0}")]
    Unreachable(String),

    #[error("forward not found: {0}")]
    NotFound(String),

    #[error("forwarding daemon rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub net_id: String,
    pub proto: Proto,
    pub bind_addr: String,
    pub remote_addr: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub net_id: String,
    pub proto: Proto,
    pub bind_addr: String,
    pub bind_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListByRemoteRequest {
    pub net_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<Proto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    pub net_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    pub proto: Proto,
    pub bind_addr: String,
    pub bind_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
}

#[derive(Debug, Deserialize)]
struct ForwardList {
    #[serde(default)]
    forwards: Vec<Forward>,
}

#[derive(Debug, Serialize)]
struct Call<'a, P> {
    method: &'a str,
    params: &'a P,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    code: String,
    message: String,
}

/// Client for the host's SDN forwarding daemon. One connection per call,
/// newline delimited JSON in both directions.
#[derive(Debug, Clone)]
pub struct ForwardClient {
    socket_path: PathBuf,
}

impl ForwardClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let raw = socket_path.as_ref().to_string_lossy();
        let path = raw.strip_prefix("unix://").unwrap_or(&raw);
        Self {
            socket_path: PathBuf::from(path),
        }
    }

    pub async fn open(&self, req: &OpenRequest) -> Result<Forward, ForwardError> {
        self.call("open", req).await
    }

    pub async fn close(&self, req: &CloseRequest) -> Result<Forward, ForwardError> {
        self.call("close", req).await
    }

    pub async fn list_by_remote(&self, req: &ListByRemoteRequest) -> Result<Vec<Forward>, ForwardError> {
        let list: ForwardList = self.call("list_by_remote", req).await?;
        Ok(list.forwards)
    }

    pub async fn list(&self, req: &ListRequest) -> Result<Vec<Forward>, ForwardError> {
        let list: ForwardList = self.call("list", req).await?;
        Ok(list.forwards)
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R, ForwardError> {
        let reply = tokio::time::timeout(CALL_TIMEOUT, self.round_trip(method, params))
            .await
            .map_err(|_| ForwardError::Unreachable(format!("{method} timed out")))??;

        if let Some(err) = reply.error {
            return Err(match err.code.as_str() {
                "not_found" => ForwardError::NotFound(err.message),
                _ => ForwardError::Rejected(err.message),
            });
        }

        let result = reply.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| ForwardError::Rejected(format!("bad {method} reply: {e}")))
    }

    async fn round_trip<P: Serialize>(&self, method: &str, params: &P) -> Result<Reply, ForwardError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            error!(socket = %self.socket_path.display(), error = %e, "sdn connect failed");
            ForwardError::Unreachable(e.to_string())
        })?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_string(&Call { method, params })
            .map_err(|e| ForwardError::Rejected(e.to_string()))?;
        line.push('\n');
        debug!(method, "sdn call");

        write
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ForwardError::Unreachable(e.to_string()))?;

        let mut reader = BufReader::new(read);
        let mut reply = String::new();
        let n = reader
            .read_line(&mut reply)
            .await
            .map_err(|e| ForwardError::Unreachable(e.to_string()))?;
        if n == 0 {
            return Err(ForwardError::Unreachable("connection closed".to_string()));
        }

        serde_json::from_str(reply.trim()).map_err(|e| ForwardError::Rejected(format!("unparsable reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::serve_fake_forwarder;

    #[tokio::test]
    async fn test_open_list_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdn.sock");
        let seen = serve_fake_forwarder(&path);

        let client = ForwardClient::new(format!("unix://{}", path.display()));
        let opened = client
            .open(&OpenRequest {
                net_id: "net-1".to_string(),
                proto: Proto::Tcp,
                bind_addr: "192.168.1.10".to_string(),
                remote_addr: "10.0.0.2".to_string(),
                remote_port: 22,
            })
            .await
            .unwrap();
        assert_eq!(opened.bind_port, 20000);
        assert_eq!(seen.lock().unwrap()[0]["params"]["net_id"], "net-1");

        let listed = client
            .list_by_remote(&ListByRemoteRequest {
                net_id: "net-1".to_string(),
                proto: Some(Proto::Tcp),
                remote_addr: Some("10.0.0.2".to_string()),
                remote_port: None,
            })
            .await
            .unwrap();
        assert_eq!(listed, vec![opened.clone()]);

        let closed = client
            .close(&CloseRequest {
                net_id: "net-1".to_string(),
                proto: Proto::Tcp,
                bind_addr: opened.bind_addr.clone(),
                bind_port: opened.bind_port,
            })
            .await
            .unwrap();
        assert_eq!(closed, opened);

        let err = client
            .close(&CloseRequest {
                net_id: "net-1".to_string(),
                proto: Proto::Tcp,
                bind_addr: opened.bind_addr.clone(),
                bind_port: opened.bind_port,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::NotFound(_)));

        let all = client
            .list(&ListRequest {
                net_id: "net-1".to_string(),
            })
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_missing_daemon_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let client = ForwardClient::new(dir.path().join("absent.sock"));
        let err = client
            .list(&ListRequest {
                net_id: "net-1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Unreachable(_)));
    }
}
