use thiserror::Error;

use crate::agent::{
    control_plane::ControlPlaneError, forward::ForwardError, hypervisor::MonitorError,
    registry::RegistryError,
};

/// Errors surfaced to the request router. Everything except `Internal` is a
/// synchronous rejection that left the instance untouched.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("guest {0} not found")]
    NotFound(String),

    #[error("guest {0} exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Precondition(String),

    #[error("forwarder: {0}")]
    Forward(#[from] ForwardError),

    #[error("control plane: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("monitor: {0}")]
    Monitor(#[from] MonitorError),

    #[error("storage: {0}")]
    Storage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    pub fn precondition(message: impl Into<String>) -> Self {
        AgentError::Precondition(message.into())
    }

    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            AgentError::Precondition(_) | AgentError::AlreadyExists(_) | AgentError::NotFound(_)
        )
    }
}

impl From<RegistryError> for AgentError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(id) => AgentError::AlreadyExists(id),
            RegistryError::NotFound(id) => AgentError::NotFound(id),
            other => AgentError::Internal(anyhow::Error::new(other)),
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
