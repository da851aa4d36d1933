//! Backend endpoint handles.
//!
//! An [`Endpoint`] is the opaque, comparable handle the worker pool hands
//! out: one container engine daemon or one cluster API server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Kind of compute backend behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// A container engine daemon.
    Docker,
    /// A cluster orchestrator API server.
    Kubernetes,
}

impl EndpointKind {
    /// Returns the kind name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection details for one compute backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier.
    pub id: String,

    /// Backend kind.
    pub kind: EndpointKind,

    /// Address (`unix:///var/run/docker.sock`, `tcp://host:2376`,
    /// `https://apiserver:6443`).
    pub address: String,

    /// Bearer token for API servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// TLS material for TCP daemons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPaths>,
}

impl Endpoint {
    /// Creates a docker endpoint.
    pub fn docker(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: EndpointKind::Docker,
            address: address.into(),
            token: None,
            tls: None,
        }
    }

    /// Creates a kubernetes endpoint.
    pub fn kubernetes(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: EndpointKind::Kubernetes,
            address: address.into(),
            token: None,
            tls: None,
        }
    }

    /// Sets the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.address)
    }
}

/// Certificate paths for TLS connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsPaths {
    /// Client certificate.
    pub cert: PathBuf,
    /// Client key.
    pub key: PathBuf,
    /// Certificate authority.
    pub ca: PathBuf,
}
