//! Kubernetes control-plane boundary
//!
//! The orchestration core only talks to the cluster through the
//! [`ControlPlane`] trait: create an object, list objects by label selector,
//! delete an object by name. Two implementations live here:
//!
//! - [`KubeApiClient`]: REST client for a real API server
//! - [`SimulatedControlPlane`]: in-memory plane for tests and dry runs

pub mod client;
pub mod objects;
pub mod simulated;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{ApiServerConfig, KubeApiClient};
pub use objects::{
    to_dns_name, to_dns_name_with_suffix, DeploymentObject, InitContainer, NamespaceObject, PullPolicy, ServiceObject,
    WorkloadSpec,
};
pub use simulated::{ControlPlaneCall, SimulatedControlPlane};

/// Label carrying the DNS name of a unit
pub const APP_LABEL: &str = "app";

/// Label carrying the DNS name of the owning pod
pub const POD_LABEL: &str = "podweave.io/pod";

/// Errors surfaced by a control-plane call
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{0} objects require a namespace")]
    MissingNamespace(ObjectKind),

    #[error("API server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Kinds of cluster objects this crate manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Namespace,
    Service,
    Deployment,
    Pod,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Namespace => "Namespace",
            ObjectKind::Service => "Service",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Pod => "Pod",
        }
    }

    /// Whether objects of this kind live inside a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Namespace)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality-based label selector
///
/// Backed by a `BTreeMap` so the rendered query string is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(key, value)
    }

    /// Add another required label
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as a `labelSelector` query value (`a=b,c=d`)
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Observed phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Observed state of one listed object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PodPhase>,
}

impl ObjectStatus {
    /// A running pod with the given IP and labels
    pub fn running_pod(
        name: impl Into<String>,
        ip: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            pod_ip: Some(ip.into()),
            phase: Some(PodPhase::Running),
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == Some(PodPhase::Running)
    }
}

/// Result of a delete call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub status: String,
}

impl DeleteResponse {
    pub fn success() -> Self {
        Self {
            status: "Success".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows simulating the cluster in tests)
// ============================================================================

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create an object. `namespace` is `None` only for cluster-scoped kinds.
    async fn create(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        spec: &serde_json::Value,
    ) -> Result<(), ControlPlaneError>;

    /// List objects of `kind` in `namespace` matching `selector`
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ObjectStatus>, ControlPlaneError>;

    /// Delete a named object
    async fn delete(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
    ) -> Result<DeleteResponse, ControlPlaneError>;
}

/// Control plane shared between units of one or more orchestrators
pub type SharedControlPlane = Arc<dyn ControlPlane>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_query_is_sorted() {
        let selector = LabelSelector::matching(POD_LABEL, "encoder").and(APP_LABEL, "encoder-0");
        assert_eq!(selector.to_query(), "app=encoder-0,podweave.io/pod=encoder");
    }

    #[test]
    fn test_label_selector_requires_all_labels() {
        let selector = LabelSelector::matching("app", "a").and("tier", "shard");

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "a".to_string());
        assert!(!selector.matches(&labels));

        labels.insert("tier".to_string(), "shard".to_string());
        labels.insert("extra".to_string(), "x".to_string());
        assert!(selector.matches(&labels));
    }

    #[test]
    fn test_pod_phase_unknown_values() {
        let phase: PodPhase = serde_json::from_str("\"Evicted\"").unwrap();
        assert_eq!(phase, PodPhase::Unknown);
        let phase: PodPhase = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(phase, PodPhase::Running);
    }

    #[test]
    fn test_delete_response() {
        assert!(DeleteResponse::success().is_success());
        let failed = DeleteResponse {
            status: "Failure".to_string(),
        };
        assert!(!failed.is_success());
    }

    #[test]
    fn test_object_kind_scope() {
        assert!(!ObjectKind::Namespace.is_namespaced());
        assert!(ObjectKind::Deployment.is_namespaced());
        assert_eq!(ObjectKind::Service.to_string(), "Service");
    }
}
