//! REST client for the Kubernetes API server

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    ControlPlane, ControlPlaneError, DeleteResponse, LabelSelector, ObjectKind, ObjectStatus,
    PodPhase,
};

/// Connection settings for an API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Base URL, e.g. `https://10.0.0.1:6443`
    pub server: String,
    /// Bearer token
    pub token: Option<String>,
    /// PEM-encoded CA bundle used to verify the server
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub timeout: Duration,
}

impl ApiServerConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: None,
            ca_pem: None,
            insecure_skip_tls_verify: false,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    metadata: ListedMetadata,
    #[serde(default)]
    status: Option<ListedStatus>,
}

#[derive(Debug, Deserialize)]
struct ListedMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedStatus {
    #[serde(default)]
    phase: Option<PodPhase>,
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
}

// ============================================================================
// SBIO: Pure request construction
// ============================================================================

/// Collection path of `kind` within `namespace`
pub fn collection_path(kind: ObjectKind, namespace: Option<&str>) -> Result<String, ControlPlaneError> {
    match (kind, namespace) {
        (ObjectKind::Namespace, _) => Ok("/api/v1/namespaces".to_string()),
        (_, None) => Err(ControlPlaneError::MissingNamespace(kind)),
        (ObjectKind::Service, Some(ns)) => Ok(format!("/api/v1/namespaces/{}/services", ns)),
        (ObjectKind::Pod, Some(ns)) => Ok(format!("/api/v1/namespaces/{}/pods", ns)),
        (ObjectKind::Deployment, Some(ns)) => {
            Ok(format!("/apis/apps/v1/namespaces/{}/deployments", ns))
        }
    }
}

/// Extract the `status` string of a delete response body
///
/// Deletes answer either with a `Status` object or with the deleted object
/// itself; only the former carries a string status.
pub fn delete_status(body: &Value) -> String {
    let is_status_object = body.get("kind").and_then(Value::as_str) == Some("Status");
    if is_status_object {
        if let Some(status) = body.get("status").and_then(Value::as_str) {
            return status.to_string();
        }
    }
    "Success".to_string()
}

fn object_name(spec: &Value) -> String {
    spec.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct KubeApiClient {
    client: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl KubeApiClient {
    pub fn new(config: &ApiServerConfig) -> Result<Self, ControlPlaneError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if let Some(pem) = &config.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            server: config.server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.server, path);
        let mut req = self.client.request(method, &url);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req
    }

    async fn check(
        response: Response,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Response, ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(match status {
            StatusCode::CONFLICT => ControlPlaneError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            StatusCode::NOT_FOUND => ControlPlaneError::NotFound {
                kind,
                name: name.to_string(),
            },
            other => ControlPlaneError::Api {
                status: other.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl ControlPlane for KubeApiClient {
    async fn create(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        spec: &Value,
    ) -> Result<(), ControlPlaneError> {
        let path = collection_path(kind, namespace)?;
        let name = object_name(spec);
        debug!("POST {} ({} {})", path, kind, name);

        let response = self
            .request(reqwest::Method::POST, &path)
            .json(spec)
            .send()
            .await?;
        Self::check(response, kind, &name).await?;
        Ok(())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ObjectStatus>, ControlPlaneError> {
        let path = collection_path(kind, Some(namespace))?;
        let mut req = self.request(reqwest::Method::GET, &path);
        if !selector.match_labels.is_empty() {
            req = req.query(&[("labelSelector", selector.to_query())]);
        }

        let response = Self::check(req.send().await?, kind, "").await?;
        let list: ObjectList = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        Ok(list
            .items
            .into_iter()
            .map(|item| {
                let status = item.status.unwrap_or_default();
                ObjectStatus {
                    name: item.metadata.name,
                    labels: item.metadata.labels,
                    pod_ip: status.pod_ip,
                    phase: status.phase,
                }
            })
            .collect())
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
    ) -> Result<DeleteResponse, ControlPlaneError> {
        let path = format!("{}/{}", collection_path(kind, Some(namespace))?, name);
        debug!("DELETE {}", path);

        let body = json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "propagationPolicy": "Background",
        });
        let response = self
            .request(reqwest::Method::DELETE, &path)
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response, kind, name).await?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
        Ok(DeleteResponse {
            status: delete_status(&value),
        })
    }
}
