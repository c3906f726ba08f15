//! In-memory control plane
//!
//! Stores created objects, records every call in order and serves pod
//! listings either from per-unit scripts or, by default, by reporting every
//! replica of a matching Deployment as running. Failures can be injected
//! per object name. Used by the test suite and by `--dry-run`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::objects::DeploymentObject;
use super::{
    ControlPlane, ControlPlaneError, DeleteResponse, LabelSelector, ObjectKind, ObjectStatus,
    APP_LABEL,
};

/// One recorded control-plane call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneCall {
    Create {
        kind: ObjectKind,
        namespace: Option<String>,
        name: String,
    },
    List {
        kind: ObjectKind,
        namespace: String,
        selector: String,
    },
    Delete {
        kind: ObjectKind,
        namespace: String,
        name: String,
    },
}

type ObjectKey = (ObjectKind, String, String);

/// Simulated cluster
pub struct SimulatedControlPlane {
    calls: Mutex<Vec<ControlPlaneCall>>,
    objects: DashMap<ObjectKey, Value>,
    /// Scripted pod listings keyed by `app` label; the last entry repeats
    pod_scripts: DashMap<String, VecDeque<Vec<ObjectStatus>>>,
    create_failures: DashMap<String, String>,
    list_failures: DashMap<String, String>,
    delete_failures: DashMap<String, String>,
    delete_statuses: DashMap<String, String>,
}

impl SimulatedControlPlane {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            objects: DashMap::new(),
            pod_scripts: DashMap::new(),
            create_failures: DashMap::new(),
            list_failures: DashMap::new(),
            delete_failures: DashMap::new(),
            delete_statuses: DashMap::new(),
        }
    }

    /// Serve `responses` in order to pod listings for the unit labelled `app`
    pub fn script_pods(&self, app: &str, responses: Vec<Vec<ObjectStatus>>) {
        self.pod_scripts
            .insert(app.to_string(), responses.into_iter().collect());
    }

    /// Fail every create call for objects named `name`
    pub fn fail_create(&self, name: &str, message: &str) {
        self.create_failures
            .insert(name.to_string(), message.to_string());
    }

    /// Fail pod listings for the unit labelled `app`
    pub fn fail_list(&self, app: &str, message: &str) {
        self.list_failures
            .insert(app.to_string(), message.to_string());
    }

    /// Fail every delete call for objects named `name`
    pub fn fail_delete(&self, name: &str, message: &str) {
        self.delete_failures
            .insert(name.to_string(), message.to_string());
    }

    /// Answer deletes of `name` with a non-success status
    pub fn delete_status(&self, name: &str, status: &str) {
        self.delete_statuses
            .insert(name.to_string(), status.to_string());
    }

    /// All calls recorded so far, in order
    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.lock_calls().clone()
    }

    /// Names of objects of `kind` passed to delete, in call order
    pub fn deleted(&self, kind: ObjectKind) -> Vec<String> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                ControlPlaneCall::Delete { kind: k, name, .. } if *k == kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of objects of `kind` passed to create, in call order
    pub fn created(&self, kind: ObjectKind) -> Vec<String> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                ControlPlaneCall::Create { kind: k, name, .. } if *k == kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of pod listings issued for the unit labelled `app`
    pub fn list_count(&self, app: &str) -> usize {
        let needle = format!("{}={}", APP_LABEL, app);
        self.lock_calls()
            .iter()
            .filter(|call| match call {
                ControlPlaneCall::List { selector, .. } => {
                    selector.split(',').any(|part| part == needle)
                }
                _ => false,
            })
            .count()
    }

    /// A stored object, if it currently exists
    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|v| v.clone())
    }

    /// A stored Deployment decoded back into its typed form
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<DeploymentObject> {
        self.object(ObjectKind::Deployment, namespace, name)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<ControlPlaneCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: ControlPlaneCall) {
        debug!("simulated control plane: {:?}", call);
        self.lock_calls().push(call);
    }

    fn scripted_pods(&self, app: &str) -> Option<Vec<ObjectStatus>> {
        let mut script = self.pod_scripts.get_mut(app)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }

    /// Every replica of every matching Deployment, reported as running
    fn running_replicas(&self, namespace: &str, selector: &LabelSelector) -> Vec<ObjectStatus> {
        let mut deployments: Vec<DeploymentObject> = self
            .objects
            .iter()
            .filter(|entry| {
                let (kind, ns, _) = entry.key();
                *kind == ObjectKind::Deployment && ns == namespace
            })
            .filter_map(|entry| serde_json::from_value(entry.value().clone()).ok())
            .collect();
        deployments.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        deployments
            .iter()
            .enumerate()
            .filter(|(_, d)| selector.matches(&d.spec.template.metadata.labels))
            .flat_map(|(index, d)| {
                (0..d.spec.replicas).map(move |replica| {
                    ObjectStatus::running_pod(
                        format!("{}-{}", d.metadata.name, replica),
                        format!("10.244.{}.{}", index, replica + 1),
                        d.spec.template.metadata.labels.clone(),
                    )
                })
            })
            .collect()
    }
}

impl Default for SimulatedControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn create(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        spec: &Value,
    ) -> Result<(), ControlPlaneError> {
        let name = spec
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.record(ControlPlaneCall::Create {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.clone(),
        });

        if kind.is_namespaced() && namespace.is_none() {
            return Err(ControlPlaneError::MissingNamespace(kind));
        }
        if let Some(message) = self.create_failures.get(&name) {
            return Err(ControlPlaneError::Rejected(message.clone()));
        }

        let key = (kind, namespace.unwrap_or_default().to_string(), name.clone());
        if self.objects.contains_key(&key) {
            return Err(ControlPlaneError::AlreadyExists { kind, name });
        }
        self.objects.insert(key, spec.clone());
        Ok(())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<ObjectStatus>, ControlPlaneError> {
        self.record(ControlPlaneCall::List {
            kind,
            namespace: namespace.to_string(),
            selector: selector.to_query(),
        });

        let app = selector
            .match_labels
            .get(APP_LABEL)
            .cloned()
            .unwrap_or_default();
        if let Some(message) = self.list_failures.get(&app) {
            return Err(ControlPlaneError::Rejected(message.clone()));
        }

        if kind != ObjectKind::Pod {
            return Ok(self
                .objects
                .iter()
                .filter(|entry| entry.key().0 == kind && entry.key().1 == namespace)
                .map(|entry| ObjectStatus {
                    name: entry.key().2.clone(),
                    labels: Default::default(),
                    pod_ip: None,
                    phase: None,
                })
                .collect());
        }

        if let Some(pods) = self.scripted_pods(&app) {
            return Ok(pods);
        }
        Ok(self.running_replicas(namespace, selector))
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        name: &str,
        namespace: &str,
    ) -> Result<DeleteResponse, ControlPlaneError> {
        self.record(ControlPlaneCall::Delete {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });

        if let Some(message) = self.delete_failures.get(name) {
            return Err(ControlPlaneError::Rejected(message.clone()));
        }

        let key = (kind, namespace.to_string(), name.to_string());
        if self.objects.remove(&key).is_none() {
            return Err(ControlPlaneError::NotFound {
                kind,
                name: name.to_string(),
            });
        }

        Ok(match self.delete_statuses.get(name) {
            Some(status) => DeleteResponse {
                status: status.clone(),
            },
            None => DeleteResponse::success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::objects::{PullPolicy, WorkloadSpec};
    use std::collections::BTreeMap;

    fn deployment_json(name: &str, replicas: u32) -> Value {
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), name.to_string());
        let spec = WorkloadSpec {
            name: name.to_string(),
            namespace: "ns".to_string(),
            labels,
            image: "img".to_string(),
            pull_policy: PullPolicy::IfNotPresent,
            command: vec![],
            args: vec![],
            replicas,
            ports: vec![],
            init_container: None,
        };
        serde_json::to_value(spec.deployment()).unwrap()
    }

    #[tokio::test]
    async fn test_create_twice_reports_conflict() {
        let plane = SimulatedControlPlane::new();
        let spec = deployment_json("enc", 1);
        tokio_test::assert_ok!(plane.create(ObjectKind::Deployment, Some("ns"), &spec).await);
        let err = tokio_test::assert_err!(
            plane.create(ObjectKind::Deployment, Some("ns"), &spec).await
        );
        assert!(matches!(err, ControlPlaneError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_running_replicas_follow_deployments() {
        let plane = SimulatedControlPlane::new();
        plane
            .create(ObjectKind::Deployment, Some("ns"), &deployment_json("enc", 3))
            .await
            .unwrap();
        plane
            .create(ObjectKind::Deployment, Some("ns"), &deployment_json("idx", 1))
            .await
            .unwrap();

        let pods = plane
            .list(ObjectKind::Pod, "ns", &LabelSelector::matching(APP_LABEL, "enc"))
            .await
            .unwrap();
        assert_eq!(pods.len(), 3);
        assert!(pods.iter().all(|p| p.is_running()));
        assert_eq!(plane.list_count("enc"), 1);
    }

    #[tokio::test]
    async fn test_scripted_pods_repeat_last_entry() {
        let plane = SimulatedControlPlane::new();
        let pod = ObjectStatus::running_pod("enc-0", "10.0.0.1", BTreeMap::new());
        plane.script_pods("enc", vec![vec![], vec![pod]]);
        let selector = LabelSelector::matching(APP_LABEL, "enc");

        assert!(plane.list(ObjectKind::Pod, "ns", &selector).await.unwrap().is_empty());
        assert_eq!(plane.list(ObjectKind::Pod, "ns", &selector).await.unwrap().len(), 1);
        assert_eq!(plane.list(ObjectKind::Pod, "ns", &selector).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_object() {
        let plane = SimulatedControlPlane::new();
        let err = tokio_test::assert_err!(plane.delete(ObjectKind::Deployment, "ghost", "ns").await);
        assert!(matches!(err, ControlPlaneError::NotFound { .. }));
        assert_eq!(plane.deleted(ObjectKind::Deployment), vec!["ghost"]);
    }
}
