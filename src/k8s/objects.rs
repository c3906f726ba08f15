//! Kubernetes object specs produced by this crate
//!
//! Deployments, Services and Namespaces are modelled as typed serde structs
//! that serialize to the Kubernetes JSON layout. Only the fields the
//! orchestrator sets are modelled.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length of a DNS-1123 label
pub const DNS_LABEL_MAX_LEN: usize = 63;

/// Name of the shared volume populated by an init container
pub const SHARED_VOLUME_NAME: &str = "shared-data";

fn invalid_dns_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9-]").expect("static DNS pattern"))
}

/// Convert an arbitrary name into a DNS-1123 label
///
/// Lowercases, replaces anything outside `[a-z0-9-]` with `-`, trims
/// leading/trailing dashes and truncates to 63 characters.
pub fn to_dns_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = invalid_dns_chars().replace_all(&lowered, "-");
    let mut dns: String = replaced.trim_matches('-').to_string();
    if dns.len() > DNS_LABEL_MAX_LEN {
        dns.truncate(DNS_LABEL_MAX_LEN);
        dns = dns.trim_end_matches('-').to_string();
    }
    dns
}

/// DNS-1123 label of `base` with `suffix` appended
///
/// The base is shortened first so the suffix always survives the 63
/// character limit. An empty base gives an empty name.
pub fn to_dns_name_with_suffix(base: &str, suffix: &str) -> String {
    let mut dns = to_dns_name(base);
    if dns.is_empty() {
        return dns;
    }
    let room = DNS_LABEL_MAX_LEN.saturating_sub(suffix.len());
    if dns.len() > room {
        dns.truncate(room);
        dns = dns.trim_end_matches('-').to_string();
    }
    dns.push_str(suffix);
    dns
}

/// Image pull policy of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// Init container that pre-populates the shared volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitContainer {
    /// Image to run before the main container
    pub image: String,
    /// Command executed by the init container
    #[serde(default)]
    pub command: Vec<String>,
    /// Where the shared volume is mounted in both containers
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

fn default_mount_path() -> String {
    "/shared".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
}

impl NamespaceObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Namespace".to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub selector: Selector,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub metadata: ObjectMeta,
    pub spec: PodTemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub image_pull_policy: PullPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub empty_dir: EmptyDir,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyDir {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceObject {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub service_type: String,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    pub target_port: u16,
}

// ============================================================================
// SBIO: Pure construction of object specs
// ============================================================================

/// Everything needed to render one Deployment+Service pair
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    /// DNS-safe object name
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub replicas: u32,
    /// Named ports exposed by the container and the service
    pub ports: Vec<(String, u16)>,
    pub init_container: Option<InitContainer>,
}

impl WorkloadSpec {
    pub fn deployment(&self) -> DeploymentObject {
        let mounts = self
            .init_container
            .as_ref()
            .map(|init| {
                vec![VolumeMount {
                    name: SHARED_VOLUME_NAME.to_string(),
                    mount_path: init.mount_path.clone(),
                }]
            })
            .unwrap_or_default();

        let main = Container {
            name: "executor".to_string(),
            image: self.image.clone(),
            image_pull_policy: self.pull_policy,
            command: self.command.clone(),
            args: self.args.clone(),
            ports: self
                .ports
                .iter()
                .map(|(name, port)| ContainerPort {
                    name: name.clone(),
                    container_port: *port,
                })
                .collect(),
            volume_mounts: mounts.clone(),
        };

        let (init_containers, volumes) = match &self.init_container {
            Some(init) => (
                vec![Container {
                    name: "init".to_string(),
                    image: init.image.clone(),
                    image_pull_policy: PullPolicy::IfNotPresent,
                    command: init.command.clone(),
                    args: Vec::new(),
                    ports: Vec::new(),
                    volume_mounts: mounts,
                }],
                vec![Volume {
                    name: SHARED_VOLUME_NAME.to_string(),
                    empty_dir: EmptyDir::default(),
                }],
            ),
            None => (Vec::new(), Vec::new()),
        };

        DeploymentObject {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            metadata: self.metadata(),
            spec: DeploymentSpec {
                replicas: self.replicas,
                selector: Selector {
                    match_labels: self.labels.clone(),
                },
                template: PodTemplate {
                    metadata: ObjectMeta {
                        name: self.name.clone(),
                        namespace: None,
                        labels: self.labels.clone(),
                    },
                    spec: PodTemplateSpec {
                        containers: vec![main],
                        init_containers,
                        volumes,
                    },
                },
            },
        }
    }

    pub fn service(&self) -> ServiceObject {
        ServiceObject {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: self.metadata(),
            spec: ServiceSpec {
                service_type: "ClusterIP".to_string(),
                selector: self.labels.clone(),
                ports: self
                    .ports
                    .iter()
                    .map(|(name, port)| ServicePort {
                        name: name.clone(),
                        protocol: "TCP".to_string(),
                        port: *port,
                        target_port: *port,
                    })
                    .collect(),
            },
        }
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.name.clone(),
            namespace: Some(self.namespace.clone()),
            labels: self.labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(init: Option<InitContainer>) -> WorkloadSpec {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "encoder-0".to_string());
        WorkloadSpec {
            name: "encoder-0".to_string(),
            namespace: "search".to_string(),
            labels,
            image: "acme/encoder:1.2".to_string(),
            pull_policy: PullPolicy::IfNotPresent,
            command: vec!["podweave".to_string()],
            args: vec!["executor".to_string()],
            replicas: 2,
            ports: vec![("port-in".to_string(), 8081), ("port-out".to_string(), 8082)],
            init_container: init,
        }
    }

    #[test]
    fn test_to_dns_name() {
        assert_eq!(to_dns_name("Text_Encoder"), "text-encoder");
        assert_eq!(to_dns_name("a/b.c"), "a-b-c");
        assert_eq!(to_dns_name("_edge_"), "edge");
        assert_eq!(to_dns_name(&"x".repeat(80)).len(), DNS_LABEL_MAX_LEN);
        assert_eq!(to_dns_name("___"), "");
    }

    #[test]
    fn test_to_dns_name_with_suffix_keeps_suffix() {
        assert_eq!(to_dns_name_with_suffix("Text_Encoder", "-head"), "text-encoder-head");
        assert_eq!(to_dns_name_with_suffix("enc", ""), "enc");
        assert_eq!(to_dns_name_with_suffix("___", "-0"), "");

        let long = "x".repeat(70);
        let head = to_dns_name_with_suffix(&long, "-head");
        let shard = to_dns_name_with_suffix(&long, "-12");
        assert_eq!(head.len(), DNS_LABEL_MAX_LEN);
        assert!(head.ends_with("x-head"));
        assert!(shard.ends_with("x-12"));
        assert_ne!(head, shard);

        // a dash left at the cut is dropped before the suffix
        let dashed = format!("{}-yyyy", "z".repeat(57));
        assert_eq!(to_dns_name_with_suffix(&dashed, "-tail"), format!("{}-tail", "z".repeat(57)));
    }

    #[test]
    fn test_deployment_json_layout() {
        let value = serde_json::to_value(workload(None).deployment()).unwrap();
        assert_eq!(value["apiVersion"], "apps/v1");
        assert_eq!(value["metadata"]["namespace"], "search");
        assert_eq!(value["spec"]["replicas"], 2);
        assert_eq!(value["spec"]["selector"]["matchLabels"]["app"], "encoder-0");
        let container = &value["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["ports"][0]["containerPort"], 8081);
        assert!(value["spec"]["template"]["spec"].get("initContainers").is_none());
    }

    #[test]
    fn test_init_container_shares_volume() {
        let init = InitContainer {
            image: "acme/dumper".to_string(),
            command: vec!["python".to_string(), "dump.py".to_string()],
            mount_path: "/shared".to_string(),
        };
        let deployment = workload(Some(init)).deployment();
        let spec = &deployment.spec.template.spec;
        assert_eq!(spec.init_containers.len(), 1);
        assert_eq!(spec.volumes[0].name, SHARED_VOLUME_NAME);
        assert_eq!(spec.containers[0].volume_mounts[0].mount_path, "/shared");
        assert_eq!(spec.init_containers[0].volume_mounts[0].name, SHARED_VOLUME_NAME);
    }

    #[test]
    fn test_service_targets_unit_labels() {
        let value = serde_json::to_value(workload(None).service()).unwrap();
        assert_eq!(value["kind"], "Service");
        assert_eq!(value["spec"]["type"], "ClusterIP");
        assert_eq!(value["spec"]["selector"]["app"], "encoder-0");
        assert_eq!(value["spec"]["ports"][1]["targetPort"], 8082);
    }
}
