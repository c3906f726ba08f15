use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::images::{ImageConfig, DEFAULT_USES};
use crate::k8s::{to_dns_name, InitContainer};
use crate::pod::{PodArgs, PodKind, Polling, TopologyBuilder, GATEWAY_NAME};

/// Errors that can occur during manifest parsing and validation
#[derive(Error, Debug, PartialEq)]
pub enum ManifestError {
    #[error("Manifest parse error: {0}")]
    ParseError(String),

    #[error("Environment variable '{0}' referenced by the manifest is not set")]
    MissingVariable(String),

    #[error("Flow '{0}' has no pods")]
    EmptyFlow(String),

    #[error("Duplicate pod name: '{0}'")]
    DuplicatePodName(String),

    #[error("Pod name '{0}' is reserved")]
    ReservedName(String),

    #[error("Pod '{1}' needs '{0}', which is not defined before it")]
    UndefinedNeed(String, String),

    #[error("Pod '{0}' is invalid: {1}")]
    InvalidPod(String, String),

    #[error("Unit name '{0}' of pod '{1}' is already used by pod '{2}'")]
    UnitNameClash(String, String, String),

    #[error("Namespace '{0}' is not a valid DNS label")]
    InvalidNamespace(String),
}

/// Serialization format of a manifest file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    Yaml,
}

impl ManifestFormat {
    /// `.json` files are JSON, everything else is read as YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ManifestFormat::Json,
            _ => ManifestFormat::Yaml,
        }
    }
}

/// Settings of the flow's gateway pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewaySpec {
    #[serde(default = "default_port_expose")]
    pub port_expose: u16,
    #[serde(default)]
    pub extra_flags: BTreeMap<String, Value>,
}

fn default_port_expose() -> u16 {
    8080
}

impl Default for GatewaySpec {
    fn default() -> Self {
        Self {
            port_expose: default_port_expose(),
            extra_flags: BTreeMap::new(),
        }
    }
}

/// One processing stage of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PodSpec {
    pub name: String,
    #[serde(default = "default_uses")]
    pub uses: String,
    #[serde(default)]
    pub uses_before: Option<String>,
    #[serde(default)]
    pub uses_after: Option<String>,
    #[serde(default)]
    pub uses_with: BTreeMap<String, Value>,
    #[serde(default = "default_count")]
    pub shards: u32,
    #[serde(default = "default_count")]
    pub replicas: u32,
    #[serde(default)]
    pub polling: Polling,
    /// Upstream pods; defaults to the previous pod, or the gateway for the first
    #[serde(default)]
    pub needs: Option<Vec<String>>,
    #[serde(default)]
    pub init_container: Option<InitContainer>,
    #[serde(default)]
    pub extra_flags: BTreeMap<String, Value>,
}

fn default_uses() -> String {
    DEFAULT_USES.to_string()
}

fn default_count() -> u32 {
    1
}

/// A flow: an ordered chain of pods behind a gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlowManifest {
    pub name: String,
    /// Target namespace; defaults to the DNS form of the flow name
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub noblock_on_start: bool,
    #[serde(default)]
    pub gateway: GatewaySpec,
    /// Pinned image settings; unset resolves the base image version at deploy
    #[serde(default)]
    pub images: Option<ImageConfig>,
    pub pods: Vec<PodSpec>,
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

fn env_reference() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{[A-Za-z_][A-Za-z0-9_]*\}").expect("static env reference pattern")
    })
}

/// Expand `${VAR}` references from the process environment
///
/// A bare `$` is kept as written, so values such as `^a$` pass through.
pub fn expand_env(content: &str) -> Result<String, ManifestError> {
    let mut expanded = String::with_capacity(content.len());
    let mut last = 0;
    for found in env_reference().find_iter(content) {
        expanded.push_str(&content[last..found.start()]);
        let value = shellexpand::env(found.as_str())
            .map_err(|e| ManifestError::MissingVariable(e.var_name))?;
        expanded.push_str(&value);
        last = found.end();
    }
    expanded.push_str(&content[last..]);
    Ok(expanded)
}

/// Parse and validate a manifest
pub fn parse_manifest(content: &str, format: ManifestFormat) -> Result<FlowManifest, ManifestError> {
    let expanded = expand_env(content)?;
    let manifest: FlowManifest = match format {
        ManifestFormat::Json => serde_json::from_str(&expanded)
            .map_err(|e| ManifestError::ParseError(e.to_string()))?,
        ManifestFormat::Yaml => serde_yaml::from_str(&expanded)
            .map_err(|e| ManifestError::ParseError(e.to_string()))?,
    };
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Check pod names and that every need points at the gateway or an earlier pod
pub fn validate_manifest(manifest: &FlowManifest) -> Result<(), ManifestError> {
    if manifest.pods.is_empty() {
        return Err(ManifestError::EmptyFlow(manifest.name.clone()));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (index, pod) in manifest.pods.iter().enumerate() {
        if pod.name == GATEWAY_NAME {
            return Err(ManifestError::ReservedName(pod.name.clone()));
        }
        for need in manifest.resolved_needs(index) {
            if need != GATEWAY_NAME && !seen.contains(need.as_str()) {
                return Err(ManifestError::UndefinedNeed(need, pod.name.clone()));
            }
        }
        if !seen.insert(&pod.name) {
            return Err(ManifestError::DuplicatePodName(pod.name.clone()));
        }
    }

    let namespace = manifest.namespace();
    if namespace.is_empty() || to_dns_name(&namespace) != namespace {
        return Err(ManifestError::InvalidNamespace(namespace));
    }
    check_unit_names(manifest)
}

/// Every unit of the flow, gateway included, must own a distinct DNS name
fn check_unit_names(manifest: &FlowManifest) -> Result<(), ManifestError> {
    let builder = TopologyBuilder::new(DEFAULT_USES);
    let mut owners: HashMap<String, String> = HashMap::new();

    let mut pods = vec![(manifest.gateway_args(), 0)];
    for index in 0..manifest.pods.len() {
        if let Some(args) = manifest.pod_args(index) {
            pods.push((args, manifest.resolved_needs(index).len()));
        }
    }

    for (args, fanin) in pods {
        let plan = builder
            .plan(&args, fanin)
            .map_err(|e| ManifestError::InvalidPod(args.name.clone(), e.to_string()))?;
        for unit in plan.units() {
            if let Some(other) = owners.insert(unit.dns_name.clone(), args.name.clone()) {
                return Err(ManifestError::UnitNameClash(
                    unit.dns_name.clone(),
                    args.name.clone(),
                    other,
                ));
            }
        }
    }
    Ok(())
}

impl FlowManifest {
    /// The explicit namespace, or the flow name as a DNS label
    pub fn namespace(&self) -> String {
        match &self.namespace {
            Some(namespace) => namespace.clone(),
            None => to_dns_name(&self.name),
        }
    }

    /// Upstream pods of the pod at `index`
    pub fn resolved_needs(&self, index: usize) -> Vec<String> {
        if let Some(needs) = self.pods.get(index).and_then(|p| p.needs.clone()) {
            return needs;
        }
        match index.checked_sub(1).and_then(|i| self.pods.get(i)) {
            Some(previous) => vec![previous.name.clone()],
            None => vec![GATEWAY_NAME.to_string()],
        }
    }

    /// Orchestration arguments of the pod at `index`
    pub fn pod_args(&self, index: usize) -> Option<PodArgs> {
        let pod = self.pods.get(index)?;
        Some(PodArgs {
            name: pod.name.clone(),
            namespace: self.namespace(),
            kind: PodKind::Runtime,
            uses: pod.uses.clone(),
            uses_before: pod.uses_before.clone(),
            uses_after: pod.uses_after.clone(),
            uses_with: pod.uses_with.clone(),
            shards: pod.shards,
            replicas: pod.replicas,
            polling: pod.polling,
            port_expose: None,
            noblock_on_start: self.noblock_on_start,
            init_container: pod.init_container.clone(),
            extra_flags: pod.extra_flags.clone(),
        })
    }

    /// Orchestration arguments of the gateway
    pub fn gateway_args(&self) -> PodArgs {
        let mut args = PodArgs::gateway(self.namespace(), self.gateway.port_expose)
            .noblock(self.noblock_on_start);
        args.extra_flags = self.gateway.extra_flags.clone();
        args
    }
}
