//! Declarative pod arguments and the per-unit arguments derived from them

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::images::DEFAULT_USES;
use crate::k8s::InitContainer;

/// Name of the distinguished gateway pod
pub const GATEWAY_NAME: &str = "gateway";

/// How a head distributes requests over shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Polling {
    #[default]
    Any,
    All,
}

impl Polling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polling::Any => "ANY",
            Polling::All => "ALL",
        }
    }
}

/// What a pod deploys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodKind {
    #[default]
    Runtime,
    Gateway,
}

/// Position of a runtime unit inside its pod's topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitRole {
    Head,
    Shard,
    Tail,
}

impl UnitRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitRole::Head => "head",
            UnitRole::Shard => "shard",
            UnitRole::Tail => "tail",
        }
    }
}

/// Tagged variant selecting how a unit is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Gateway,
    Runtime(UnitRole),
}

impl UnitKind {
    pub fn role_name(&self) -> &'static str {
        match self {
            UnitKind::Gateway => "gateway",
            UnitKind::Runtime(role) => role.as_str(),
        }
    }
}

/// Declarative description of one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodArgs {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub kind: PodKind,
    /// Image reference of the shards
    #[serde(default = "default_uses")]
    pub uses: String,
    /// Pre-processing image; forces a head unit
    #[serde(default)]
    pub uses_before: Option<String>,
    /// Post-processing image; forces a tail unit
    #[serde(default)]
    pub uses_after: Option<String>,
    /// Executor parameters passed to the shards
    #[serde(default)]
    pub uses_with: BTreeMap<String, Value>,
    #[serde(default = "default_count")]
    pub shards: u32,
    #[serde(default = "default_count")]
    pub replicas: u32,
    #[serde(default)]
    pub polling: Polling,
    /// Port published by the gateway service
    #[serde(default)]
    pub port_expose: Option<u16>,
    /// Create every unit first and wait for readiness later
    #[serde(default)]
    pub noblock_on_start: bool,
    #[serde(default)]
    pub init_container: Option<InitContainer>,
    /// Additional runtime flags, rendered as `--key value`
    #[serde(default)]
    pub extra_flags: BTreeMap<String, Value>,
}

fn default_uses() -> String {
    DEFAULT_USES.to_string()
}

fn default_count() -> u32 {
    1
}

impl PodArgs {
    /// Runtime pod with one shard and one replica
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            kind: PodKind::Runtime,
            uses: default_uses(),
            uses_before: None,
            uses_after: None,
            uses_with: BTreeMap::new(),
            shards: 1,
            replicas: 1,
            polling: Polling::default(),
            port_expose: None,
            noblock_on_start: false,
            init_container: None,
            extra_flags: BTreeMap::new(),
        }
    }

    /// The gateway pod of a flow
    pub fn gateway(namespace: impl Into<String>, port_expose: u16) -> Self {
        Self {
            kind: PodKind::Gateway,
            port_expose: Some(port_expose),
            ..Self::new(GATEWAY_NAME, namespace)
        }
    }

    pub fn with_uses(mut self, uses: impl Into<String>) -> Self {
        self.uses = uses.into();
        self
    }

    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_uses_before(mut self, uses: impl Into<String>) -> Self {
        self.uses_before = Some(uses.into());
        self
    }

    pub fn with_uses_after(mut self, uses: impl Into<String>) -> Self {
        self.uses_after = Some(uses.into());
        self
    }

    pub fn noblock(mut self, noblock: bool) -> Self {
        self.noblock_on_start = noblock;
        self
    }

    pub fn is_gateway(&self) -> bool {
        self.kind == PodKind::Gateway
    }
}

/// Arguments of one concrete unit, fixed once the unit is built
#[derive(Debug, Clone, PartialEq)]
pub struct UnitArgs {
    /// Externally visible unit name
    pub name: String,
    /// Name of the unit's Deployment and Service
    pub dns_name: String,
    pub pod_name: String,
    pub namespace: String,
    pub kind: UnitKind,
    pub uses: String,
    pub shard_id: Option<u32>,
    pub replicas: u32,
    pub uses_with: BTreeMap<String, Value>,
    pub polling: Polling,
    pub port_expose: Option<u16>,
    pub init_container: Option<InitContainer>,
    pub extra_flags: BTreeMap<String, Value>,
}
