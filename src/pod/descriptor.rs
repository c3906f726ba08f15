//! Addressable endpoints of units, as consumed by the routing layer

use serde::{Deserialize, Serialize};

/// Network view of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub name: String,
    /// Cluster-internal service host, `<dns name>.<namespace>.svc`
    pub head_host: String,
    pub head_port_in: u16,
    pub tail_port_out: u16,
    /// Always unset on Kubernetes: services are addressed by host and port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_identity: Option<String>,
}

impl TopologyNode {
    /// `host:port` the routing layer sends requests to
    pub fn ingress_address(&self) -> String {
        format!("{}:{}", self.head_host, self.head_port_in)
    }
}
