//! A whole flow: every manifest pod plus the gateway
//!
//! Pods are created in manifest order and the gateway last. In blocking mode
//! each pod is ready before the next is created, so the gateway comes up
//! behind a ready flow. With `noblock-on-start` every object, gateway
//! included, is created first and readiness is awaited afterwards. Teardown
//! runs in the reverse order.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{validate_manifest, FlowManifest, ManifestError};
use crate::pod::{
    ExitStack, PodError, PodOrchestrator, StartOptions, TeardownReport, TopologyNode,
    UnitContext, GATEWAY_NAME,
};

/// Errors that can occur while deploying a flow
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Pod '{pod}' failed: {source}")]
    Pod {
        pod: String,
        #[source]
        source: PodError,
    },

    #[error("Flow '{0}' was already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl FlowError {
    fn pod(pod: &str, source: PodError) -> Self {
        FlowError::Pod {
            pod: pod.to_string(),
            source,
        }
    }
}

/// Routing entry of one pod
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PodRoute {
    pub pod: String,
    pub needs: Vec<String>,
    pub deployments: Vec<TopologyNode>,
}

/// Everything the routing layer needs to forward requests through a flow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingTable {
    pub flow: String,
    pub namespace: String,
    /// Gateway first, then pods in manifest order
    pub pods: Vec<PodRoute>,
}

impl RoutingTable {
    pub fn route(&self, pod: &str) -> Option<&PodRoute> {
        self.pods.iter().find(|r| r.pod == pod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowSlot {
    Pod(usize),
    Gateway,
}

pub struct FlowDeployment {
    name: String,
    namespace: String,
    noblock: bool,
    gateway: PodOrchestrator,
    pods: Vec<PodOrchestrator>,
    stack: ExitStack<FlowSlot>,
    started: bool,
}

impl FlowDeployment {
    /// Plan every pod of `manifest`; fails before touching the cluster
    pub fn new(
        manifest: &FlowManifest,
        context: UnitContext,
        options: StartOptions,
    ) -> Result<Self, FlowError> {
        validate_manifest(manifest)?;

        let mut pods = Vec::with_capacity(manifest.pods.len());
        for (index, spec) in manifest.pods.iter().enumerate() {
            let Some(args) = manifest.pod_args(index) else {
                continue;
            };
            let pod = PodOrchestrator::new(
                args,
                manifest.resolved_needs(index),
                context.clone(),
                options.clone(),
            )
            .map_err(|e| FlowError::pod(&spec.name, e))?;
            pods.push(pod);
        }

        let gateway = PodOrchestrator::new(manifest.gateway_args(), Vec::new(), context, options)
            .map_err(|e| FlowError::pod(GATEWAY_NAME, e))?;

        Ok(Self {
            name: manifest.name.clone(),
            namespace: manifest.namespace(),
            noblock: manifest.noblock_on_start,
            gateway,
            pods,
            stack: ExitStack::new(),
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn gateway(&self) -> &PodOrchestrator {
        &self.gateway
    }

    pub fn pods(&self) -> &[PodOrchestrator] {
        &self.pods
    }

    fn slot_mut(&mut self, slot: FlowSlot) -> Option<&mut PodOrchestrator> {
        match slot {
            FlowSlot::Pod(index) => self.pods.get_mut(index),
            FlowSlot::Gateway => Some(&mut self.gateway),
        }
    }

    fn start_order(&self) -> Vec<FlowSlot> {
        (0..self.pods.len())
            .map(FlowSlot::Pod)
            .chain(std::iter::once(FlowSlot::Gateway))
            .collect()
    }

    /// Start every pod, then the gateway
    ///
    /// With `noblock-on-start` all pods are created first and then awaited in
    /// the same order. Any failure closes what was started before returning.
    pub async fn start(&mut self) -> Result<(), FlowError> {
        if self.started {
            return Err(FlowError::AlreadyStarted(self.name.clone()));
        }
        self.started = true;
        info!(
            "Deploying flow '{}' ({} pods) to namespace '{}'",
            self.name,
            self.pods.len(),
            self.namespace
        );

        let result = self.start_pods().await;
        let result = match result {
            Ok(()) if self.noblock => self.wait_pods().await,
            other => other,
        };

        if let Err(e) = result {
            error!("Flow '{}' failed to start: {}", self.name, e);
            self.close().await;
            return Err(e);
        }

        info!("Flow '{}' is ready", self.name);
        Ok(())
    }

    async fn start_pods(&mut self) -> Result<(), FlowError> {
        for slot in self.start_order() {
            let Some(pod) = self.slot_mut(slot) else {
                continue;
            };
            let name = pod.name().to_string();
            pod.start().await.map_err(|e| FlowError::pod(&name, e))?;
            self.stack.push(slot);
        }
        Ok(())
    }

    async fn wait_pods(&mut self) -> Result<(), FlowError> {
        for slot in self.start_order() {
            let Some(pod) = self.slot_mut(slot) else {
                continue;
            };
            let name = pod.name().to_string();
            pod.wait_start_success()
                .await
                .map_err(|e| FlowError::pod(&name, e))?;
        }
        Ok(())
    }

    /// Treat every unit of the flow as deployed by an earlier run
    pub fn adopt(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for slot in self.start_order() {
            if let Some(pod) = self.slot_mut(slot) {
                pod.adopt();
                self.stack.push(slot);
            }
        }
    }

    /// Close the gateway and pods in reverse start order
    pub async fn close(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(slot) = self.stack.pop() {
            if let Some(pod) = self.slot_mut(slot) {
                report.merge(pod.close().await);
            }
        }
        report
    }

    /// Delete everything a previous deploy of this flow created
    pub async fn teardown(&mut self) -> TeardownReport {
        self.adopt();
        self.close().await
    }

    pub fn routing_table(&self) -> RoutingTable {
        let gateway_needs = self
            .pods
            .iter()
            .filter(|p| !self.pods.iter().any(|other| other.needs().iter().any(|n| n == p.name())))
            .map(|p| p.name().to_string())
            .collect();

        let mut pods = vec![PodRoute {
            pod: GATEWAY_NAME.to_string(),
            needs: gateway_needs,
            deployments: self.gateway.deployments(),
        }];
        pods.extend(self.pods.iter().map(|p| PodRoute {
            pod: p.name().to_string(),
            needs: p.needs().to_vec(),
            deployments: p.deployments(),
        }));

        RoutingTable {
            flow: self.name.clone(),
            namespace: self.namespace.clone(),
            pods,
        }
    }
}
