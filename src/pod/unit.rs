//! One Kubernetes Deployment+Service pair
//!
//! A [`DeploymentUnit`] renders its container spec, creates its objects,
//! polls the cluster until the desired number of distinct running pod IPs is
//! observed and deletes its objects again. Its identity, image and replica
//! count are fixed at construction.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::args::{UnitArgs, UnitKind};
use super::descriptor::TopologyNode;
use super::PodError;
use crate::images::{DefaultImageResolver, ImageConfig, ImageResolver, ResolvedImage};
use crate::k8s::{
    to_dns_name, ControlPlaneError, LabelSelector, ObjectKind, PullPolicy, SharedControlPlane,
    WorkloadSpec, APP_LABEL, POD_LABEL,
};

/// Port every unit receives requests on
pub const FIXED_HEAD_PORT_IN: u16 = 8081;

/// Port every unit emits results on
pub const FIXED_TAIL_PORT_OUT: u16 = 8082;

/// Default delay between readiness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ingress/egress ports shared by all units of a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitPorts {
    pub port_in: u16,
    pub port_out: u16,
}

impl Default for UnitPorts {
    fn default() -> Self {
        Self {
            port_in: FIXED_HEAD_PORT_IN,
            port_out: FIXED_TAIL_PORT_OUT,
        }
    }
}

/// Lifecycle of a unit. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitPhase {
    Unstarted,
    Starting,
    Ready,
    Failed,
    Closing,
    Closed,
}

/// How a readiness wait polls and when it gives up
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Overall limit; `None` waits indefinitely
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
            cancel: None,
        }
    }
}

impl WaitOptions {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of closing a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Nothing to delete: never started or already closed
    Skipped,
    Deleted,
    /// At least one deletion failed; the message is what was logged
    Failed(String),
}

/// Collaborators shared by every unit
#[derive(Clone)]
pub struct UnitContext {
    pub control_plane: SharedControlPlane,
    pub images: Arc<ImageConfig>,
    pub resolver: Arc<dyn ImageResolver>,
}

impl UnitContext {
    pub fn new(control_plane: SharedControlPlane, images: ImageConfig) -> Self {
        let resolver = Arc::new(DefaultImageResolver::new(&images));
        Self {
            control_plane,
            images: Arc::new(images),
            resolver,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ImageResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

// ============================================================================
// SBIO: Pure container argument construction
// ============================================================================

fn scalar_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a JSON object as `--flag value` tokens
///
/// Keys come out sorted, `snake_case` turns into `--kebab-case`, `true`
/// becomes a bare flag, `false` and null are dropped, arrays repeat their
/// values after one flag and nested objects are passed as compact JSON.
pub fn to_cli_flags(params: &Value, skip: &[&str]) -> Vec<String> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };

    let mut tokens = Vec::new();
    for (key, value) in map {
        if skip.contains(&key.as_str()) {
            continue;
        }
        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => tokens.push(flag),
            Value::Array(items) if items.is_empty() => {}
            Value::Array(items) => {
                tokens.push(flag);
                tokens.extend(items.iter().map(scalar_token));
            }
            Value::Object(_) => {
                tokens.push(flag);
                tokens.push(value.to_string());
            }
            scalar => {
                tokens.push(flag);
                tokens.push(scalar_token(scalar));
            }
        }
    }
    tokens
}

/// Runtime configuration rendered into container flags; extra flags win
fn runtime_flags(args: &UnitArgs, ports: UnitPorts, replicas: u32) -> Value {
    let mut flags = serde_json::Map::new();
    flags.insert("name".to_string(), Value::from(args.name.as_str()));
    flags.insert("pod_role".to_string(), Value::from(args.kind.role_name()));
    flags.insert("polling".to_string(), Value::from(args.polling.as_str()));
    flags.insert("port_in".to_string(), Value::from(ports.port_in));
    flags.insert("port_out".to_string(), Value::from(ports.port_out));
    if let Some(expose) = args.port_expose {
        flags.insert("port_expose".to_string(), Value::from(expose));
    }
    flags.insert("replicas".to_string(), Value::from(replicas));
    for (key, value) in &args.extra_flags {
        flags.insert(key.clone(), value.clone());
    }
    Value::Object(flags)
}

/// Arguments of a runtime container running `uses`
pub fn runtime_container_args(args: &UnitArgs, uses: &str, ports: UnitPorts) -> Vec<String> {
    let mut tokens: Vec<String> = [
        "executor",
        "--native",
        "--uses",
        uses,
        "--grpc-data-requests",
        "--runtime-cls",
        "GrpcDataRuntime",
        "--uses-metas",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    tokens.push(json!({ "shard_id": args.shard_id }).to_string());

    if !args.uses_with.is_empty() {
        tokens.push("--uses-with".to_string());
        tokens.push(json!(args.uses_with).to_string());
    }

    tokens.extend(to_cli_flags(
        &runtime_flags(args, ports, args.replicas),
        &[],
    ));
    tokens
}

/// Arguments of the gateway container
pub fn gateway_container_args(args: &UnitArgs, ports: UnitPorts) -> Vec<String> {
    let mut tokens = vec!["gateway".to_string(), "--grpc-data-requests".to_string()];
    tokens.extend(to_cli_flags(&runtime_flags(args, ports, 1), &["pod_role"]));
    tokens
}

// ============================================================================
// DeploymentUnit
// ============================================================================

pub struct DeploymentUnit {
    args: UnitArgs,
    dns_name: String,
    pod_dns_name: String,
    ports: UnitPorts,
    replicas: u32,
    context: UnitContext,
    phase: UnitPhase,
    ready_since: Option<DateTime<Utc>>,
}

impl DeploymentUnit {
    pub fn new(args: UnitArgs, ports: UnitPorts, context: UnitContext) -> Self {
        let replicas = match args.kind {
            UnitKind::Gateway => 1,
            UnitKind::Runtime(_) => args.replicas,
        };
        Self {
            dns_name: args.dns_name.clone(),
            pod_dns_name: to_dns_name(&args.pod_name),
            args,
            ports,
            replicas,
            context,
            phase: UnitPhase::Unstarted,
            ready_since: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.args.name
    }

    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    pub fn namespace(&self) -> &str {
        &self.args.namespace
    }

    pub fn kind(&self) -> UnitKind {
        self.args.kind
    }

    pub fn args(&self) -> &UnitArgs {
        &self.args
    }

    pub fn ports(&self) -> UnitPorts {
        self.ports
    }

    /// Desired number of ready pods
    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    pub fn phase(&self) -> UnitPhase {
        self.phase
    }

    pub fn ready_since(&self) -> Option<DateTime<Utc>> {
        self.ready_since
    }

    /// Labels put on every object and pod of this unit
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), self.dns_name.clone());
        labels.insert(POD_LABEL.to_string(), self.pod_dns_name.clone());
        labels
    }

    /// Selector matching exactly this unit's pods
    pub fn selector(&self) -> LabelSelector {
        LabelSelector::matching(APP_LABEL, self.dns_name.clone())
            .and(POD_LABEL, self.pod_dns_name.clone())
    }

    /// Image and `--uses` value for a runtime unit
    fn runtime_image(&self) -> (String, String) {
        let images = &self.context.images;
        match self.context.resolver.resolve(&self.args.uses) {
            ResolvedImage::Custom(image) => (image, images.custom_uses_path.clone()),
            ResolvedImage::FrameworkDefault => {
                (images.base_image(), images.default_executor_class.clone())
            }
        }
    }

    /// The Deployment+Service this unit materializes
    pub fn workload(&self) -> WorkloadSpec {
        let mut ports = vec![
            ("port-in".to_string(), self.ports.port_in),
            ("port-out".to_string(), self.ports.port_out),
        ];

        match self.args.kind {
            UnitKind::Gateway => {
                if let Some(expose) = self.args.port_expose {
                    ports.push(("port-expose".to_string(), expose));
                }
                WorkloadSpec {
                    name: self.dns_name.clone(),
                    namespace: self.args.namespace.clone(),
                    labels: self.labels(),
                    image: self.context.images.base_image(),
                    pull_policy: PullPolicy::Always,
                    command: self.context.images.command.clone(),
                    args: gateway_container_args(&self.args, self.ports),
                    replicas: 1,
                    ports,
                    init_container: None,
                }
            }
            UnitKind::Runtime(_) => {
                let (image, uses) = self.runtime_image();
                WorkloadSpec {
                    name: self.dns_name.clone(),
                    namespace: self.args.namespace.clone(),
                    labels: self.labels(),
                    image,
                    pull_policy: PullPolicy::IfNotPresent,
                    command: self.context.images.command.clone(),
                    args: runtime_container_args(&self.args, &uses, self.ports),
                    replicas: self.replicas,
                    ports,
                    init_container: self.args.init_container.clone(),
                }
            }
        }
    }

    /// Create this unit's objects and, when `wait` is given, block until ready
    ///
    /// Starting a unit that is already starting or ready is a no-op. If the
    /// unit fails here it deletes whatever it created before returning.
    pub async fn start(&mut self, wait: Option<&WaitOptions>) -> Result<(), PodError> {
        match self.phase {
            UnitPhase::Unstarted => {}
            UnitPhase::Starting | UnitPhase::Ready => return Ok(()),
            other => {
                return Err(PodError::Precondition(format!(
                    "unit '{}' cannot start from phase {:?}",
                    self.args.name, other
                )))
            }
        }

        self.phase = UnitPhase::Starting;
        info!(
            "Deploying {} unit '{}' in namespace '{}' ({} replica(s))",
            self.args.kind.role_name(),
            self.args.name,
            self.args.namespace,
            self.replicas
        );

        if let Err(e) = self.deploy().await {
            self.phase = UnitPhase::Failed;
            error!("Failed to deploy unit '{}': {}", self.args.name, e);
            self.close().await;
            return Err(e.into());
        }

        if let Some(options) = wait {
            if let Err(e) = self.wait_start_success(options).await {
                self.close().await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn deploy(&self) -> Result<(), ControlPlaneError> {
        let workload = self.workload();
        let service = serde_json::to_value(workload.service())
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
        let deployment = serde_json::to_value(workload.deployment())
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        self.create_tolerating_existing(ObjectKind::Service, &service)
            .await?;
        self.create_tolerating_existing(ObjectKind::Deployment, &deployment)
            .await
    }

    async fn create_tolerating_existing(
        &self,
        kind: ObjectKind,
        spec: &Value,
    ) -> Result<(), ControlPlaneError> {
        match self
            .context
            .control_plane
            .create(kind, Some(&self.args.namespace), spec)
            .await
        {
            Ok(()) => Ok(()),
            Err(ControlPlaneError::AlreadyExists { .. }) => {
                debug!("{} '{}' already exists", kind, self.dns_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn fail(&mut self, err: PodError) -> PodError {
        self.phase = UnitPhase::Failed;
        error!("Unit '{}' failed to become ready: {}", self.args.name, err);
        err
    }

    /// Poll until the number of distinct running pod IPs reaches the desired
    /// replica count
    pub async fn wait_start_success(&mut self, options: &WaitOptions) -> Result<(), PodError> {
        match self.phase {
            UnitPhase::Starting => {}
            UnitPhase::Ready => return Ok(()),
            other => {
                return Err(PodError::Precondition(format!(
                    "unit '{}' cannot wait for readiness from phase {:?}",
                    self.args.name, other
                )))
            }
        }

        let started = Instant::now();
        let selector = self.selector();
        loop {
            let pods = match self
                .context
                .control_plane
                .list(ObjectKind::Pod, &self.args.namespace, &selector)
                .await
            {
                Ok(pods) => pods,
                Err(e) => return Err(self.fail(e.into())),
            };

            let running = pods
                .iter()
                .filter(|p| p.is_running())
                .filter_map(|p| p.pod_ip.as_deref())
                .collect::<HashSet<_>>()
                .len();

            if running >= self.replicas as usize {
                self.phase = UnitPhase::Ready;
                self.ready_since = Some(Utc::now());
                info!(
                    "Unit '{}' ready with {}/{} pods",
                    self.args.name, running, self.replicas
                );
                return Ok(());
            }
            debug!(
                "Unit '{}' has {}/{} running pods",
                self.args.name, running, self.replicas
            );

            if let Some(deadline) = options.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    let unit = self.args.name.clone();
                    return Err(self.fail(PodError::ReadinessTimeout { unit, elapsed }));
                }
            }

            match &options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            let unit = self.args.name.clone();
                            return Err(self.fail(PodError::Cancelled { unit }));
                        }
                        _ = sleep(options.poll_interval) => {}
                    }
                }
                None => sleep(options.poll_interval).await,
            }
        }
    }

    /// Treat objects left by an earlier run as owned by this unit
    pub fn adopt(&mut self) {
        if self.phase == UnitPhase::Unstarted {
            self.phase = UnitPhase::Starting;
        }
    }

    /// Delete this unit's Deployment and Service
    ///
    /// Never fails: deletion problems are logged and reported in the outcome.
    /// Closing an unstarted or closed unit does nothing.
    pub async fn close(&mut self) -> CloseOutcome {
        match self.phase {
            UnitPhase::Unstarted | UnitPhase::Closing | UnitPhase::Closed => {
                return CloseOutcome::Skipped
            }
            _ => {}
        }

        self.phase = UnitPhase::Closing;
        let deployment = self.delete_object(ObjectKind::Deployment).await;
        let service = self.delete_object(ObjectKind::Service).await;
        self.phase = UnitPhase::Closed;

        match (deployment, service) {
            (Ok(()), Ok(())) => CloseOutcome::Deleted,
            (Err(message), _) | (_, Err(message)) => CloseOutcome::Failed(message),
        }
    }

    async fn delete_object(&self, kind: ObjectKind) -> Result<(), String> {
        let result = self
            .context
            .control_plane
            .delete(kind, &self.dns_name, &self.args.namespace)
            .await;

        match result {
            Ok(response) if response.is_success() => {
                info!("Successful deletion of {} '{}'", kind, self.dns_name);
                Ok(())
            }
            Ok(response) => {
                let message = format!(
                    "Deletion of {} '{}' unsuccessful with status {}",
                    kind, self.dns_name, response.status
                );
                error!("{}", message);
                Err(message)
            }
            Err(ControlPlaneError::NotFound { .. }) => {
                warn!("{} '{}' was already gone", kind, self.dns_name);
                Ok(())
            }
            Err(e) => {
                let message = format!("Error deleting {} '{}': {}", kind, self.dns_name, e);
                error!("{}", message);
                Err(message)
            }
        }
    }

    /// Network view of this unit
    pub fn to_node(&self) -> TopologyNode {
        TopologyNode {
            name: self.args.name.clone(),
            head_host: format!("{}.{}.svc", self.dns_name, self.args.namespace),
            head_port_in: self.ports.port_in,
            tail_port_out: self.ports.port_out,
            routing_identity: None,
        }
    }
}
