//! Drives the units of one pod through ordered start and reverse teardown

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::args::PodArgs;
use super::descriptor::TopologyNode;
use super::exit_stack::ExitStack;
use super::topology::{TopologyBuilder, TopologyPlan};
use super::unit::{CloseOutcome, DeploymentUnit, UnitContext, UnitPorts, WaitOptions};
use super::PodError;
use crate::k8s::{ControlPlaneError, NamespaceObject, ObjectKind};

/// How an orchestrator starts its units
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub wait: WaitOptions,
    /// Start shards concurrently; head and tail still act as barriers
    pub parallel_shards: bool,
}

/// Position of a started unit, as recorded on the exit stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSlot {
    Head,
    Shard(usize),
    Tail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownFailure {
    pub unit: String,
    pub message: String,
}

/// What a teardown did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Units deleted, in teardown order
    pub closed: Vec<String>,
    /// Deletions that failed and were skipped over
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.closed.extend(other.closed);
        self.failures.extend(other.failures);
    }
}

pub struct PodOrchestrator {
    args: PodArgs,
    needs: Vec<String>,
    context: UnitContext,
    options: StartOptions,
    head: Option<DeploymentUnit>,
    shards: Vec<DeploymentUnit>,
    tail: Option<DeploymentUnit>,
    stack: ExitStack<UnitSlot>,
    started: bool,
}

impl PodOrchestrator {
    /// Plan the topology of `args` and build its units
    ///
    /// The number of `needs` is the upstream fan-in.
    pub fn new(
        args: PodArgs,
        needs: Vec<String>,
        context: UnitContext,
        options: StartOptions,
    ) -> Result<Self, PodError> {
        let mut orchestrator = Self {
            args,
            needs,
            context,
            options,
            head: None,
            shards: Vec::new(),
            tail: None,
            stack: ExitStack::new(),
            started: false,
        };
        orchestrator.build_units()?;
        Ok(orchestrator)
    }

    fn build_units(&mut self) -> Result<(), PodError> {
        let builder = TopologyBuilder::new(self.context.images.default_uses.clone());
        let TopologyPlan { head, shards, tail } = builder.plan(&self.args, self.needs.len())?;

        let ports = UnitPorts::default();
        let build = |args| DeploymentUnit::new(args, ports, self.context.clone());
        self.head = head.map(build);
        self.shards = shards.into_iter().map(build).collect();
        self.tail = tail.map(build);

        debug!(
            "Planned pod '{}': head={}, shards={}, tail={}",
            self.args.name,
            self.head.is_some(),
            self.shards.len(),
            self.tail.is_some()
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.args.name
    }

    pub fn namespace(&self) -> &str {
        &self.args.namespace
    }

    pub fn args(&self) -> &PodArgs {
        &self.args
    }

    pub fn needs(&self) -> &[String] {
        &self.needs
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn head(&self) -> Option<&DeploymentUnit> {
        self.head.as_ref()
    }

    pub fn shards(&self) -> &[DeploymentUnit] {
        &self.shards
    }

    pub fn tail(&self) -> Option<&DeploymentUnit> {
        self.tail.as_ref()
    }

    /// Units in start order
    pub fn units(&self) -> impl Iterator<Item = &DeploymentUnit> {
        self.head
            .iter()
            .chain(self.shards.iter())
            .chain(self.tail.iter())
    }

    /// Replace the pod arguments and plan again
    pub fn update_args(&mut self, args: PodArgs) -> Result<(), PodError> {
        if self.started {
            return Err(PodError::Precondition(format!(
                "pod '{}' cannot change arguments after start",
                self.args.name
            )));
        }
        self.args = args;
        self.build_units()
    }

    /// Node descriptors in routing order: `[head?, shards..., tail?]`
    ///
    /// A gateway plans exactly one unit, so its list holds a single node.
    pub fn deployments(&self) -> Vec<TopologyNode> {
        self.units().map(DeploymentUnit::to_node).collect()
    }

    fn unit_mut(&mut self, slot: UnitSlot) -> Option<&mut DeploymentUnit> {
        match slot {
            UnitSlot::Head => self.head.as_mut(),
            UnitSlot::Shard(index) => self.shards.get_mut(index),
            UnitSlot::Tail => self.tail.as_mut(),
        }
    }

    async fn ensure_namespace(&self) -> Result<(), PodError> {
        let spec = serde_json::to_value(NamespaceObject::new(self.args.namespace.clone()))
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        match self
            .context
            .control_plane
            .create(ObjectKind::Namespace, None, &spec)
            .await
        {
            Ok(()) => {
                info!("Created namespace '{}'", self.args.namespace);
                Ok(())
            }
            Err(ControlPlaneError::AlreadyExists { .. }) => {
                debug!("Namespace '{}' already exists", self.args.namespace);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create the namespace, then head, shards and tail in that order
    ///
    /// Unless `noblock_on_start` is set every unit is ready before the next
    /// one is created. Any failure tears down what was started before the
    /// error is returned.
    pub async fn start(&mut self) -> Result<(), PodError> {
        if self.started {
            return Err(PodError::Precondition(format!(
                "pod '{}' was already started",
                self.args.name
            )));
        }
        self.started = true;

        self.ensure_namespace().await?;

        let wait = (!self.args.noblock_on_start).then(|| self.options.wait.clone());
        if let Err(e) = self.start_units(wait.as_ref()).await {
            error!("Starting pod '{}' failed: {}", self.args.name, e);
            self.close().await;
            return Err(e);
        }

        info!(
            "Pod '{}' started with {} unit(s){}",
            self.args.name,
            self.stack.len(),
            if wait.is_some() { "" } else { ", readiness deferred" }
        );
        Ok(())
    }

    async fn start_units(&mut self, wait: Option<&WaitOptions>) -> Result<(), PodError> {
        if let Some(head) = self.head.as_mut() {
            head.start(wait).await?;
            self.stack.push(UnitSlot::Head);
        }

        if self.options.parallel_shards && self.shards.len() > 1 {
            // the first failing shard cancels the readiness waits of the rest
            let batch = wait.map(|options| {
                let token = options
                    .cancel
                    .as_ref()
                    .map(CancellationToken::child_token)
                    .unwrap_or_default();
                (options.clone().with_cancel(token.clone()), token)
            });
            let batch_wait = batch.as_ref().map(|(options, _)| options);
            let batch_token = batch.as_ref().map(|(_, token)| token);

            let results = join_all(self.shards.iter_mut().map(|shard| async move {
                let result = shard.start(batch_wait).await;
                if result.is_err() {
                    if let Some(token) = batch_token {
                        token.cancel();
                    }
                }
                result
            }))
            .await;

            // record in index order so teardown stays deterministic
            let mut first_error: Option<PodError> = None;
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(()) => self.stack.push(UnitSlot::Shard(index)),
                    // report the failure itself over the cancellations it caused
                    Err(e) => match first_error {
                        None => first_error = Some(e),
                        Some(PodError::Cancelled { .. })
                            if !matches!(e, PodError::Cancelled { .. }) =>
                        {
                            first_error = Some(e)
                        }
                        Some(_) => {}
                    },
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        } else {
            for index in 0..self.shards.len() {
                self.shards[index].start(wait).await?;
                self.stack.push(UnitSlot::Shard(index));
            }
        }

        if let Some(tail) = self.tail.as_mut() {
            tail.start(wait).await?;
            self.stack.push(UnitSlot::Tail);
        }
        Ok(())
    }

    /// Wait for head, shards and tail in order after a deferred start
    pub async fn wait_start_success(&mut self) -> Result<(), PodError> {
        if !self.args.noblock_on_start {
            return Err(PodError::Precondition(format!(
                "pod '{}' waits during start; wait_start_success needs noblock_on_start",
                self.args.name
            )));
        }
        if !self.started {
            return Err(PodError::Precondition(format!(
                "pod '{}' has not been started",
                self.args.name
            )));
        }

        let wait = self.options.wait.clone();
        let result = async {
            for unit in self
                .head
                .iter_mut()
                .chain(self.shards.iter_mut())
                .chain(self.tail.iter_mut())
            {
                unit.wait_start_success(&wait).await?;
            }
            Ok::<(), PodError>(())
        }
        .await;

        if let Err(e) = result {
            error!("Pod '{}' failed to become ready: {}", self.args.name, e);
            self.close().await;
            return Err(e);
        }
        info!("Pod '{}' is ready", self.args.name);
        Ok(())
    }

    /// Mark every unit as started without creating anything
    ///
    /// Used to tear down objects left by an earlier run.
    pub fn adopt(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if let Some(head) = self.head.as_mut() {
            head.adopt();
            self.stack.push(UnitSlot::Head);
        }
        for (index, shard) in self.shards.iter_mut().enumerate() {
            shard.adopt();
            self.stack.push(UnitSlot::Shard(index));
        }
        if let Some(tail) = self.tail.as_mut() {
            tail.adopt();
            self.stack.push(UnitSlot::Tail);
        }
    }

    /// Close started units in reverse start order
    ///
    /// A failed deletion is recorded and the remaining units are still closed.
    /// The namespace is left in place.
    pub async fn close(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        while let Some(slot) = self.stack.pop() {
            let Some(unit) = self.unit_mut(slot) else {
                continue;
            };
            let name = unit.name().to_string();
            match unit.close().await {
                CloseOutcome::Deleted => report.closed.push(name),
                CloseOutcome::Failed(message) => {
                    warn!("Continuing teardown after failure on '{}'", name);
                    report.failures.push(TeardownFailure {
                        unit: name,
                        message,
                    });
                }
                CloseOutcome::Skipped => {}
            }
        }

        if !report.closed.is_empty() || !report.failures.is_empty() {
            info!(
                "Pod '{}' closed {} unit(s), {} failure(s)",
                self.args.name,
                report.closed.len(),
                report.failures.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::ImageConfig;
    use crate::k8s::{ControlPlaneCall, PullPolicy, SimulatedControlPlane};
    use crate::pod::unit::UnitPhase;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(plane: &Arc<SimulatedControlPlane>) -> UnitContext {
        UnitContext::new(plane.clone(), ImageConfig::default())
    }

    fn options() -> StartOptions {
        StartOptions {
            wait: WaitOptions::default().with_poll_interval(Duration::from_millis(1)),
            parallel_shards: false,
        }
    }

    fn sharded(shards: u32) -> PodArgs {
        PodArgs::new("encoder", "flow")
            .with_uses("acme/encoder")
            .with_shards(shards)
    }

    fn orchestrator(plane: &Arc<SimulatedControlPlane>, args: PodArgs) -> PodOrchestrator {
        PodOrchestrator::new(args, vec!["gateway".to_string()], context(plane), options()).unwrap()
    }

    const TEARDOWN: [&str; 5] = [
        "encoder-tail",
        "encoder-2",
        "encoder-1",
        "encoder-0",
        "encoder-head",
    ];

    #[tokio::test]
    async fn test_teardown_reverses_start_order() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, sharded(3));

        pod.start().await.unwrap();
        assert_eq!(
            plane.created(ObjectKind::Deployment),
            vec!["encoder-head", "encoder-0", "encoder-1", "encoder-2", "encoder-tail"]
        );

        let report = pod.close().await;
        assert!(report.is_clean());
        assert_eq!(report.closed, TEARDOWN);
        assert_eq!(plane.deleted(ObjectKind::Deployment), TEARDOWN);
    }

    #[tokio::test]
    async fn test_teardown_order_with_parallel_shards() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut opts = options();
        opts.parallel_shards = true;
        let mut pod = PodOrchestrator::new(sharded(3), vec![], context(&plane), opts).unwrap();

        pod.start().await.unwrap();
        let created = plane.created(ObjectKind::Deployment);
        assert_eq!(created.first().map(String::as_str), Some("encoder-head"));
        assert_eq!(created.last().map(String::as_str), Some("encoder-tail"));

        assert_eq!(pod.close().await.closed, TEARDOWN);
    }

    #[tokio::test]
    async fn test_parallel_shard_failure_cancels_siblings() {
        let plane = Arc::new(SimulatedControlPlane::new());
        plane.fail_list("encoder-1", "apiserver unavailable");
        plane.script_pods("encoder-0", vec![vec![]]);
        let mut opts = options();
        opts.parallel_shards = true;
        let mut pod = PodOrchestrator::new(sharded(3), vec![], context(&plane), opts).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), pod.start())
            .await
            .expect("parallel start should stop after the first failure")
            .unwrap_err();
        assert!(matches!(
            err,
            PodError::ControlPlane(ControlPlaneError::Rejected(ref m)) if m == "apiserver unavailable"
        ));

        let mut deleted = plane.deleted(ObjectKind::Deployment);
        assert_eq!(deleted.last().map(String::as_str), Some("encoder-head"));
        deleted.sort();
        assert_eq!(deleted, vec!["encoder-0", "encoder-1", "encoder-2", "encoder-head"]);
        assert!(plane.created(ObjectKind::Deployment).iter().all(|n| n != "encoder-tail"));
        assert_eq!(pod.shards()[0].phase(), UnitPhase::Closed);
    }

    #[tokio::test]
    async fn test_long_pod_name_creates_one_deployment_per_unit() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, PodArgs::new("x".repeat(63), "flow").with_shards(3));

        pod.start().await.unwrap();
        assert_eq!(pod.units().count(), 5);
        for unit in pod.units() {
            assert!(plane.deployment("flow", unit.dns_name()).is_some());
        }
        let mut created = plane.created(ObjectKind::Deployment);
        created.dedup();
        assert_eq!(created.len(), 5);

        assert_eq!(pod.close().await.closed.len(), 5);
    }

    #[tokio::test]
    async fn test_namespace_created_first_and_tolerated() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut first = orchestrator(&plane, sharded(1));
        let mut second = orchestrator(&plane, PodArgs::new("indexer", "flow"));

        first.start().await.unwrap();
        second.start().await.unwrap();

        let calls = plane.calls();
        assert!(matches!(
            &calls[0],
            ControlPlaneCall::Create { kind: ObjectKind::Namespace, name, .. } if name == "flow"
        ));
        assert_eq!(plane.created(ObjectKind::Namespace).len(), 2);
    }

    #[tokio::test]
    async fn test_shard_failure_rolls_back_started_units() {
        let plane = Arc::new(SimulatedControlPlane::new());
        plane.fail_list("encoder-1", "apiserver unavailable");
        let mut pod = orchestrator(&plane, sharded(3));

        let err = pod.start().await.unwrap_err();
        assert!(matches!(
            err,
            PodError::ControlPlane(ControlPlaneError::Rejected(ref m)) if m == "apiserver unavailable"
        ));

        assert_eq!(
            plane.created(ObjectKind::Deployment),
            vec!["encoder-head", "encoder-0", "encoder-1"]
        );
        assert_eq!(
            plane.deleted(ObjectKind::Deployment),
            vec!["encoder-1", "encoder-0", "encoder-head"]
        );
        assert_eq!(pod.shards()[2].phase(), UnitPhase::Unstarted);

        // nothing left to close
        assert_eq!(pod.close().await, TeardownReport::default());
        assert_eq!(plane.deleted(ObjectKind::Deployment).len(), 3);
    }

    #[tokio::test]
    async fn test_deferred_wait_failure_closes_everything() {
        let plane = Arc::new(SimulatedControlPlane::new());
        plane.script_pods("encoder-0", vec![vec![]]);
        let mut opts = options();
        opts.wait = opts.wait.with_deadline(Duration::from_millis(20));
        let mut pod =
            PodOrchestrator::new(sharded(3).noblock(true), vec![], context(&plane), opts).unwrap();

        pod.start().await.unwrap();
        assert_eq!(plane.list_count("encoder-head"), 0);
        assert!(pod.units().all(|u| u.phase() == UnitPhase::Starting));

        let err = pod.wait_start_success().await.unwrap_err();
        assert!(matches!(err, PodError::ReadinessTimeout { ref unit, .. } if unit == "encoder-0"));
        assert_eq!(plane.deleted(ObjectKind::Deployment), TEARDOWN);
        assert!(pod.units().all(|u| u.phase() == UnitPhase::Closed));
    }

    #[tokio::test]
    async fn test_deferred_wait_succeeds() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, sharded(2).noblock(true));
        pod.start().await.unwrap();
        pod.wait_start_success().await.unwrap();
        assert!(pod.units().all(|u| u.phase() == UnitPhase::Ready));
    }

    #[tokio::test]
    async fn test_wait_requires_noblock() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, sharded(1));
        pod.start().await.unwrap();
        let err = pod.wait_start_success().await.unwrap_err();
        assert!(matches!(err, PodError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, sharded(1));
        pod.start().await.unwrap();
        assert!(matches!(
            pod.start().await.unwrap_err(),
            PodError::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn test_gateway_single_replica_always_pulls() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let args = PodArgs::gateway("flow", 8080).with_replicas(5);
        let mut pod = PodOrchestrator::new(args, vec![], context(&plane), options()).unwrap();
        pod.start().await.unwrap();

        let deployment = plane.deployment("flow", "gateway").unwrap();
        assert_eq!(deployment.spec.replicas, 1);
        assert_eq!(
            deployment.spec.template.spec.containers[0].image_pull_policy,
            PullPolicy::Always
        );

        let nodes = pod.deployments();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "gateway");
    }

    #[test]
    fn test_deployments_order_and_naming() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let pod = orchestrator(&plane, sharded(3));
        let names: Vec<_> = pod.deployments().into_iter().map(|n| n.name).collect();
        assert_eq!(
            names,
            vec!["encoder-head", "encoder-0", "encoder-1", "encoder-2", "encoder-tail"]
        );
        assert!(pod.deployments().iter().all(|n| n.routing_identity.is_none()));

        let single = orchestrator(&plane, sharded(1));
        assert_eq!(single.deployments()[0].name, "encoder");
    }

    #[test]
    fn test_invalid_args_fail_at_construction() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let result = PodOrchestrator::new(sharded(0), vec![], context(&plane), options());
        assert!(matches!(result, Err(PodError::InvalidTopologyArgs(_))));
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_args_only_before_start() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, sharded(1));
        pod.update_args(sharded(2)).unwrap();
        assert_eq!(pod.units().count(), 4);

        pod.start().await.unwrap();
        assert!(matches!(
            pod.update_args(sharded(3)).unwrap_err(),
            PodError::Precondition(_)
        ));
    }

    #[tokio::test]
    async fn test_close_before_start_does_nothing() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut pod = orchestrator(&plane, sharded(2));
        assert_eq!(pod.close().await, TeardownReport::default());
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deletion_does_not_block_siblings() {
        let plane = Arc::new(SimulatedControlPlane::new());
        plane.fail_delete("encoder-1", "forbidden");
        let mut pod = orchestrator(&plane, sharded(3));
        pod.start().await.unwrap();

        let report = pod.close().await;
        assert_eq!(
            report.closed,
            vec!["encoder-tail", "encoder-2", "encoder-0", "encoder-head"]
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "encoder-1");
    }

    #[tokio::test]
    async fn test_adopt_then_close_deletes_existing_objects() {
        let plane = Arc::new(SimulatedControlPlane::new());
        let mut first = orchestrator(&plane, sharded(3));
        first.start().await.unwrap();

        let mut second = orchestrator(&plane, sharded(3));
        second.adopt();
        let report = second.close().await;
        assert_eq!(report.closed, TEARDOWN);
        assert!(plane.object(ObjectKind::Deployment, "flow", "encoder-0").is_none());
    }
}
