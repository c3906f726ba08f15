//! Topology planning: which of head, shards and tail a pod needs
//!
//! Pure functions only; nothing here touches the cluster.

use std::collections::HashSet;

use super::args::{PodArgs, UnitArgs, UnitKind, UnitRole};
use super::PodError;
use crate::k8s::to_dns_name_with_suffix;

/// Planned units of one pod
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyPlan {
    pub head: Option<UnitArgs>,
    pub shards: Vec<UnitArgs>,
    pub tail: Option<UnitArgs>,
}

impl TopologyPlan {
    /// Units in start order: head, shards, tail
    pub fn units(&self) -> impl Iterator<Item = &UnitArgs> {
        self.head
            .iter()
            .chain(self.shards.iter())
            .chain(self.tail.iter())
    }

    pub fn len(&self) -> usize {
        self.shards.len() + self.head.iter().count() + self.tail.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A head is needed to fan out to shards, to merge fan-in across replicas,
/// or to run a pre-processing image.
pub fn needs_head(
    shards: u32,
    replicas: u32,
    upstream_fanin: usize,
    uses_before: Option<&str>,
) -> bool {
    shards > 1 || (upstream_fanin > 1 && replicas > 1) || uses_before.is_some()
}

/// A tail is needed to gather from shards or to run a post-processing image.
pub fn needs_tail(shards: u32, uses_after: Option<&str>) -> bool {
    shards > 1 || uses_after.is_some()
}

/// Suffix of shard `index` of a pod with `shards` shards
pub fn shard_suffix(index: u32, shards: u32) -> String {
    if shards > 1 {
        format!("-{}", index)
    } else {
        String::new()
    }
}

/// Every unit needs a non-empty DNS name that no sibling shares
fn check_unit_names(pod: &str, plan: &TopologyPlan) -> Result<(), PodError> {
    let mut seen = HashSet::new();
    for unit in plan.units() {
        if unit.dns_name.is_empty() {
            return Err(PodError::InvalidTopologyArgs(format!(
                "pod '{}' has no valid DNS name for unit '{}'",
                pod, unit.name
            )));
        }
        if !seen.insert(unit.dns_name.as_str()) {
            return Err(PodError::InvalidTopologyArgs(format!(
                "pod '{}' maps more than one unit to DNS name '{}'",
                pod, unit.dns_name
            )));
        }
    }
    Ok(())
}

/// Plans the units of a pod
///
/// Holds the `uses` value that head and tail fall back to when no
/// pre/post-processing image is configured.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    pass_through_uses: String,
}

impl TopologyBuilder {
    pub fn new(pass_through_uses: impl Into<String>) -> Self {
        Self {
            pass_through_uses: pass_through_uses.into(),
        }
    }

    /// Plan the units of `args` given `upstream_fanin` predecessor pods
    pub fn plan(&self, args: &PodArgs, upstream_fanin: usize) -> Result<TopologyPlan, PodError> {
        if args.shards < 1 {
            return Err(PodError::InvalidTopologyArgs(format!(
                "pod '{}' needs at least one shard, got {}",
                args.name, args.shards
            )));
        }
        if args.replicas < 1 {
            return Err(PodError::InvalidTopologyArgs(format!(
                "pod '{}' needs at least one replica, got {}",
                args.name, args.replicas
            )));
        }

        if args.is_gateway() {
            let plan = TopologyPlan {
                head: None,
                shards: vec![self.unit(args, String::new(), UnitKind::Gateway, None)],
                tail: None,
            };
            check_unit_names(&args.name, &plan)?;
            return Ok(plan);
        }

        let head = needs_head(
            args.shards,
            args.replicas,
            upstream_fanin,
            args.uses_before.as_deref(),
        )
        .then(|| {
            let mut unit = self.unit(
                args,
                "-head".to_string(),
                UnitKind::Runtime(UnitRole::Head),
                None,
            );
            unit.uses = args
                .uses_before
                .clone()
                .unwrap_or_else(|| self.pass_through_uses.clone());
            unit
        });

        let tail = needs_tail(args.shards, args.uses_after.as_deref()).then(|| {
            let mut unit = self.unit(
                args,
                "-tail".to_string(),
                UnitKind::Runtime(UnitRole::Tail),
                None,
            );
            unit.uses = args
                .uses_after
                .clone()
                .unwrap_or_else(|| self.pass_through_uses.clone());
            unit
        });

        let shards = (0..args.shards)
            .map(|index| {
                self.unit(
                    args,
                    shard_suffix(index, args.shards),
                    UnitKind::Runtime(UnitRole::Shard),
                    Some(index),
                )
            })
            .collect();

        let plan = TopologyPlan { head, shards, tail };
        check_unit_names(&args.name, &plan)?;
        Ok(plan)
    }

    fn unit(&self, args: &PodArgs, suffix: String, kind: UnitKind, shard_id: Option<u32>) -> UnitArgs {
        let is_shard = matches!(kind, UnitKind::Runtime(UnitRole::Shard));
        UnitArgs {
            name: format!("{}{}", args.name, suffix),
            dns_name: to_dns_name_with_suffix(&args.name, &suffix),
            pod_name: args.name.clone(),
            namespace: args.namespace.clone(),
            kind,
            uses: args.uses.clone(),
            shard_id,
            replicas: args.replicas,
            // executor parameters and data preparation belong to the shards
            uses_with: if is_shard {
                args.uses_with.clone()
            } else {
                Default::default()
            },
            polling: args.polling,
            port_expose: args.port_expose,
            init_container: if is_shard {
                args.init_container.clone()
            } else {
                None
            },
            extra_flags: args.extra_flags.clone(),
        }
    }
}
