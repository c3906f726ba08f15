//! End-to-end flow deployment against the in-memory control plane

use std::sync::Arc;
use std::time::Duration;

use podweave::config::{parse_manifest, ManifestFormat};
use podweave::flow::FlowDeployment;
use podweave::images::ImageConfig;
use podweave::k8s::{ObjectKind, ObjectStatus, PullPolicy, SimulatedControlPlane};
use podweave::pod::{StartOptions, UnitContext, UnitPhase, WaitOptions};

const MANIFEST: &str = r#"
name: Image Search
namespace: search
gateway:
  port-expose: 45678
pods:
  - name: crafter
    uses: docker://acme/crafter:2
    init-container:
      image: acme/dataset-puller
      command: [sh, -c, "cp -r /data/* /shared"]
  - name: encoder
    uses: acme/encoder:1
    shards: 3
    replicas: 2
    uses-after: acme/merger
    uses-with:
      batch_size: 32
  - name: indexer
    polling: ALL
"#;

fn options() -> StartOptions {
    StartOptions {
        wait: WaitOptions::default().with_poll_interval(Duration::from_millis(1)),
        parallel_shards: true,
    }
}

fn deployment(plane: &Arc<SimulatedControlPlane>) -> FlowDeployment {
    let manifest = parse_manifest(MANIFEST, ManifestFormat::Yaml).unwrap();
    let context = UnitContext::new(plane.clone(), ImageConfig::default().with_version("0.4.2"));
    FlowDeployment::new(&manifest, context, options()).unwrap()
}

#[tokio::test]
async fn test_flow_objects_on_cluster() {
    let plane = Arc::new(SimulatedControlPlane::new());
    let mut flow = deployment(&plane);
    flow.start().await.unwrap();

    // init container shares an emptyDir with the executor
    let crafter = plane.deployment("search", "crafter").unwrap();
    let template = &crafter.spec.template.spec;
    assert_eq!(template.containers[0].image, "acme/crafter:2");
    assert_eq!(template.init_containers[0].image, "acme/dataset-puller");
    assert_eq!(template.volumes.len(), 1);
    assert_eq!(
        template.containers[0].volume_mounts,
        template.init_containers[0].volume_mounts
    );

    // shards carry the replica count, shard id and executor parameters
    let shard = plane.deployment("search", "encoder-2").unwrap();
    assert_eq!(shard.spec.replicas, 2);
    let args = &shard.spec.template.spec.containers[0].args;
    let metas = args.iter().position(|a| a == "--uses-metas").unwrap();
    assert_eq!(args[metas + 1], r#"{"shard_id":2}"#);
    assert!(args.contains(&r#"{"batch_size":32}"#.to_string()));
    assert_eq!(
        shard.spec.template.spec.containers[0].image_pull_policy,
        PullPolicy::IfNotPresent
    );

    // the tail runs the post-processing image, not the shard parameters
    let tail = plane.deployment("search", "encoder-tail").unwrap();
    assert_eq!(tail.spec.template.spec.containers[0].image, "acme/merger");
    assert!(!tail.spec.template.spec.containers[0]
        .args
        .contains(&"--uses-with".to_string()));

    // the head runs the framework image with the default executor
    let head = plane.deployment("search", "encoder-head").unwrap();
    assert_eq!(
        head.spec.template.spec.containers[0].image,
        "podweave/runtime:0.4.2-standard"
    );

    let gateway = plane.deployment("search", "gateway").unwrap();
    assert_eq!(gateway.spec.replicas, 1);
    let service = plane
        .object(ObjectKind::Service, "search", "gateway")
        .unwrap();
    let ports: Vec<u64> = service["spec"]["ports"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["port"].as_u64().unwrap())
        .collect();
    assert_eq!(ports, vec![8081, 8082, 45678]);

    assert!(flow
        .pods()
        .iter()
        .flat_map(|p| p.units())
        .all(|u| u.phase() == UnitPhase::Ready));
}

#[tokio::test]
async fn test_routing_table_export() {
    let plane = Arc::new(SimulatedControlPlane::new());
    let flow = deployment(&plane);
    let table = flow.routing_table();

    assert_eq!(table.flow, "Image Search");
    let encoder = table.route("encoder").unwrap();
    assert_eq!(encoder.needs, vec!["crafter"]);
    let names: Vec<_> = encoder.deployments.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["encoder-head", "encoder-0", "encoder-1", "encoder-2", "encoder-tail"]
    );

    let json = serde_json::to_value(&table).unwrap();
    assert_eq!(json["pods"][0]["pod"], "gateway");
    assert_eq!(
        json["pods"][1]["deployments"][0]["head_host"],
        "crafter.search.svc"
    );
}

#[tokio::test]
async fn test_slow_shard_delays_tail_until_ready() {
    let plane = Arc::new(SimulatedControlPlane::new());
    let pod = |ip: &str| ObjectStatus::running_pod(ip, ip, Default::default());
    plane.script_pods(
        "encoder-1",
        vec![
            vec![],
            vec![pod("10.9.0.1")],
            vec![pod("10.9.0.1"), pod("10.9.0.2")],
        ],
    );

    let mut flow = deployment(&plane);
    flow.start().await.unwrap();
    assert_eq!(plane.list_count("encoder-1"), 3);

    let created = plane.created(ObjectKind::Deployment);
    let tail = created.iter().position(|n| n == "encoder-tail").unwrap();
    let shard = created.iter().position(|n| n == "encoder-1").unwrap();
    assert!(shard < tail);
}

#[tokio::test]
async fn test_teardown_leaves_namespace() {
    let plane = Arc::new(SimulatedControlPlane::new());
    let mut flow = deployment(&plane);
    flow.start().await.unwrap();

    let report = flow.close().await;
    assert!(report.is_clean());
    assert_eq!(report.closed.first().map(String::as_str), Some("gateway"));
    assert_eq!(report.closed.last().map(String::as_str), Some("crafter"));
    assert!(plane.deleted(ObjectKind::Namespace).is_empty());
    assert!(plane.object(ObjectKind::Namespace, "", "search").is_some());
}
