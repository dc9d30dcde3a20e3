//! End-to-end lifecycle scenarios against the in-memory control plane
//!
//! Each test drives the orchestrator the way the CLI does: plan, reconcile,
//! persist, then inspect both the lifecycle record and the simulated host.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use vmforge::cli::{report_exit_code, EXIT_CANCELLED, EXIT_PARTIAL};
use vmforge::config::{parse_cluster_config, ClusterSpec, DocumentFormat};
use vmforge::control::memory::{names_of, touched, OpKind};
use vmforge::control::{ControlError, Handle, MemoryControlPlane};
use vmforge::devices::{DeviceProbe, HostDevice, ProbeError, StaticInventory};
use vmforge::orchestrator::{Orchestrator, OrchestratorError};
use vmforge::planner::graph::ResourceId;
use vmforge::planner::{PlanError, ResourceKind};
use vmforge::settings::Settings;
use vmforge::state::ResourceStatus;

fn cluster(name: &str, computes: u32, gpus_per_compute: u32) -> ClusterSpec {
    let gpu = if gpus_per_compute > 0 {
        format!(", gpu: {{count: {}}}", gpus_per_compute)
    } else {
        String::new()
    };
    let doc = format!(
        r#"
version: "1"
name: {name}
image: /img/base.qcow2
storage: {{backend: qcow2}}
networks: [{{name: mgmt, subnet: 10.0.0.0/24}}]
nodes:
  - {{name: head, role: controller, vcpus: 2, memory_mb: 2048, disk_gb: 20}}
  - {{name: compute, role: compute, count: {computes}, vcpus: 4, memory_mb: 4096, disk_gb: 40{gpu}}}
"#
    );
    parse_cluster_config(&doc, DocumentFormat::Yaml).unwrap()
}

fn gpu(addr: &str, group: u32) -> HostDevice {
    HostDevice {
        address: addr.parse().unwrap(),
        iommu_group: Some(group),
        class: 0x030000,
        vendor: 0x10de,
        device: 0x2204,
        driver: Some("vfio-pci".to_string()),
    }
}

fn audio(addr: &str, group: u32, driver: &str) -> HostDevice {
    HostDevice {
        address: addr.parse().unwrap(),
        iommu_group: Some(group),
        class: 0x040300,
        vendor: 0x10de,
        device: 0x1aef,
        driver: Some(driver.to_string()),
    }
}

/// Returns one snapshot per call, repeating the last one, and counts calls
struct SequenceProbe {
    snapshots: Vec<Vec<HostDevice>>,
    calls: AtomicUsize,
}

impl SequenceProbe {
    fn new(snapshots: Vec<Vec<HostDevice>>) -> Self {
        Self {
            snapshots,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeviceProbe for SequenceProbe {
    fn probe(&self) -> Result<Vec<HostDevice>, ProbeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let idx = n.min(self.snapshots.len().saturating_sub(1));
        Ok(self.snapshots.get(idx).cloned().unwrap_or_default())
    }
}

fn settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default().with_state_dir(dir.path().to_string_lossy());
    settings.retry.initial_delay_ms = 0;
    settings
}

fn orchestrator(
    dir: &TempDir,
    cp: &Arc<MemoryControlPlane>,
    probe: Arc<dyn DeviceProbe>,
) -> Orchestrator {
    Orchestrator::new(settings(dir), cp.clone(), cp.clone(), probe)
}

fn with_devices(dir: &TempDir, cp: &Arc<MemoryControlPlane>, devices: Vec<HostDevice>) -> Orchestrator {
    orchestrator(dir, cp, Arc::new(StaticInventory::new(devices)))
}

fn position(names: &[String], name: &str) -> usize {
    names
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("{} never defined", name))
}

#[tokio::test]
async fn test_second_create_makes_no_calls() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, vec![gpu("0000:02:00.0", 14), gpu("0000:03:00.0", 15)]);
    let spec = cluster("lab", 2, 1);

    let first = assert_ok!(orch.create(&spec).await);
    assert!(first.is_success());
    assert_eq!(first.ready, 8);

    cp.clear_ops();
    let second = assert_ok!(orch.create(&spec).await);
    assert!(second.is_success());
    assert!(second.performed.is_empty());
    assert_eq!(cp.op_count(), 0);
}

#[tokio::test]
async fn test_plan_is_deterministic_across_hosts() {
    let devices = vec![gpu("0000:03:00.0", 15), gpu("0000:02:00.0", 14)];
    let spec = cluster("lab", 2, 1);

    let mut hashes = HashSet::new();
    let mut allocations = Vec::new();
    for _ in 0..2 {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let orch = orchestrator(&dir, &cp, Arc::new(StaticInventory::new(devices.clone())));
        let planned = assert_ok!(orch.plan(&spec));
        hashes.insert(planned.graph.hash());
        allocations.push(planned.allocations);
    }
    assert_eq!(hashes.len(), 1);
    assert_eq!(allocations[0], allocations[1]);
    assert_eq!(allocations[0][0].node, "compute-01");
    assert_eq!(allocations[0][0].primary.to_string(), "0000:02:00.0");
}

#[tokio::test]
async fn test_host_bound_sibling_blocks_whole_cluster() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(
        &dir,
        &cp,
        vec![gpu("0000:02:00.0", 14), audio("0000:02:00.1", 14, "snd_hda_intel")],
    );

    let err = assert_err!(orch.create(&cluster("lab", 1, 1)).await);
    match err {
        OrchestratorError::Plan(PlanError::Unsatisfied(unmet)) => {
            assert_eq!(unmet[0].node, "compute-01");
            assert!(unmet[0].blockers[0].contains("snd_hda_intel"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(cp.op_count(), 0);
    assert!(orch.status(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_two_gpu_node_gets_two_whole_groups() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(
        &dir,
        &cp,
        vec![
            gpu("0000:02:00.0", 14),
            audio("0000:02:00.1", 14, "vfio-pci"),
            gpu("0000:03:00.0", 15),
        ],
    );

    let report = assert_ok!(orch.create(&cluster("lab", 1, 2)).await);
    assert!(report.is_success());

    let attached: Vec<String> = cp
        .attached_devices()
        .into_iter()
        .filter(|(_, vm)| vm == "lab-compute-01")
        .map(|(addr, _)| addr.to_string())
        .collect();
    assert_eq!(attached, vec!["0000:02:00.0", "0000:02:00.1", "0000:03:00.0"]);
}

#[tokio::test]
async fn test_resources_defined_after_their_dependencies() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, Vec::new());
    assert_ok!(orch.create(&cluster("lab", 2, 0)).await);

    let defined = names_of(&cp.ops(), OpKind::Define);
    let net = position(&defined, "lab-mgmt");
    let pool = position(&defined, "lab");
    let head_disk = position(&defined, "lab-head.qcow2");
    let head = position(&defined, "lab-head");
    assert!(pool < head_disk);
    assert!(head_disk < head);
    assert!(net < head);
    for compute in ["lab-compute-01", "lab-compute-02"] {
        assert!(head < position(&defined, compute));
    }
}

#[tokio::test]
async fn test_failed_vm_resumes_without_touching_others() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, Vec::new());
    let spec = cluster("lab", 2, 0);

    cp.fail(
        OpKind::Define,
        "lab-compute-02",
        ControlError::Permanent("no space left on device".to_string()),
        1,
    );
    let first = assert_ok!(orch.create(&spec).await);
    assert!(!first.is_success());
    assert_eq!(report_exit_code(&first), EXIT_PARTIAL);

    let record = orch.store().load("lab").unwrap().unwrap();
    assert_eq!(
        record.status_of(&ResourceId::vm("compute-02")),
        Some(ResourceStatus::Failed)
    );
    assert_eq!(
        record.status_of(&ResourceId::vm("compute-01")),
        Some(ResourceStatus::Ready)
    );

    cp.clear_ops();
    let second = assert_ok!(orch.create(&spec).await);
    assert!(second.is_success());
    let expected: HashSet<String> = ["lab-compute-02".to_string()].into_iter().collect();
    assert_eq!(touched(&cp.ops()), expected);
}

#[tokio::test]
async fn test_destroy_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, vec![gpu("0000:02:00.0", 14)]);
    assert_ok!(orch.create(&cluster("lab", 1, 1)).await);
    assert!(!cp.live_names().is_empty());

    let report = assert_ok!(orch.destroy("lab").await);
    assert!(report.is_success());
    assert!(cp.live_names().is_empty());
    assert!(orch.status(None).unwrap().is_empty());
    assert!(!orch.store().path_for("lab").exists());
}

#[tokio::test]
async fn test_foreign_object_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    cp.insert_live(Handle::new(ResourceKind::Vm, "lab-head"));
    let orch = with_devices(&dir, &cp, Vec::new());

    let report = assert_ok!(orch.create(&cluster("lab", 1, 0)).await);
    assert!(report.failed.iter().any(|f| f.id == ResourceId::vm("head")));
    assert!(report.blocked.contains(&ResourceId::vm("compute-01")));

    assert_ok!(orch.destroy("lab").await);
    assert_eq!(cp.live_names(), vec!["lab-head".to_string()]);
}

#[tokio::test]
async fn test_gpu_owned_by_another_cluster_is_not_taken() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, vec![gpu("0000:02:00.0", 14)]);
    assert_ok!(orch.create(&cluster("lab", 1, 1)).await);

    let err = assert_err!(orch.plan(&cluster("lab2", 1, 1)));
    match err {
        OrchestratorError::Plan(PlanError::Unsatisfied(unmet)) => {
            assert!(unmet[0].blockers.iter().any(|b| b.contains("owned by lab/compute-01")));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_device_conflict_triggers_replan() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let mut host_bound = gpu("0000:02:00.0", 14);
    host_bound.driver = Some("nvidia".to_string());
    let probe = Arc::new(SequenceProbe::new(vec![
        vec![gpu("0000:02:00.0", 14), gpu("0000:03:00.0", 15)],
        vec![host_bound, gpu("0000:03:00.0", 15)],
    ]));
    cp.set_binding("0000:02:00.0".parse().unwrap(), Some("nvidia"));
    let orch = orchestrator(&dir, &cp, probe.clone());

    let report = assert_ok!(orch.create(&cluster("lab", 1, 1)).await);
    assert!(report.is_success());
    assert_eq!(probe.calls(), 2);

    let attached: Vec<String> = cp
        .attached_devices()
        .into_iter()
        .map(|(addr, _)| addr.to_string())
        .collect();
    assert_eq!(attached, vec!["0000:03:00.0"]);
}

#[tokio::test]
async fn test_stop_then_start() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, Vec::new());
    assert_ok!(orch.create(&cluster("lab", 2, 0)).await);

    assert!(assert_ok!(orch.stop("lab").await).is_success());
    assert!(!cp.is_running("lab-head"));
    assert!(!cp.is_running("lab-compute-01"));

    assert!(assert_ok!(orch.start("lab").await).is_success());
    assert!(cp.is_running("lab-head"));
    assert!(cp.is_running("lab-compute-02"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_rolls_back_this_run() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new().with_call_delay(Duration::from_millis(100)));
    let (tx, rx) = watch::channel(false);
    let orch = with_devices(&dir, &cp, Vec::new()).with_cancel(rx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = tx.send(true);
    });

    let report = assert_ok!(orch.create(&cluster("lab", 2, 0)).await);
    assert!(report.cancelled);
    assert_eq!(report_exit_code(&report), EXIT_CANCELLED);
    assert!(!report.rolled_back.is_empty());
    assert!(cp.live_names().is_empty());
}

#[tokio::test]
async fn test_gpu_cluster_provisions_and_inventories_every_node() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, vec![gpu("0000:02:00.0", 14), gpu("0000:03:00.0", 15)]);

    let report = assert_ok!(orch.create(&cluster("lab", 2, 1)).await);
    assert!(report.is_success());
    for vm in ["lab-head", "lab-compute-01", "lab-compute-02"] {
        assert!(cp.is_running(vm), "{} not running", vm);
    }

    let inventory = assert_ok!(orch.inventory("lab").await);
    assert_eq!(inventory.nodes.len(), 3);
    assert!(inventory.all_reachable());
    assert_eq!(inventory.nodes["head"].facts.gpu_count, 0);
    assert_eq!(inventory.nodes["compute-01"].facts.gpu_count, 1);
    assert_eq!(inventory.nodes["compute-02"].facts.gpu_count, 1);
}

#[tokio::test]
async fn test_oversubscribed_gpu_request_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, vec![gpu("0000:02:00.0", 14), gpu("0000:03:00.0", 15)]);

    let err = assert_err!(orch.create(&cluster("lab", 2, 2)).await);
    match err {
        OrchestratorError::Plan(PlanError::Unsatisfied(unmet)) => {
            assert!(!unmet.is_empty());
            assert!(unmet.iter().all(|u| u.requested == 2 && u.found < 2));
            assert!(unmet.iter().any(|u| u.node.starts_with("compute-")));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(cp.op_count(), 0);
    assert!(orch.store().load("lab").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_compute_does_not_stall_controller_resize() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new());
    let orch = with_devices(&dir, &cp, Vec::new());
    cp.fail(
        OpKind::Define,
        "lab-compute-01",
        ControlError::Permanent("bad image".to_string()),
        1,
    );
    let first = assert_ok!(orch.create(&cluster("lab", 2, 0)).await);
    assert!(!first.is_success());

    let mut resized = cluster("lab", 2, 0);
    resized.nodes[0].resources.vcpus = 4;
    let report = assert_ok!(orch.create(&resized).await);
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.ready, 8);
    assert!(cp.is_running("lab-head"));
    assert!(cp.is_running("lab-compute-01"));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_resize_leaves_nothing_untracked() {
    let dir = TempDir::new().unwrap();
    let cp = Arc::new(MemoryControlPlane::new().with_call_delay(Duration::from_millis(100)));
    let serial = |cancel: Option<watch::Receiver<bool>>| {
        let mut settings = settings(&dir);
        settings.max_parallel = 1;
        let orch = Orchestrator::new(
            settings,
            cp.clone(),
            cp.clone(),
            Arc::new(StaticInventory::new(Vec::new())),
        );
        match cancel {
            Some(rx) => orch.with_cancel(rx),
            None => orch,
        }
    };
    let spec = cluster("lab", 2, 0);
    assert_ok!(serial(None).create(&spec).await);

    let mut resized = spec.clone();
    for node in resized.nodes.iter_mut().skip(1) {
        node.resources.vcpus = 8;
    }
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });
    let orch = serial(Some(rx));
    let report = assert_ok!(orch.create(&resized).await);
    assert!(report.cancelled);
    assert!(!report.blocked.is_empty());

    // Every live VM is still tracked as READY
    let record = orch.store().load("lab").unwrap().unwrap();
    for node in ["compute-01", "compute-02"] {
        let live = cp.is_live(&format!("lab-{}", node));
        let ready = record.status_of(&ResourceId::vm(node)) == Some(ResourceStatus::Ready);
        assert_eq!(ready, live, "{}", node);
    }
    assert!(cp.is_live("lab-compute-02"));

    let destroyed = assert_ok!(serial(None).destroy("lab").await);
    assert!(destroyed.is_success());
    assert!(cp.live_names().is_empty());
    assert!(orch.store().load("lab").unwrap().is_none());
}
