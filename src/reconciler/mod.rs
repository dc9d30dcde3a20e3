//! Lifecycle reconciler
//!
//! Drives the control plane until a cluster's lifecycle record matches its
//! desired-state graph. Work is claimed by a bounded worker pool in dependency
//! order and every status transition is committed through the cluster's
//! [`StateWriter`] before the next step starts.
//!
//! ```text
//! create:  diff -> teardown (orphans, replacements, leftovers) -> create
//! destroy: teardown everything recorded, dependents first
//! ```

pub mod diff;
pub mod retry;

pub use diff::{plan_actions, ActionPlan, TeardownReason};
pub use retry::{retry_transient, Attempted, RetryPolicy};

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::NodeRole;
use crate::control::{with_timeout, ControlError, ControlPlane, Handle};
use crate::devices::{is_vfio_driver, PciAddress};
use crate::planner::graph::{DesiredStateGraph, GraphError, ResourceId, ResourceKind, ResourceNode};
use crate::state::{
    LifecycleRecord, PowerState, ResourceRecord, ResourceStatus, StateError, StateStore,
    StateWriter,
};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to list live objects: {0}")]
    Listing(ControlError),

    #[error("Cluster '{0}' has no lifecycle record; run create first")]
    NotProvisioned(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Destroy,
    Start,
    Stop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Destroy => "destroy",
            Operation::Start => "start",
            Operation::Stop => "stop",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformedAction {
    pub id: ResourceId,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedResource {
    pub id: ResourceId,
    pub error: String,
}

/// An allocated function found bound to a host driver right before use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConflict {
    pub node: String,
    pub address: PciAddress,
    pub driver: Option<String>,
}

impl fmt::Display for DeviceConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: device {} is bound to '{}' instead of vfio",
            self.node,
            self.address,
            self.driver.as_deref().unwrap_or("no driver")
        )
    }
}

/// What one reconciler operation did
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub cluster: String,
    pub operation: Operation,
    pub performed: Vec<PerformedAction>,
    pub failed: Vec<FailedResource>,
    /// Resources that were never attempted because something they need is not READY
    pub blocked: Vec<ResourceId>,
    pub device_conflicts: Vec<DeviceConflict>,
    pub cancelled: bool,
    /// Resources made READY by this run and torn down again after cancellation
    pub rolled_back: Vec<ResourceId>,
    /// READY resources in the record when the operation finished
    pub ready: usize,
}

impl ReconcileReport {
    fn new(cluster: &str, operation: Operation) -> Self {
        Self {
            cluster: cluster.to_string(),
            operation,
            performed: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            device_conflicts: Vec::new(),
            cancelled: false,
            rolled_back: Vec::new(),
            ready: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.blocked.is_empty()
            && self.device_conflicts.is_empty()
            && !self.cancelled
    }

    /// Some work succeeded or is in place even though the run did not fully succeed
    pub fn is_partial(&self) -> bool {
        !self.performed.is_empty() || self.ready > 0
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_parallel: usize,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            call_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Everything a worker task needs, shared across the pool
struct Worker {
    control: Arc<dyn ControlPlane>,
    writer: Arc<StateWriter>,
    config: ReconcilerConfig,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

#[derive(Clone, Copy)]
enum Phase<'a> {
    Create(&'a DesiredStateGraph),
    /// Carries the recorded resources already known to have no live object
    Teardown(&'a BTreeSet<ResourceId>),
}

impl Phase<'_> {
    /// Create claims a resource once all its dependencies are READY; teardown
    /// claims it once nothing that may exist live still depends on it.
    fn claimable(self, id: &ResourceId, snapshot: &LifecycleRecord) -> bool {
        match self {
            Phase::Create(graph) => graph
                .get(id)
                .is_some_and(|n| n.depends_on.iter().all(|d| snapshot.is_ready(d))),
            Phase::Teardown(gone) => !snapshot.resources.iter().any(|(other, r)| {
                other != id
                    && r.status != ResourceStatus::Pending
                    && !gone.contains(other)
                    && r.depends_on.contains(id)
            }),
        }
    }
}

enum Outcome {
    Done(Vec<&'static str>),
    Failed(String),
    Conflict(DeviceConflict),
}

#[derive(Default)]
struct PhaseOutcome {
    completed: Vec<ResourceId>,
}

async fn run_phase(
    worker: &Arc<Worker>,
    phase: Phase<'_>,
    todo: &BTreeSet<ResourceId>,
    report: &mut ReconcileReport,
) -> Result<PhaseOutcome, StateError> {
    let semaphore = Arc::new(Semaphore::new(worker.config.max_parallel.max(1)));
    let mut tasks: JoinSet<(ResourceId, Result<Outcome, StateError>)> = JoinSet::new();
    let mut in_flight: BTreeSet<ResourceId> = BTreeSet::new();
    let mut settled: BTreeSet<ResourceId> = BTreeSet::new();
    let mut outcome = PhaseOutcome::default();
    let mut state_error: Option<StateError> = None;

    loop {
        if state_error.is_none() && !worker.is_cancelled() {
            let snapshot = worker.writer.snapshot().await;
            let candidates: Vec<ResourceId> = todo
                .iter()
                .filter(|id| !in_flight.contains(*id) && !settled.contains(*id))
                .filter(|id| phase.claimable(id, &snapshot))
                .cloned()
                .collect();

            for id in candidates {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let w = Arc::clone(worker);
                match phase {
                    Phase::Create(graph) => {
                        let Some(node) = graph.get(&id).cloned() else {
                            continue;
                        };
                        tasks.spawn(async move {
                            let _permit = permit;
                            let result = create_one(&w, &node).await;
                            (node.id, result)
                        });
                    }
                    Phase::Teardown(_) => {
                        let target = id.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            let result = teardown_one(&w, &target).await;
                            (target, result)
                        });
                    }
                }
                in_flight.insert(id);
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (id, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Worker task did not complete");
                continue;
            }
        };
        in_flight.remove(&id);
        settled.insert(id.clone());

        match result {
            Ok(Outcome::Done(actions)) => {
                for action in actions {
                    report.performed.push(PerformedAction {
                        id: id.clone(),
                        action: action.to_string(),
                    });
                }
                outcome.completed.push(id);
            }
            Ok(Outcome::Failed(error)) => {
                report.failed.push(FailedResource { id, error });
            }
            Ok(Outcome::Conflict(conflict)) => {
                report.device_conflicts.push(conflict);
            }
            Err(e) => {
                error!(resource = %id, error = %e, "Failed to commit lifecycle record");
                state_error.get_or_insert(e);
            }
        }
    }

    for id in &in_flight {
        report.failed.push(FailedResource {
            id: id.clone(),
            error: "worker task aborted".to_string(),
        });
    }
    for id in todo {
        if !settled.contains(id) && !in_flight.contains(id) {
            report.blocked.push(id.clone());
        }
    }

    match state_error {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

async fn fail_resource(
    w: &Worker,
    id: &ResourceId,
    attempts: u32,
    err: ControlError,
) -> Result<Outcome, StateError> {
    let message = err.to_string();
    error!(resource = %id, attempts = attempts, error = %message, "Resource failed");
    let recorded = message.clone();
    w.writer
        .commit(move |r| {
            if let Some(rec) = r.resources.get_mut(id) {
                rec.attempts = attempts;
                rec.fail(recorded);
            }
        })
        .await?;
    Ok(Outcome::Failed(message))
}

/// Bring one resource from PENDING to READY
async fn create_one(w: &Worker, node: &ResourceNode) -> Result<Outcome, StateError> {
    let id = &node.id;
    let timeout = w.config.call_timeout;
    let control = &w.control;

    if let Some(vm) = node.spec.as_vm() {
        for function in vm.passthrough.iter().flat_map(|a| a.functions.iter()) {
            let address = *function;
            let binding = with_timeout(timeout, control.device_binding(address)).await;
            match binding {
                Ok(Some(driver)) if is_vfio_driver(&driver) => {}
                Ok(driver) => {
                    let conflict = DeviceConflict {
                        node: vm.node.clone(),
                        address,
                        driver,
                    };
                    warn!(resource = %id, conflict = %conflict, "Allocated device no longer free");
                    let note = conflict.to_string();
                    w.writer
                        .commit(move |r| {
                            if let Some(rec) = r.resources.get_mut(id) {
                                rec.set_status(ResourceStatus::Pending);
                                rec.last_error = Some(note);
                            }
                        })
                        .await?;
                    return Ok(Outcome::Conflict(conflict));
                }
                Err(e) => return fail_resource(w, id, 0, e).await,
            }
        }
    }

    w.writer
        .commit(|r| {
            let rec = r
                .resources
                .entry(id.clone())
                .or_insert_with(|| ResourceRecord::pending(node));
            rec.attempts = 0;
            rec.set_status(ResourceStatus::Creating);
        })
        .await?;
    info!(resource = %id, name = %node.spec.live_name(), "Creating resource");

    let spec = &node.spec;
    let defined = retry_transient(&w.config.retry, &format!("define {}", id), &w.cancel, move |_| {
        with_timeout(timeout, control.define(spec))
    })
    .await;
    let mut attempts = defined.attempts;
    let handle = match defined.result {
        Ok(handle) => handle,
        // An earlier attempt timed out but went through
        Err(ControlError::AlreadyExists(_)) if defined.attempts > 1 => {
            debug!(resource = %id, "Accepting object created by a timed-out attempt");
            Handle::for_spec(spec)
        }
        Err(e) => return fail_resource(w, id, attempts, e).await,
    };

    let mut actions = vec!["define"];
    let mut power = None;
    if node.kind() == ResourceKind::Vm {
        let handle_ref = &handle;
        let started = retry_transient(&w.config.retry, &format!("start {}", id), &w.cancel, move |_| {
            with_timeout(timeout, control.start(handle_ref))
        })
        .await;
        attempts += started.attempts;
        match started.result {
            Ok(()) | Err(ControlError::AlreadyExists(_)) => {}
            Err(e) => return fail_resource(w, id, attempts, e).await,
        }
        actions.push("start");
        power = Some(PowerState::Running);
    }

    let live_name = handle.name.clone();
    w.writer
        .commit(move |r| {
            if let Some(rec) = r.resources.get_mut(id) {
                rec.handle = Some(live_name);
                rec.power = power;
                rec.attempts = attempts;
                rec.set_status(ResourceStatus::Ready);
            }
        })
        .await?;
    info!(resource = %id, attempts = attempts, "Resource ready");
    Ok(Outcome::Done(actions))
}

/// Remove one resource from the control plane and from the record
async fn teardown_one(w: &Worker, id: &ResourceId) -> Result<Outcome, StateError> {
    let snapshot = w.writer.snapshot().await;
    let Some(rec) = snapshot.resources.get(id) else {
        return Ok(Outcome::Done(Vec::new()));
    };

    // Never reached the control plane
    if rec.status == ResourceStatus::Pending {
        w.writer
            .commit(|r| {
                r.resources.remove(id);
            })
            .await?;
        return Ok(Outcome::Done(Vec::new()));
    }

    w.writer
        .commit(|r| {
            if let Some(rec) = r.resources.get_mut(id) {
                rec.set_status(ResourceStatus::Destroying);
            }
        })
        .await?;
    info!(resource = %id, name = %rec.live_name(), "Destroying resource");

    let handle = Handle::for_spec(&rec.spec);
    let handle_ref = &handle;
    let control = &w.control;
    let timeout = w.config.call_timeout;
    let destroyed = retry_transient(&w.config.retry, &format!("destroy {}", id), &w.cancel, move |_| {
        with_timeout(timeout, control.destroy(handle_ref))
    })
    .await;

    match destroyed.result {
        Ok(()) | Err(ControlError::NotFound(_)) => {
            w.writer
                .commit(|r| {
                    r.resources.remove(id);
                })
                .await?;
            debug!(resource = %id, "Resource removed");
            Ok(Outcome::Done(vec!["destroy"]))
        }
        Err(e) => fail_resource(w, id, destroyed.attempts, e).await,
    }
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct Reconciler {
    control: Arc<dyn ControlPlane>,
    store: StateStore,
    config: ReconcilerConfig,
    cancel: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(control: Arc<dyn ControlPlane>, store: StateStore, config: ReconcilerConfig) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            control,
            store,
            config,
            cancel,
        }
    }

    /// Stop claiming new work once `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn worker(&self, writer: &Arc<StateWriter>, cancel: watch::Receiver<bool>) -> Arc<Worker> {
        Arc::new(Worker {
            control: Arc::clone(&self.control),
            writer: Arc::clone(writer),
            config: self.config.clone(),
            cancel,
        })
    }

    async fn list_live(&self) -> Result<HashSet<Handle>, ReconcileError> {
        let control = &self.control;
        let timeout = self.config.call_timeout;
        let listed = retry_transient(&self.config.retry, "list", &self.cancel, move |_| {
            with_timeout(timeout, control.list())
        })
        .await;
        listed
            .result
            .map(|handles| handles.into_iter().collect())
            .map_err(ReconcileError::Listing)
    }

    /// What `create` would do, without changing anything
    pub async fn preview(&self, graph: &DesiredStateGraph) -> Result<ActionPlan, ReconcileError> {
        graph.order()?;
        let record = self
            .store
            .load(&graph.cluster)?
            .unwrap_or_else(|| LifecycleRecord::new(&graph.cluster, &graph.hash()));
        let live = self.list_live().await?;
        Ok(plan_actions(graph, &record, &live))
    }

    /// Converge the cluster onto `graph`
    pub async fn create(&self, graph: &DesiredStateGraph) -> Result<ReconcileReport, ReconcileError> {
        let order = graph.order()?;
        let cluster = graph.cluster.as_str();
        let hash = graph.hash();
        let mut report = ReconcileReport::new(cluster, Operation::Create);

        let record = self
            .store
            .load(cluster)?
            .unwrap_or_else(|| LifecycleRecord::new(cluster, &hash));
        let live = self.list_live().await?;
        let plan = plan_actions(graph, &record, &live);

        info!(
            cluster = %cluster,
            create = plan.create.len(),
            teardown = plan.teardown.len(),
            unchanged = plan.unchanged.len(),
            conflicts = plan.conflicts.len(),
            "Reconciling cluster"
        );

        for id in &plan.conflicts {
            let name = graph.get(id).map(|n| n.spec.live_name()).unwrap_or_default();
            warn!(resource = %id, name = %name, "Live object exists without a record");
            report.failed.push(FailedResource {
                id: id.clone(),
                error: format!("'{}' already exists but is not in the lifecycle record; refusing to adopt it", name),
            });
        }

        if plan.is_noop() {
            report.ready = record.count_by_status().get(&ResourceStatus::Ready).copied().unwrap_or(0);
            info!(cluster = %cluster, "Cluster already converged");
            return Ok(report);
        }

        // Interrupted or failed steps the listing did not find live
        let gone: BTreeSet<ResourceId> = record
            .resources
            .iter()
            .filter(|(id, r)| {
                !matches!(r.status, ResourceStatus::Pending | ResourceStatus::Ready)
                    && !plan.teardown.contains_key(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let writer = Arc::new(StateWriter::new(self.store.clone(), record));
        writer
            .commit(|r| {
                r.run_id = Uuid::new_v4();
                r.graph_hash = hash.clone();
            })
            .await?;
        let worker = self.worker(&writer, self.cancel.clone());

        let teardown: BTreeSet<ResourceId> = plan.teardown.keys().cloned().collect();
        let torn = run_phase(&worker, Phase::Teardown(&gone), &teardown, &mut report).await?;

        // A resource whose teardown did not complete keeps its record, and so
        // does everything built on top of it
        let mut held: BTreeSet<ResourceId> = teardown
            .iter()
            .filter(|id| !torn.completed.contains(*id))
            .cloned()
            .collect();
        for id in &order {
            let stacked = graph
                .get(id)
                .is_some_and(|n| n.depends_on.iter().any(|d| held.contains(d)));
            if stacked {
                held.insert(id.clone());
            }
        }
        let (deferred, to_create): (BTreeSet<ResourceId>, BTreeSet<ResourceId>) =
            plan.create.iter().cloned().partition(|id| held.contains(id));
        for id in deferred {
            let reported = report.blocked.contains(&id) || report.failed.iter().any(|f| f.id == id);
            if !reported {
                report.blocked.push(id);
            }
        }

        writer
            .commit(|r| {
                for id in &to_create {
                    let Some(node) = graph.get(id) else {
                        continue;
                    };
                    let fresh = match r.resources.get(id) {
                        None => ResourceRecord::pending(node),
                        Some(old) if old.status == ResourceStatus::Ready => continue,
                        // Keep the previous attempt's error until the next one resolves
                        Some(old) => {
                            let mut rec = ResourceRecord::pending(node);
                            rec.attempts = old.attempts;
                            rec.last_error = old.last_error.clone();
                            rec.timestamps = old.timestamps.clone();
                            rec.set_status(ResourceStatus::Pending);
                            rec
                        }
                    };
                    r.resources.insert(id.clone(), fresh);
                }
            })
            .await?;

        let created = if self.is_cancelled() {
            report.blocked.extend(to_create.iter().cloned());
            PhaseOutcome::default()
        } else {
            run_phase(&worker, Phase::Create(graph), &to_create, &mut report).await?
        };

        if self.is_cancelled() {
            report.cancelled = true;
            warn!(
                cluster = %cluster,
                created = created.completed.len(),
                "Cancelled, tearing down resources created by this run"
            );
            // Rollback runs to completion regardless of the cancel signal
            let (_keep, never) = watch::channel(false);
            let rollback = self.worker(&writer, never);
            let ids: BTreeSet<ResourceId> = created.completed.iter().cloned().collect();
            let undone = run_phase(&rollback, Phase::Teardown(&BTreeSet::new()), &ids, &mut report).await?;
            report.rolled_back = undone.completed;
        }

        writer.remove_if_empty().await?;
        let snapshot = writer.snapshot().await;
        report.ready = snapshot.count_by_status().get(&ResourceStatus::Ready).copied().unwrap_or(0);
        info!(
            cluster = %cluster,
            performed = report.performed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            ready = report.ready,
            "Create finished"
        );
        Ok(report)
    }

    /// Tear down everything recorded for `cluster`
    pub async fn destroy(&self, cluster: &str) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::new(cluster, Operation::Destroy);
        let Some(record) = self.store.load(cluster)? else {
            info!(cluster = %cluster, "Nothing recorded, nothing to destroy");
            return Ok(report);
        };

        let ids: BTreeSet<ResourceId> = record.resources.keys().cloned().collect();
        info!(cluster = %cluster, resources = ids.len(), "Destroying cluster");
        let writer = Arc::new(StateWriter::new(self.store.clone(), record));
        let worker = self.worker(&writer, self.cancel.clone());
        run_phase(&worker, Phase::Teardown(&BTreeSet::new()), &ids, &mut report).await?;
        report.cancelled = self.is_cancelled();

        if writer.remove_if_empty().await? {
            info!(cluster = %cluster, "Cluster destroyed, lifecycle record removed");
        }
        let snapshot = writer.snapshot().await;
        report.ready = snapshot.count_by_status().get(&ResourceStatus::Ready).copied().unwrap_or(0);
        Ok(report)
    }

    /// Power on READY VMs, controller first
    pub async fn start(&self, cluster: &str) -> Result<ReconcileReport, ReconcileError> {
        self.set_power(cluster, PowerState::Running).await
    }

    /// Shut down READY VMs, controller last
    pub async fn stop(&self, cluster: &str) -> Result<ReconcileReport, ReconcileError> {
        self.set_power(cluster, PowerState::Stopped).await
    }

    async fn set_power(&self, cluster: &str, target: PowerState) -> Result<ReconcileReport, ReconcileError> {
        let operation = match target {
            PowerState::Running => Operation::Start,
            PowerState::Stopped => Operation::Stop,
        };
        let mut report = ReconcileReport::new(cluster, operation);
        let record = self
            .store
            .load(cluster)?
            .ok_or_else(|| ReconcileError::NotProvisioned(cluster.to_string()))?;

        let mut controllers = Vec::new();
        let mut compute = Vec::new();
        for (id, rec, vm) in record.vms() {
            if rec.status != ResourceStatus::Ready {
                report.blocked.push(id.clone());
                continue;
            }
            if rec.power.unwrap_or(PowerState::Running) == target {
                debug!(resource = %id, power = %target, "Already in requested power state");
                continue;
            }
            let entry = (id.clone(), Handle::for_spec(&rec.spec));
            match vm.role {
                NodeRole::Controller => controllers.push(entry),
                NodeRole::Compute => compute.push(entry),
            }
        }
        let waves = match target {
            PowerState::Running => [controllers, compute],
            PowerState::Stopped => [compute, controllers],
        };

        let writer = Arc::new(StateWriter::new(self.store.clone(), record));
        for wave in waves {
            if wave.is_empty() {
                continue;
            }
            if self.is_cancelled() {
                report.cancelled = true;
                report.blocked.extend(wave.into_iter().map(|(id, _)| id));
                continue;
            }
            let results: Vec<(ResourceId, Result<(), ControlError>)> = stream::iter(wave)
                .map(|(id, handle)| async move {
                    let result = self.power_call(&id, &handle, target).await;
                    (id, result)
                })
                .buffer_unordered(self.config.max_parallel.max(1))
                .collect()
                .await;

            for (id, result) in results {
                match result {
                    Ok(()) => {
                        writer
                            .commit(|r| {
                                if let Some(rec) = r.resources.get_mut(&id) {
                                    rec.power = Some(target);
                                }
                            })
                            .await?;
                        report.performed.push(PerformedAction {
                            id,
                            action: operation.to_string(),
                        });
                    }
                    Err(e) => {
                        error!(resource = %id, error = %e, "Power change failed");
                        report.failed.push(FailedResource {
                            id,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        let snapshot = writer.snapshot().await;
        report.ready = snapshot.count_by_status().get(&ResourceStatus::Ready).copied().unwrap_or(0);
        info!(
            cluster = %cluster,
            operation = %operation,
            changed = report.performed.len(),
            failed = report.failed.len(),
            "Power change finished"
        );
        Ok(report)
    }

    async fn power_call(&self, id: &ResourceId, handle: &Handle, target: PowerState) -> Result<(), ControlError> {
        let control = &self.control;
        let timeout = self.config.call_timeout;
        let label = format!("{} {}", target, id);
        let attempted = retry_transient(&self.config.retry, &label, &self.cancel, move |_| {
            let call = async move {
                match target {
                    PowerState::Running => control.start(handle).await,
                    PowerState::Stopped => control.stop(handle).await,
                }
            };
            with_timeout(timeout, call)
        })
        .await;
        match attempted.result {
            Err(ControlError::AlreadyExists(_)) if target == PowerState::Running => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_cluster_config, ClusterSpec, DocumentFormat};
    use crate::control::memory::{names_of, OpKind};
    use crate::control::MemoryControlPlane;
    use crate::planner::graph::expand_in;
    use crate::planner::PassthroughAllocation;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    const CLUSTER: &str = r#"
version: "1"
name: lab
image: /img/base.qcow2
storage: {backend: qcow2}
networks: [{name: mgmt, subnet: 10.0.0.0/24}]
nodes:
  - {name: head, role: controller, vcpus: 2, memory_mb: 2048, disk_gb: 20}
  - {name: compute, role: compute, count: 2, vcpus: 4, memory_mb: 4096, disk_gb: 40}
"#;

    fn spec() -> ClusterSpec {
        parse_cluster_config(CLUSTER, DocumentFormat::Yaml).unwrap()
    }

    fn graph(allocs: &[PassthroughAllocation]) -> DesiredStateGraph {
        expand_in(&spec(), allocs, Path::new("/pools"))
    }

    /// Same cluster with different vCPU counts for the controller and compute nodes
    fn resized(head_vcpus: u32, compute_vcpus: u32) -> DesiredStateGraph {
        let doc = CLUSTER
            .replace("vcpus: 4", &format!("vcpus: {}", compute_vcpus))
            .replace("vcpus: 2", &format!("vcpus: {}", head_vcpus));
        let spec = parse_cluster_config(&doc, DocumentFormat::Yaml).unwrap();
        expand_in(&spec, &[], Path::new("/pools"))
    }

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            max_parallel: 4,
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(3),
        }
    }

    fn reconciler(cp: &Arc<MemoryControlPlane>, dir: &TempDir) -> Reconciler {
        Reconciler::new(cp.clone(), StateStore::new(dir.path()), config())
    }

    #[tokio::test]
    async fn test_create_then_noop() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let r = reconciler(&cp, &dir);
        let g = graph(&[]);

        let report = r.create(&g).await.unwrap();
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.ready, g.len());
        assert!(cp.is_running("lab-head"));

        cp.clear_ops();
        let again = r.create(&g).await.unwrap();
        assert!(again.performed.is_empty());
        assert_eq!(cp.op_count(), 0);
    }

    #[tokio::test]
    async fn test_dependencies_defined_first() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        reconciler(&cp, &dir).create(&graph(&[])).await.unwrap();

        let defined = names_of(&cp.ops(), OpKind::Define);
        let pos = |name: &str| defined.iter().position(|n| n == name).unwrap();
        assert!(pos("lab") < pos("lab-head.qcow2"));
        assert!(pos("lab-mgmt") < pos("lab-head"));
        assert!(pos("lab-head.qcow2") < pos("lab-head"));
        assert!(pos("lab-head") < pos("lab-compute-01"));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        cp.fail(OpKind::Define, "lab-mgmt", ControlError::Transient("busy".into()), 2);

        let report = reconciler(&cp, &dir).create(&graph(&[])).await.unwrap();
        assert!(report.is_success());
        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        assert_eq!(record.resources[&ResourceId::network("mgmt")].attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_blocks_dependents() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        cp.fail(OpKind::Define, "lab-head.qcow2", ControlError::Permanent("disk full".into()), 1);

        let report = reconciler(&cp, &dir).create(&graph(&[])).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.blocked.contains(&ResourceId::vm("head")));
        assert!(report.blocked.contains(&ResourceId::vm("compute-01")));
        assert!(cp.is_live("lab-compute-01.qcow2"));

        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        let failed = &record.resources[&ResourceId::volume("head")];
        assert_eq!(failed.status, ResourceStatus::Failed);
        assert!(failed.last_error.as_deref().unwrap().contains("disk full"));
        assert_eq!(record.status_of(&ResourceId::vm("head")), Some(ResourceStatus::Pending));
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let r = reconciler(&cp, &dir);
        r.create(&graph(&[])).await.unwrap();
        cp.clear_ops();

        let report = r.destroy("lab").await.unwrap();
        assert!(report.is_success());
        assert!(cp.live_names().is_empty());
        assert!(StateStore::new(dir.path()).load("lab").unwrap().is_none());

        let destroyed = names_of(&cp.ops(), OpKind::Destroy);
        let pos = |name: &str| destroyed.iter().position(|n| n == name).unwrap();
        assert!(pos("lab-compute-01") < pos("lab-head"));
        assert!(pos("lab-head") < pos("lab-mgmt"));
        assert!(pos("lab-head.qcow2") < pos("lab"));

        let again = r.destroy("lab").await.unwrap();
        assert!(again.performed.is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_start_only_touch_vms() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let r = reconciler(&cp, &dir);
        r.create(&graph(&[])).await.unwrap();
        cp.clear_ops();

        let stopped = r.stop("lab").await.unwrap();
        assert_eq!(stopped.performed.len(), 3);
        assert!(!cp.is_running("lab-head"));
        let order = names_of(&cp.ops(), OpKind::Stop);
        assert_eq!(order.last().map(String::as_str), Some("lab-head"));

        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        assert!(record.vms().all(|(_, rec, _)| rec.power == Some(PowerState::Stopped)));

        r.start("lab").await.unwrap();
        assert!(cp.is_running("lab-compute-02"));
        assert_eq!(
            names_of(&cp.ops(), OpKind::Start).first().map(String::as_str),
            Some("lab-head")
        );
        assert!(names_of(&cp.ops(), OpKind::Define).is_empty());
    }

    #[tokio::test]
    async fn test_start_without_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let err = reconciler(&cp, &dir).start("lab").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotProvisioned(_)));
    }

    #[tokio::test]
    async fn test_host_bound_device_sends_vm_back_to_pending() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let gpu: PciAddress = "0000:02:00.0".parse().unwrap();
        let alloc = PassthroughAllocation {
            node: "compute-01".to_string(),
            iommu_group: 14,
            primary: gpu,
            vendor: 0x10de,
            device: 0x2204,
            functions: vec![gpu],
        };
        cp.set_binding(gpu, Some("nvidia"));

        let report = reconciler(&cp, &dir).create(&graph(&[alloc])).await.unwrap();
        assert_eq!(report.device_conflicts.len(), 1);
        assert_eq!(report.device_conflicts[0].driver.as_deref(), Some("nvidia"));
        assert!(!cp.is_live("lab-compute-01"));
        assert!(cp.is_live("lab-compute-02"));

        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        assert_eq!(
            record.status_of(&ResourceId::vm("compute-01")),
            Some(ResourceStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_unrecorded_live_object_is_not_adopted() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        cp.insert_live(Handle::new(ResourceKind::Vm, "lab-compute-02"));

        let report = reconciler(&cp, &dir).create(&graph(&[])).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, ResourceId::vm("compute-02"));
        assert!(!names_of(&cp.ops(), OpKind::Define).contains(&"lab-compute-02".to_string()));
        assert!(!names_of(&cp.ops(), OpKind::Destroy).contains(&"lab-compute-02".to_string()));
    }

    /// Flips the cancel signal as soon as a given call on a given object returns
    struct CancelAfter {
        inner: Arc<MemoryControlPlane>,
        kind: OpKind,
        name: String,
        tx: watch::Sender<bool>,
    }

    impl CancelAfter {
        fn trip(&self, kind: OpKind, name: &str) {
            if kind == self.kind && name == self.name {
                let _ = self.tx.send(true);
            }
        }
    }

    #[async_trait]
    impl ControlPlane for CancelAfter {
        async fn define(&self, spec: &crate::planner::ResourceSpec) -> Result<Handle, ControlError> {
            let out = self.inner.define(spec).await;
            self.trip(OpKind::Define, spec.live_name());
            out
        }
        async fn start(&self, handle: &Handle) -> Result<(), ControlError> {
            self.inner.start(handle).await
        }
        async fn stop(&self, handle: &Handle) -> Result<(), ControlError> {
            self.inner.stop(handle).await
        }
        async fn destroy(&self, handle: &Handle) -> Result<(), ControlError> {
            let out = self.inner.destroy(handle).await;
            self.trip(OpKind::Destroy, &handle.name);
            out
        }
        async fn list(&self) -> Result<Vec<Handle>, ControlError> {
            self.inner.list().await
        }
        async fn device_binding(&self, address: PciAddress) -> Result<Option<String>, ControlError> {
            self.inner.device_binding(address).await
        }
    }

    #[tokio::test]
    async fn test_cancel_tears_down_this_runs_resources() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(MemoryControlPlane::new());
        let (tx, rx) = watch::channel(false);
        let cp = Arc::new(CancelAfter {
            inner: inner.clone(),
            kind: OpKind::Define,
            name: "lab-mgmt".to_string(),
            tx,
        });
        let mut cfg = config();
        cfg.max_parallel = 1;
        let r = Reconciler::new(cp, StateStore::new(dir.path()), cfg).with_cancel(rx);

        let report = r.create(&graph(&[])).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.rolled_back, vec![ResourceId::network("mgmt")]);
        assert!(inner.live_names().is_empty());
        assert!(!report.blocked.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_replacement_keeps_live_records() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(MemoryControlPlane::new());
        reconciler(&inner, &dir).create(&graph(&[])).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let cp = Arc::new(CancelAfter {
            inner: inner.clone(),
            kind: OpKind::Destroy,
            name: "lab-compute-01".to_string(),
            tx,
        });
        let mut cfg = config();
        cfg.max_parallel = 1;
        let r = Reconciler::new(cp, StateStore::new(dir.path()), cfg).with_cancel(rx);

        let report = r.create(&resized(2, 8)).await.unwrap();
        assert!(report.cancelled);
        assert!(report.blocked.contains(&ResourceId::vm("compute-02")));

        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        assert_eq!(
            record.status_of(&ResourceId::vm("compute-02")),
            Some(ResourceStatus::Ready)
        );
        assert!(inner.is_live("lab-compute-02"));
        assert_eq!(
            record.status_of(&ResourceId::vm("compute-01")),
            Some(ResourceStatus::Pending)
        );
        assert!(!inner.is_live("lab-compute-01"));

        inner.clear_ops();
        let destroyed = reconciler(&inner, &dir).destroy("lab").await.unwrap();
        assert!(destroyed.is_success());
        assert!(names_of(&inner.ops(), OpKind::Destroy).contains(&"lab-compute-02".to_string()));
        assert!(inner.live_names().is_empty());
        assert!(StateStore::new(dir.path()).load("lab").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_after_cancelled_replacement_converges() {
        let dir = TempDir::new().unwrap();
        let inner = Arc::new(MemoryControlPlane::new());
        reconciler(&inner, &dir).create(&graph(&[])).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let cp = Arc::new(CancelAfter {
            inner: inner.clone(),
            kind: OpKind::Destroy,
            name: "lab-compute-01".to_string(),
            tx,
        });
        let mut cfg = config();
        cfg.max_parallel = 1;
        let target = resized(2, 8);
        Reconciler::new(cp, StateStore::new(dir.path()), cfg)
            .with_cancel(rx)
            .create(&target)
            .await
            .unwrap();

        let report = reconciler(&inner, &dir).create(&target).await.unwrap();
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.ready, target.len());
        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        for node in ["compute-01", "compute-02"] {
            let rec = &record.resources[&ResourceId::vm(node)];
            assert_eq!(rec.fingerprint, target.get(&ResourceId::vm(node)).unwrap().fingerprint);
        }
    }

    #[tokio::test]
    async fn test_failed_dependent_does_not_stall_controller_replacement() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        let r = reconciler(&cp, &dir);
        cp.fail(OpKind::Define, "lab-compute-01", ControlError::Permanent("bad image".into()), 1);
        let first = r.create(&graph(&[])).await.unwrap();
        assert_eq!(first.failed.len(), 1);
        assert!(!cp.is_live("lab-compute-01"));

        cp.clear_ops();
        let report = r.create(&resized(4, 4)).await.unwrap();
        assert!(report.is_success(), "{:?}", report);
        for vm in ["lab-head", "lab-compute-01", "lab-compute-02"] {
            assert!(cp.is_running(vm), "{} not running", vm);
        }

        let destroyed = names_of(&cp.ops(), OpKind::Destroy);
        assert!(destroyed.contains(&"lab-head".to_string()));
        assert!(!destroyed.contains(&"lab-compute-01".to_string()));
        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        assert!(record.all_ready());
    }

    #[tokio::test]
    async fn test_requeued_failure_keeps_last_error() {
        let dir = TempDir::new().unwrap();
        let cp = Arc::new(MemoryControlPlane::new());
        cp.fail(OpKind::Define, "lab-compute-01", ControlError::Permanent("bad image".into()), 1);
        reconciler(&cp, &dir).create(&graph(&[])).await.unwrap();

        // Cancelled before any claim: the failed VM is only re-queued
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = reconciler(&cp, &dir).with_cancel(rx).create(&graph(&[])).await.unwrap();
        assert!(report.cancelled);

        let record = StateStore::new(dir.path()).load("lab").unwrap().unwrap();
        let rec = &record.resources[&ResourceId::vm("compute-01")];
        assert_eq!(rec.status, ResourceStatus::Pending);
        assert!(rec.last_error.as_deref().unwrap().contains("bad image"));
        assert_eq!(rec.attempts, 1);
        assert!(rec.timestamps.failed_at.is_some());
    }
}
