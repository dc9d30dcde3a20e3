//! Entry points tying planning, reconciliation and inventory together
//!
//! Validation and planning always finish before anything is mutated. A device
//! found host-bound right before a VM is created sends the cluster back through
//! probing and planning, at most [`MAX_REPLANS`] times.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{load_cluster_file, ClusterSpec, ConfigError};
use crate::control::{AddressResolver, ControlPlane};
use crate::devices::{DeviceProbe, HostDevice, ProbeError};
use crate::inventory::{self, InventoryRecord};
use crate::planner::{
    check_host_capacity, expand_in, plan, DesiredStateGraph, DeviceClaims, HostCapacity,
    PassthroughAllocation, PlanError,
};
use crate::reconciler::{ActionPlan, ReconcileError, ReconcileReport, Reconciler};
use crate::settings::Settings;
use crate::state::{LifecycleRecord, StateError, StateStore, StateWriter};

/// Re-plans allowed after device conflicts before giving up
pub const MAX_REPLANS: usize = 2;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl OrchestratorError {
    /// The lifecycle record on disk cannot be trusted
    pub fn is_corrupt_state(&self) -> bool {
        match self {
            OrchestratorError::State(e) => e.is_corrupt(),
            OrchestratorError::Reconcile(ReconcileError::State(e)) => e.is_corrupt(),
            _ => false,
        }
    }
}

/// Result of planning a cluster
#[derive(Debug, Clone)]
pub struct Planned {
    pub allocations: Vec<PassthroughAllocation>,
    pub graph: DesiredStateGraph,
    /// Host capacity warnings
    pub warnings: Vec<String>,
}

pub struct Orchestrator {
    settings: Settings,
    store: StateStore,
    control: Arc<dyn ControlPlane>,
    resolver: Arc<dyn AddressResolver>,
    prober: Arc<dyn DeviceProbe>,
    capacity: Option<HostCapacity>,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        control: Arc<dyn ControlPlane>,
        resolver: Arc<dyn AddressResolver>,
        prober: Arc<dyn DeviceProbe>,
    ) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            store: StateStore::new(settings.state_dir()),
            settings,
            control,
            resolver,
            prober,
            capacity: None,
            cancel,
        }
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Compare cluster requests against this host when planning
    pub fn with_capacity(mut self, capacity: HostCapacity) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.control),
            self.store.clone(),
            self.settings.reconciler_config(),
        )
        .with_cancel(self.cancel.clone())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Load and validate a cluster document
    pub fn validate(&self, path: &Path) -> Result<ClusterSpec, OrchestratorError> {
        Ok(load_cluster_file(path)?)
    }

    /// Host device snapshot
    pub fn devices(&self) -> Result<Vec<HostDevice>, OrchestratorError> {
        Ok(self.prober.probe()?)
    }

    /// Allocate GPUs and expand the cluster into its desired-state graph.
    ///
    /// The host is probed only when some node asks for GPUs.
    pub fn plan(&self, spec: &ClusterSpec) -> Result<Planned, OrchestratorError> {
        // A corrupt record of this cluster is reported as such, not as a claims problem
        self.store.load(&spec.name)?;

        let requests = spec.gpu_requests();
        let allocations = if requests.iter().any(|r| r.count > 0) {
            let inventory = self.prober.probe()?;
            let records = self
                .store
                .load_all()
                .map_err(|e| PlanError::Claims(e.to_string()))?;
            let claims = DeviceClaims::from_records(&spec.name, &records);
            debug!(devices = inventory.len(), claims = claims.len(), "Planning passthrough");
            plan(&requests, &inventory, &claims)?
        } else {
            Vec::new()
        };

        let graph = expand_in(spec, &allocations, &self.settings.pool_root());
        let warnings = match &self.capacity {
            Some(capacity) => check_host_capacity(spec, capacity),
            None => Vec::new(),
        };
        info!(
            cluster = %spec.name,
            resources = graph.len(),
            gpus = allocations.len(),
            "Cluster planned"
        );
        Ok(Planned {
            allocations,
            graph,
            warnings,
        })
    }

    /// What `create` would change right now
    pub async fn preview(&self, planned: &Planned) -> Result<ActionPlan, OrchestratorError> {
        Ok(self.reconciler().preview(&planned.graph).await?)
    }

    pub async fn create(&self, spec: &ClusterSpec) -> Result<ReconcileReport, OrchestratorError> {
        let mut replans = 0;
        loop {
            let planned = self.plan(spec)?;
            for warning in &planned.warnings {
                warn!(cluster = %spec.name, "{}", warning);
            }

            let report = self.reconciler().create(&planned.graph).await?;
            let Some(conflict) = report.device_conflicts.first().cloned() else {
                return Ok(report);
            };
            if report.cancelled || self.is_cancelled() {
                return Ok(report);
            }
            if replans >= MAX_REPLANS {
                return Err(PlanError::AllocationConflict {
                    node: conflict.node,
                    address: conflict.address,
                    driver: conflict.driver.unwrap_or_else(|| "no driver".to_string()),
                }
                .into());
            }
            replans += 1;
            warn!(
                cluster = %spec.name,
                conflict = %conflict,
                replan = replans,
                "Device taken by the host, re-planning"
            );
        }
    }

    pub async fn destroy(&self, cluster: &str) -> Result<ReconcileReport, OrchestratorError> {
        Ok(self.reconciler().destroy(cluster).await?)
    }

    pub async fn start(&self, cluster: &str) -> Result<ReconcileReport, OrchestratorError> {
        Ok(self.reconciler().start(cluster).await?)
    }

    pub async fn stop(&self, cluster: &str) -> Result<ReconcileReport, OrchestratorError> {
        Ok(self.reconciler().stop(cluster).await?)
    }

    /// Records for one cluster, or for every cluster when `cluster` is `None`
    pub fn status(&self, cluster: Option<&str>) -> Result<Vec<LifecycleRecord>, OrchestratorError> {
        match cluster {
            Some(name) => Ok(self.store.load(name)?.into_iter().collect()),
            None => Ok(self.store.load_all()?),
        }
    }

    /// Resolve node addresses and write them back into the record
    pub async fn inventory(&self, cluster: &str) -> Result<InventoryRecord, OrchestratorError> {
        let record = self
            .store
            .load(cluster)?
            .ok_or_else(|| ReconcileError::NotProvisioned(cluster.to_string()))?;

        let inv = inventory::emit(
            &record,
            self.resolver.as_ref(),
            &self.settings.inventory_settings(),
        )
        .await;

        let addresses = inv.addresses();
        if !addresses.is_empty() {
            let writer = StateWriter::new(self.store.clone(), record);
            writer
                .commit(|r| {
                    for (id, address) in &addresses {
                        if let Some(rec) = r.resources.get_mut(id) {
                            rec.address = Some(*address);
                        }
                    }
                })
                .await?;
        }
        Ok(inv)
    }
}
