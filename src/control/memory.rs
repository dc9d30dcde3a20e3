//! In-process control plane
//!
//! Keeps live objects in memory and records every call, so ordering,
//! idempotence and failure handling can be observed without a hypervisor.
//! Failures can be injected per operation and object name.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AddressResolver, ControlError, ControlPlane, Handle};
use crate::devices::PciAddress;
use crate::planner::graph::{ResourceKind, ResourceSpec, VmDefinition};

/// Driver reported for functions nobody registered
const DEFAULT_BINDING: &str = "vfio-pci";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Define,
    Start,
    Stop,
    Destroy,
}

/// One recorded control-plane call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub name: String,
}

#[derive(Debug, Clone)]
struct LiveObject {
    spec: Option<ResourceSpec>,
    running: bool,
}

#[derive(Debug)]
struct Injected {
    error: ControlError,
    remaining: usize,
}

#[derive(Default)]
pub struct MemoryControlPlane {
    objects: DashMap<Handle, LiveObject>,
    bindings: DashMap<PciAddress, Option<String>>,
    failures: DashMap<(OpKind, String), Injected>,
    unreachable: DashMap<String, ()>,
    ops: Mutex<Vec<Op>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_delay: Option<Duration>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call take `delay`
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    /// Fail the next `times` calls of `kind` on object `name`
    pub fn fail(&self, kind: OpKind, name: &str, error: ControlError, times: usize) {
        self.failures.insert(
            (kind, name.to_string()),
            Injected {
                error,
                remaining: times,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Report `driver` for a PCI function
    pub fn set_binding(&self, address: PciAddress, driver: Option<&str>) {
        self.bindings.insert(address, driver.map(String::from));
    }

    /// Make a VM never answer address probes
    pub fn set_unreachable(&self, vm_name: &str) {
        self.unreachable.insert(vm_name.to_string(), ());
    }

    /// Create a live object behind the reconciler's back
    pub fn insert_live(&self, handle: Handle) {
        self.objects.insert(
            handle,
            LiveObject {
                spec: None,
                running: false,
            },
        );
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    pub fn clear_ops(&self) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.clear();
        }
    }

    pub fn op_count(&self) -> usize {
        self.ops.lock().map(|ops| ops.len()).unwrap_or_default()
    }

    /// Live object names, sorted
    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.iter().map(|e| e.key().name.clone()).collect();
        names.sort();
        names
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.objects.iter().any(|e| e.key().name == name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.objects
            .iter()
            .any(|e| e.key().name == name && e.value().running)
    }

    /// PCI functions attached to running or defined VMs, with their VM name
    pub fn attached_devices(&self) -> Vec<(PciAddress, String)> {
        let mut out = Vec::new();
        for entry in self.objects.iter() {
            if let Some(ResourceSpec::Vm(vm)) = &entry.value().spec {
                for alloc in &vm.passthrough {
                    for f in &alloc.functions {
                        out.push((*f, vm.name.clone()));
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Largest number of calls that were in progress at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, kind: OpKind, name: &str) -> Result<(), ControlError> {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(Op {
                kind,
                name: name.to_string(),
            });
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = (kind, name.to_string());
        let injected = match self.failures.get_mut(&key) {
            Some(mut entry) if entry.remaining > 0 => {
                entry.remaining -= 1;
                Some(entry.error.clone())
            }
            _ => None,
        };
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn find(&self, name: &str, kind: ResourceKind) -> Option<Handle> {
        self.objects
            .iter()
            .find(|e| e.key().name == name && e.key().kind == kind)
            .map(|e| e.key().clone())
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn define(&self, spec: &ResourceSpec) -> Result<Handle, ControlError> {
        let handle = Handle::for_spec(spec);
        self.enter(OpKind::Define, &handle.name).await?;
        if self.objects.contains_key(&handle) {
            return Err(ControlError::AlreadyExists(handle.to_string()));
        }
        // Non-domain objects come up active
        let running = spec.kind() != ResourceKind::Vm;
        self.objects.insert(
            handle.clone(),
            LiveObject {
                spec: Some(spec.clone()),
                running,
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &Handle) -> Result<(), ControlError> {
        self.enter(OpKind::Start, &handle.name).await?;
        let mut entry = self
            .objects
            .get_mut(handle)
            .ok_or_else(|| ControlError::NotFound(handle.to_string()))?;
        entry.running = true;
        Ok(())
    }

    async fn stop(&self, handle: &Handle) -> Result<(), ControlError> {
        self.enter(OpKind::Stop, &handle.name).await?;
        let mut entry = self
            .objects
            .get_mut(handle)
            .ok_or_else(|| ControlError::NotFound(handle.to_string()))?;
        entry.running = false;
        Ok(())
    }

    async fn destroy(&self, handle: &Handle) -> Result<(), ControlError> {
        self.enter(OpKind::Destroy, &handle.name).await?;
        self.objects
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| ControlError::NotFound(handle.to_string()))
    }

    async fn list(&self) -> Result<Vec<Handle>, ControlError> {
        let mut handles: Vec<Handle> = self.objects.iter().map(|e| e.key().clone()).collect();
        handles.sort();
        Ok(handles)
    }

    async fn device_binding(&self, address: PciAddress) -> Result<Option<String>, ControlError> {
        Ok(match self.bindings.get(&address) {
            Some(driver) => driver.clone(),
            None => Some(DEFAULT_BINDING.to_string()),
        })
    }
}

#[async_trait]
impl AddressResolver for MemoryControlPlane {
    async fn resolve(&self, vm: &VmDefinition) -> Result<Option<Ipv4Addr>, ControlError> {
        if self.unreachable.contains_key(&vm.name) {
            return Ok(None);
        }
        match self.find(&vm.name, ResourceKind::Vm) {
            Some(handle) if self.objects.get(&handle).is_some_and(|o| o.running) => {
                Ok(vm.primary_ip())
            }
            _ => Ok(None),
        }
    }
}

/// Names that appear in `ops` for `kind`, in call order
pub fn names_of(ops: &[Op], kind: OpKind) -> Vec<String> {
    ops.iter()
        .filter(|op| op.kind == kind)
        .map(|op| op.name.clone())
        .collect()
}

/// Distinct object names touched by any call
pub fn touched(ops: &[Op]) -> HashSet<String> {
    ops.iter().map(|op| op.name.clone()).collect()
}
