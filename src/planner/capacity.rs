//! Host capacity check
//!
//! Compares what a cluster asks for against what the hypervisor host has.
//! Only warns: overcommitting vCPUs is common and the control plane is the
//! final judge of memory.

use sysinfo::System;

use crate::config::ClusterSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapacity {
    pub hostname: String,
    pub cpus: usize,
    pub memory_mb: u64,
}

impl HostCapacity {
    /// Read logical CPU count and total memory from the running host
    pub fn from_system() -> Self {
        let mut system = System::new_all();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            cpus: system.cpus().len(),
            memory_mb: system.total_memory() / (1024 * 1024),
        }
    }
}

/// Human-readable warnings for requests that exceed host capacity
pub fn check_host_capacity(spec: &ClusterSpec, capacity: &HostCapacity) -> Vec<String> {
    let vcpus: u64 = spec.nodes.iter().map(|n| u64::from(n.resources.vcpus)).sum();
    let memory_mb: u64 = spec.nodes.iter().map(|n| n.resources.memory_mb).sum();
    let mut warnings = Vec::new();

    if capacity.cpus > 0 && vcpus > capacity.cpus as u64 {
        warnings.push(format!(
            "cluster requests {} vCPUs, host has {} logical CPUs (overcommitted)",
            vcpus, capacity.cpus
        ));
    }
    if capacity.memory_mb > 0 && memory_mb > capacity.memory_mb {
        warnings.push(format!(
            "cluster requests {} MiB of memory, host has {} MiB",
            memory_mb, capacity.memory_mb
        ));
    }
    for node in &spec.nodes {
        if capacity.cpus > 0 && node.resources.vcpus as usize > capacity.cpus {
            warnings.push(format!(
                "{} requests {} vCPUs, more than the host's {} CPUs",
                node.name, node.resources.vcpus, capacity.cpus
            ));
        }
    }
    warnings
}
