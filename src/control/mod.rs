//! Virtualization control plane interface
//!
//! The reconciler talks to the hypervisor only through [`ControlPlane`]; the
//! inventory emitter only through [`AddressResolver`]. Two implementations
//! exist: [`virsh::VirshControlPlane`] for libvirt hosts and
//! [`memory::MemoryControlPlane`] for dry runs and tests.

pub mod memory;
pub mod virsh;
pub mod xml;

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::PciAddress;
use crate::planner::graph::{ResourceKind, ResourceSpec, VmDefinition};

pub use memory::MemoryControlPlane;
pub use virsh::{VirshAddressResolver, VirshControlPlane};

/// Reference to a live object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    pub kind: ResourceKind,
    pub name: String,
    /// Containing pool, for volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Handle {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent: None,
        }
    }

    /// Handle the control plane uses for a resource definition
    pub fn for_spec(spec: &ResourceSpec) -> Self {
        match spec {
            ResourceSpec::Volume(v) => Self {
                kind: ResourceKind::Volume,
                name: v.name.clone(),
                parent: Some(v.pool.clone()),
            },
            other => Self::new(other.kind(), other.live_name()),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{} {}/{}", self.kind, parent, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("transient control-plane failure: {0}")]
    Transient(String),

    #[error("control-plane failure: {0}")]
    Permanent(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("control-plane call timed out after {0:?}")]
    Timeout(Duration),
}

impl ControlError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::Transient(_) | ControlError::Timeout(_))
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create the object described by `spec`. Networks, pools and volumes come
    /// back active; domains come back defined but shut off.
    async fn define(&self, spec: &ResourceSpec) -> Result<Handle, ControlError>;

    async fn start(&self, handle: &Handle) -> Result<(), ControlError>;

    /// Graceful shutdown of a domain
    async fn stop(&self, handle: &Handle) -> Result<(), ControlError>;

    /// Remove the object entirely, stopping it first if needed
    async fn destroy(&self, handle: &Handle) -> Result<(), ControlError>;

    /// Every live object this control plane knows about
    async fn list(&self) -> Result<Vec<Handle>, ControlError>;

    /// Driver currently bound to a PCI function, `None` if unbound
    async fn device_binding(&self, address: PciAddress) -> Result<Option<String>, ControlError>;
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// An address at which the VM answers right now, if any
    async fn resolve(&self, vm: &VmDefinition) -> Result<Option<Ipv4Addr>, ControlError>;
}

/// Run one control-plane call under a deadline.
///
/// The call's future is dropped on expiry; backends must not rely on drop to
/// abort work already handed to the hypervisor.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ControlError>
where
    F: std::future::Future<Output = Result<T, ControlError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ControlError::Timeout(limit)),
    }
}
