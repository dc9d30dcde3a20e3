//! vmforge: provision GPU passthrough VM clusters on a single libvirt host
//!
//! A cluster document is validated, its GPU requests are matched to whole IOMMU
//! groups, and the result is expanded into a graph of networks, pools, volumes and
//! VMs. The reconciler converges the host towards that graph, recording every step
//! in a durable lifecycle record so interrupted runs resume where they stopped.

pub mod cli;
pub mod config;
pub mod control;
pub mod devices;
pub mod inventory;
pub mod orchestrator;
pub mod planner;
pub mod reconciler;
pub mod settings;
pub mod state;
