//! Inventory output formats
//!
//! JSON and YAML carry the full record, every node included. INI is an Ansible
//! inventory: only reachable nodes appear, in an `[all]` section with inline
//! host variables followed by the role groups.

use std::fmt::Write;

use super::{InventoryRecord, NodeOutcome};
use crate::config::NodeRole;

pub fn to_json(record: &InventoryRecord) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(record)
}

pub fn to_yaml(record: &InventoryRecord) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(record)
}

/// Ansible group names may not contain dashes
pub fn group_prefix(cluster: &str) -> String {
    cluster.replace('-', "_")
}

pub fn to_ini(record: &InventoryRecord, ssh_user: &str) -> String {
    let prefix = group_prefix(&record.cluster);
    let reachable: Vec<_> = record.with_outcome(NodeOutcome::Reachable).collect();

    let mut out = String::new();
    let _ = writeln!(out, "[all]");
    for (name, node) in &reachable {
        let host = node.address.map(|a| a.to_string()).unwrap_or_default();
        let _ = writeln!(
            out,
            "{} ansible_host={} ansible_user={} node_role={} gpu_count={}",
            name, host, ssh_user, node.role, node.facts.gpu_count
        );
    }
    let _ = writeln!(out);

    let groups = [
        (
            format!("{}_controllers", prefix),
            reachable
                .iter()
                .filter(|(_, n)| n.role == NodeRole::Controller)
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>(),
        ),
        (
            format!("{}_compute", prefix),
            reachable
                .iter()
                .filter(|(_, n)| n.role == NodeRole::Compute)
                .map(|(name, _)| name.as_str())
                .collect(),
        ),
        (
            format!("{}_gpu_nodes", prefix),
            reachable
                .iter()
                .filter(|(_, n)| n.facts.gpu_count > 0)
                .map(|(name, _)| name.as_str())
                .collect(),
        ),
    ];

    for (group, hosts) in &groups {
        let _ = writeln!(out, "[{}]", group);
        for host in hosts {
            let _ = writeln!(out, "{}", host);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "[{}:children]", prefix);
    for (group, _) in &groups {
        let _ = writeln!(out, "{}", group);
    }
    out
}
