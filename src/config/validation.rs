//! Cluster spec validation
//!
//! A single pass over a [`RawClusterConfig`] that either produces a typed
//! [`ClusterSpec`] or the complete list of everything wrong with the document.
//! Side-effect-free: no filesystem or host access happens here.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::schema::{
    ClusterSpec, GpuSpec, Ipv4Cidr, NetworkSpec, NodeResources, NodeRole, NodeSpec,
    RawClusterConfig, RawNode, StorageBackend, StorageSpec, SUPPORTED_VERSIONS,
};

/// Longest interface name the kernel accepts
const MAX_BRIDGE_LEN: usize = 15;

/// Offset inside the subnet where node addresses start (gateway is .1)
pub const FIRST_NODE_HOST: u32 = 10;

static CLUSTER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,30}$").unwrap());

static NODE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,47}$").unwrap());

static VENDOR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(0x)?[0-9a-fA-F]{4}$").unwrap());

/// One violation, addressed by its path in the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in a document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError::new(field, message));
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter()
    }

    /// True if any violation is reported against `field`
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n  - {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ============================================================================
// SBIO: Pure validation logic (no I/O)
// ============================================================================

/// Validate a raw document into a typed spec, reporting all violations at once.
pub fn validate(raw: &RawClusterConfig) -> Result<ClusterSpec, ValidationErrors> {
    let mut errs = ValidationErrors::default();

    let version = match raw.version.as_deref() {
        None => {
            errs.push("version", "missing schema version");
            None
        }
        Some(v) if !SUPPORTED_VERSIONS.contains(&v) => {
            errs.push(
                "version",
                format!(
                    "unsupported schema version '{}', supported: {}",
                    v,
                    SUPPORTED_VERSIONS.join(", ")
                ),
            );
            None
        }
        Some(v) => Some(v.to_string()),
    };

    let name = match raw.name.as_deref() {
        None => {
            errs.push("name", "missing cluster name");
            None
        }
        Some(n) if !CLUSTER_NAME.is_match(n) => {
            errs.push(
                "name",
                format!(
                    "'{}' must be 1-31 lowercase letters, digits or '-' and start with a letter or digit",
                    n
                ),
            );
            None
        }
        Some(n) => Some(n.to_string()),
    };

    let image = match raw.image.as_deref() {
        None | Some("") => {
            errs.push("image", "missing template image");
            None
        }
        Some(i) => Some(PathBuf::from(i)),
    };

    let storage = validate_storage(raw, &mut errs);
    let networks = validate_networks(raw, name.as_deref(), &mut errs);
    let network_names: Vec<String> = raw
        .networks
        .iter()
        .filter_map(|n| n.name.clone())
        .collect();
    let nodes = validate_nodes(&raw.nodes, &network_names, &mut errs);

    // Address capacity: every node needs a host address from FIRST_NODE_HOST upward
    for (i, net) in networks.iter().enumerate() {
        let attached = nodes
            .iter()
            .filter(|n| n.networks.contains(&net.name))
            .count() as u32;
        if attached > 0 && net.subnet.host(FIRST_NODE_HOST + attached - 1).is_none() {
            errs.push(
                format!("networks[{}].subnet", i),
                format!(
                    "{} has no room for {} node address(es) starting at .{}",
                    net.subnet, attached, FIRST_NODE_HOST
                ),
            );
        }
    }

    if !errs.is_empty() {
        return Err(errs);
    }

    match (version, name, image, storage) {
        (Some(version), Some(name), Some(image), Some(storage)) => Ok(ClusterSpec {
            name,
            version,
            image,
            storage,
            networks,
            nodes,
        }),
        // Every None above pushed an error, so this arm is unreachable in practice
        _ => Err(errs),
    }
}

fn validate_storage(raw: &RawClusterConfig, errs: &mut ValidationErrors) -> Option<StorageSpec> {
    let Some(storage) = &raw.storage else {
        errs.push("storage", "missing storage section");
        return None;
    };
    let backend = match storage.backend.as_deref() {
        None => {
            errs.push("storage.backend", "missing storage backend");
            None
        }
        Some(b) => match b.parse::<StorageBackend>() {
            Ok(backend) => Some(backend),
            Err(msg) => {
                errs.push("storage.backend", msg);
                None
            }
        },
    };
    backend.map(|backend| StorageSpec {
        backend,
        pool_path: storage.pool_path.as_ref().map(PathBuf::from),
    })
}

fn validate_networks(
    raw: &RawClusterConfig,
    cluster: Option<&str>,
    errs: &mut ValidationErrors,
) -> Vec<NetworkSpec> {
    if raw.networks.is_empty() {
        errs.push("networks", "at least one network is required");
    }

    let mut seen = HashSet::new();
    let mut networks = Vec::new();
    for (i, net) in raw.networks.iter().enumerate() {
        let field = format!("networks[{}]", i);

        let name = match net.name.as_deref() {
            None => {
                errs.push(format!("{}.name", field), "missing network name");
                None
            }
            Some(n) if !NODE_NAME.is_match(n) => {
                errs.push(format!("{}.name", field), format!("invalid network name '{}'", n));
                None
            }
            Some(n) => {
                if !seen.insert(n) {
                    errs.push(format!("{}.name", field), format!("duplicate network name '{}'", n));
                }
                Some(n)
            }
        };

        let subnet = match net.subnet.as_deref() {
            None => {
                errs.push(format!("{}.subnet", field), "missing subnet");
                None
            }
            Some(s) => match s.parse::<Ipv4Cidr>() {
                Ok(cidr) if !(8..=29).contains(&cidr.prefix) => {
                    errs.push(
                        format!("{}.subnet", field),
                        format!("prefix /{} out of range, expected /8 to /29", cidr.prefix),
                    );
                    None
                }
                Ok(cidr) => Some(cidr),
                Err(msg) => {
                    errs.push(format!("{}.subnet", field), msg);
                    None
                }
            },
        };

        let bridge = match (&net.bridge, name, cluster) {
            (Some(b), _, _) if b.is_empty() || b.len() > MAX_BRIDGE_LEN => {
                errs.push(
                    format!("{}.bridge", field),
                    format!("bridge name '{}' must be 1-{} characters", b, MAX_BRIDGE_LEN),
                );
                None
            }
            (Some(b), _, _) => Some(b.clone()),
            (None, Some(n), Some(c)) => Some(default_bridge_name(c, n)),
            _ => None,
        };

        if let (Some(name), Some(subnet), Some(bridge)) = (name, subnet, bridge) {
            networks.push(NetworkSpec {
                name: name.to_string(),
                subnet,
                bridge,
            });
        }
    }
    networks
}

/// Bridge name derived from cluster and network, clipped to the kernel limit
pub fn default_bridge_name(cluster: &str, network: &str) -> String {
    let mut bridge = format!("vf-{}-{}", cluster, network);
    bridge.truncate(MAX_BRIDGE_LEN);
    bridge.trim_end_matches('-').to_string()
}

fn validate_nodes(
    raw_nodes: &[RawNode],
    network_names: &[String],
    errs: &mut ValidationErrors,
) -> Vec<NodeSpec> {
    if raw_nodes.is_empty() {
        errs.push("nodes", "at least one node entry is required");
        return Vec::new();
    }

    let mut nodes = Vec::new();
    let mut controllers = 0usize;

    for (i, node) in raw_nodes.iter().enumerate() {
        let field = format!("nodes[{}]", i);

        let name = match node.name.as_deref() {
            None => {
                errs.push(format!("{}.name", field), "missing node name");
                None
            }
            Some(n) if !NODE_NAME.is_match(n) => {
                errs.push(
                    format!("{}.name", field),
                    format!(
                        "'{}' must be lowercase letters, digits or '-' and start with a letter or digit",
                        n
                    ),
                );
                None
            }
            Some(n) => Some(n),
        };

        let role = match node.role.as_deref() {
            None => {
                errs.push(format!("{}.role", field), "missing role");
                None
            }
            Some(r) => match r.parse::<NodeRole>() {
                Ok(role) => Some(role),
                Err(msg) => {
                    errs.push(format!("{}.role", field), msg);
                    None
                }
            },
        };

        let count = match (role, node.count) {
            (Some(NodeRole::Controller), Some(c)) if c != 1 => {
                errs.push(
                    format!("{}.count", field),
                    format!("controller count must be 1, got {}", c),
                );
                None
            }
            (Some(NodeRole::Controller), _) => {
                controllers += 1;
                Some(None)
            }
            (_, Some(c)) if c < 0 => {
                errs.push(
                    format!("{}.count", field),
                    format!("compute count must be non-negative, got {}", c),
                );
                None
            }
            (_, Some(c)) => Some(Some(c as u32)),
            (_, None) => Some(None),
        };

        let vcpus = positive(node.vcpus, &format!("{}.vcpus", field), errs);
        let memory_mb = positive(node.memory_mb, &format!("{}.memory_mb", field), errs);
        let disk_gb = positive(node.disk_gb, &format!("{}.disk_gb", field), errs);
        let gpus = validate_gpu(node, &field, errs);

        let networks = match &node.networks {
            None => Some(network_names.to_vec()),
            Some(list) => {
                let mut ok = true;
                for net in list {
                    if !network_names.contains(net) {
                        errs.push(
                            format!("{}.networks", field),
                            format!("network '{}' is not declared", net),
                        );
                        ok = false;
                    }
                }
                if list.is_empty() {
                    errs.push(format!("{}.networks", field), "node must attach to a network");
                    ok = false;
                }
                ok.then(|| list.clone())
            }
        };

        let (
            Some(name),
            Some(role),
            Some(count),
            Some(vcpus),
            Some(memory_mb),
            Some(disk_gb),
            Some(gpus),
            Some(networks),
        ) = (name, role, count, vcpus, memory_mb, disk_gb, gpus, networks)
        else {
            continue;
        };

        let resources = NodeResources {
            vcpus: vcpus as u32,
            memory_mb: memory_mb as u64,
            disk_gb: disk_gb as u64,
            gpus,
        };

        for expanded in expand_names(name, count) {
            nodes.push(NodeSpec {
                name: expanded,
                role,
                resources: resources.clone(),
                networks: networks.clone(),
            });
        }
    }

    match controllers {
        1 => {}
        0 => errs.push("nodes", "exactly one controller node is required, found none"),
        n => errs.push(
            "nodes",
            format!("exactly one controller node is required, found {}", n),
        ),
    }

    let mut seen = BTreeSet::new();
    for node in &nodes {
        if !seen.insert(node.name.as_str()) {
            errs.push("nodes", format!("duplicate node name '{}'", node.name));
        }
    }

    // Controller first, compute nodes in name order
    nodes.sort_by(|a, b| (a.role, &a.name).cmp(&(b.role, &b.name)));
    nodes
}

fn positive(value: Option<i64>, field: &str, errs: &mut ValidationErrors) -> Option<i64> {
    match value {
        None => {
            errs.push(field, "missing value");
            None
        }
        Some(v) if v <= 0 => {
            errs.push(field, format!("must be positive, got {}", v));
            None
        }
        Some(v) if v > i64::from(u32::MAX) => {
            errs.push(field, format!("{} is out of range", v));
            None
        }
        Some(v) => Some(v),
    }
}

fn validate_gpu(node: &RawNode, field: &str, errs: &mut ValidationErrors) -> Option<GpuSpec> {
    let Some(gpu) = &node.gpu else {
        return Some(GpuSpec::default());
    };

    let count = match gpu.count {
        None => Some(0),
        Some(c) if c < 0 => {
            errs.push(
                format!("{}.gpu.count", field),
                format!("must be non-negative, got {}", c),
            );
            None
        }
        Some(c) => Some(c as u32),
    };

    let vendor = match gpu.vendor.as_deref() {
        None => Some(None),
        Some(v) if VENDOR_ID.is_match(v) => {
            u16::from_str_radix(v.trim_start_matches("0x"), 16).ok().map(Some)
        }
        Some(v) => {
            errs.push(
                format!("{}.gpu.vendor", field),
                format!("'{}' is not a 4-digit hex PCI vendor id", v),
            );
            None
        }
    };

    Some(GpuSpec {
        count: count?,
        vendor: vendor?,
    })
}

/// Expand a node entry into concrete names: `compute` x2 -> compute-01, compute-02
pub fn expand_names(name: &str, count: Option<u32>) -> Vec<String> {
    match count {
        None => vec![name.to_string()],
        Some(n) => {
            let width = n.to_string().len().max(2);
            (1..=n)
                .map(|i| format!("{}-{:0width$}", name, i, width = width))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RawGpu, RawNetwork, RawStorage};

    fn raw_node(name: &str, role: &str) -> RawNode {
        RawNode {
            name: Some(name.to_string()),
            role: Some(role.to_string()),
            vcpus: Some(4),
            memory_mb: Some(8192),
            disk_gb: Some(50),
            ..Default::default()
        }
    }

    fn valid_raw() -> RawClusterConfig {
        let mut compute = raw_node("compute", "compute");
        compute.count = Some(2);
        compute.gpu = Some(RawGpu {
            count: Some(1),
            vendor: Some("10de".to_string()),
        });
        RawClusterConfig {
            version: Some("1".to_string()),
            name: Some("hpc-lab".to_string()),
            image: Some("/images/base.qcow2".to_string()),
            storage: Some(RawStorage {
                backend: Some("qcow2".to_string()),
                pool_path: None,
            }),
            networks: vec![RawNetwork {
                name: Some("mgmt".to_string()),
                subnet: Some("192.168.100.0/24".to_string()),
                bridge: None,
            }],
            nodes: vec![raw_node("controller", "controller"), compute],
        }
    }

    #[test]
    fn test_valid_config_expands_compute_nodes() {
        let spec = validate(&valid_raw()).unwrap();
        let names: Vec<_> = spec.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["controller", "compute-01", "compute-02"]);
        assert_eq!(spec.compute_nodes().len(), 2);
        assert_eq!(spec.controller().unwrap().role, NodeRole::Controller);
        assert_eq!(spec.gpu_requests().len(), 2);
        assert_eq!(spec.gpu_requests()[0].vendor, Some(0x10de));
        assert_eq!(spec.networks[0].bridge, "vf-hpc-lab-mgmt");
        assert_eq!(spec.nodes[1].networks, vec!["mgmt".to_string()]);
    }

    #[test]
    fn test_reports_all_violations_in_one_pass() {
        let mut raw = valid_raw();
        raw.version = Some("7".to_string());
        raw.storage = Some(RawStorage {
            backend: Some("zfs".to_string()),
            pool_path: None,
        });
        raw.nodes[0].vcpus = Some(0);
        raw.nodes[1].count = Some(-1);
        raw.nodes[1].memory_mb = Some(-512);

        let errs = validate(&raw).unwrap_err();
        assert!(errs.has_field("version"));
        assert!(errs.has_field("storage.backend"));
        assert!(errs.has_field("nodes[0].vcpus"));
        assert!(errs.has_field("nodes[1].count"));
        assert!(errs.has_field("nodes[1].memory_mb"));
        assert_eq!(errs.len(), 5);
    }

    #[test]
    fn test_unsupported_version_is_explicit() {
        let mut raw = valid_raw();
        raw.version = Some("2".to_string());
        let errs = validate(&raw).unwrap_err();
        let msg = errs.to_string();
        assert!(msg.contains("unsupported schema version '2'"));
    }

    #[test]
    fn test_requires_exactly_one_controller() {
        let mut raw = valid_raw();
        raw.nodes.push(raw_node("controller-b", "controller"));
        let errs = validate(&raw).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| e.message.contains("exactly one controller node is required, found 2")));

        let mut raw = valid_raw();
        raw.nodes.remove(0);
        let errs = validate(&raw).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("found none")));
    }

    #[test]
    fn test_duplicate_node_names_after_expansion() {
        let mut raw = valid_raw();
        raw.nodes.push(raw_node("compute-01", "compute"));
        let errs = validate(&raw).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| e.message == "duplicate node name 'compute-01'"));
    }

    #[test]
    fn test_zero_compute_nodes_allowed() {
        let mut raw = valid_raw();
        raw.nodes[1].count = Some(0);
        let spec = validate(&raw).unwrap();
        assert_eq!(spec.nodes.len(), 1);
        assert!(spec.gpu_requests().is_empty());
    }

    #[test]
    fn test_undeclared_network_reference() {
        let mut raw = valid_raw();
        raw.nodes[1].networks = Some(vec!["storage".to_string()]);
        let errs = validate(&raw).unwrap_err();
        assert!(errs.has_field("nodes[1].networks"));
    }

    #[test]
    fn test_subnet_too_small_for_nodes() {
        let mut raw = valid_raw();
        raw.networks[0].subnet = Some("10.0.0.0/29".to_string());
        let errs = validate(&raw).unwrap_err();
        assert!(errs.has_field("networks[0].subnet"));
    }

    #[test]
    fn test_bad_vendor_id() {
        let mut raw = valid_raw();
        raw.nodes[1].gpu = Some(RawGpu {
            count: Some(1),
            vendor: Some("nvidia".to_string()),
        });
        let errs = validate(&raw).unwrap_err();
        assert!(errs.has_field("nodes[1].gpu.vendor"));
    }

    #[test]
    fn test_expand_names_width() {
        assert_eq!(expand_names("c", None), vec!["c"]);
        assert_eq!(expand_names("c", Some(2)), vec!["c-01", "c-02"]);
        assert_eq!(expand_names("c", Some(100))[99], "c-100");
        assert_eq!(expand_names("c", Some(100))[0], "c-001");
    }

    #[test]
    fn test_default_bridge_name_fits_kernel_limit() {
        let bridge = default_bridge_name("a-very-long-cluster", "mgmt");
        assert!(bridge.len() <= MAX_BRIDGE_LEN);
        assert!(!bridge.ends_with('-'));
    }
}
