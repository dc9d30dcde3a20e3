//! libvirt backend driven through the `virsh` CLI
//!
//! Every call spawns one `virsh` process per step. Failures are classified from
//! stderr into transient (connection trouble, busy locks) and permanent errors so
//! the reconciler knows what is worth retrying.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use super::xml::{render_dhcp_host, render_domain_xml, render_network_xml};
use super::{AddressResolver, ControlError, ControlPlane, Handle};
use crate::config::StorageBackend;
use crate::devices::{read_driver, PciAddress, DEFAULT_SYSFS_ROOT};
use crate::planner::graph::{PoolDef, ResourceKind, ResourceSpec, VmDefinition, VolumeDef};

const TRANSIENT_MARKERS: &[&str] = &[
    "failed to connect",
    "unable to connect",
    "timed out",
    "resource busy",
    "cannot acquire",
    "connection reset",
    "temporarily unavailable",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "no domain with matching",
    "no network with matching",
    "no storage pool with matching",
    "no storage vol with matching",
];

const NOT_RUNNING_MARKERS: &[&str] = &["not running", "is not active", "domain is not running"];

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Map virsh stderr onto a [`ControlError`]
pub fn classify_error(stderr: &str) -> ControlError {
    let msg = stderr.trim().trim_start_matches("error: ").to_string();
    let lower = msg.to_lowercase();
    if lower.contains("already exists") || lower.contains("already active") {
        ControlError::AlreadyExists(msg)
    } else if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        ControlError::NotFound(msg)
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ControlError::Transient(msg)
    } else {
        ControlError::Permanent(msg)
    }
}

fn is_not_running(err: &ControlError) -> bool {
    match err {
        ControlError::Permanent(msg) | ControlError::NotFound(msg) => {
            let lower = msg.to_lowercase();
            NOT_RUNNING_MARKERS.iter().any(|m| lower.contains(m))
        }
        _ => false,
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn pool_define_args(pool: &PoolDef) -> Vec<String> {
    args(&[
        "pool-define-as",
        &pool.name,
        "dir",
        "--target",
        &pool.path.to_string_lossy(),
    ])
}

/// Arguments for creating a volume; raw volumes are filled by a separate upload
pub fn volume_create_args(vol: &VolumeDef) -> Vec<String> {
    let capacity = format!("{}G", vol.capacity_gb);
    match vol.format {
        StorageBackend::Qcow2 => args(&[
            "vol-create-as",
            &vol.pool,
            &vol.name,
            &capacity,
            "--format",
            "qcow2",
            "--backing-vol",
            &vol.template.to_string_lossy(),
            "--backing-vol-format",
            "qcow2",
        ]),
        StorageBackend::Raw => args(&[
            "vol-create-as",
            &vol.pool,
            &vol.name,
            &capacity,
            "--format",
            "raw",
        ]),
    }
}

/// Names from `virsh list --name` style output
pub fn parse_name_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Volume names from the `virsh vol-list` table
pub fn parse_vol_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// First IPv4 address from `virsh domifaddr` output
pub fn parse_domifaddr(stdout: &str) -> Option<Ipv4Addr> {
    stdout.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() >= 4 && cols[2] == "ipv4" {
            cols[3].split('/').next()?.parse().ok()
        } else {
            None
        }
    })
}

// ============================================================================
// I/O: virsh process runner
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Virsh {
    uri: Option<String>,
}

impl Virsh {
    pub fn new(uri: Option<String>) -> Self {
        Self { uri }
    }

    async fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<String, ControlError> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.uri {
            cmd.arg("-c").arg(uri);
        }
        cmd.args(argv)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(args = ?argv, "virsh");
        let mut child = cmd
            .spawn()
            .map_err(|e| ControlError::Permanent(format!("failed to run virsh: {}", e)))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| ControlError::Transient(format!("virsh stdin: {}", e)))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ControlError::Transient(format!("virsh wait: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(classify_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn run_args(&self, parts: &[&str]) -> Result<String, ControlError> {
        self.run(&args(parts), None).await
    }
}

// ============================================================================
// ControlPlane implementation
// ============================================================================

pub struct VirshControlPlane {
    virsh: Virsh,
    sysfs_root: PathBuf,
}

impl VirshControlPlane {
    pub fn new(uri: Option<String>) -> Self {
        Self {
            virsh: Virsh::new(uri),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
        }
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    async fn define_vm(&self, vm: &VmDefinition) -> Result<(), ControlError> {
        for iface in &vm.interfaces {
            let host = render_dhcp_host(&vm.name, iface);
            let result = self
                .virsh
                .run_args(&[
                    "net-update",
                    &iface.network,
                    "add-last",
                    "ip-dhcp-host",
                    &host,
                    "--live",
                    "--config",
                ])
                .await;
            match result {
                Ok(_) | Err(ControlError::AlreadyExists(_)) => {}
                Err(ControlError::Permanent(msg)) if msg.contains("existing") => {}
                Err(e) => return Err(e),
            }
        }
        self.virsh
            .run(&args(&["define", "/dev/stdin"]), Some(&render_domain_xml(vm)))
            .await?;
        Ok(())
    }

    async fn ignore_not_running(&self, parts: &[&str]) -> Result<(), ControlError> {
        match self.virsh.run_args(parts).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_running(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ControlPlane for VirshControlPlane {
    async fn define(&self, spec: &ResourceSpec) -> Result<Handle, ControlError> {
        match spec {
            ResourceSpec::Network(net) => {
                self.virsh
                    .run(&args(&["net-define", "/dev/stdin"]), Some(&render_network_xml(net)))
                    .await?;
                self.virsh.run_args(&["net-autostart", &net.name]).await?;
                self.virsh.run_args(&["net-start", &net.name]).await?;
            }
            ResourceSpec::Pool(pool) => {
                self.virsh.run(&pool_define_args(pool), None).await?;
                self.virsh.run_args(&["pool-build", &pool.name]).await?;
                self.virsh.run_args(&["pool-start", &pool.name]).await?;
                self.virsh.run_args(&["pool-autostart", &pool.name]).await?;
            }
            ResourceSpec::Volume(vol) => {
                self.virsh.run(&volume_create_args(vol), None).await?;
                if vol.format == StorageBackend::Raw {
                    self.virsh
                        .run_args(&[
                            "vol-upload",
                            "--pool",
                            &vol.pool,
                            &vol.name,
                            &vol.template.to_string_lossy(),
                        ])
                        .await?;
                }
            }
            ResourceSpec::Vm(vm) => self.define_vm(vm).await?,
        }
        Ok(Handle::for_spec(spec))
    }

    async fn start(&self, handle: &Handle) -> Result<(), ControlError> {
        match handle.kind {
            ResourceKind::Vm => {
                self.virsh.run_args(&["start", &handle.name]).await?;
            }
            ResourceKind::Network => {
                self.virsh.run_args(&["net-start", &handle.name]).await?;
            }
            ResourceKind::Pool => {
                self.virsh.run_args(&["pool-start", &handle.name]).await?;
            }
            ResourceKind::Volume => {}
        }
        Ok(())
    }

    async fn stop(&self, handle: &Handle) -> Result<(), ControlError> {
        if handle.kind == ResourceKind::Vm {
            self.ignore_not_running(&["shutdown", &handle.name]).await?;
        }
        Ok(())
    }

    async fn destroy(&self, handle: &Handle) -> Result<(), ControlError> {
        match handle.kind {
            ResourceKind::Vm => {
                self.ignore_not_running(&["destroy", &handle.name]).await?;
                self.virsh
                    .run_args(&["undefine", &handle.name, "--nvram"])
                    .await?;
            }
            ResourceKind::Network => {
                self.ignore_not_running(&["net-destroy", &handle.name]).await?;
                self.virsh.run_args(&["net-undefine", &handle.name]).await?;
            }
            ResourceKind::Pool => {
                self.ignore_not_running(&["pool-destroy", &handle.name]).await?;
                if let Err(e) = self.virsh.run_args(&["pool-delete", &handle.name]).await {
                    warn!(pool = %handle.name, error = %e, "Pool directory not removed");
                }
                self.virsh.run_args(&["pool-undefine", &handle.name]).await?;
            }
            ResourceKind::Volume => {
                let pool = handle.parent.as_deref().ok_or_else(|| {
                    ControlError::Permanent(format!("volume {} has no pool", handle.name))
                })?;
                self.virsh
                    .run_args(&["vol-delete", &handle.name, "--pool", pool])
                    .await?;
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Handle>, ControlError> {
        let mut handles = Vec::new();

        let domains = self.virsh.run_args(&["list", "--all", "--name"]).await?;
        handles.extend(
            parse_name_list(&domains)
                .into_iter()
                .map(|n| Handle::new(ResourceKind::Vm, n)),
        );

        let networks = self.virsh.run_args(&["net-list", "--all", "--name"]).await?;
        handles.extend(
            parse_name_list(&networks)
                .into_iter()
                .map(|n| Handle::new(ResourceKind::Network, n)),
        );

        let pools = parse_name_list(&self.virsh.run_args(&["pool-list", "--all", "--name"]).await?);
        for pool in &pools {
            match self.virsh.run_args(&["vol-list", pool]).await {
                Ok(out) => handles.extend(parse_vol_list(&out).into_iter().map(|v| Handle {
                    kind: ResourceKind::Volume,
                    name: v,
                    parent: Some(pool.clone()),
                })),
                // Inactive pools cannot list volumes
                Err(e) => debug!(pool = %pool, error = %e, "Skipping volume listing"),
            }
        }
        handles.extend(pools.into_iter().map(|n| Handle::new(ResourceKind::Pool, n)));

        Ok(handles)
    }

    async fn device_binding(&self, address: PciAddress) -> Result<Option<String>, ControlError> {
        read_driver(&self.sysfs_root, address).map_err(|e| ControlError::Permanent(e.to_string()))
    }
}

// ============================================================================
// Address resolution
// ============================================================================

/// Resolves guest addresses from DHCP leases and confirms them with a TCP connect
pub struct VirshAddressResolver {
    virsh: Virsh,
    port: u16,
    connect_timeout: Duration,
}

impl VirshAddressResolver {
    pub fn new(uri: Option<String>, port: u16) -> Self {
        Self {
            virsh: Virsh::new(uri),
            port,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl AddressResolver for VirshAddressResolver {
    async fn resolve(&self, vm: &VmDefinition) -> Result<Option<Ipv4Addr>, ControlError> {
        let leased = match self
            .virsh
            .run_args(&["domifaddr", &vm.name, "--source", "lease"])
            .await
        {
            Ok(out) => parse_domifaddr(&out),
            Err(e) if e.is_transient() => return Err(e),
            Err(_) => None,
        };
        let Some(ip) = leased.or_else(|| vm.primary_ip()) else {
            return Ok(None);
        };

        let addr = SocketAddr::from((ip, self.port));
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(Some(ip)),
            _ => Ok(None),
        }
    }
}
