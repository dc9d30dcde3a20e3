//! CLI module for vmforge
//!
//! Provides lifecycle subcommands:
//! - `vmforge create` - Provision a cluster from a cluster document
//! - `vmforge start` / `vmforge stop` - Power a provisioned cluster on or off
//! - `vmforge destroy` - Tear a cluster down and drop its record
//! - `vmforge status` - Show lifecycle records
//! - `vmforge validate` / `vmforge plan` - Check a document without touching the host
//! - `vmforge devices` - List host PCIe devices
//! - `vmforge inventory` - Emit an Ansible-compatible inventory

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "vmforge")]
#[command(about = "Provision GPU passthrough VM clusters from declarative specs")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.vmforge/config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before settings
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Override the lifecycle record directory
    #[arg(long, value_name = "DIR", env = "VMFORGE_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Virtualization backend
    #[arg(long, value_enum, default_value_t = Backend::Virsh, global = true)]
    pub backend: Backend,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// libvirt through the virsh binary
    Virsh,
    /// In-process simulation, nothing on the host is touched
    Memory,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or converge a cluster
    Create(CreateArgs),

    /// Start every VM of a cluster
    Start(ClusterArgs),

    /// Stop every VM of a cluster
    Stop(ClusterArgs),

    /// Destroy a cluster
    Destroy(ClusterArgs),

    /// Show lifecycle records
    Status(StatusArgs),

    /// Validate a cluster document
    Validate(FileArgs),

    /// Show the allocation and the actions create would take
    Plan(FileArgs),

    /// List host PCIe devices
    Devices(DevicesArgs),

    /// Emit an inventory of a provisioned cluster
    Inventory(InventoryArgs),
}

/// Arguments for the create command
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Path to the cluster document (JSON or YAML)
    pub file: PathBuf,

    /// Plan only: print what would change without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments naming a provisioned cluster
#[derive(Parser, Debug)]
pub struct ClusterArgs {
    /// Cluster name
    pub cluster: String,
}

/// Arguments for commands that read a cluster document
#[derive(Parser, Debug)]
pub struct FileArgs {
    /// Path to the cluster document (JSON or YAML)
    pub file: PathBuf,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Cluster name (omit for all clusters)
    pub cluster: Option<String>,

    /// Print the raw records as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the devices command
#[derive(Parser, Debug)]
pub struct DevicesArgs {
    /// Include non-GPU functions
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum InventoryFormat {
    Json,
    Yaml,
    Ini,
}

/// Arguments for the inventory command
#[derive(Parser, Debug)]
pub struct InventoryArgs {
    /// Cluster name
    pub cluster: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = InventoryFormat::Ini)]
    pub format: InventoryFormat,

    /// Write to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        let cli = Cli::parse_from(["vmforge", "create", "cluster.yaml"]);
        match cli.command {
            Commands::Create(args) => {
                assert_eq!(args.file, PathBuf::from("cluster.yaml"));
                assert!(!args.dry_run);
            }
            _ => panic!("Expected Create command"),
        }
        assert_eq!(cli.backend, Backend::Virsh);
    }

    #[test]
    fn test_parse_destroy() {
        let cli = Cli::parse_from(["vmforge", "destroy", "lab"]);
        match cli.command {
            Commands::Destroy(args) => assert_eq!(args.cluster, "lab"),
            _ => panic!("Expected Destroy command"),
        }
    }

    #[test]
    fn test_parse_status_all() {
        let cli = Cli::parse_from(["vmforge", "status"]);
        match cli.command {
            Commands::Status(args) => {
                assert!(args.cluster.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_parse_inventory_format() {
        let cli = Cli::parse_from([
            "vmforge",
            "inventory",
            "lab",
            "--format",
            "json",
            "--output",
            "hosts.json",
        ]);
        match cli.command {
            Commands::Inventory(args) => {
                assert_eq!(args.cluster, "lab");
                assert_eq!(args.format, InventoryFormat::Json);
                assert_eq!(args.output, Some(PathBuf::from("hosts.json")));
            }
            _ => panic!("Expected Inventory command"),
        }
    }

    #[test]
    fn test_inventory_defaults_to_ini() {
        let cli = Cli::parse_from(["vmforge", "inventory", "lab"]);
        match cli.command {
            Commands::Inventory(args) => assert_eq!(args.format, InventoryFormat::Ini),
            _ => panic!("Expected Inventory command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "vmforge",
            "plan",
            "cluster.json",
            "--backend",
            "memory",
            "--state-dir",
            "/tmp/state",
        ]);
        assert_eq!(cli.backend, Backend::Memory);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
    }

    #[test]
    fn test_verbose_global() {
        let cli = Cli::parse_from(["vmforge", "-vvv", "devices"]);
        assert_eq!(cli.verbose, 3);
    }
}
