//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;

use thiserror::Error;
use tracing::info;

use super::display::{
    format_cluster_detail, format_cluster_list, format_devices, format_plan, format_report,
    format_validation_result,
};
use super::{Commands, InventoryArgs, InventoryFormat};
use crate::config::ConfigError;
use crate::inventory::{to_ini, to_json, to_yaml};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::reconciler::{ReconcileError, ReconcileReport};
use crate::settings::SettingsError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_VALIDATION: i32 = 10;
pub const EXIT_PLANNING: i32 = 20;
pub const EXIT_RECONCILE: i32 = 30;
pub const EXIT_PARTIAL: i32 = 40;
pub const EXIT_CORRUPT_STATE: i32 = 50;
pub const EXIT_CANCELLED: i32 = 130;

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        let CommandError::Orchestrator(e) = self else {
            return EXIT_USAGE;
        };
        if e.is_corrupt_state() {
            return EXIT_CORRUPT_STATE;
        }
        match e {
            OrchestratorError::Config(ConfigError::IoError(_)) => EXIT_USAGE,
            OrchestratorError::Config(_) => EXIT_VALIDATION,
            OrchestratorError::Plan(_) | OrchestratorError::Probe(_) => EXIT_PLANNING,
            OrchestratorError::Reconcile(ReconcileError::NotProvisioned(_)) => EXIT_USAGE,
            OrchestratorError::Reconcile(ReconcileError::Graph(_)) => EXIT_PLANNING,
            OrchestratorError::Reconcile(_) => EXIT_RECONCILE,
            OrchestratorError::State(_) => EXIT_USAGE,
        }
    }
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Text for stdout plus the process exit code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self {
            text,
            exit_code: EXIT_OK,
        }
    }
}

/// 0 on full success, 130 when cancelled, 40 when some work stuck, 30 otherwise
pub fn report_exit_code(report: &ReconcileReport) -> i32 {
    if report.cancelled {
        EXIT_CANCELLED
    } else if report.is_success() {
        EXIT_OK
    } else if report.is_partial() {
        EXIT_PARTIAL
    } else {
        EXIT_RECONCILE
    }
}

fn report_output(report: &ReconcileReport) -> CommandOutput {
    CommandOutput {
        text: format_report(report),
        exit_code: report_exit_code(report),
    }
}

// ============================================================================
// Validate Commands
// ============================================================================

/// Result of validating a cluster document
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub cluster: String,
    pub nodes: usize,
    pub networks: usize,
    pub gpus: u32,
    pub error: Option<String>,
}

/// Validate a cluster document; an unreadable file is an error, an invalid one is a result
pub fn validate_cluster(orch: &Orchestrator, path: &Path) -> CommandResult<ValidationResult> {
    match orch.validate(path) {
        Ok(spec) => Ok(ValidationResult {
            valid: true,
            gpus: spec.gpu_requests().iter().map(|r| r.count).sum(),
            cluster: spec.name,
            nodes: spec.nodes.len(),
            networks: spec.networks.len(),
            error: None,
        }),
        Err(OrchestratorError::Config(ConfigError::IoError(e))) => Err(CommandError::Io(e)),
        Err(e) => Ok(ValidationResult {
            valid: false,
            cluster: String::new(),
            nodes: 0,
            networks: 0,
            gpus: 0,
            error: Some(e.to_string()),
        }),
    }
}

// ============================================================================
// Lifecycle Commands
// ============================================================================

/// Allocation and pending actions for a document, without mutating anything
pub async fn plan_cluster(orch: &Orchestrator, path: &Path) -> CommandResult<String> {
    let spec = orch.validate(path)?;
    let planned = orch.plan(&spec)?;
    let actions = orch.preview(&planned).await?;
    Ok(format_plan(&planned, &actions))
}

pub async fn create_cluster(orch: &Orchestrator, path: &Path) -> CommandResult<CommandOutput> {
    let spec = orch.validate(path)?;
    info!(cluster = %spec.name, file = %path.display(), "Creating cluster");
    let report = orch.create(&spec).await?;
    Ok(report_output(&report))
}

pub async fn start_cluster(orch: &Orchestrator, cluster: &str) -> CommandResult<CommandOutput> {
    Ok(report_output(&orch.start(cluster).await?))
}

pub async fn stop_cluster(orch: &Orchestrator, cluster: &str) -> CommandResult<CommandOutput> {
    Ok(report_output(&orch.stop(cluster).await?))
}

pub async fn destroy_cluster(orch: &Orchestrator, cluster: &str) -> CommandResult<CommandOutput> {
    Ok(report_output(&orch.destroy(cluster).await?))
}

pub fn cluster_status(
    orch: &Orchestrator,
    cluster: Option<&str>,
    json: bool,
) -> CommandResult<String> {
    let records = orch.status(cluster)?;
    if let Some(name) = cluster {
        if records.is_empty() {
            return Err(OrchestratorError::Reconcile(ReconcileError::NotProvisioned(
                name.to_string(),
            ))
            .into());
        }
    }
    if json {
        return Ok(serde_json::to_string_pretty(&records)?);
    }
    Ok(match (cluster, records.first()) {
        (Some(_), Some(record)) => format_cluster_detail(record),
        _ => format_cluster_list(&records),
    })
}

pub fn list_devices(orch: &Orchestrator, all: bool) -> CommandResult<String> {
    Ok(format_devices(&orch.devices()?, all))
}

/// Render the inventory in the requested format
pub async fn render_inventory(orch: &Orchestrator, args: &InventoryArgs) -> CommandResult<String> {
    let record = orch.inventory(&args.cluster).await?;
    Ok(match args.format {
        InventoryFormat::Json => to_json(&record)?,
        InventoryFormat::Yaml => to_yaml(&record)?,
        InventoryFormat::Ini => to_ini(&record, &orch.settings().inventory.ssh_user),
    })
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run one subcommand against an orchestrator
pub async fn run_command(orch: &Orchestrator, command: &Commands) -> CommandResult<CommandOutput> {
    match command {
        Commands::Create(args) if args.dry_run => Ok(CommandOutput::ok(
            plan_cluster(orch, &args.file).await?,
        )),
        Commands::Create(args) => create_cluster(orch, &args.file).await,
        Commands::Start(args) => start_cluster(orch, &args.cluster).await,
        Commands::Stop(args) => stop_cluster(orch, &args.cluster).await,
        Commands::Destroy(args) => destroy_cluster(orch, &args.cluster).await,
        Commands::Status(args) => Ok(CommandOutput::ok(cluster_status(
            orch,
            args.cluster.as_deref(),
            args.json,
        )?)),
        Commands::Validate(args) => {
            let result = validate_cluster(orch, &args.file)?;
            Ok(CommandOutput {
                exit_code: if result.valid { EXIT_OK } else { EXIT_VALIDATION },
                text: format_validation_result(&result, &args.file.display().to_string()),
            })
        }
        Commands::Plan(args) => Ok(CommandOutput::ok(plan_cluster(orch, &args.file).await?)),
        Commands::Devices(args) => Ok(CommandOutput::ok(list_devices(orch, args.all)?)),
        Commands::Inventory(args) => {
            let text = render_inventory(orch, args).await?;
            match &args.output {
                Some(path) => {
                    write_output(path, &text)?;
                    Ok(CommandOutput::ok(format!(
                        "Inventory for {} written to {}\n",
                        args.cluster,
                        path.display()
                    )))
                }
                None => Ok(CommandOutput::ok(text)),
            }
        }
    }
}

fn write_output(path: &Path, content: &str) -> CommandResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}
