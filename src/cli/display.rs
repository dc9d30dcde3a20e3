//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::ValidationResult;
use crate::devices::HostDevice;
use crate::orchestrator::Planned;
use crate::reconciler::{ActionPlan, ReconcileReport, TeardownReason};
use crate::state::{LifecycleRecord, ResourceStatus};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    // Calculate column widths
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    // Header
    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    // Rows
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

// ============================================================================
// Validation display
// ============================================================================

/// Format validation result for display
pub fn format_validation_result(result: &ValidationResult, path: &str) -> String {
    let mut output = String::new();

    if result.valid {
        output.push_str(&format!("✓ {} is valid\n\n", path));
        output.push_str(&format!("  Cluster:  {}\n", result.cluster));
        output.push_str(&format!("  Nodes:    {}\n", result.nodes));
        output.push_str(&format!("  Networks: {}\n", result.networks));
        output.push_str(&format!("  GPUs:     {}\n", result.gpus));
    } else {
        output.push_str(&format!("✗ {} is invalid\n\n", path));
        if let Some(ref error) = result.error {
            for line in error.lines() {
                output.push_str(&format!("  {}\n", line.trim_start()));
            }
        }
    }

    output
}

// ============================================================================
// Plan display
// ============================================================================

fn teardown_label(reason: TeardownReason) -> &'static str {
    match reason {
        TeardownReason::Orphan => "remove",
        TeardownReason::Replace => "replace",
        TeardownReason::Leftover => "clean up",
    }
}

/// Format allocations, warnings and pending actions of a planned cluster
pub fn format_plan(planned: &Planned, actions: &ActionPlan) -> String {
    let mut output = String::new();

    let hash = planned.graph.hash();
    output.push_str(&format!(
        "Cluster: {} ({} resources, graph {})\n\n",
        planned.graph.cluster,
        planned.graph.len(),
        &hash[..hash.len().min(12)]
    ));

    if !planned.allocations.is_empty() {
        output.push_str("GPU allocation:\n");
        let rows = planned
            .allocations
            .iter()
            .map(|a| {
                vec![
                    a.node.clone(),
                    a.primary.to_string(),
                    a.iommu_group.to_string(),
                    format!("{:04x}:{:04x}", a.vendor, a.device),
                    a.functions
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                ]
            })
            .collect();
        output.push_str(&format_table(
            &["NODE", "GPU", "IOMMU", "ID", "FUNCTIONS"],
            rows,
        ));
        output.push('\n');
    }

    for warning in &planned.warnings {
        output.push_str(&format!("warning: {}\n", warning));
    }
    if !planned.warnings.is_empty() {
        output.push('\n');
    }

    if actions.is_noop() {
        output.push_str("Nothing to do: cluster matches the document.\n");
        return output;
    }

    let mut rows: Vec<Vec<String>> = actions
        .teardown
        .iter()
        .map(|(id, reason)| vec![id.to_string(), teardown_label(*reason).to_string()])
        .collect();
    rows.extend(
        actions
            .create
            .iter()
            .filter(|id| !actions.teardown.contains_key(*id))
            .map(|id| vec![id.to_string(), "create".to_string()]),
    );
    rows.extend(
        actions
            .conflicts
            .iter()
            .map(|id| vec![id.to_string(), "conflict (exists, not managed)".to_string()]),
    );
    output.push_str(&format_table(&["RESOURCE", "ACTION"], rows));
    if !actions.unchanged.is_empty() {
        output.push_str(&format!("\n{} resource(s) unchanged\n", actions.unchanged.len()));
    }

    output
}

// ============================================================================
// Reconcile report display
// ============================================================================

/// Format the outcome of create/start/stop/destroy
pub fn format_report(report: &ReconcileReport) -> String {
    let mut output = String::new();

    let verdict = if report.cancelled {
        "cancelled"
    } else if report.is_success() {
        "succeeded"
    } else if report.is_partial() {
        "partially failed"
    } else {
        "failed"
    };
    output.push_str(&format!(
        "{} {} {}\n",
        report.operation, report.cluster, verdict
    ));

    if !report.performed.is_empty() {
        output.push('\n');
        let rows = report
            .performed
            .iter()
            .map(|p| vec![p.id.to_string(), p.action.clone()])
            .collect();
        output.push_str(&format_table(&["RESOURCE", "ACTION"], rows));
    }

    if !report.failed.is_empty() {
        output.push_str("\nFailed:\n");
        for f in &report.failed {
            output.push_str(&format!("  {}: {}\n", f.id, f.error));
        }
    }

    if !report.blocked.is_empty() {
        output.push_str("\nBlocked:\n");
        for id in &report.blocked {
            output.push_str(&format!("  {}\n", id));
        }
    }

    if !report.device_conflicts.is_empty() {
        output.push_str("\nDevice conflicts:\n");
        for c in &report.device_conflicts {
            output.push_str(&format!("  {}\n", c));
        }
    }

    if !report.rolled_back.is_empty() {
        output.push_str("\nRolled back:\n");
        for id in &report.rolled_back {
            output.push_str(&format!("  {}\n", id));
        }
    }

    output.push_str(&format!("\nReady resources: {}\n", report.ready));
    output
}

// ============================================================================
// Status display
// ============================================================================

/// One line per cluster
pub fn format_cluster_list(records: &[LifecycleRecord]) -> String {
    let rows = records
        .iter()
        .map(|r| {
            let counts = r.count_by_status();
            let count = |s: ResourceStatus| counts.get(&s).copied().unwrap_or(0);
            vec![
                r.cluster.clone(),
                r.resources.len().to_string(),
                count(ResourceStatus::Ready).to_string(),
                count(ResourceStatus::Failed).to_string(),
                r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();

    format_table(&["CLUSTER", "RESOURCES", "READY", "FAILED", "UPDATED"], rows)
}

/// Every resource of one cluster
pub fn format_cluster_detail(record: &LifecycleRecord) -> String {
    let mut output = String::new();

    output.push_str(&format!("Cluster:  {}\n", record.cluster));
    output.push_str(&format!("Run:      {}\n", record.run_id));
    output.push_str(&format!("Graph:    {}\n", record.graph_hash));
    output.push_str(&format!("Updated:  {}\n\n", record.updated_at.to_rfc3339()));

    let rows = record
        .resources
        .iter()
        .map(|(id, r)| {
            vec![
                id.to_string(),
                r.status.to_string(),
                or_dash(r.power.map(|p| p.to_string())),
                or_dash(r.address.map(|a| a.to_string())),
                r.attempts.to_string(),
                or_dash(r.last_error.clone()),
            ]
        })
        .collect();
    output.push_str(&format_table(
        &["RESOURCE", "STATUS", "POWER", "ADDRESS", "ATTEMPTS", "ERROR"],
        rows,
    ));

    output
}

// ============================================================================
// Device display
// ============================================================================

/// Format host devices; bridges and non-GPU functions only with `all`
pub fn format_devices(devices: &[HostDevice], all: bool) -> String {
    let rows = devices
        .iter()
        .filter(|d| all || d.is_gpu())
        .map(|d| {
            vec![
                d.address.to_string(),
                format!("{:06x}", d.class),
                format!("{:04x}:{:04x}", d.vendor, d.device),
                or_dash(d.iommu_group.map(|g| g.to_string())),
                or_dash(d.driver.clone()),
                if d.is_passthrough_ready() { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();

    format_table(
        &["ADDRESS", "CLASS", "ID", "IOMMU", "DRIVER", "PASSTHROUGH"],
        rows,
    )
}
