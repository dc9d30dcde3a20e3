use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vmforge::cli::{run_command, Backend, Cli, EXIT_CANCELLED, EXIT_USAGE};
use vmforge::control::{
    AddressResolver, ControlPlane, MemoryControlPlane, VirshAddressResolver, VirshControlPlane,
};
use vmforge::devices::{DeviceProbe, SysfsProber};
use vmforge::orchestrator::Orchestrator;
use vmforge::planner::HostCapacity;
use vmforge::settings::{load_env_file, load_settings, load_settings_from, Settings};

type Backends = (
    Arc<dyn ControlPlane>,
    Arc<dyn AddressResolver>,
    Arc<dyn DeviceProbe>,
);

fn backend(kind: Backend, settings: &Settings) -> Backends {
    let prober: Arc<dyn DeviceProbe> = Arc::new(SysfsProber::new(settings.sysfs_root()));
    match kind {
        Backend::Virsh => {
            let uri = settings.libvirt_uri();
            info!(uri = %uri, "Using libvirt backend");
            let control: Arc<dyn ControlPlane> = Arc::new(
                VirshControlPlane::new(Some(uri.clone())).with_sysfs_root(settings.sysfs_root()),
            );
            let resolver: Arc<dyn AddressResolver> =
                Arc::new(VirshAddressResolver::new(Some(uri), settings.inventory.ssh_port));
            (control, resolver, prober)
        }
        Backend::Memory => {
            info!("Using in-memory backend, host is not touched");
            let memory = Arc::new(MemoryControlPlane::new());
            let control: Arc<dyn ControlPlane> = memory.clone();
            let resolver: Arc<dyn AddressResolver> = memory;
            (control, resolver, prober)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = load_env_file(env_file) {
            error!("Failed to load env file: {}", e);
            process::exit(EXIT_USAGE);
        }
    }

    let settings = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    let mut settings = match settings {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            process::exit(EXIT_USAGE);
        }
    };
    if let Some(ref dir) = cli.state_dir {
        settings = settings.with_state_dir(dir.to_string_lossy());
    }

    let (control, resolver, prober) = backend(cli.backend, &settings);

    // Ctrl-C stops new work and rolls back what this run created
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator = Orchestrator::new(settings, control, resolver, prober)
        .with_capacity(HostCapacity::from_system())
        .with_cancel(cancel_rx.clone());

    let code = match run_command(&orchestrator, &cli.command).await {
        Ok(output) => {
            print!("{}", output.text);
            output.exit_code
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };

    if *cancel_rx.borrow() && code != 0 {
        process::exit(EXIT_CANCELLED);
    }
    process::exit(code);
}
