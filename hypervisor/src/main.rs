//! Main entry point for the hypervisor binary
//!
//! `serve` runs the station with real service implementations; `apply-update`
//! installs a staged bundle from outside the serving process.

use anyhow::{anyhow, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;

use hypervisor::{
    hypervisor::COMPONENT,
    server,
    services::{
        FileConfigAccessor, HttpInferenceBackend, PortBinder, RealInstaller, RealProcessSupervisor,
        RealProcessTerminator, RealSessionLauncher,
    },
    ConfigAccessor, DetachedHost, Exit, Hypervisor, UpdateOrchestrator, Updater,
};
use shared::{
    logging::{self, TracingEndpoint},
    process_debug, process_info, BundleDescriptor, PlatformFamily, ProcessId, UpdatePhase,
};

/// Local model-serving station
#[derive(Parser)]
#[command(name = "hypervisor")]
#[command(about = "Supervises the inference backend, serves requests and updates the station in place")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the station
    Serve(ServeArgs),
    /// Replace an installed bundle with a staged one and relaunch it
    ApplyUpdate(ApplyUpdateArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Preferred service port (searches upward when taken)
    #[arg(long)]
    port: Option<u16>,

    /// Service bind host
    #[arg(long)]
    host: Option<String>,

    /// Station data directory holding config.json
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Backend executable
    #[arg(long)]
    backend: Option<PathBuf>,

    /// Number of workers
    #[arg(long)]
    workers: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Tracing endpoint URL
    #[arg(long)]
    trace_ep: Option<String>,

    /// Do not start the backend on launch
    #[arg(long)]
    no_autostart: bool,
}

#[derive(Args)]
struct ApplyUpdateArgs {
    /// Staged bundle to install
    #[arg(long)]
    new: PathBuf,

    /// Installed bundle to replace
    #[arg(long)]
    old: PathBuf,

    /// Process supervising the installed bundle
    #[arg(long)]
    pid: u32,

    /// Seconds to wait for in-flight work
    #[arg(long, default_value = "1.0")]
    grace: f64,

    /// Platform family (macos, linux, windows); defaults to the current one
    #[arg(long)]
    platform: Option<String>,

    /// Version of the staged bundle
    #[arg(long)]
    version: Option<String>,

    /// Install even when the version is not newer
    #[arg(long)]
    force: bool,

    /// Station data directory for update_log.txt
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::ApplyUpdate(args) => apply_update(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    ProcessId::init_hypervisor();
    logging::init_tracing(Some(&args.log_level), args.trace_ep.clone().map(TracingEndpoint::new));

    let data_dir = args.data_dir.clone().unwrap_or_else(FileConfigAccessor::default_data_dir);
    let config = FileConfigAccessor::load(&data_dir);
    let settings = config.override_runtime(|settings| {
        if let Some(port) = args.port {
            settings.preferred_port = port;
        }
        if let Some(host) = &args.host {
            settings.service_host = host.clone();
        }
        if let Some(backend) = &args.backend {
            settings.backend_executable = Some(backend.clone());
        }
        if let Some(workers) = args.workers {
            settings.worker_count = workers;
        }
    })?;
    process_debug!(ProcessId::current(), "📂 Settings from {}", config.path().display());

    let binder = PortBinder::new(settings.service_host.clone());
    let (listener, allocation) = binder
        .bind(settings.preferred_port, settings.port_search_range)
        .await?;
    let backend_port = binder
        .find_free(settings.backend_port, settings.port_search_range)
        .await?;
    if backend_port.bound != settings.backend_port {
        config.override_runtime(|settings| settings.backend_port = backend_port.bound)?;
    }
    process_info!(
        ProcessId::current(),
        "🌐 Listening on http://{}:{} (requested {}, {} attempts), backend port {}",
        settings.service_host,
        allocation.bound,
        allocation.requested,
        allocation.attempts,
        backend_port.bound
    );

    // Wire real services into the control loop
    let config = Arc::new(config);
    let backend = Arc::new(HttpInferenceBackend::new(config.subscribe()));
    let supervisor = Arc::new(RealProcessSupervisor::new());
    let updater = Arc::new(UpdateOrchestrator::new(
        RealProcessTerminator::new(),
        RealInstaller::new(),
        RealSessionLauncher::new(PlatformFamily::current(), &data_dir),
        config.version(COMPONENT),
    ));
    let hypervisor = Hypervisor::new(config, backend, supervisor, updater);
    let handle = hypervisor.handle();

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            process_info!(ProcessId::current(), "🛑 Received Ctrl+C, shutting down gracefully...");
            let _ = signal_handle.shutdown().await;
        }
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server::serve(listener, handle, async {
        let _ = stop_rx.await;
    }));

    let exit = hypervisor.run(!args.no_autostart).await?;
    let _ = stop_tx.send(());
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => logging::log_error(ProcessId::current(), "HTTP server", &e),
        Err(e) => logging::log_error(ProcessId::current(), "HTTP server task", &e),
    }

    if exit == Exit::Updated {
        process_info!(ProcessId::current(), "👋 Exiting in favour of the updated build");
    }
    Ok(())
}

async fn apply_update(args: ApplyUpdateArgs) -> anyhow::Result<()> {
    ProcessId::init_updater();
    logging::init_tracing(Some(&args.log_level), None);

    let platform = match &args.platform {
        Some(name) => name.parse::<PlatformFamily>()?,
        None => PlatformFamily::current(),
    };
    let data_dir = args.data_dir.clone().unwrap_or_else(FileConfigAccessor::default_data_dir);
    let installed = FileConfigAccessor::load(&data_dir).version(COMPONENT);

    let descriptor = BundleDescriptor {
        new_bundle_path: args.new,
        old_installed_path: args.old,
        supervising_process_id: args.pid,
        grace_period_seconds: args.grace,
        platform_family: platform,
        version: args.version,
        force: args.force,
    };

    let orchestrator = UpdateOrchestrator::new(
        RealProcessTerminator::new(),
        RealInstaller::new(),
        RealSessionLauncher::new(platform, &data_dir),
        installed,
    );
    let job = orchestrator.request(descriptor).map_err(|status| {
        anyhow!(
            "update rejected: {}",
            status.reason.unwrap_or_else(|| format!("{:?}", status.phase))
        )
    })?;

    let status = orchestrator.run(job, Arc::new(DetachedHost)).await;
    if status.phase != UpdatePhase::Done {
        bail!(
            "update failed: {}",
            status.reason.unwrap_or_else(|| "unknown reason".to_string())
        );
    }
    logging::log_success(ProcessId::current(), "Update applied");
    Ok(())
}
