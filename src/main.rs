use ephemera::config::{ProvisioningContext, Settings};
use ephemera::orchestrator::Orchestrator;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for the server task after signalling shutdown
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ephemera=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional settings file, then environment overrides
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = match config_path {
        Some(ref path) => {
            let mut settings = Settings::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load settings");
                e
            })?;
            info!(path = %path.display(), "Settings loaded");
            settings.apply_env(|name| std::env::var(name).ok())?;
            settings
        }
        None => Settings::from_env()?,
    };
    settings.validate()?;

    print_startup_banner(&settings);

    let ctx = ProvisioningContext::from_settings(&settings)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Orchestrator::new(settings, ctx).start(shutdown_rx).await?;
    info!(addr = %supervisor.local_addr, "Serving");

    wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), supervisor.server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Artifact server failed"),
        Ok(Err(e)) => error!(error = %e, "Artifact server task panicked"),
        Err(_) => warn!("Artifact server did not stop in time"),
    }

    if supervisor.reaper.is_finished() {
        info!("Artifacts already purged");
    } else {
        warn!("Exiting before the artifact purge ran");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(settings: &Settings) {
    info!(name = PKG_NAME, version = VERSION, "Starting provisioner");
    info!(
        bind = %settings.server.bind,
        http_port = settings.server.http_port,
        proxy_port = settings.server.proxy_port,
        sub_path = %settings.server.sub_path,
        file_route = ?settings.server.file_route,
        "Server configuration"
    );
    info!(
        work_dir = %settings.paths.work_dir,
        share_dir = %settings.paths.share_dir,
        grace_secs = settings.lifecycle.grace_period_secs,
        telemetry = settings.telemetry.credentials().is_some(),
        "Lifecycle configuration"
    );
}
