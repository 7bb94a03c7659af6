//! Pipeline sequencing
//!
//! One run goes cleanup → directories → provision → links → serve → arm the reaper.
//! Provisioning failures are contained in the [`ProvisionReport`]; only a
//! missing directory or an unbindable listener stops the run.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::arch::ArchitectureVariant;
use crate::artifacts::{remove_path, ArtifactLayout, Removal};
use crate::config::{ProvisioningContext, Settings};
use crate::fetch::{make_executable, plan_downloads, ArtifactFetcher};
use crate::launch::{plan_launches, LaunchedProcess, ProcessLauncher};
use crate::links::{share_links, write_links, LinkTarget};
use crate::reaper::{LifecycleReaper, ReapReport};
use crate::server::{ArtifactServer, FileRoute};
use crate::synth::synthesize;
use crate::uplink::Uplink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    CleaningPriorState,
    DirectoriesEnsured,
    Provisioned,
    Serving,
    ReapScheduled,
}

/// What happened during provisioning
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub variant: ArchitectureVariant,
    pub downloaded: Vec<PathBuf>,
    /// Set when the download batch stopped early
    pub fetch_error: Option<String>,
    pub configs_written: bool,
    pub launched: Vec<LaunchedProcess>,
    pub launch_failures: Vec<String>,
    /// `list.txt` and `sub.txt` were written
    pub links_written: bool,
    pub announced: bool,
}

impl ProvisionReport {
    fn new(variant: ArchitectureVariant) -> Self {
        Self {
            variant,
            downloaded: Vec::new(),
            fetch_error: None,
            configs_written: false,
            launched: Vec::new(),
            launch_failures: Vec::new(),
            links_written: false,
            announced: false,
        }
    }

    /// Every binary fetched, configured and launched
    pub fn is_complete(&self) -> bool {
        self.fetch_error.is_none() && self.configs_written && self.launch_failures.is_empty()
    }
}

/// Handles to the tasks left running after [`Orchestrator::start`]
pub struct Supervisor {
    pub local_addr: SocketAddr,
    pub server: JoinHandle<anyhow::Result<()>>,
    pub reaper: JoinHandle<ReapReport>,
    pub report: ProvisionReport,
}

pub struct Orchestrator {
    settings: Settings,
    ctx: ProvisioningContext,
    layout: ArtifactLayout,
    fetcher: ArtifactFetcher,
    launcher: ProcessLauncher,
    uplink: Uplink,
    state: PipelineState,
}

impl Orchestrator {
    pub fn new(settings: Settings, ctx: ProvisioningContext) -> Self {
        let layout = ArtifactLayout::new(&ctx.work_dir, &ctx.share_dir);
        let uplink = Uplink::new(settings.uplink.clone());
        Self {
            settings,
            ctx,
            layout,
            fetcher: ArtifactFetcher::new(),
            launcher: ProcessLauncher::new(),
            uplink,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline state change");
        self.state = next;
    }

    /// Remove leftovers of an earlier run and create the directories.
    ///
    /// Safe to call repeatedly.
    pub async fn prepare(&mut self) -> anyhow::Result<()> {
        self.transition(PipelineState::CleaningPriorState);

        let mut removed = 0;
        for path in self.layout.prior_run_leftovers() {
            if remove_path(&path).await == Removal::Removed {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Removed artifacts from a previous run");
        }

        self.layout.ensure_dirs()?;
        self.transition(PipelineState::DirectoriesEnsured);
        Ok(())
    }

    /// Fetch, configure and launch the binaries, then publish links and announce.
    ///
    /// Never fails: each stage records its outcome in the report.
    pub async fn provision(&mut self) -> ProvisionReport {
        let variant = ArchitectureVariant::detect();
        let mut report = ProvisionReport::new(variant);
        info!(arch = %variant, "Provisioning binaries");

        let batch = plan_downloads(
            variant,
            self.ctx.telemetry.as_ref(),
            &self.settings.downloads,
            &self.layout,
        );

        match self.fetcher.fetch_all(&batch).await {
            Ok(paths) => report.downloaded = paths,
            Err(e) => {
                error!(error = %e, "Provisioning aborted");
                report.fetch_error = Some(e.to_string());
                return report;
            }
        }

        for path in &report.downloaded {
            if let Err(e) = make_executable(path) {
                warn!(path = %path.display(), error = %e, "Failed to set permissions");
            }
        }

        let generated = synthesize(&self.ctx);
        if let Err(e) = generated.write(&self.layout).await {
            error!(error = %e, "Failed to write configuration");
            return report;
        }
        report.configs_written = true;

        for spec in plan_launches(&self.ctx, &self.layout) {
            match self.launcher.launch(&spec) {
                Ok(launched) => report.launched.push(launched),
                Err(e) => {
                    error!(name = %spec.name, error = %e, "Failed to launch");
                    report.launch_failures.push(spec.name.clone());
                }
            }
        }
        self.transition(PipelineState::Provisioned);

        let settle = self.settings.lifecycle.settle();
        if !settle.is_zero() {
            debug!(secs = settle.as_secs(), "Waiting for launched processes to settle");
            tokio::time::sleep(settle).await;
        }

        match LinkTarget::from_settings(&self.settings) {
            Some(target) => {
                let links = share_links(&target, &self.ctx.identity_token);
                match write_links(&self.layout, &links).await {
                    Ok(()) => report.links_written = true,
                    Err(e) => warn!(error = %e, "Failed to write share links"),
                }
            }
            None => debug!("No public domain configured, skipping share links"),
        }

        report.announced = self
            .uplink
            .announce(&self.ctx.sub_path, &self.layout.list_file())
            .await;

        report
    }

    /// Run the whole pipeline and hand back the long-lived tasks
    pub async fn start(mut self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Supervisor> {
        self.prepare().await?;

        let report = self.provision().await;
        if report.is_complete() {
            info!(launched = report.launched.len(), "Provisioning complete");
        } else {
            warn!("Provisioning incomplete; serving files anyway");
        }

        self.uplink.register_keepalive().await;

        let ip: IpAddr = self.settings.server.bind.parse().map_err(|e| {
            anyhow::anyhow!("Invalid bind address '{}': {}", self.settings.server.bind, e)
        })?;
        let route = FileRoute::new(self.settings.server.file_route, &self.ctx.sub_path);
        let server = ArtifactServer::bind(
            SocketAddr::new(ip, self.ctx.http_port),
            route,
            self.layout.share_dir(),
            shutdown_rx,
        )
        .await?;
        let local_addr = server.local_addr()?;
        let server = tokio::spawn(server.run());
        self.transition(PipelineState::Serving);

        let reaper = LifecycleReaper::new(
            self.layout.reapable(),
            self.settings.lifecycle.grace_period(),
        )
        .arm();
        self.transition(PipelineState::ReapScheduled);

        Ok(Supervisor {
            local_addr,
            server,
            reaper,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn orchestrator(tmp: &TempDir) -> Orchestrator {
        let mut settings = Settings::default();
        settings.paths.work_dir = tmp.path().join("work").display().to_string();
        settings.paths.share_dir = tmp.path().join("share").display().to_string();
        let ctx = ProvisioningContext::with_token(&settings, "token".to_string());
        Orchestrator::new(settings, ctx)
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut orch = orchestrator(&tmp);
        assert_eq!(orch.state(), PipelineState::Idle);

        orch.prepare().await.unwrap();
        let leftover = orch.layout().path("web");
        std::fs::write(&leftover, "old").unwrap();
        let kept = orch.layout().share_dir().join("sub.txt");
        std::fs::write(&kept, "sub").unwrap();

        orch.prepare().await.unwrap();
        assert_eq!(orch.state(), PipelineState::DirectoriesEnsured);
        assert!(!leftover.exists());
        assert!(kept.exists());
        assert!(orch.layout().work_dir().is_dir());
    }

    #[tokio::test]
    async fn test_prepare_fails_when_directory_cannot_be_created() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("work"), "not a dir").unwrap();
        let mut orch = orchestrator(&tmp);

        assert!(orch.prepare().await.is_err());
        assert_eq!(orch.state(), PipelineState::CleaningPriorState);
    }

    #[test]
    fn test_report_completeness() {
        let mut report = ProvisionReport::new(ArchitectureVariant::Amd);
        assert!(!report.is_complete());

        report.configs_written = true;
        assert!(report.is_complete());

        report.launch_failures.push("web".to_string());
        assert!(!report.is_complete());
    }
}
