//! Detached process launch
//!
//! Launched binaries have no channel back to this process. The child handle is
//! dropped right after spawning and the process keeps running on its own.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use crate::artifacts::{ArtifactLayout, AGENT_BINARY, LEGACY_AGENT_BINARY, PROXY_BINARY};
use crate::config::ProvisioningContext;
use crate::synth::is_tls_port;

/// Where a launched process writes stdout and stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Null,
    /// Append to this file, creating it if needed
    File(PathBuf),
}

impl LogSink {
    fn streams(&self) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            LogSink::Null => Ok((Stdio::null(), Stdio::null())),
            LogSink::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log: LogSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedProcess {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Spawn `spec` in its own process group and forget about it
    pub fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchedProcess> {
        let (stdout, stderr) = spec.log.streams()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.kill_on_drop(false);

        // Detach from our process group so terminal signals aimed at us
        // do not reach the child
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(name = %spec.name, pid, "Process launched");

        Ok(LaunchedProcess {
            name: spec.name.clone(),
            pid,
        })
    }
}

/// Build the launch order for a run: telemetry agent first, then the proxy.
pub fn plan_launches(ctx: &ProvisioningContext, layout: &ArtifactLayout) -> Vec<LaunchSpec> {
    let mut plan = Vec::with_capacity(2);

    if let Some(creds) = &ctx.telemetry {
        let spec = if let Some(port) = creds.agent_port {
            let mut args = vec![
                "-s".to_string(),
                format!("{}:{}", creds.server, port),
                "-p".to_string(),
                creds.key.clone(),
            ];
            if is_tls_port(&format!("{}:{}", creds.server, port)) {
                args.push("--tls".to_string());
            }
            LaunchSpec {
                name: LEGACY_AGENT_BINARY.to_string(),
                program: layout.path(LEGACY_AGENT_BINARY),
                args,
                log: LogSink::Null,
            }
        } else {
            LaunchSpec {
                name: AGENT_BINARY.to_string(),
                program: layout.path(AGENT_BINARY),
                args: vec![
                    "-c".to_string(),
                    layout.agent_config().display().to_string(),
                ],
                log: LogSink::Null,
            }
        };
        plan.push(spec);
    }

    plan.push(LaunchSpec {
        name: PROXY_BINARY.to_string(),
        program: layout.path(PROXY_BINARY),
        args: vec![
            "-c".to_string(),
            layout.proxy_config().display().to_string(),
        ],
        log: LogSink::File(layout.boot_log()),
    });

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryCredentials;
    use tempfile::TempDir;

    fn context(telemetry: Option<TelemetryCredentials>) -> ProvisioningContext {
        ProvisioningContext {
            work_dir: PathBuf::from("/w"),
            share_dir: PathBuf::from("/s"),
            http_port: 3000,
            proxy_port: 3100,
            internal_port_base: 3001,
            sub_path: "sub".to_string(),
            identity_token: "token".to_string(),
            telemetry,
        }
    }

    #[test]
    fn test_plan_proxy_only() {
        let layout = ArtifactLayout::new("/w", "/s");
        let plan = plan_launches(&context(None), &layout);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].program, PathBuf::from("/w/web"));
        assert_eq!(plan[0].args, vec!["-c", "/w/config.json"]);
        assert_eq!(plan[0].log, LogSink::File(PathBuf::from("/w/boot.log")));
    }

    #[test]
    fn test_plan_v1_agent_uses_sidecar() {
        let layout = ArtifactLayout::new("/w", "/s");
        let creds = TelemetryCredentials {
            server: "nz.example.com:443".to_string(),
            key: "k".to_string(),
            agent_port: None,
        };
        let plan = plan_launches(&context(Some(creds)), &layout);

        let names: Vec<_> = plan.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["php", "web"]);
        assert_eq!(plan[0].args, vec!["-c", "/w/config.yaml"]);
    }

    #[test]
    fn test_plan_legacy_agent_flags() {
        let layout = ArtifactLayout::new("/w", "/s");
        let creds = TelemetryCredentials {
            server: "nz.example.com".to_string(),
            key: "k".to_string(),
            agent_port: Some(443),
        };
        let plan = plan_launches(&context(Some(creds)), &layout);

        assert_eq!(plan[0].name, "npm");
        assert_eq!(
            plan[0].args,
            vec!["-s", "nz.example.com:443", "-p", "k", "--tls"]
        );
    }

    #[test]
    fn test_plan_legacy_agent_without_tls() {
        let layout = ArtifactLayout::new("/w", "/s");
        let creds = TelemetryCredentials {
            server: "nz.example.com".to_string(),
            key: "k".to_string(),
            agent_port: Some(5555),
        };
        let plan = plan_launches(&context(Some(creds)), &layout);
        assert!(!plan[0].args.iter().any(|a| a == "--tls"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_detached_process() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("out.log");
        let spec = LaunchSpec {
            name: "sleeper".to_string(),
            program: PathBuf::from("sleep"),
            args: vec!["1".to_string()],
            log: LogSink::File(log.clone()),
        };

        let launched = ProcessLauncher::new().launch(&spec).unwrap();
        assert_eq!(launched.name, "sleeper");
        assert!(launched.pid > 0);
        assert!(log.exists());
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let tmp = TempDir::new().unwrap();
        let spec = LaunchSpec {
            name: "web".to_string(),
            program: tmp.path().join("web"),
            args: Vec::new(),
            log: LogSink::Null,
        };

        assert!(ProcessLauncher::new().launch(&spec).is_err());
    }
}
