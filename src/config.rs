use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::IdentityStore;

/// Settings for one provisioning run.
///
/// Loaded from an optional TOML file, then overridden by environment
/// variables (see [`Settings::apply_env`]).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Listener and routing settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Filesystem layout
    #[serde(default)]
    pub paths: PathSettings,

    /// Identity token settings
    #[serde(default)]
    pub identity: IdentitySettings,

    /// Optional telemetry agent credentials
    #[serde(default)]
    pub telemetry: TelemetrySettings,

    /// Best-effort outbound registrations
    #[serde(default)]
    pub uplink: UplinkSettings,

    /// Architecture-specific download URLs
    #[serde(default)]
    pub downloads: DownloadSources,

    /// Timing of the settle delay and the artifact purge
    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    /// Share-link generation
    #[serde(default)]
    pub links: LinkSettings,
}

/// How the artifact server maps request paths onto the share directory
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileRouteKind {
    /// `GET /{relative path}` serves any file under the share directory
    #[default]
    Share,
    /// `GET /{sub_path}` serves the subscription file only
    Subscription,
}

impl FileRouteKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "share" => Some(Self::Share),
            "subscription" | "sub" => Some(Self::Subscription),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Bind address for the artifact server (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public HTTP port of the artifact server (default: 3000)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Public ingress port of the proxy binary (default: 3100)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// First of the four loopback ingress ports (default: 3001)
    #[serde(default = "default_internal_port_base")]
    pub internal_port_base: u16,

    /// Token naming the file route (default: "sub")
    #[serde(default = "default_sub_path")]
    pub sub_path: String,

    /// File route strategy (default: share)
    #[serde(default)]
    pub file_route: FileRouteKind,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            proxy_port: default_proxy_port(),
            internal_port_base: default_internal_port_base(),
            sub_path: default_sub_path(),
            file_route: FileRouteKind::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    /// Working directory for binaries, configs and logs (default: ./.cache)
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Directory the artifact server reads from (default: ./share)
    #[serde(default = "default_share_dir")]
    pub share_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            share_dir: default_share_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IdentitySettings {
    /// Fixed identity token; skips the sidecar file entirely
    pub token: Option<String>,

    /// Sidecar file persisting a generated token (default: `.uuid` next to the executable)
    pub file: Option<String>,
}

impl IdentitySettings {
    pub fn sidecar_path(&self) -> PathBuf {
        if let Some(ref file) = self.file {
            return PathBuf::from(file);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".uuid")
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetrySettings {
    /// Agent server address (`host:port` for v1 agents, `host` for legacy agents)
    pub server: Option<String>,

    /// Agent secret
    pub key: Option<String>,

    /// Legacy agent port; selects the flag-driven agent when set
    pub port: Option<u16>,
}

impl TelemetrySettings {
    /// Credentials are present only when both server and key are non-empty
    pub fn credentials(&self) -> Option<TelemetryCredentials> {
        let server = self.server.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let key = self.key.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some(TelemetryCredentials {
            server: server.to_string(),
            key: key.to_string(),
            agent_port: self.port,
        })
    }
}

/// Telemetry credentials resolved for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryCredentials {
    pub server: String,
    pub key: String,
    pub agent_port: Option<u16>,
}

impl TelemetryCredentials {
    /// Legacy agents take their settings as flags instead of a sidecar document
    pub fn is_legacy(&self) -> bool {
        self.agent_port.is_some()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UplinkSettings {
    /// Base URL of the upload target
    pub upload_url: Option<String>,

    /// Externally reachable URL of this deployment
    pub project_url: Option<String>,

    /// Register `project_url` with the keepalive service (default: false)
    #[serde(default)]
    pub auto_access: bool,

    /// Keepalive registration endpoint
    #[serde(default = "default_keepalive_url")]
    pub keepalive_url: String,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            upload_url: None,
            project_url: None,
            auto_access: false,
            keepalive_url: default_keepalive_url(),
        }
    }
}

/// Inputs for the generated share links
#[derive(Debug, Deserialize, Clone)]
pub struct LinkSettings {
    /// Public domain fronting the websocket ingresses; falls back to the
    /// host of `uplink.project_url`
    pub domain: Option<String>,

    /// Address clients dial (default: cdns.doon.eu.org)
    #[serde(default = "default_edge_host")]
    pub edge_host: String,

    /// Port clients dial (default: 443)
    #[serde(default = "default_edge_port")]
    pub edge_port: u16,

    /// Label appended to each link
    pub name: Option<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            domain: None,
            edge_host: default_edge_host(),
            edge_port: default_edge_port(),
            name: None,
        }
    }
}

/// Download URLs for every binary, per architecture
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadSources {
    #[serde(default = "default_proxy_arm")]
    pub proxy_arm: String,
    #[serde(default = "default_proxy_amd")]
    pub proxy_amd: String,
    #[serde(default = "default_agent_arm")]
    pub agent_arm: String,
    #[serde(default = "default_agent_amd")]
    pub agent_amd: String,
    #[serde(default = "default_legacy_agent_arm")]
    pub legacy_agent_arm: String,
    #[serde(default = "default_legacy_agent_amd")]
    pub legacy_agent_amd: String,

    /// Expected SHA-256 (hex) of the proxy binary, checked after download
    pub proxy_sha256: Option<String>,
}

impl Default for DownloadSources {
    fn default() -> Self {
        Self {
            proxy_arm: default_proxy_arm(),
            proxy_amd: default_proxy_amd(),
            agent_arm: default_agent_arm(),
            agent_amd: default_agent_amd(),
            legacy_agent_arm: default_legacy_agent_arm(),
            legacy_agent_amd: default_legacy_agent_amd(),
            proxy_sha256: None,
        }
    }
}

impl DownloadSources {
    /// Point every URL at `{base}/{arm|amd}/{web|v1|agent}`
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            proxy_arm: format!("{base}/arm/web"),
            proxy_amd: format!("{base}/amd/web"),
            agent_arm: format!("{base}/arm/v1"),
            agent_amd: format!("{base}/amd/v1"),
            legacy_agent_arm: format!("{base}/arm/agent"),
            legacy_agent_amd: format!("{base}/amd/agent"),
            proxy_sha256: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleSettings {
    /// Delay before provisioned artifacts are deleted (default: 90)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Pause after launching, before dependent outbound calls (default: 5)
    #[serde(default = "default_settle")]
    pub settle_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            settle_secs: default_settle(),
        }
    }
}

impl LifecycleSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

fn default_edge_host() -> String {
    "cdns.doon.eu.org".to_string()
}

fn default_edge_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_proxy_port() -> u16 {
    3100
}

fn default_internal_port_base() -> u16 {
    3001
}

fn default_sub_path() -> String {
    "sub".to_string()
}

fn default_work_dir() -> String {
    "./.cache".to_string()
}

fn default_share_dir() -> String {
    "./share".to_string()
}

fn default_keepalive_url() -> String {
    "https://keep.gvrander.eu.org/add-url".to_string()
}

fn default_proxy_arm() -> String {
    "https://arm64.ssss.nyc.mn/web".to_string()
}

fn default_proxy_amd() -> String {
    "https://amd64.ssss.nyc.mn/web".to_string()
}

fn default_agent_arm() -> String {
    "https://arm64.ssss.nyc.mn/v1".to_string()
}

fn default_agent_amd() -> String {
    "https://amd64.ssss.nyc.mn/v1".to_string()
}

fn default_legacy_agent_arm() -> String {
    "https://arm64.ssss.nyc.mn/agent".to_string()
}

fn default_legacy_agent_amd() -> String {
    "https://amd64.ssss.nyc.mn/agent".to_string()
}

fn default_grace_period() -> u64 {
    90
}

fn default_settle() -> u64 {
    5
}

/// Treat empty environment values as unset
fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_port(name: &str, value: &str) -> anyhow::Result<u16> {
    value
        .parse::<u16>()
        .map_err(|e| anyhow::anyhow!("{} must be a port number, got '{}': {}", name, value, e))
}

fn parse_secs(name: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse::<u64>()
        .map_err(|e| anyhow::anyhow!("{} must be a number of seconds, got '{}': {}", name, value, e))
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        let mut settings = Settings::default();
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Override fields from environment-style lookups
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));

        if let Some(v) = get("FILE_PATH") {
            self.paths.work_dir = v;
        }
        if let Some(v) = get("SHARE_PATH") {
            self.paths.share_dir = v;
        }
        if let Some(v) = get("HTTP_PORT") {
            self.server.http_port = parse_port("HTTP_PORT", &v)?;
        }
        if let Some(v) = get("SERVER_PORT").or_else(|| get("PORT")) {
            self.server.proxy_port = parse_port("SERVER_PORT", &v)?;
        }
        if let Some(v) = get("SUB_PATH") {
            self.server.sub_path = v;
        }
        if let Some(v) = get("FILE_ROUTE") {
            self.server.file_route = FileRouteKind::parse(&v)
                .ok_or_else(|| anyhow::anyhow!("FILE_ROUTE must be 'share' or 'subscription', got '{}'", v))?;
        }
        if let Some(v) = get("UUID") {
            self.identity.token = Some(v);
        }
        if let Some(v) = get("UUID_FILE") {
            self.identity.file = Some(v);
        }
        if let Some(v) = get("NEZHA_SERVER") {
            self.telemetry.server = Some(v);
        }
        if let Some(v) = get("NEZHA_KEY") {
            self.telemetry.key = Some(v);
        }
        if let Some(v) = get("NEZHA_PORT") {
            self.telemetry.port = Some(parse_port("NEZHA_PORT", &v)?);
        }
        if let Some(v) = get("UPLOAD_URL") {
            self.uplink.upload_url = Some(v);
        }
        if let Some(v) = get("PROJECT_URL") {
            self.uplink.project_url = Some(v);
        }
        if let Some(v) = get("AUTO_ACCESS") {
            self.uplink.auto_access = v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("KEEPALIVE_URL") {
            self.uplink.keepalive_url = v;
        }
        if let Some(v) = get("ARGO_DOMAIN") {
            self.links.domain = Some(v);
        }
        if let Some(v) = get("CFIP") {
            self.links.edge_host = v;
        }
        if let Some(v) = get("CFPORT") {
            self.links.edge_port = parse_port("CFPORT", &v)?;
        }
        if let Some(v) = get("NAME") {
            self.links.name = Some(v);
        }
        if let Some(v) = get("GRACE_PERIOD_SECS") {
            self.lifecycle.grace_period_secs = parse_secs("GRACE_PERIOD_SECS", &v)?;
        }
        if let Some(v) = get("SETTLE_SECS") {
            self.lifecycle.settle_secs = parse_secs("SETTLE_SECS", &v)?;
        }

        Ok(())
    }

    /// Validate the settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.proxy_port == 0 {
            anyhow::bail!("proxy_port must be non-zero");
        }
        if self.server.internal_port_base == 0 || self.server.internal_port_base > u16::MAX - 3 {
            anyhow::bail!(
                "internal_port_base {} leaves no room for four loopback ingresses",
                self.server.internal_port_base
            );
        }
        let sub_path = self.server.sub_path.as_str();
        if sub_path.is_empty() || sub_path.contains('/') || sub_path == "." || sub_path == ".." {
            anyhow::bail!("sub_path must be a single non-empty path segment, got '{}'", sub_path);
        }
        if self.paths.work_dir.trim().is_empty() {
            anyhow::bail!("work_dir must not be empty");
        }
        if self.paths.share_dir.trim().is_empty() {
            anyhow::bail!("share_dir must not be empty");
        }
        if let Some(ref digest) = self.downloads.proxy_sha256 {
            if digest.len() != 64 || hex::decode(digest).is_err() {
                anyhow::bail!("proxy_sha256 must be 64 hex characters");
            }
        }
        Ok(())
    }
}

/// Immutable per-run context handed to every pipeline component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningContext {
    pub work_dir: PathBuf,
    pub share_dir: PathBuf,
    pub http_port: u16,
    pub proxy_port: u16,
    pub internal_port_base: u16,
    pub sub_path: String,
    pub identity_token: String,
    pub telemetry: Option<TelemetryCredentials>,
}

impl ProvisioningContext {
    /// Build the context, resolving the identity token from the override or sidecar
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let identity_token = match settings.identity.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => IdentityStore::new(settings.identity.sidecar_path()).load_or_create()?,
        };
        Ok(Self::with_token(settings, identity_token))
    }

    /// Build the context with an already-resolved identity token
    pub fn with_token(settings: &Settings, identity_token: String) -> Self {
        Self {
            work_dir: PathBuf::from(&settings.paths.work_dir),
            share_dir: PathBuf::from(&settings.paths.share_dir),
            http_port: settings.server.http_port,
            proxy_port: settings.server.proxy_port,
            internal_port_base: settings.server.internal_port_base,
            sub_path: settings.server.sub_path.clone(),
            identity_token,
            telemetry: settings.telemetry.credentials(),
        }
    }
}
