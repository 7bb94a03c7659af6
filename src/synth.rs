//! Runtime configuration synthesis
//!
//! Both documents are built from typed structs so field order, and therefore
//! the rendered bytes, depend only on the [`ProvisioningContext`].

use serde::Serialize;
use tracing::debug;

use crate::artifacts::{remove_path, ArtifactLayout, Removal};
use crate::config::{ProvisioningContext, TelemetryCredentials};

/// Server ports on which the telemetry agent talks TLS
const TLS_PORTS: &[u16] = &[443, 8443, 2096, 2087, 2083, 2053];

const LOOPBACK: &str = "127.0.0.1";
const XHTTP_PATH: &str = "/xh";
pub const VLESS_WS_PATH: &str = "/vless-argo";
pub const VMESS_WS_PATH: &str = "/vmess-argo";
pub const TROJAN_WS_PATH: &str = "/trojan-argo";
const DOH_RESOLVER: &str = "https+local://1.1.1.1/dns-query";

/// Whether `server` (`host:port`) points at a TLS port
pub fn is_tls_port(server: &str) -> bool {
    server
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .map(|port| TLS_PORTS.contains(&port))
        .unwrap_or(false)
}

// ==================== Proxy document ====================

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub log: LogBlock,
    pub inbounds: Vec<Inbound>,
    pub dns: DnsBlock,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogBlock {
    pub access: String,
    pub error: String,
    pub loglevel: String,
}

impl LogBlock {
    fn silenced() -> Self {
        Self {
            access: "/dev/null".to_string(),
            error: "/dev/null".to_string(),
            loglevel: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Sniffing>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InboundSettings {
    pub clients: Vec<ClientEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decryption: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Fallback>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u8>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Fallback {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub dest: u16,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<PathBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<PathBlock>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PathBlock {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
    pub metadata_only: bool,
}

impl Sniffing {
    fn standard() -> Self {
        Self {
            enabled: true,
            dest_override: vec!["http".into(), "tls".into(), "quic".into()],
            metadata_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DnsBlock {
    pub servers: Vec<String>,
    pub disable_cache: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Outbound {
    pub protocol: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSettings {
    pub domain_strategy: String,
}

impl ProxyConfig {
    pub fn build(ctx: &ProvisioningContext) -> Self {
        let token = ctx.identity_token.as_str();
        let base = ctx.internal_port_base;

        let with_id = |id: &str| ClientEntry {
            id: Some(id.to_string()),
            ..Default::default()
        };

        let public = Inbound {
            port: ctx.proxy_port,
            listen: None,
            protocol: "vless".to_string(),
            settings: InboundSettings {
                clients: vec![ClientEntry {
                    flow: Some("xtls-rprx-vision".to_string()),
                    ..with_id(token)
                }],
                decryption: Some("none".to_string()),
                fallbacks: vec![
                    Fallback { path: None, dest: base },
                    Fallback { path: Some(VLESS_WS_PATH.to_string()), dest: base + 1 },
                    Fallback { path: Some(VMESS_WS_PATH.to_string()), dest: base + 2 },
                    Fallback { path: Some(TROJAN_WS_PATH.to_string()), dest: base + 3 },
                    Fallback { path: Some(format!("/{}", ctx.sub_path)), dest: ctx.http_port },
                ],
            },
            stream_settings: StreamSettings {
                network: "tcp".to_string(),
                security: None,
                xhttp_settings: None,
                ws_settings: None,
            },
            sniffing: None,
        };

        let xhttp = Inbound {
            port: base,
            listen: Some(LOOPBACK.to_string()),
            protocol: "vless".to_string(),
            settings: InboundSettings {
                clients: vec![ClientEntry { level: Some(0), ..with_id(token) }],
                decryption: Some("none".to_string()),
                fallbacks: Vec::new(),
            },
            stream_settings: StreamSettings {
                network: "xhttp".to_string(),
                security: None,
                xhttp_settings: Some(PathBlock { path: XHTTP_PATH.to_string() }),
                ws_settings: None,
            },
            sniffing: None,
        };

        let vless_ws = ws_inbound(
            base + 1,
            "vless",
            ClientEntry { level: Some(0), ..with_id(token) },
            Some("none"),
            VLESS_WS_PATH,
        );
        let vmess_ws = ws_inbound(
            base + 2,
            "vmess",
            ClientEntry { alter_id: Some(0), ..with_id(token) },
            None,
            VMESS_WS_PATH,
        );
        let trojan_ws = ws_inbound(
            base + 3,
            "trojan",
            ClientEntry {
                password: Some(token.to_string()),
                ..Default::default()
            },
            None,
            TROJAN_WS_PATH,
        );

        Self {
            log: LogBlock::silenced(),
            inbounds: vec![public, xhttp, vless_ws, vmess_ws, trojan_ws],
            dns: DnsBlock {
                servers: vec![DOH_RESOLVER.to_string()],
                disable_cache: true,
            },
            outbounds: vec![
                Outbound {
                    protocol: "freedom".to_string(),
                    tag: "direct".to_string(),
                    settings: Some(OutboundSettings {
                        domain_strategy: "UseIPv4v6".to_string(),
                    }),
                },
                Outbound {
                    protocol: "blackhole".to_string(),
                    tag: "block".to_string(),
                    settings: None,
                },
            ],
        }
    }

    pub fn render(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn ws_inbound(
    port: u16,
    protocol: &str,
    client: ClientEntry,
    decryption: Option<&str>,
    path: &str,
) -> Inbound {
    Inbound {
        port,
        listen: Some(LOOPBACK.to_string()),
        protocol: protocol.to_string(),
        settings: InboundSettings {
            clients: vec![client],
            decryption: decryption.map(str::to_string),
            fallbacks: Vec::new(),
        },
        stream_settings: StreamSettings {
            network: "ws".to_string(),
            security: Some("none".to_string()),
            xhttp_settings: None,
            ws_settings: Some(PathBlock { path: path.to_string() }),
        },
        sniffing: Some(Sniffing::standard()),
    }
}

// ==================== Agent sidecar ====================

/// Config file for the v1 telemetry agent
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub client_secret: String,
    pub debug: bool,
    pub disable_auto_update: bool,
    pub disable_command_execute: bool,
    pub disable_force_update: bool,
    pub disable_nat: bool,
    pub disable_send_query: bool,
    pub gpu: bool,
    pub insecure_tls: bool,
    pub ip_report_period: u64,
    pub report_delay: u32,
    pub server: String,
    pub skip_connection_count: bool,
    pub skip_procs_count: bool,
    pub temperature: bool,
    pub tls: bool,
    pub use_gitee_to_upgrade: bool,
    pub use_ipv6_country_code: bool,
    pub uuid: String,
}

impl AgentConfig {
    /// Sidecar for `creds`, or `None` when the legacy agent is selected
    pub fn build(creds: &TelemetryCredentials, identity_token: &str) -> Option<Self> {
        if creds.is_legacy() {
            return None;
        }
        Some(Self {
            client_secret: creds.key.clone(),
            debug: false,
            disable_auto_update: true,
            disable_command_execute: true,
            disable_force_update: true,
            disable_nat: false,
            disable_send_query: false,
            gpu: false,
            insecure_tls: false,
            ip_report_period: 180_000,
            report_delay: 4,
            server: creds.server.clone(),
            skip_connection_count: true,
            skip_procs_count: true,
            temperature: false,
            tls: is_tls_port(&creds.server),
            use_gitee_to_upgrade: false,
            use_ipv6_country_code: false,
            uuid: identity_token.to_string(),
        })
    }

    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

// ==================== Generated pair ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfig {
    pub proxy: ProxyConfig,
    pub agent: Option<AgentConfig>,
}

/// Build the config documents for a run
pub fn synthesize(ctx: &ProvisioningContext) -> GeneratedConfig {
    GeneratedConfig {
        proxy: ProxyConfig::build(ctx),
        agent: ctx
            .telemetry
            .as_ref()
            .and_then(|creds| AgentConfig::build(creds, &ctx.identity_token)),
    }
}

impl GeneratedConfig {
    /// Write both documents, truncating earlier versions.
    ///
    /// Without an agent document, a sidecar left by an earlier run is removed.
    pub async fn write(&self, layout: &ArtifactLayout) -> anyhow::Result<()> {
        let proxy_path = layout.proxy_config();
        let proxy = self
            .proxy
            .render()
            .map_err(|e| anyhow::anyhow!("Failed to render proxy config: {}", e))?;
        tokio::fs::write(&proxy_path, proxy).await.map_err(|e| {
            anyhow::anyhow!("Failed to write '{}': {}", proxy_path.display(), e)
        })?;
        debug!(path = %proxy_path.display(), "Proxy config written");

        let agent_path = layout.agent_config();
        match &self.agent {
            Some(agent) => {
                let rendered = agent
                    .render()
                    .map_err(|e| anyhow::anyhow!("Failed to render agent config: {}", e))?;
                tokio::fs::write(&agent_path, rendered).await.map_err(|e| {
                    anyhow::anyhow!("Failed to write '{}': {}", agent_path.display(), e)
                })?;
                debug!(path = %agent_path.display(), "Agent config written");
            }
            None => {
                if remove_path(&agent_path).await == Removal::Removed {
                    debug!(path = %agent_path.display(), "Removed stale agent config");
                }
            }
        }

        Ok(())
    }
}
