//! Share links for the websocket ingresses
//!
//! After launch the node list is written to `list.txt` in the working
//! directory and, base64-encoded, to `sub.txt` in the share directory.

use serde::Serialize;
use tracing::{debug, info};

use crate::artifacts::ArtifactLayout;
use crate::config::Settings;
use crate::synth::{TROJAN_WS_PATH, VLESS_WS_PATH, VMESS_WS_PATH};

/// Label used when no name is configured
const DEFAULT_LABEL: &str = "ephemera";

/// Early-data hint appended to every websocket path
const EARLY_DATA: &str = "?ed=2560";

const FINGERPRINT: &str = "firefox";

/// Where clients connect and which host they present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    /// Public domain used for SNI and the websocket `Host` header
    pub domain: String,
    pub edge_host: String,
    pub edge_port: u16,
    pub label: String,
}

impl LinkTarget {
    /// Build the target from settings.
    ///
    /// The domain is `links.domain`, else the host of `uplink.project_url`.
    /// Returns `None` when neither is set.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let domain = settings
            .links
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .or_else(|| {
                settings
                    .uplink
                    .project_url
                    .as_deref()
                    .and_then(|url| reqwest::Url::parse(url).ok())
                    .and_then(|url| url.host_str().map(str::to_string))
            })?;

        let label = settings
            .links
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_LABEL)
            .to_string();

        Some(Self {
            domain,
            edge_host: settings.links.edge_host.clone(),
            edge_port: settings.links.edge_port,
            label,
        })
    }
}

/// Share descriptor for the vmess ingress, serialized then base64-encoded
#[derive(Debug, Serialize)]
struct VmessShare<'a> {
    v: &'a str,
    ps: &'a str,
    add: &'a str,
    port: String,
    id: &'a str,
    aid: &'a str,
    scy: &'a str,
    net: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    host: &'a str,
    path: String,
    tls: &'a str,
    sni: &'a str,
    alpn: &'a str,
    fp: &'a str,
}

/// vless, vmess and trojan links, in that order
pub fn share_links(target: &LinkTarget, token: &str) -> Vec<String> {
    let label = urlencoding::encode(&target.label);
    let ws_query = |path: &str| {
        format!(
            "security=tls&sni={domain}&fp={FINGERPRINT}&type=ws&host={domain}&path={path}",
            domain = target.domain,
            path = urlencoding::encode(&format!("{path}{EARLY_DATA}")),
        )
    };

    let vless = format!(
        "vless://{token}@{}:{}?encryption=none&{}#{label}",
        target.edge_host,
        target.edge_port,
        ws_query(VLESS_WS_PATH),
    );

    let vmess_share = VmessShare {
        v: "2",
        ps: &target.label,
        add: &target.edge_host,
        port: target.edge_port.to_string(),
        id: token,
        aid: "0",
        scy: "none",
        net: "ws",
        kind: "none",
        host: &target.domain,
        path: format!("{VMESS_WS_PATH}{EARLY_DATA}"),
        tls: "tls",
        sni: &target.domain,
        alpn: "",
        fp: FINGERPRINT,
    };
    let vmess_json = serde_json::to_string(&vmess_share).unwrap_or_default();
    let vmess = format!(
        "vmess://{}",
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, vmess_json)
    );

    let trojan = format!(
        "trojan://{token}@{}:{}?{}#{label}",
        target.edge_host,
        target.edge_port,
        ws_query(TROJAN_WS_PATH),
    );

    vec![vless, vmess, trojan]
}

/// Write the plain node list and the base64 subscription
pub async fn write_links(layout: &ArtifactLayout, links: &[String]) -> anyhow::Result<()> {
    let list = links.join("\n");

    let list_path = layout.list_file();
    tokio::fs::write(&list_path, format!("{list}\n"))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write '{}': {}", list_path.display(), e))?;
    debug!(path = %list_path.display(), "Node list written");

    let sub_path = layout.subscription_file();
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &list);
    tokio::fs::write(&sub_path, encoded)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write '{}': {}", sub_path.display(), e))?;

    info!(count = links.len(), path = %sub_path.display(), "Subscription written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TOKEN: &str = "9afd1229-b893-40c1-84dd-51e7ce204913";

    fn target() -> LinkTarget {
        LinkTarget {
            domain: "edge.example.com".to_string(),
            edge_host: "cdns.doon.eu.org".to_string(),
            edge_port: 443,
            label: "Node A".to_string(),
        }
    }

    fn decode(encoded: &str) -> Vec<u8> {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).unwrap()
    }

    #[test]
    fn test_target_requires_a_domain() {
        assert!(LinkTarget::from_settings(&Settings::default()).is_none());

        let mut settings = Settings::default();
        settings.links.domain = Some("   ".to_string());
        assert!(LinkTarget::from_settings(&settings).is_none());
    }

    #[test]
    fn test_target_falls_back_to_project_url_host() {
        let mut settings = Settings::default();
        settings.uplink.project_url = Some("https://app.example.org:8443/base".to_string());

        let target = LinkTarget::from_settings(&settings).unwrap();
        assert_eq!(target.domain, "app.example.org");
        assert_eq!(target.label, DEFAULT_LABEL);
        assert_eq!(target.edge_port, 443);

        settings.links.domain = Some("tunnel.example.net".to_string());
        settings.links.name = Some("eu-1".to_string());
        let target = LinkTarget::from_settings(&settings).unwrap();
        assert_eq!(target.domain, "tunnel.example.net");
        assert_eq!(target.label, "eu-1");
    }

    #[test]
    fn test_share_links() {
        let links = share_links(&target(), TOKEN);
        assert_eq!(links.len(), 3);

        assert_eq!(
            links[0],
            format!(
                "vless://{TOKEN}@cdns.doon.eu.org:443?encryption=none&security=tls\
                 &sni=edge.example.com&fp=firefox&type=ws&host=edge.example.com\
                 &path=%2Fvless-argo%3Fed%3D2560#Node%20A"
            )
        );
        assert!(links[2].starts_with(&format!("trojan://{TOKEN}@cdns.doon.eu.org:443?")));
        assert!(links[2].contains("path=%2Ftrojan-argo%3Fed%3D2560"));

        let vmess = links[1].strip_prefix("vmess://").unwrap();
        let share: serde_json::Value = serde_json::from_slice(&decode(vmess)).unwrap();
        assert_eq!(share["id"], TOKEN);
        assert_eq!(share["add"], "cdns.doon.eu.org");
        assert_eq!(share["host"], "edge.example.com");
        assert_eq!(share["path"], "/vmess-argo?ed=2560");
        assert_eq!(share["type"], "none");
        assert_eq!(share["port"], "443");
    }

    #[tokio::test]
    async fn test_write_links() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path().join("work"), tmp.path().join("share"));
        layout.ensure_dirs().unwrap();

        let links = share_links(&target(), TOKEN);
        write_links(&layout, &links).await.unwrap();

        let list = std::fs::read_to_string(layout.list_file()).unwrap();
        assert_eq!(list.lines().count(), 3);

        let sub = std::fs::read_to_string(layout.subscription_file()).unwrap();
        let decoded = String::from_utf8(decode(&sub)).unwrap();
        assert_eq!(decoded, links.join("\n"));
    }

    #[tokio::test]
    async fn test_write_links_fails_without_directories() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path().join("missing"), tmp.path().join("share"));

        assert!(write_links(&layout, &share_links(&target(), TOKEN)).await.is_err());
    }
}
