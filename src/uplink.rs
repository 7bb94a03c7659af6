//! Best-effort outbound registrations
//!
//! Nothing here can fail a run: every error is logged and swallowed.

use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::UplinkSettings;

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Share-link schemes picked out of the node list
const NODE_SCHEMES: &[&str] = &["vless://", "vmess://", "trojan://", "hysteria2://", "tuic://"];

/// One pending POST
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub endpoint: String,
    pub body: serde_json::Value,
}

/// Decide what to announce.
///
/// With a project URL the subscription URL is registered. Without one, the
/// share links found in `node_list` are uploaded instead.
pub fn plan_announcement(
    settings: &UplinkSettings,
    sub_path: &str,
    node_list: Option<&str>,
) -> Option<Announcement> {
    let upload = settings.upload_url.as_deref()?.trim_end_matches('/');

    if let Some(project) = settings.project_url.as_deref() {
        let subscription = format!("{}/{}", project.trim_end_matches('/'), sub_path);
        return Some(Announcement {
            endpoint: format!("{}/api/add-subscriptions", upload),
            body: json!({ "subscription": [subscription] }),
        });
    }

    let nodes: Vec<&str> = node_list?
        .lines()
        .filter(|line| NODE_SCHEMES.iter().any(|scheme| line.contains(scheme)))
        .collect();
    if nodes.is_empty() {
        return None;
    }

    Some(Announcement {
        endpoint: format!("{}/api/add-nodes", upload),
        body: json!({ "nodes": nodes }),
    })
}

pub struct Uplink {
    client: Client,
    settings: UplinkSettings,
}

impl Uplink {
    pub fn new(settings: UplinkSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, settings }
    }

    /// Register the subscription or upload nodes. Returns whether the target
    /// accepted the request.
    pub async fn announce(&self, sub_path: &str, list_file: &Path) -> bool {
        if self.settings.upload_url.is_none() {
            debug!("No upload target configured");
            return false;
        }

        let node_list = if self.settings.project_url.is_none() {
            tokio::fs::read_to_string(list_file).await.ok()
        } else {
            None
        };

        match plan_announcement(&self.settings, sub_path, node_list.as_deref()) {
            Some(announcement) => self.post(&announcement.endpoint, &announcement.body).await,
            None => {
                debug!(path = %list_file.display(), "Nothing to announce");
                false
            }
        }
    }

    /// Ask the keepalive service to poll the project URL
    pub async fn register_keepalive(&self) -> bool {
        let project = match (&self.settings.project_url, self.settings.auto_access) {
            (Some(project), true) => project,
            _ => {
                info!("Skipping keepalive registration");
                return false;
            }
        };

        let body = json!({ "url": project });
        self.post(&self.settings.keepalive_url, &body).await
    }

    async fn post(&self, endpoint: &str, body: &serde_json::Value) -> bool {
        match self.client.post(endpoint).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(endpoint, "Uplink request accepted");
                true
            }
            Ok(response) => {
                warn!(endpoint, status = %response.status(), "Uplink request rejected");
                false
            }
            Err(e) => {
                warn!(endpoint, error = %e, "Uplink request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(upload: Option<&str>, project: Option<&str>) -> UplinkSettings {
        UplinkSettings {
            upload_url: upload.map(str::to_string),
            project_url: project.map(str::to_string),
            ..UplinkSettings::default()
        }
    }

    #[test]
    fn test_no_upload_url_means_nothing() {
        let s = settings(None, Some("https://app.example.com"));
        assert!(plan_announcement(&s, "sub", Some("vless://x")).is_none());
    }

    #[test]
    fn test_subscription_announcement() {
        let s = settings(Some("https://merge.example.com/"), Some("https://app.example.com/"));
        let a = plan_announcement(&s, "sub", None).unwrap();

        assert_eq!(a.endpoint, "https://merge.example.com/api/add-subscriptions");
        assert_eq!(
            a.body,
            json!({ "subscription": ["https://app.example.com/sub"] })
        );
    }

    #[test]
    fn test_node_announcement_filters_links() {
        let s = settings(Some("https://merge.example.com"), None);
        let list = "vless://a@h:443\n\nnot a link\ntrojan://b@h:443\ntuic://c@h:443\n";
        let a = plan_announcement(&s, "sub", Some(list)).unwrap();

        assert_eq!(a.endpoint, "https://merge.example.com/api/add-nodes");
        assert_eq!(
            a.body,
            json!({ "nodes": ["vless://a@h:443", "trojan://b@h:443", "tuic://c@h:443"] })
        );
    }

    #[test]
    fn test_node_announcement_needs_links() {
        let s = settings(Some("https://merge.example.com"), None);
        assert!(plan_announcement(&s, "sub", Some("nothing here\n")).is_none());
        assert!(plan_announcement(&s, "sub", None).is_none());
    }

    #[tokio::test]
    async fn test_keepalive_skipped_without_auto_access() {
        let uplink = Uplink::new(settings(None, Some("https://app.example.com")));
        assert!(!uplink.register_keepalive().await);
    }

    #[tokio::test]
    async fn test_announce_unreachable_target_is_swallowed() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let base = format!("http://127.0.0.1:{}", port);
        let uplink = Uplink::new(settings(Some(&base), Some("https://app.example.com")));

        assert!(!uplink.announce("sub", Path::new("/nonexistent/list.txt")).await);
    }
}
