//! Binary download
//!
//! Binaries are streamed to disk chunk by chunk so large payloads never sit in
//! memory. A failed download never leaves a partial file behind.

use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::arch::ArchitectureVariant;
use crate::artifacts::{ArtifactLayout, AGENT_BINARY, LEGACY_AGENT_BINARY, PROXY_BINARY};
use crate::config::{DownloadSources, TelemetryCredentials};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

/// Permissions given to downloaded binaries
#[cfg(unix)]
const EXECUTABLE_MODE: u32 = 0o775;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {name} to {url} failed: {source}")]
    Transport {
        name: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status} for {name}")]
    Status {
        name: String,
        url: String,
        status: StatusCode,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },
}

/// One binary to download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    /// Logical name, also the file name in the working directory
    pub name: String,
    pub url: String,
    pub dest: PathBuf,
    /// Expected SHA-256 of the payload, hex encoded
    pub sha256: Option<String>,
}

/// Build the ordered download batch for a run.
///
/// The telemetry agent, when credentials are present, comes first and the
/// proxy binary last.
pub fn plan_downloads(
    variant: ArchitectureVariant,
    telemetry: Option<&TelemetryCredentials>,
    sources: &DownloadSources,
    layout: &ArtifactLayout,
) -> Vec<DownloadSpec> {
    let pick = |arm: &str, amd: &str| match variant {
        ArchitectureVariant::Arm => arm.to_string(),
        ArchitectureVariant::Amd => amd.to_string(),
    };

    let mut batch = Vec::with_capacity(2);

    if let Some(creds) = telemetry {
        let (name, url) = if creds.is_legacy() {
            (
                LEGACY_AGENT_BINARY,
                pick(&sources.legacy_agent_arm, &sources.legacy_agent_amd),
            )
        } else {
            (AGENT_BINARY, pick(&sources.agent_arm, &sources.agent_amd))
        };
        batch.push(DownloadSpec {
            name: name.to_string(),
            url,
            dest: layout.path(name),
            sha256: None,
        });
    }

    batch.push(DownloadSpec {
        name: PROXY_BINARY.to_string(),
        url: pick(&sources.proxy_arm, &sources.proxy_amd),
        dest: layout.path(PROXY_BINARY),
        sha256: sources.proxy_sha256.as_ref().map(|s| s.to_ascii_lowercase()),
    });

    batch
}

/// Streams binaries from their source URLs
pub struct ArtifactFetcher {
    client: Client,
}

impl ArtifactFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client)
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Download one binary, returning the number of bytes written.
    ///
    /// On any failure the destination file is removed.
    pub async fn fetch(&self, spec: &DownloadSpec) -> Result<u64, FetchError> {
        debug!(name = %spec.name, url = %spec.url, dest = %spec.dest.display(), "Downloading");

        match self.stream_to_file(spec).await {
            Ok(written) => {
                info!(name = %spec.name, bytes = written, "Download succeeded");
                Ok(written)
            }
            Err(e) => {
                discard_partial(&spec.dest).await;
                error!(name = %spec.name, error = %e, "Download failed");
                Err(e)
            }
        }
    }

    /// Download a batch in order, stopping at the first failure.
    ///
    /// Files fetched before the failure are left in place.
    pub async fn fetch_all(&self, batch: &[DownloadSpec]) -> Result<Vec<PathBuf>, FetchError> {
        let mut fetched = Vec::with_capacity(batch.len());
        for spec in batch {
            self.fetch(spec).await?;
            fetched.push(spec.dest.clone());
        }
        Ok(fetched)
    }

    async fn stream_to_file(&self, spec: &DownloadSpec) -> Result<u64, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            name: spec.name.clone(),
            url: spec.url.clone(),
            source,
        };
        let io = |source: std::io::Error| FetchError::Io {
            path: spec.dest.clone(),
            source,
        };

        let mut response = self.client.get(&spec.url).send().await.map_err(transport)?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                name: spec.name.clone(),
                url: spec.url.clone(),
                status: response.status(),
            });
        }

        let mut file = tokio::fs::File::create(&spec.dest).await.map_err(io)?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            file.write_all(&chunk).await.map_err(io)?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io)?;

        if let Some(ref expected) = spec.sha256 {
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                return Err(FetchError::Integrity {
                    name: spec.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(written)
    }
}

impl Default for ArtifactFetcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

/// Mark a downloaded binary executable
pub fn make_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(EXECUTABLE_MODE))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::metadata(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn creds(agent_port: Option<u16>) -> TelemetryCredentials {
        TelemetryCredentials {
            server: "nz.example.com:8008".to_string(),
            key: "secret".to_string(),
            agent_port,
        }
    }

    #[test]
    fn test_plan_without_telemetry_is_proxy_only() {
        let layout = ArtifactLayout::new("/w", "/s");
        let sources = DownloadSources::from_base("http://dl");

        let batch = plan_downloads(ArchitectureVariant::Amd, None, &sources, &layout);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "web");
        assert_eq!(batch[0].url, "http://dl/amd/web");
        assert_eq!(batch[0].dest, PathBuf::from("/w/web"));
    }

    #[test]
    fn test_plan_with_telemetry_puts_agent_first() {
        let layout = ArtifactLayout::new("/w", "/s");
        let sources = DownloadSources::from_base("http://dl");

        let batch = plan_downloads(ArchitectureVariant::Arm, Some(&creds(None)), &sources, &layout);
        let names: Vec<_> = batch.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["php", "web"]);
        assert_eq!(batch[0].url, "http://dl/arm/v1");
        assert_eq!(batch[1].url, "http://dl/arm/web");
    }

    #[test]
    fn test_plan_with_legacy_agent() {
        let layout = ArtifactLayout::new("/w", "/s");
        let sources = DownloadSources::from_base("http://dl");

        let batch = plan_downloads(ArchitectureVariant::Amd, Some(&creds(Some(5555))), &sources, &layout);
        assert_eq!(batch[0].name, "npm");
        assert_eq!(batch[0].url, "http://dl/amd/agent");
    }

    #[test]
    fn test_plan_carries_lowercased_digest() {
        let layout = ArtifactLayout::new("/w", "/s");
        let mut sources = DownloadSources::from_base("http://dl");
        sources.proxy_sha256 = Some("AB".repeat(32));

        let batch = plan_downloads(ArchitectureVariant::Amd, None, &sources, &layout);
        assert_eq!(batch[0].sha256, Some("ab".repeat(32)));
    }

    #[tokio::test]
    async fn test_transport_error_leaves_no_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("web");
        std::fs::write(&dest, "stale").unwrap();

        // Reserve a port and close it so the connection is refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let spec = DownloadSpec {
            name: "web".to_string(),
            url: format!("http://127.0.0.1:{}/web", port),
            dest: dest.clone(),
            sha256: None,
        };

        let err = ArtifactFetcher::new().fetch(&spec).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
        assert!(!dest.exists());
    }

    /// Answer a single request with `body`, returning the URL to fetch
    async fn serve_once(body: &'static [u8]) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
            let _ = stream.shutdown().await;
        });
        format!("http://{}/web", addr)
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_download() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("web");
        let spec = DownloadSpec {
            name: "web".to_string(),
            url: serve_once(b"abc").await,
            dest: dest.clone(),
            sha256: Some("0".repeat(64)),
        };

        let err = ArtifactFetcher::new().fetch(&spec).await.unwrap_err();
        match err {
            FetchError::Integrity { name, actual, .. } => {
                assert_eq!(name, "web");
                assert_eq!(
                    actual,
                    "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
                );
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_matching_checksum_keeps_download() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("web");
        let spec = DownloadSpec {
            name: "web".to_string(),
            url: serve_once(b"abc").await,
            dest: dest.clone(),
            sha256: Some(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string(),
            ),
        };

        ArtifactFetcher::new().fetch(&spec).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bin");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        make_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o775);
    }

    #[test]
    fn test_make_executable_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(make_executable(&tmp.path().join("absent")).is_err());
    }
}
