//! Well-known paths of everything the pipeline creates
//!
//! Artifacts are tracked by a fixed list of names inside the working directory
//! rather than a registry, so a fresh process can clean up after a previous one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Proxy binary
pub const PROXY_BINARY: &str = "web";
/// Config-file driven telemetry agent
pub const AGENT_BINARY: &str = "php";
/// Flag driven (legacy) telemetry agent
pub const LEGACY_AGENT_BINARY: &str = "npm";
/// Auxiliary binary name left behind by older deployments
pub const AUX_BINARY: &str = "bot";

pub const PROXY_CONFIG: &str = "config.json";
pub const AGENT_CONFIG: &str = "config.yaml";
pub const BOOT_LOG: &str = "boot.log";
pub const LIST_FILE: &str = "list.txt";
pub const SUBSCRIPTION_FILE: &str = "sub.txt";

/// Names removed before provisioning starts
const PRIOR_RUN_LEFTOVERS: &[&str] = &[
    PROXY_BINARY,
    AUX_BINARY,
    LEGACY_AGENT_BINARY,
    AGENT_BINARY,
    BOOT_LOG,
    LIST_FILE,
];

/// Names removed by the lifecycle reaper
const REAPED: &[&str] = &[
    BOOT_LOG,
    PROXY_CONFIG,
    AGENT_CONFIG,
    LIST_FILE,
    PROXY_BINARY,
    AUX_BINARY,
    AGENT_BINARY,
    LEGACY_AGENT_BINARY,
];

/// Outcome of removing one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Missing,
    Failed,
}

/// Layout of the working and share directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    work_dir: PathBuf,
    share_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(work_dir: impl Into<PathBuf>, share_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            share_dir: share_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn share_dir(&self) -> &Path {
        &self.share_dir
    }

    /// Path of a named artifact inside the working directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    pub fn proxy_config(&self) -> PathBuf {
        self.path(PROXY_CONFIG)
    }

    pub fn agent_config(&self) -> PathBuf {
        self.path(AGENT_CONFIG)
    }

    pub fn boot_log(&self) -> PathBuf {
        self.path(BOOT_LOG)
    }

    pub fn list_file(&self) -> PathBuf {
        self.path(LIST_FILE)
    }

    /// Subscription file, kept in the share directory so it outlives the reaper
    pub fn subscription_file(&self) -> PathBuf {
        self.share_dir.join(SUBSCRIPTION_FILE)
    }

    pub fn prior_run_leftovers(&self) -> Vec<PathBuf> {
        PRIOR_RUN_LEFTOVERS.iter().map(|name| self.path(name)).collect()
    }

    pub fn reapable(&self) -> Vec<PathBuf> {
        REAPED.iter().map(|name| self.path(name)).collect()
    }

    /// Create the working and share directories if absent
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.work_dir, &self.share_dir] {
            if dir.is_dir() {
                debug!(path = %dir.display(), "Directory already exists");
                continue;
            }
            std::fs::create_dir_all(dir).map_err(|e| {
                anyhow::anyhow!("Failed to create directory '{}': {}", dir.display(), e)
            })?;
            debug!(path = %dir.display(), "Directory created");
        }
        Ok(())
    }
}

/// Remove a file or directory tree, never failing
pub async fn remove_path(path: &Path) -> Removal {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Removal::Missing,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to inspect artifact");
            return Removal::Failed;
        }
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Removal::Removed,
        Err(e) if e.kind() == ErrorKind::NotFound => Removal::Missing,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            Removal::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reapable_paths_live_in_work_dir() {
        let layout = ArtifactLayout::new("/w", "/s");
        for path in layout.reapable() {
            assert!(path.starts_with("/w"));
        }
        assert!(layout.reapable().contains(&PathBuf::from("/w/config.json")));
        assert!(!layout.reapable().contains(&PathBuf::from("/w/sub.txt")));
    }

    #[test]
    fn test_ensure_dirs_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path().join("a/b"), tmp.path().join("share"));

        layout.ensure_dirs().unwrap();
        layout.ensure_dirs().unwrap();

        assert!(layout.work_dir().is_dir());
        assert!(layout.share_dir().is_dir());
    }

    #[test]
    fn test_ensure_dirs_fails_on_file_in_the_way() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let layout = ArtifactLayout::new(blocker.join("work"), tmp.path().join("share"));

        assert!(layout.ensure_dirs().is_err());
    }

    #[tokio::test]
    async fn test_remove_path_variants() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        let dir = tmp.path().join("dir");
        std::fs::write(&file, "x").unwrap();
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/inner"), "y").unwrap();

        assert_eq!(remove_path(&file).await, Removal::Removed);
        assert_eq!(remove_path(&dir).await, Removal::Removed);
        assert_eq!(remove_path(&file).await, Removal::Missing);
        assert!(!dir.exists());
    }
}
