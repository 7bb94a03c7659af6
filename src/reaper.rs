//! Deferred purge of provisioned artifacts

use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::artifacts::{remove_path, Removal};

/// Counts from one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub removed: usize,
    pub missing: usize,
    pub failed: usize,
}

impl ReapReport {
    fn record(&mut self, outcome: Removal) {
        match outcome {
            Removal::Removed => self.removed += 1,
            Removal::Missing => self.missing += 1,
            Removal::Failed => self.failed += 1,
        }
    }
}

/// One-shot timer that deletes a fixed set of paths after a grace period.
///
/// The sweep does not coordinate with launched processes. A binary that has
/// already loaded its config keeps running after the file is gone.
pub struct LifecycleReaper {
    paths: Vec<PathBuf>,
    grace: Duration,
}

impl LifecycleReaper {
    pub fn new(paths: Vec<PathBuf>, grace: Duration) -> Self {
        Self { paths, grace }
    }

    /// Start the timer on the runtime
    pub fn arm(self) -> JoinHandle<ReapReport> {
        info!(
            grace_secs = self.grace.as_secs(),
            paths = self.paths.len(),
            "Artifact purge scheduled"
        );
        tokio::spawn(async move {
            tokio::time::sleep(self.grace).await;
            let report = self.sweep().await;
            info!(
                removed = report.removed,
                missing = report.missing,
                failed = report.failed,
                "Provisioned artifacts purged"
            );
            report
        })
    }

    /// Remove every path now; individual failures are counted, never returned
    pub async fn sweep(&self) -> ReapReport {
        let mut report = ReapReport::default();
        for path in &self.paths {
            report.record(remove_path(path).await);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweep_counts_outcomes() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("config.json");
        let dir = tmp.path().join("logs");
        std::fs::write(&file, "{}").unwrap();
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("x"), "x").unwrap();

        let reaper = LifecycleReaper::new(
            vec![file.clone(), dir.clone(), tmp.path().join("absent")],
            Duration::ZERO,
        );
        let report = reaper.sweep().await;

        assert_eq!(
            report,
            ReapReport {
                removed: 2,
                missing: 1,
                failed: 0
            }
        );
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_waits_for_grace_period() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("web");
        std::fs::write(&file, "bin").unwrap();

        let handle = LifecycleReaper::new(vec![file.clone()], Duration::from_secs(90)).arm();

        tokio::time::sleep(Duration::from_secs(89)).await;
        assert!(file.exists());
        assert!(!handle.is_finished());

        let report = handle.await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!file.exists());
    }
}
