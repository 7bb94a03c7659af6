//! Persisted identity token
//!
//! The token is generated once per install and stored in a sidecar file next to
//! the program, outside the working directory, so the artifact purge never
//! touches it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token, if any
    pub fn load(&self) -> anyhow::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let token = content.trim();
                if token.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(token.to_string()))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read identity file '{}': {}",
                self.path.display(),
                e
            )),
        }
    }

    /// Return the stored token, generating and persisting one on first use
    pub fn load_or_create(&self) -> anyhow::Result<String> {
        if let Some(token) = self.load()? {
            info!(path = %self.path.display(), "Using stored identity token");
            return Ok(token);
        }

        let token = uuid::Uuid::new_v4().to_string();
        std::fs::write(&self.path, &token).map_err(|e| {
            anyhow::anyhow!(
                "Failed to write identity file '{}': {}",
                self.path.display(),
                e
            )
        })?;
        info!(path = %self.path.display(), "Generated and stored new identity token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_token_is_reused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".uuid");
        std::fs::write(&path, "  3f1c6a52-0000-4000-8000-000000000001\n").unwrap();

        let store = IdentityStore::new(&path);
        assert_eq!(
            store.load_or_create().unwrap(),
            "3f1c6a52-0000-4000-8000-000000000001"
        );
    }

    #[test]
    fn test_token_is_created_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".uuid");

        let first = IdentityStore::new(&path).load_or_create().unwrap();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        let second = IdentityStore::new(&path).load_or_create().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_file_is_treated_as_absent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".uuid");
        std::fs::write(&path, "\n").unwrap();

        let store = IdentityStore::new(&path);
        assert!(store.load().unwrap().is_none());
        let token = store.load_or_create().unwrap();
        assert_eq!(store.load().unwrap(), Some(token));
    }

    #[test]
    fn test_unwritable_location_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing").join(".uuid");

        let err = IdentityStore::new(&path).load_or_create().unwrap_err();
        assert!(err.to_string().contains("Failed to write identity file"));
    }
}
