//! Directory-backed secret store.
//!
//! Secret-sync sidecars and CSI secret drivers materialise each secret as a
//! JSON file and rewrite it in place on rotation. [`FileSecretStore`] reads
//! `<dir>/<name>.json` on every fetch, so the credential cache sees a rotated
//! value as soon as its entry expires or is invalidated.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::SecretStore;
use crate::error::{SecretsError, SecretsResult};
use crate::secret::SecretValue;

#[derive(Clone, Debug)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path holding `name`. Characters outside `[A-Za-z0-9._-]` map to
    /// `_`, so `prod/caseline/db` lives in `prod_caseline_db.json`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn fetch_secret(&self, name: &str) -> SecretsResult<SecretValue> {
        let path = self.path_for(name);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => SecretsError::not_found(name),
            ErrorKind::PermissionDenied => SecretsError::access_denied(name, e.to_string()),
            _ => SecretsError::unavailable(name, format!("{}: {e}", path.display())),
        })?;

        tracing::debug!(secret = %name, path = %path.display(), "read secret file");
        SecretValue::from_json(name, &raw)
    }
}
