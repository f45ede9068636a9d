//! Crash-safe persistence of the in-progress-download record: if the process
//! dies mid-update, the next launch can see what was attempted and recover.

use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const INFO_FILE_NAME: &str = "update-info.json";

/// Everything needed to resume, retry, or clean up after a download that may
/// not have finished.
///
/// Field names are `camelCase` on the wire to match `spec.md`'s documented
/// `update-info.json` shape, even though the rest of this crate is
/// `snake_case` internally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub attempts: u32,
    pub current_version: String,
    pub update_version: String,
    pub update_size: u64,
    pub update_hash: String,
    pub update_file: String,
}

impl UpdateInfo {
    /// True iff this record's `currentVersion` still equals the running
    /// application's version, i.e. the version never advanced since the
    /// record was written. A successful install bumps the running version,
    /// so equality here means the last attempted install did not complete.
    pub fn did_last_update_fail(&self, current_version: &Version) -> bool {
        self.current_version == current_version.to_string()
    }

    /// Load the persisted record from `downloads_directory`, if any exists.
    pub async fn load(downloads_directory: &Path) -> Result<Option<Self>> {
        let path = downloads_directory.join(INFO_FILE_NAME);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let info: UpdateInfo = serde_json::from_slice(&bytes)
                    .map_err(|e| crate::error::UpdaterError::UpdateInfoInvalid(e.to_string()))?;
                Ok(Some(info))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist this record to `downloads_directory`, replacing any existing
    /// file whole (no partial writes observable by a concurrent reader).
    pub async fn save(&self, downloads_directory: &Path) -> Result<()> {
        tokio::fs::create_dir_all(downloads_directory).await?;
        let path = downloads_directory.join(INFO_FILE_NAME);
        let tmp_path = downloads_directory.join(format!("{INFO_FILE_NAME}.tmp"));
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::error::UpdaterError::UpdateInfoInvalid(e.to_string()))?;
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Delete the persisted record, marking the update as resolved
    /// (succeeded or abandoned). Missing-file is not an error.
    pub async fn clear(downloads_directory: &Path) -> Result<()> {
        let path = downloads_directory.join(INFO_FILE_NAME);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the downloaded artifact this record points to, and then this
    /// record itself. Refuses to touch any path that, once resolved, falls
    /// outside `downloads_directory` (a manifest or a tampered record
    /// pointing `updateFile` at `../../etc/passwd` must not reach into the
    /// filesystem at large). Filesystem errors during artifact removal are
    /// swallowed — cleanup is best-effort once the record itself is gone.
    pub async fn cleanup(&self, downloads_directory: &Path) -> Result<()> {
        let artifact_path = downloads_directory.join(&self.update_file);
        if let Ok(canonical_dir) = tokio::fs::canonicalize(downloads_directory).await {
            if let Ok(canonical_artifact) = tokio::fs::canonicalize(&artifact_path).await {
                if canonical_artifact.starts_with(&canonical_dir) {
                    let _ = tokio::fs::remove_file(&canonical_artifact).await;
                }
            }
        }
        Self::clear(downloads_directory).await
    }

    /// The path this record's artifact would live at under
    /// `downloads_directory`, without touching the filesystem.
    pub fn artifact_path(&self, downloads_directory: &Path) -> PathBuf {
        downloads_directory.join(&self.update_file)
    }
}
