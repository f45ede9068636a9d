//! File-size verification for downloaded artifacts.

use std::path::Path;

use crate::error::{Result, UpdaterError};

/// Verify that `path`'s size on disk equals `expected_bytes`.
pub async fn verify(expected_bytes: u64, path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path).await?;
    let actual = metadata.len();
    if actual == expected_bytes {
        Ok(())
    } else {
        Err(UpdaterError::SizeMismatch {
            expected: expected_bytes,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::fs;

    #[tokio::test]
    async fn verify_accepts_matching_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"0123456789").await.unwrap();
        verify(10, &path).await.unwrap();
    }

    #[tokio::test]
    async fn verify_rejects_mismatched_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"0123456789").await.unwrap();
        let err = verify(11, &path).await.unwrap_err();
        assert!(matches!(err, UpdaterError::SizeMismatch { .. }));
    }
}
