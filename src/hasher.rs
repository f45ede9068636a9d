//! Streaming SHA-512 verification of downloaded artifacts.

use sha2::{Digest, Sha512};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{Result, UpdaterError};

const CHUNK_SIZE: usize = 64 * 1024;

/// Stream `path` through SHA-512, returning its lowercase hex digest.
pub async fn calculate(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that `path`'s SHA-512 digest matches `expected_hex`
/// (case-insensitive hex comparison).
pub async fn verify(expected_hex: &str, path: &Path) -> Result<()> {
    let actual = calculate(path).await?;
    if actual.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(UpdaterError::HashMismatch {
            expected: expected_hex.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::fs;

    const CONTENTS: &str = "Test file\nOK\n";
    const SHA512_HEX: &str = "c3ff3dc57711c22a729e6d8575d30e216052cb5873824c44299bd184780154479\
e8245685a9c6d308f9ec25cdcb6ec7a1236ef0039b406f79264544a2c1ea295";

    #[tokio::test]
    async fn calculate_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, CONTENTS).await.unwrap();
        let digest = calculate(&path).await.unwrap();
        assert_eq!(digest, SHA512_HEX);
    }

    #[tokio::test]
    async fn verify_accepts_correct_hash_case_insensitively() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, CONTENTS).await.unwrap();
        verify(&SHA512_HEX.to_ascii_uppercase(), &path).await.unwrap();
    }

    #[tokio::test]
    async fn verify_rejects_wrong_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, CONTENTS).await.unwrap();
        let err = verify(&"0".repeat(128), &path).await.unwrap_err();
        assert!(matches!(err, UpdaterError::HashMismatch { .. }));
    }
}
