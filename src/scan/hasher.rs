//! Content hashing
//!
//! MD5 is the primary fingerprint (it is what the cloud provider reports for
//! its files, so both sides of a diff speak it); SHA-256 is an optional
//! second flavor. Hashing reads in small chunks so huge files never sit in
//! memory. Symlinks are resolved up to a bounded depth before giving up.

use crate::error::EngineResult;
use md5::{Digest, Md5};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Hash flavors to compute for a file.
#[derive(Debug, Clone, Copy)]
pub struct HashFlavors {
    pub md5: bool,
    pub sha256: bool,
}

impl Default for HashFlavors {
    fn default() -> Self {
        Self {
            md5: true,
            sha256: false,
        }
    }
}

/// Computed signatures. Either may be None when the file was unreadable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signatures {
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

pub struct ContentHasher {
    chunk_size: usize,
    max_link_depth: u32,
    flavors: HashFlavors,
}

impl ContentHasher {
    pub fn new(chunk_size: usize, max_link_depth: u32, flavors: HashFlavors) -> Self {
        Self {
            chunk_size: chunk_size.max(512),
            max_link_depth,
            flavors,
        }
    }

    /// Compute signatures for the file at `path`. A vanished file yields
    /// empty signatures (rapidly created/destroyed temp files are normal);
    /// the caller indexes the node hashless and moves on.
    pub async fn calculate_signatures(&self, path: &Path) -> EngineResult<Signatures> {
        match self.hash_file(path).await {
            Ok(signatures) => Ok(signatures),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.try_resolve_link(path).await
            }
            Err(err) => {
                warn!("Could not hash '{}': {err}", path.display());
                Ok(Signatures::default())
            }
        }
    }

    async fn try_resolve_link(&self, path: &Path) -> EngineResult<Signatures> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(_) => {
                debug!(
                    "Could not calculate signature: file not found, skipping: {}",
                    path.display()
                );
                return Ok(Signatures::default());
            }
        };
        if !meta.file_type().is_symlink() {
            debug!(
                "Could not calculate signature: file not found, skipping: {}",
                path.display()
            );
            return Ok(Signatures::default());
        }

        let mut current = path.to_path_buf();
        for attempt in 0..self.max_link_depth {
            let target: PathBuf = match tokio::fs::read_link(&current).await {
                Ok(t) => {
                    if t.is_absolute() {
                        t
                    } else {
                        current.parent().map(|p| p.join(&t)).unwrap_or(t)
                    }
                }
                Err(_) => {
                    warn!("Broken link, skipping: '{}'", current.display());
                    return Ok(Signatures::default());
                }
            };
            debug!(
                "Resolved link (depth {attempt}): '{}' -> '{}'",
                current.display(),
                target.display()
            );
            match self.hash_file(&target).await {
                Ok(signatures) => return Ok(signatures),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    current = target;
                }
                Err(err) => {
                    warn!("Could not hash link target '{}': {err}", target.display());
                    return Ok(Signatures::default());
                }
            }
        }

        warn!(
            "Max link depth ({}) exceeded: '{}'",
            self.max_link_depth,
            path.display()
        );
        Ok(Signatures::default())
    }

    async fn hash_file(&self, path: &Path) -> std::io::Result<Signatures> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut md5 = self.flavors.md5.then(Md5::new);
        let mut sha256 = self.flavors.sha256.then(Sha256::new);
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            if let Some(hasher) = md5.as_mut() {
                hasher.update(&buf[..read]);
            }
            if let Some(hasher) = sha256.as_mut() {
                hasher.update(&buf[..read]);
            }
        }

        Ok(Signatures {
            md5: md5.map(|h| hex::encode(h.finalize())),
            sha256: sha256.map(|h| hex::encode(h.finalize())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hasher() -> ContentHasher {
        ContentHasher::new(4096, 5, HashFlavors::default())
    }

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let sig = hasher().calculate_signatures(&path).await.unwrap();
        // md5("hello")
        assert_eq!(sig.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
    }

    #[tokio::test]
    async fn zero_byte_file_is_hashed_normally() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();
        let sig = hasher().calculate_signatures(&path).await.unwrap();
        // md5 of the empty string
        assert_eq!(sig.md5.as_deref(), Some("d41d8cd98f00b204e9800998ecf8427e"));
    }

    #[tokio::test]
    async fn missing_file_yields_empty_signatures() {
        let dir = tempdir().unwrap();
        let sig = hasher()
            .calculate_signatures(&dir.path().join("nope"))
            .await
            .unwrap();
        assert_eq!(sig, Signatures::default());
    }

    #[tokio::test]
    async fn sha256_flavor_is_computed_when_enabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let hasher = ContentHasher::new(
            4096,
            5,
            HashFlavors {
                md5: true,
                sha256: true,
            },
        );
        let sig = hasher.calculate_signatures(&path).await.unwrap();
        assert_eq!(
            sig.sha256.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_is_resolved_within_depth() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("real.txt");
        tokio::fs::write(&target, b"hello").await.unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        // Opening the link succeeds directly (open follows links), so this
        // exercises the happy path; the resolution loop covers dangling ones.
        let sig = hasher().calculate_signatures(&link).await.unwrap();
        assert_eq!(sig.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
    }
}
