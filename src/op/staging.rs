//! Copy staging
//!
//! A copy is long-running and non-atomic, so it is materialized in a staging
//! directory first and renamed into place only after verification. The
//! rename is only atomic when staging and destination share a volume, so a
//! secondary staging directory is created at the root of any non-primary
//! volume a destination lives on.

use crate::device::Uid;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct StagingArea {
    /// Staging dir used for destinations on the primary volume
    primary: PathBuf,
    /// Name of per-volume staging dirs created on other volumes
    dir_name: String,
}

impl StagingArea {
    pub fn new(primary: PathBuf, dir_name: impl Into<String>) -> Self {
        Self {
            primary,
            dir_name: dir_name.into(),
        }
    }

    /// The staging directory to use for a copy landing at `dst_path`,
    /// created on demand. Chosen so the final rename stays on one volume.
    pub fn staging_dir_for(&self, dst_path: &Path) -> io::Result<PathBuf> {
        let volume_root = volume_root_of(dst_path);
        let staging_dir = match volume_root {
            Some(root) if root != Path::new("/") => root.join(&self.dir_name),
            _ => self.primary.clone(),
        };

        if !staging_dir.exists() {
            info!("Creating staging dir: '{}'", staging_dir.display());
            std::fs::create_dir_all(&staging_dir)?;
        } else {
            debug!(
                "Staging dir for dst '{}' = '{}'",
                dst_path.display(),
                staging_dir.display()
            );
        }
        Ok(staging_dir)
    }

    /// A unique file path inside the right staging dir for one op.
    pub fn staging_file_for(&self, dst_path: &Path, op_uid: Uid) -> io::Result<PathBuf> {
        let dir = self.staging_dir_for(dst_path)?;
        let name = dst_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "staged".to_string());
        Ok(dir.join(format!("{name}.{op_uid}.part")))
    }
}

/// Highest ancestor of `path` living on the same filesystem device, i.e. the
/// root of the volume the path belongs to.
#[cfg(unix)]
fn volume_root_of(path: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let start = nearest_existing_ancestor(path)?;
    let dev = std::fs::metadata(&start).ok()?.dev();

    let mut current = start;
    while let Some(parent) = current.parent() {
        match std::fs::metadata(parent) {
            Ok(meta) if meta.dev() == dev => current = parent.to_path_buf(),
            _ => break,
        }
    }
    Some(current)
}

#[cfg(not(unix))]
fn volume_root_of(_path: &Path) -> Option<PathBuf> {
    None
}

#[cfg(unix)]
fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    loop {
        if current.exists() {
            return Some(current);
        }
        current = current.parent()?.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn staging_file_is_unique_per_op() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path().join("stage"), ".app-staging");
        let dst = dir.path().join("out/file.bin");
        let a = staging.staging_file_for(&dst, Uid(7)).unwrap();
        let b = staging.staging_file_for(&dst, Uid(8)).unwrap();
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("file.bin"));
    }

    #[cfg(unix)]
    #[test]
    fn volume_root_is_an_ancestor() {
        let dir = tempdir().unwrap();
        let root = volume_root_of(dir.path()).unwrap();
        assert!(dir.path().starts_with(&root));
    }
}
