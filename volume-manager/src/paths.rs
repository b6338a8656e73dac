//! Deterministic on-disk layout for staged and published volumes.
//!
//! ```text
//! <mount_root>/staging/<volume_id>/<usage>
//! <mount_root>/per-alloc/<alloc_id>/<volume_id>/<usage>
//! ```
//!
//! Paths depend only on their inputs, so a restarted node re-derives the same
//! locations and rediscovers existing mounts by probing them.

use std::path::{Path, PathBuf};

use crate::error::{Result, VolumeError};
use crate::types::{Allocation, UsageKey};

/// Directory under the mount root holding per-usage staging mounts.
pub const STAGING_DIR_NAME: &str = "staging";
/// Directory under the mount root holding per-allocation publish targets.
pub const ALLOC_SPECIFIC_DIR_NAME: &str = "per-alloc";

/// Resolves staging and publish paths under a mount root.
///
/// The plugin may run with the mount root visible at a different location
/// (e.g. inside its own container); `container_root` is that location and
/// is used for every path handed to the plugin.
#[derive(Debug, Clone)]
pub struct PathResolver {
    mount_root: PathBuf,
    container_root: PathBuf,
}

impl PathResolver {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        let mount_root = mount_root.into();
        Self {
            container_root: mount_root.clone(),
            mount_root,
        }
    }

    pub fn with_container_root(mut self, container_root: impl Into<PathBuf>) -> Self {
        self.container_root = container_root.into();
        self
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Host path of the staging directory for a usage.
    pub fn staging_dir(&self, key: &UsageKey) -> PathBuf {
        staging_dir_under(&self.mount_root, key)
    }

    /// Staging directory as seen by the plugin.
    pub fn plugin_staging_dir(&self, key: &UsageKey) -> PathBuf {
        staging_dir_under(&self.container_root, key)
    }

    /// Host path of the publish target for an allocation.
    pub fn alloc_dir(&self, alloc: &Allocation, key: &UsageKey) -> PathBuf {
        alloc_dir_under(&self.mount_root, alloc, key)
    }

    /// Publish target as seen by the plugin.
    pub fn plugin_alloc_dir(&self, alloc: &Allocation, key: &UsageKey) -> PathBuf {
        alloc_dir_under(&self.container_root, alloc, key)
    }

    /// Root of everything published for an allocation.
    pub fn alloc_root(&self, alloc: &Allocation) -> PathBuf {
        self.mount_root.join(ALLOC_SPECIFIC_DIR_NAME).join(&alloc.id)
    }
}

/// Check that an ID names exactly one directory below its parent.
///
/// Volume and allocation IDs are joined into paths as-is, so a separator or
/// a `..` would place mounts (and their teardown) outside the mount root.
pub fn check_component(volume_id: &str, kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\0']) {
        return Err(VolumeError::InvalidState {
            volume_id: volume_id.to_string(),
            reason: format!("{} ID '{}' is not a valid directory name", kind, id),
        });
    }
    Ok(())
}

fn staging_dir_under(root: &Path, key: &UsageKey) -> PathBuf {
    root.join(STAGING_DIR_NAME)
        .join(&key.volume_id)
        .join(key.encode())
}

fn alloc_dir_under(root: &Path, alloc: &Allocation, key: &UsageKey) -> PathBuf {
    root.join(ALLOC_SPECIFIC_DIR_NAME)
        .join(&alloc.id)
        .join(&key.volume_id)
        .join(key.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessMode, AttachmentMode, Volume};

    fn key() -> UsageKey {
        Volume::new(
            "vol-1",
            AttachmentMode::Filesystem,
            AccessMode::SingleNodeWriter,
        )
        .usage_key()
    }

    #[test]
    fn test_staging_dir_layout() {
        let resolver = PathResolver::new("/data/csi");
        assert_eq!(
            resolver.staging_dir(&key()),
            PathBuf::from("/data/csi/staging/vol-1/rw-file-system-single-node-writer")
        );
    }

    #[test]
    fn test_staging_dir_is_deterministic() {
        let a = PathResolver::new("/data/csi");
        let b = PathResolver::new("/data/csi");
        assert_eq!(a.staging_dir(&key()), b.staging_dir(&key()));
    }

    #[test]
    fn test_alloc_dir_layout() {
        let resolver = PathResolver::new("/data/csi");
        let alloc = Allocation::new("alloc-a");
        assert_eq!(
            resolver.alloc_dir(&alloc, &key()),
            PathBuf::from("/data/csi/per-alloc/alloc-a/vol-1/rw-file-system-single-node-writer")
        );
        assert!(resolver.alloc_dir(&alloc, &key()).starts_with(resolver.alloc_root(&alloc)));
    }

    #[test]
    fn test_check_component() {
        assert!(check_component("vol-1", "volume", "vol-1").is_ok());
        assert!(check_component("vol-1", "volume", "pool.vol-1").is_ok());

        for bad in ["", ".", "..", "../etc", "a/b", "/abs", "nul\0"] {
            match check_component("vol-1", "allocation", bad) {
                Err(VolumeError::InvalidState { reason, .. }) => {
                    assert!(reason.contains("allocation ID"), "{reason}")
                }
                other => panic!("expected InvalidState for {:?}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_container_root_only_affects_plugin_paths() {
        let resolver = PathResolver::new("/data/csi").with_container_root("/csi");
        let alloc = Allocation::new("alloc-a");

        assert!(resolver.staging_dir(&key()).starts_with("/data/csi"));
        assert_eq!(
            resolver.plugin_staging_dir(&key()),
            PathBuf::from("/csi/staging/vol-1/rw-file-system-single-node-writer")
        );
        assert_eq!(
            resolver.plugin_alloc_dir(&alloc, &key()),
            PathBuf::from("/csi/per-alloc/alloc-a/vol-1/rw-file-system-single-node-writer")
        );
    }
}
