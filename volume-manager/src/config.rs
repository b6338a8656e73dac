//! Volume manager configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::PathResolver;
use crate::retry::RetryPolicy;

/// Default root for plugin staging and publish directories.
pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/volume-manager/csi";

/// Settings for one plugin's volume manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeManagerConfig {
    /// Host directory under which staging and per-allocation directories
    /// are created.
    pub mount_root: PathBuf,
    /// Where the plugin sees `mount_root`, if it runs with a different view
    /// of the filesystem (e.g. in a container).
    pub container_mount_point: Option<PathBuf>,
    /// Whether the plugin requires NodeStageVolume/NodeUnstageVolume.
    pub requires_staging: bool,
    pub retry: RetryPolicy,
}

impl Default for VolumeManagerConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            container_mount_point: None,
            requires_staging: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl VolumeManagerConfig {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            ..Self::default()
        }
    }

    pub fn requires_staging(mut self, requires_staging: bool) -> Self {
        self.requires_staging = requires_staging;
        self
    }

    pub fn container_mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.container_mount_point = Some(path.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config '{}': {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| format!("Invalid config '{}': {}", path.display(), e))?;
        Ok(config)
    }

    pub fn path_resolver(&self) -> PathResolver {
        let resolver = PathResolver::new(&self.mount_root);
        match &self.container_mount_point {
            Some(container_root) => resolver.with_container_root(container_root),
            None => resolver,
        }
    }
}
