//! Volume Manager
//!
//! Drives a volume through staging and publishing on this node for the
//! allocations that use it, and reverses those steps on teardown.
//!
//! One manager exists per installed plugin and outlives any allocation:
//! several allocations may use the same volume, so staging is done once per
//! usage and reference counted across publishes.
//!
//! ```text
//! Unstaged --stage--> Staged --publish--> Published
//!    ^                                        |
//!    +--unstage-- Unpublished <--last unpublish
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, trace, warn};

use crate::capability::{self, VolumeCapability};
use crate::config::VolumeManagerConfig;
use crate::context::{OpContext, Step};
use crate::error::{Result, VolumeError};
use crate::metrics::OperationTimer;
use crate::mount::{self, HostMountProber, MountProber};
use crate::paths::{self, PathResolver};
use crate::plugin::{CsiPlugin, PublishRequest, StageRequest};
use crate::registry::{UsageGuard, UsageRegistry, UsageState};
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{Allocation, MountInfo, PublishContext, UsageKey, Volume};

/// Handles the state of attached volumes for one CSI plugin.
pub struct VolumeManager {
    plugin: Arc<dyn CsiPlugin>,
    prober: Arc<dyn MountProber>,
    paths: PathResolver,
    /// Whether the plugin needs NodeStageVolume/NodeUnstageVolume
    requires_staging: bool,
    retry: RetryPolicy,
    usages: UsageRegistry,
}

impl VolumeManager {
    /// Create a manager probing mounts through the host mount table.
    pub fn new(config: VolumeManagerConfig, plugin: Arc<dyn CsiPlugin>) -> Self {
        Self {
            plugin,
            prober: Arc::new(HostMountProber),
            paths: config.path_resolver(),
            requires_staging: config.requires_staging,
            retry: config.retry,
            usages: UsageRegistry::new(),
        }
    }

    /// Replace the mount-point prober.
    pub fn with_prober(mut self, prober: Arc<dyn MountProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn requires_staging(&self) -> bool {
        self.requires_staging
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// State of a usage as tracked by this manager.
    pub async fn usage_state(&self, key: &UsageKey) -> UsageState {
        self.usages.state(key).await
    }

    /// Number of allocations holding a usage.
    pub async fn ref_count(&self, key: &UsageKey) -> usize {
        self.usages.ref_count(key).await
    }

    /// Make a volume available to an allocation and return where it is.
    pub async fn mount_volume(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        alloc: &Allocation,
    ) -> Result<MountInfo> {
        self.mount_volume_with_context(ctx, volume, alloc, &PublishContext::new())
            .await
    }

    /// [`mount_volume`](Self::mount_volume) with a publish context issued by
    /// the controller side of the plugin.
    #[instrument(skip_all, fields(volume_id = %volume.id, alloc_id = %alloc.id))]
    pub async fn mount_volume_with_context(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        alloc: &Allocation,
        publish_context: &PublishContext,
    ) -> Result<MountInfo> {
        let timer = OperationTimer::new("mount_volume");
        let result = self.mount(ctx, volume, alloc, publish_context).await;
        timer.observe(&result);
        result
    }

    async fn mount(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        alloc: &Allocation,
        publish_context: &PublishContext,
    ) -> Result<MountInfo> {
        // Reject corrupt records before touching the filesystem or the plugin
        let capability = capability::translate(volume)?;
        paths::check_component(&volume.id, "volume", &volume.id)?;
        paths::check_component(&volume.id, "allocation", &alloc.id)?;
        let key = volume.usage_key();
        let usage_name = key.encode();
        let step = Step {
            operation: "MountVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };

        let newly_claimed = {
            let mut usage = self.usages.acquire(&key, ctx, step).await?;

            if self.requires_staging && !usage.is_staged() {
                let staged = self
                    .stage_locked(ctx, volume, &key, &capability, publish_context, &mut usage)
                    .await;
                if let Err(e) = staged {
                    usage.record_stage_failure(&e);
                    if usage.is_idle() {
                        self.usages.remove(&key, &mut usage);
                    }
                    return Err(e);
                }
            }

            // Reserve before releasing the lock so a concurrent unmount of
            // another allocation cannot unstage underneath this publish
            let had_claim = usage.has_claim(&alloc.id);
            usage.increment_ref(&alloc.id);
            !had_claim
        };

        let published = self
            .publish(ctx, volume, alloc, &key, &capability, publish_context)
            .await;

        // The claim is already held, so committing must not be abandoned
        let mut usage = self.usages.lock_or_create(&key).await;
        match published {
            Ok(info) => {
                usage.mark_published();
                info!(
                    usage = %key,
                    target_path = %info.source.display(),
                    ref_count = usage.ref_count(),
                    "Volume published"
                );
                Ok(info)
            }
            Err(e) => {
                if newly_claimed {
                    usage.decrement_ref(&alloc.id);
                }
                if usage.is_idle() {
                    self.usages.remove(&key, &mut usage);
                }
                Err(e)
            }
        }
    }

    /// Stage a volume for its usage without publishing it.
    ///
    /// Idempotent: an existing staging mount is reused without calling the
    /// plugin. Returns the host staging path.
    #[instrument(skip_all, fields(volume_id = %volume.id))]
    pub async fn stage_volume(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        publish_context: &PublishContext,
    ) -> Result<PathBuf> {
        let capability = capability::translate(volume)?;
        paths::check_component(&volume.id, "volume", &volume.id)?;
        let key = volume.usage_key();
        let usage_name = key.encode();
        let step = Step {
            operation: "StageVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };

        let mut usage = self.usages.acquire(&key, ctx, step).await?;
        let staged = self
            .stage_locked(ctx, volume, &key, &capability, publish_context, &mut usage)
            .await;
        match staged {
            Ok(()) => Ok(self.paths.staging_dir(&key)),
            Err(e) => {
                usage.record_stage_failure(&e);
                if usage.is_idle() {
                    self.usages.remove(&key, &mut usage);
                }
                Err(e)
            }
        }
    }

    /// Stage under the usage lock. On failure nothing is recorded.
    async fn stage_locked(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        key: &UsageKey,
        capability: &VolumeCapability,
        publish_context: &PublishContext,
        usage: &mut UsageGuard,
    ) -> Result<()> {
        trace!(usage = %key, "Preparing volume staging environment");
        let staging_path = self.paths.staging_dir(key);
        let existing_mount = self.ensure_dir_unmounted(&volume.id, &staging_path).await?;
        trace!(
            staging_path = %staging_path.display(),
            pre_existing_mount = existing_mount,
            "Volume staging environment"
        );

        if existing_mount {
            debug!(
                staging_path = %staging_path.display(),
                "Re-using existing staging mount for volume"
            );
            usage.mark_staged(staging_path);
            return Ok(());
        }

        let usage_name = key.encode();
        let request = StageRequest {
            volume_id: volume.remote_id().to_string(),
            publish_context: publish_context.clone(),
            staging_path: self.paths.plugin_staging_dir(key),
            capability: capability.clone(),
            secrets: volume.secrets.clone(),
            volume_context: volume.context.clone(),
        };
        let call = Step {
            operation: "NodeStageVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };
        with_retry(&self.retry, ctx, call, || {
            self.plugin.node_stage_volume(request.clone())
        })
        .await?;

        info!(staging_path = %staging_path.display(), "Volume staged");
        usage.mark_staged(staging_path);
        Ok(())
    }

    async fn publish(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        alloc: &Allocation,
        key: &UsageKey,
        capability: &VolumeCapability,
        publish_context: &PublishContext,
    ) -> Result<MountInfo> {
        let target_path = self.paths.alloc_dir(alloc, key);
        let info = MountInfo {
            source: target_path.clone(),
            read_only: volume.read_only,
            is_device: capability.is_block(),
        };

        if self.ensure_dir_unmounted(&volume.id, &target_path).await? {
            debug!(
                target_path = %target_path.display(),
                "Re-using existing publish mount for allocation"
            );
            return Ok(info);
        }

        let usage_name = key.encode();
        let request = PublishRequest {
            volume_id: volume.remote_id().to_string(),
            publish_context: publish_context.clone(),
            staging_path: self
                .requires_staging
                .then(|| self.paths.plugin_staging_dir(key)),
            target_path: self.paths.plugin_alloc_dir(alloc, key),
            capability: capability.clone(),
            read_only: volume.read_only,
            secrets: volume.secrets.clone(),
            volume_context: volume.context.clone(),
        };
        let call = Step {
            operation: "NodePublishVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };
        let published = with_retry(&self.retry, ctx, call, || {
            self.plugin.node_publish_volume(request.clone())
        })
        .await;
        if let Err(e) = published {
            self.remove_alloc_dirs(alloc, &target_path).await;
            return Err(e);
        }

        Ok(info)
    }

    /// Release an allocation's use of a volume.
    ///
    /// The allocation's publish target is always torn down. The shared
    /// staging mount is unstaged only when no other allocation holds the
    /// usage.
    #[instrument(skip_all, fields(volume_id = %volume.id, alloc_id = %alloc.id))]
    pub async fn unmount_volume(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        alloc: &Allocation,
    ) -> Result<()> {
        let timer = OperationTimer::new("unmount_volume");
        let result = self.unmount(ctx, volume, alloc).await;
        timer.observe(&result);
        result
    }

    async fn unmount(&self, ctx: &OpContext, volume: &Volume, alloc: &Allocation) -> Result<()> {
        paths::check_component(&volume.id, "volume", &volume.id)?;
        paths::check_component(&volume.id, "allocation", &alloc.id)?;
        let key = volume.usage_key();
        let usage_name = key.encode();
        let step = Step {
            operation: "UnmountVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };

        let Some(mut usage) = self.usages.acquire_existing(&key, ctx, step).await? else {
            // Not tracked (e.g. after a restart): other consumers of the
            // staging mount cannot be ruled out, so only the target goes
            warn!(usage = %key, "Volume usage not tracked, leaving staging mount in place");
            return self.unpublish(ctx, volume, alloc, &key).await;
        };

        let had_claim = usage.has_claim(&alloc.id);
        let remaining = usage.decrement_ref(&alloc.id);

        if let Err(e) = self.unpublish(ctx, volume, alloc, &key).await {
            if had_claim {
                usage.increment_ref(&alloc.id);
                usage.mark_published();
            }
            return Err(e);
        }

        if remaining > 0 {
            info!(
                usage = %key,
                ref_count = remaining,
                "Volume still in use, keeping staging mount"
            );
            return Ok(());
        }

        usage.mark_unpublished();
        if let Some(staging_path) = usage.staging_path().map(Path::to_path_buf) {
            self.unstage(ctx, volume, &key, &staging_path).await?;
        }

        usage.mark_unstaged();
        self.usages.remove(&key, &mut usage);
        info!(usage = %key, "Volume usage released");
        Ok(())
    }

    async fn unpublish(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        alloc: &Allocation,
        key: &UsageKey,
    ) -> Result<()> {
        let target_path = self.paths.alloc_dir(alloc, key);
        if !tokio::fs::try_exists(&target_path).await.unwrap_or(true) {
            debug!(target_path = %target_path.display(), "Nothing published for allocation");
            return Ok(());
        }

        let usage_name = key.encode();
        let plugin_target = self.paths.plugin_alloc_dir(alloc, key);
        let call = Step {
            operation: "NodeUnpublishVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };
        with_retry(&self.retry, ctx, call, || {
            self.plugin
                .node_unpublish_volume(volume.remote_id(), &plugin_target)
        })
        .await?;

        // The plugin has released the mount
        self.remove_alloc_dirs(alloc, &target_path).await;

        info!(target_path = %target_path.display(), "Volume unpublished");
        Ok(())
    }

    /// Best-effort removal of a publish target and its empty parents up to
    /// the allocation's root.
    async fn remove_alloc_dirs(&self, alloc: &Allocation, target_path: &Path) {
        let alloc_root = self.paths.alloc_root(alloc);
        for dir in target_path.ancestors().take_while(|d| d.starts_with(&alloc_root)) {
            if let Err(e) = mount::remove_dir(dir).await {
                warn!(error = %e, path = %dir.display(), "Could not remove publish directory");
                break;
            }
        }
    }

    async fn unstage(
        &self,
        ctx: &OpContext,
        volume: &Volume,
        key: &UsageKey,
        staging_path: &Path,
    ) -> Result<()> {
        let usage_name = key.encode();
        let plugin_staging = self.paths.plugin_staging_dir(key);
        let call = Step {
            operation: "NodeUnstageVolume",
            volume_id: &volume.id,
            usage: &usage_name,
        };
        with_retry(&self.retry, ctx, call, || {
            self.plugin
                .node_unstage_volume(volume.remote_id(), &plugin_staging)
        })
        .await?;

        if let Err(e) = mount::remove_dir(staging_path).await {
            warn!(error = %e, path = %staging_path.display(), "Could not remove staging directory");
        }
        if let Some(volume_dir) = staging_path.parent()
            && let Err(e) = mount::remove_dir(volume_dir).await
        {
            warn!(error = %e, path = %volume_dir.display(), "Could not remove staging directory");
        }

        info!(staging_path = %staging_path.display(), "Volume unstaged");
        Ok(())
    }

    /// Whether a previously returned mount is still in place.
    pub fn has_mount(&self, volume_id: &str, info: &MountInfo) -> Result<bool> {
        self.prober
            .is_mount_point(&info.source)
            .map_err(|source| VolumeError::LocalIo {
                volume_id: volume_id.to_string(),
                operation: "mount point detection",
                path: info.source.clone(),
                source,
            })
    }

    /// Create `path` if needed and report whether it is already a mount point.
    async fn ensure_dir_unmounted(&self, volume_id: &str, path: &Path) -> Result<bool> {
        mount::ensure_dir(path)
            .await
            .map_err(|source| VolumeError::LocalIo {
                volume_id: volume_id.to_string(),
                operation: "directory creation",
                path: path.to_path_buf(),
                source,
            })?;

        self.prober
            .is_mount_point(path)
            .map_err(|source| VolumeError::LocalIo {
                volume_id: volume_id.to_string(),
                operation: "mount point detection",
                path: path.to_path_buf(),
                source,
            })
    }
}
