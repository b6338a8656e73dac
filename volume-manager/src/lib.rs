//! Node-local CSI volume manager
//!
//! Stages and publishes CSI volumes on this node for the allocations that
//! use them, reference counting shared staging mounts and tearing them down
//! when the last consumer leaves.
//!
//! This library provides:
//! - The [`VolumeManager`] lifecycle state machine
//! - Capability translation and host path layout
//! - A gRPC [`CsiPlugin`] client for the plugin's Identity and Node services

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod mount;
pub mod paths;
pub mod plugin;
pub mod registry;
pub mod retry;
pub mod types;

pub use config::VolumeManagerConfig;
pub use context::OpContext;
pub use error::{Result, VolumeError};
pub use manager::VolumeManager;
pub use mount::{HostMountProber, MountProber};
pub use plugin::{CsiPlugin, GrpcPluginClient, PublishRequest, StageRequest};
pub use registry::UsageState;
pub use retry::RetryPolicy;
pub use types::{
    AccessMode, Allocation, AttachmentMode, MountInfo, MountOptions, PublishContext, UsageKey,
    Volume,
};
