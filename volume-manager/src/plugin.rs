//! CSI plugin client
//!
//! [`CsiPlugin`] is the node-side RPC surface the volume manager drives.
//! [`GrpcPluginClient`] implements it against a running plugin over gRPC,
//! either on a unix socket (`unix:///path/to/csi.sock`) or a TCP endpoint.
//! Calls here are single attempts; retry policy lives with the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::capability::VolumeCapability;
use crate::csi;
use crate::csi::identity_client::IdentityClient;
use crate::csi::node_client::NodeClient;
use crate::error::VolumeError;
use crate::types::PublishContext;

/// Connection establishment timeout for the plugin socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments of a NodeStageVolume call.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub volume_id: String,
    pub publish_context: PublishContext,
    pub staging_path: PathBuf,
    pub capability: VolumeCapability,
    pub secrets: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
}

/// Arguments of a NodePublishVolume call.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub volume_id: String,
    pub publish_context: PublishContext,
    /// `None` when the plugin does not stage volumes.
    pub staging_path: Option<PathBuf>,
    pub target_path: PathBuf,
    pub capability: VolumeCapability,
    pub read_only: bool,
    pub secrets: HashMap<String, String>,
    pub volume_context: HashMap<String, String>,
}

/// Node-side RPCs of a CSI plugin.
///
/// Implementations must be safe to call concurrently.
#[tonic::async_trait]
pub trait CsiPlugin: Send + Sync {
    async fn node_stage_volume(&self, request: StageRequest) -> Result<(), tonic::Status>;

    async fn node_unstage_volume(
        &self,
        volume_id: &str,
        staging_path: &Path,
    ) -> Result<(), tonic::Status>;

    async fn node_publish_volume(&self, request: PublishRequest) -> Result<(), tonic::Status>;

    async fn node_unpublish_volume(
        &self,
        volume_id: &str,
        target_path: &Path,
    ) -> Result<(), tonic::Status>;
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// gRPC client for a CSI plugin's Identity and Node services.
#[derive(Debug, Clone)]
pub struct GrpcPluginClient {
    identity: IdentityClient<Channel>,
    node: NodeClient<Channel>,
}

impl GrpcPluginClient {
    /// Connect to a plugin endpoint.
    ///
    /// `unix://` endpoints are dialed through a unix socket connector, any
    /// other endpoint is treated as an HTTP/2 URL.
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self, VolumeError> {
        let connect_error = |reason: String| VolumeError::PluginConnect {
            endpoint: endpoint.to_string(),
            reason,
        };

        let channel = match endpoint.strip_prefix("unix://") {
            Some(socket) => {
                let socket = PathBuf::from(socket);
                // The URI is ignored by the connector but must parse
                Endpoint::try_from("http://[::]:50051")
                    .map_err(|e| connect_error(e.to_string()))?
                    .connect_timeout(connect_timeout)
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let socket = socket.clone();
                        async move {
                            Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?))
                        }
                    }))
                    .await
                    .map_err(|e| connect_error(e.to_string()))?
            }
            None => Endpoint::from_shared(endpoint.to_string())
                .map_err(|e| connect_error(e.to_string()))?
                .connect_timeout(connect_timeout)
                .connect()
                .await
                .map_err(|e| connect_error(e.to_string()))?,
        };

        debug!(endpoint = endpoint, "Connected to CSI plugin");
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            identity: IdentityClient::new(channel.clone()),
            node: NodeClient::new(channel),
        }
    }

    /// Plugin name and vendor version.
    pub async fn plugin_info(&self) -> Result<(String, String), tonic::Status> {
        let response = self
            .identity
            .clone()
            .get_plugin_info(csi::GetPluginInfoRequest {})
            .await?
            .into_inner();
        Ok((response.name, response.vendor_version))
    }

    /// Whether the plugin advertises STAGE_UNSTAGE_VOLUME.
    pub async fn requires_staging(&self) -> Result<bool, tonic::Status> {
        use csi::node_service_capability::{Type, rpc::Type as RpcType};

        let response = self
            .node
            .clone()
            .node_get_capabilities(csi::NodeGetCapabilitiesRequest {})
            .await?
            .into_inner();

        Ok(response.capabilities.iter().any(|cap| {
            matches!(
                &cap.r#type,
                Some(Type::Rpc(rpc)) if rpc.r#type == RpcType::StageUnstageVolume as i32
            )
        }))
    }
}

#[tonic::async_trait]
impl CsiPlugin for GrpcPluginClient {
    async fn node_stage_volume(&self, request: StageRequest) -> Result<(), tonic::Status> {
        let req = csi::NodeStageVolumeRequest {
            volume_id: request.volume_id,
            publish_context: request.publish_context,
            staging_target_path: path_string(&request.staging_path),
            volume_capability: Some(csi::VolumeCapability::from(&request.capability)),
            secrets: request.secrets,
            volume_context: request.volume_context,
        };
        self.node.clone().node_stage_volume(req).await?;
        Ok(())
    }

    async fn node_unstage_volume(
        &self,
        volume_id: &str,
        staging_path: &Path,
    ) -> Result<(), tonic::Status> {
        let req = csi::NodeUnstageVolumeRequest {
            volume_id: volume_id.to_string(),
            staging_target_path: path_string(staging_path),
        };
        self.node.clone().node_unstage_volume(req).await?;
        Ok(())
    }

    async fn node_publish_volume(&self, request: PublishRequest) -> Result<(), tonic::Status> {
        let req = csi::NodePublishVolumeRequest {
            volume_id: request.volume_id,
            publish_context: request.publish_context,
            staging_target_path: request
                .staging_path
                .as_deref()
                .map(path_string)
                .unwrap_or_default(),
            target_path: path_string(&request.target_path),
            volume_capability: Some(csi::VolumeCapability::from(&request.capability)),
            readonly: request.read_only,
            secrets: request.secrets,
            volume_context: request.volume_context,
        };
        self.node.clone().node_publish_volume(req).await?;
        Ok(())
    }

    async fn node_unpublish_volume(
        &self,
        volume_id: &str,
        target_path: &Path,
    ) -> Result<(), tonic::Status> {
        let req = csi::NodeUnpublishVolumeRequest {
            volume_id: volume_id.to_string(),
            target_path: path_string(target_path),
        };
        self.node.clone().node_unpublish_volume(req).await?;
        Ok(())
    }
}
