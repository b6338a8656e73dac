//! Volume Manager CLI
//!
//! Connects to a CSI plugin's node socket and mounts or unmounts one volume
//! for one allocation, the way an allocation runner would.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use volume_manager::plugin::DEFAULT_CONNECT_TIMEOUT;
use volume_manager::{
    AccessMode, Allocation, AttachmentMode, GrpcPluginClient, OpContext, Volume, VolumeManager,
    VolumeManagerConfig,
};

/// CLI arguments for the volume manager
#[derive(Parser, Debug)]
#[command(name = "volume-manager")]
#[command(about = "Stage and publish CSI volumes on this node")]
struct Args {
    /// CSI plugin endpoint (unix:///path/to/csi.sock or http://host:port)
    #[arg(long, env = "CSI_PLUGIN_ENDPOINT")]
    plugin_endpoint: String,

    /// JSON config file; flags below override its values
    #[arg(long, env = "VOLUME_MANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Host directory for staging and per-allocation mounts
    #[arg(long, env = "CSI_MOUNT_ROOT")]
    mount_root: Option<PathBuf>,

    /// Where the plugin sees the mount root, if different
    #[arg(long, env = "CSI_CONTAINER_MOUNT_POINT")]
    container_mount_point: Option<PathBuf>,

    /// Whether the plugin stages volumes (queried from the plugin if unset)
    #[arg(long)]
    requires_staging: Option<bool>,

    /// Overall deadline for the operation in seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage (if needed) and publish a volume for an allocation
    Mount {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Unpublish a volume for an allocation, unstaging it if unused
    Unmount {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct TargetArgs {
    /// Allocation the volume is mounted for
    #[arg(long)]
    alloc_id: String,

    /// Volume description as JSON; replaces the inline volume flags
    #[arg(long, conflicts_with = "volume_id")]
    volume_file: Option<PathBuf>,

    /// Volume ID
    #[arg(long, required_unless_present = "volume_file")]
    volume_id: Option<String>,

    /// Volume ID known to the plugin, if different
    #[arg(long)]
    external_id: Option<String>,

    /// block-device or file-system
    #[arg(long, default_value = "file-system")]
    attachment_mode: String,

    /// single-node-reader-only, single-node-writer, multi-node-reader-only,
    /// multi-node-single-writer or multi-node-multi-writer
    #[arg(long, default_value = "single-node-writer")]
    access_mode: String,

    /// Mount the volume read-only
    #[arg(long, default_value = "false")]
    read_only: bool,
}

impl TargetArgs {
    fn volume(&self) -> Result<Volume, Box<dyn std::error::Error>> {
        if let Some(path) = &self.volume_file {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read volume file '{}': {}", path.display(), e))?;
            let volume: Volume = serde_json::from_str(&contents)
                .map_err(|e| format!("Invalid volume file '{}': {}", path.display(), e))?;
            return Ok(volume);
        }

        let id = self
            .volume_id
            .clone()
            .ok_or("either --volume-id or --volume-file is required")?;
        let mut volume = Volume::new(
            id,
            AttachmentMode::from(self.attachment_mode.as_str()),
            AccessMode::from(self.access_mode.as_str()),
        )
        .read_only(self.read_only);
        volume.external_id = self.external_id.clone();
        Ok(volume)
    }
}

fn init_tracing(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => VolumeManagerConfig::from_file(path).map_err(|e| e.to_string())?,
        None => VolumeManagerConfig::default(),
    };
    if let Some(mount_root) = args.mount_root {
        config.mount_root = mount_root;
    }
    if let Some(container_mount_point) = args.container_mount_point {
        config.container_mount_point = Some(container_mount_point);
    }

    let client = GrpcPluginClient::connect(&args.plugin_endpoint, DEFAULT_CONNECT_TIMEOUT).await?;
    match client.plugin_info().await {
        Ok((name, version)) => info!(
            plugin = %name,
            version = %version,
            endpoint = %args.plugin_endpoint,
            "Connected to CSI plugin"
        ),
        Err(e) => warn!(error = %e, "Could not query plugin info"),
    }

    config.requires_staging = match args.requires_staging {
        Some(requires_staging) => requires_staging,
        None => client.requires_staging().await?,
    };

    let manager = VolumeManager::new(config, Arc::new(client));
    info!(
        mount_root = %manager.paths().mount_root().display(),
        requires_staging = manager.requires_staging(),
        "Starting volume manager"
    );
    let ctx = OpContext::with_timeout(Duration::from_secs(args.timeout_secs));

    // Ctrl-C cancels any in-flight plugin call
    let cancel = ctx.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    match args.command {
        Command::Mount { target } => {
            let volume = target.volume()?;
            let alloc = Allocation::new(target.alloc_id);
            let info = manager.mount_volume(&ctx, &volume, &alloc).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Unmount { target } => {
            let volume = target.volume()?;
            let alloc = Allocation::new(target.alloc_id);
            manager.unmount_volume(&ctx, &volume, &alloc).await?;
        }
    }

    Ok(())
}
