//! Domain vocabulary for volume usage on a node.
//!
//! These types describe a volume as the orchestrator hands it to the node
//! (attachment mode, access mode, mount options) and the allocation that
//! wants to consume it. The mode enums keep any unrecognized value they are
//! built from instead of rejecting it, so a corrupted or newer record reaches
//! the capability translator and fails there as an invalid state.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque key/value blob issued by the controller side and forwarded to the
/// plugin on stage and publish. Empty when the orchestrator supplied none.
pub type PublishContext = HashMap<String, String>;

// ============================================================================
// AttachmentMode
// ============================================================================

/// How a volume is exposed to the workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttachmentMode {
    /// Raw block device
    BlockDevice,
    /// Mounted filesystem
    Filesystem,
    /// A value this node does not recognize
    Unknown(String),
}

impl AttachmentMode {
    pub fn as_str(&self) -> &str {
        match self {
            AttachmentMode::BlockDevice => "block-device",
            AttachmentMode::Filesystem => "file-system",
            AttachmentMode::Unknown(raw) => raw,
        }
    }
}

impl Display for AttachmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for AttachmentMode {
    fn from(value: &str) -> Self {
        match value {
            "block-device" => AttachmentMode::BlockDevice,
            "file-system" => AttachmentMode::Filesystem,
            other => AttachmentMode::Unknown(other.to_string()),
        }
    }
}

impl From<String> for AttachmentMode {
    fn from(value: String) -> Self {
        AttachmentMode::from(value.as_str())
    }
}

impl From<AttachmentMode> for String {
    fn from(value: AttachmentMode) -> Self {
        value.as_str().to_string()
    }
}

// ============================================================================
// AccessMode
// ============================================================================

/// Sharing and readability contract a volume is attached under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccessMode {
    SingleNodeReader,
    SingleNodeWriter,
    MultiNodeReader,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    /// A value this node does not recognize
    Unknown(String),
}

impl AccessMode {
    pub fn as_str(&self) -> &str {
        match self {
            AccessMode::SingleNodeReader => "single-node-reader-only",
            AccessMode::SingleNodeWriter => "single-node-writer",
            AccessMode::MultiNodeReader => "multi-node-reader-only",
            AccessMode::MultiNodeSingleWriter => "multi-node-single-writer",
            AccessMode::MultiNodeMultiWriter => "multi-node-multi-writer",
            AccessMode::Unknown(raw) => raw,
        }
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for AccessMode {
    fn from(value: &str) -> Self {
        match value {
            "single-node-reader-only" => AccessMode::SingleNodeReader,
            "single-node-writer" => AccessMode::SingleNodeWriter,
            "multi-node-reader-only" => AccessMode::MultiNodeReader,
            "multi-node-single-writer" => AccessMode::MultiNodeSingleWriter,
            "multi-node-multi-writer" => AccessMode::MultiNodeMultiWriter,
            other => AccessMode::Unknown(other.to_string()),
        }
    }
}

impl From<String> for AccessMode {
    fn from(value: String) -> Self {
        AccessMode::from(value.as_str())
    }
}

impl From<AccessMode> for String {
    fn from(value: AccessMode) -> Self {
        value.as_str().to_string()
    }
}

// ============================================================================
// Volume / Allocation
// ============================================================================

/// Filesystem mount options passed to the plugin for mount-type volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// A volume as requested by an allocation on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Identifier in the orchestrator's namespace; names local directories.
    pub id: String,
    /// Identifier the plugin knows the volume by, when it differs from `id`.
    #[serde(default)]
    pub external_id: Option<String>,
    pub attachment_mode: AttachmentMode,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub mount_options: Option<MountOptions>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl Volume {
    pub fn new(
        id: impl Into<String>,
        attachment_mode: AttachmentMode,
        access_mode: AccessMode,
    ) -> Self {
        Self {
            id: id.into(),
            external_id: None,
            attachment_mode,
            access_mode,
            read_only: false,
            mount_options: None,
            secrets: HashMap::new(),
            context: HashMap::new(),
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// ID sent to the plugin.
    pub fn remote_id(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.id)
    }

    pub fn usage_key(&self) -> UsageKey {
        UsageKey {
            volume_id: self.id.clone(),
            attachment_mode: self.attachment_mode.clone(),
            access_mode: self.access_mode.clone(),
            read_only: self.read_only,
        }
    }
}

/// The workload consuming a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
}

impl Allocation {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

// ============================================================================
// UsageKey
// ============================================================================

/// Distinguishes independent staging instances of one volume.
///
/// The same volume attached under a different capability profile is staged
/// separately, so every component of the key shows up in the on-disk
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub volume_id: String,
    pub attachment_mode: AttachmentMode,
    pub access_mode: AccessMode,
    pub read_only: bool,
}

impl UsageKey {
    /// Directory name for this usage: `<ro|rw>-<attachment>-<access>`.
    pub fn encode(&self) -> String {
        let rw = if self.read_only { "ro" } else { "rw" };
        format!("{}-{}-{}", rw, self.attachment_mode, self.access_mode)
    }
}

impl Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.volume_id, self.encode())
    }
}

// ============================================================================
// MountInfo
// ============================================================================

/// Result handed back to the allocation runner after a successful mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Host path the runner bind-mounts into the workload.
    pub source: PathBuf,
    pub read_only: bool,
    /// The source is a block device node rather than a directory.
    pub is_device: bool,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_mode_from_str() {
        assert_eq!(
            AttachmentMode::from("block-device"),
            AttachmentMode::BlockDevice
        );
        assert_eq!(
            AttachmentMode::from("file-system"),
            AttachmentMode::Filesystem
        );
        assert_eq!(
            AttachmentMode::from("floppy"),
            AttachmentMode::Unknown("floppy".to_string())
        );
    }

    #[test]
    fn test_access_mode_display_matches_parse() {
        for mode in [
            AccessMode::SingleNodeReader,
            AccessMode::SingleNodeWriter,
            AccessMode::MultiNodeReader,
            AccessMode::MultiNodeSingleWriter,
            AccessMode::MultiNodeMultiWriter,
        ] {
            assert_eq!(AccessMode::from(mode.to_string()), mode);
        }
    }

    #[test]
    fn test_usage_key_encoding() {
        let vol = Volume::new(
            "vol-1",
            AttachmentMode::Filesystem,
            AccessMode::SingleNodeWriter,
        );
        assert_eq!(
            vol.usage_key().encode(),
            "rw-file-system-single-node-writer"
        );

        let ro = vol.clone().read_only(true);
        assert_eq!(
            ro.usage_key().encode(),
            "ro-file-system-single-node-writer"
        );
        assert_ne!(vol.usage_key(), ro.usage_key());
    }

    #[test]
    fn test_remote_id_prefers_external_id() {
        let mut vol = Volume::new(
            "vol-1",
            AttachmentMode::BlockDevice,
            AccessMode::MultiNodeReader,
        );
        assert_eq!(vol.remote_id(), "vol-1");

        vol.external_id = Some("pvc-1234".to_string());
        assert_eq!(vol.remote_id(), "pvc-1234");
        assert_eq!(vol.usage_key().volume_id, "vol-1");
    }

    #[test]
    fn test_volume_deserialize_keeps_unknown_modes() {
        let json = r#"{
            "id": "vol-9",
            "attachment_mode": "tape",
            "access_mode": "single-node-writer"
        }"#;
        let vol: Volume = serde_json::from_str(json).unwrap();
        assert_eq!(vol.attachment_mode, AttachmentMode::Unknown("tape".into()));
        assert_eq!(vol.access_mode, AccessMode::SingleNodeWriter);
        assert!(!vol.read_only);
        assert!(vol.secrets.is_empty());
        assert!(vol.mount_options.is_none());
    }
}
