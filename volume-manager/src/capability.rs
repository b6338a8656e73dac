//! Translation of domain attachment/access modes into CSI volume capabilities.
//!
//! Modes are validated when a job is admitted, so a failure here means a
//! corrupted record, a version skew between node and server, or a bug. It is
//! reported as [`VolumeError::InvalidState`] and never defaulted.

use crate::csi;
use crate::error::{Result, VolumeError};
use crate::types::{AccessMode, AttachmentMode, MountOptions, Volume};

/// CSI access type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    Block,
    Mount(MountOptions),
}

/// CSI access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireAccessMode {
    SingleNodeReaderOnly,
    SingleNodeWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Capability descriptor sent with stage and publish calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: WireAccessMode,
}

impl VolumeCapability {
    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }
}

/// Map an attachment mode to its CSI access type.
pub fn access_type(volume_id: &str, mode: &AttachmentMode) -> Result<AccessType> {
    match mode {
        AttachmentMode::BlockDevice => Ok(AccessType::Block),
        AttachmentMode::Filesystem => Ok(AccessType::Mount(MountOptions::default())),
        AttachmentMode::Unknown(raw) => Err(VolumeError::InvalidState {
            volume_id: volume_id.to_string(),
            reason: format!("unknown volume attachment mode '{}'", raw),
        }),
    }
}

/// Map an access mode to its CSI access mode.
pub fn access_mode(volume_id: &str, mode: &AccessMode) -> Result<WireAccessMode> {
    match mode {
        AccessMode::SingleNodeReader => Ok(WireAccessMode::SingleNodeReaderOnly),
        AccessMode::SingleNodeWriter => Ok(WireAccessMode::SingleNodeWriter),
        AccessMode::MultiNodeReader => Ok(WireAccessMode::MultiNodeReaderOnly),
        AccessMode::MultiNodeSingleWriter => Ok(WireAccessMode::MultiNodeSingleWriter),
        AccessMode::MultiNodeMultiWriter => Ok(WireAccessMode::MultiNodeMultiWriter),
        AccessMode::Unknown(raw) => Err(VolumeError::InvalidState {
            volume_id: volume_id.to_string(),
            reason: format!("unknown volume access mode '{}'", raw),
        }),
    }
}

/// Build the capability descriptor for a volume.
///
/// Mount options are only carried for the mount access type; block volumes
/// have nothing to mount.
pub fn translate(volume: &Volume) -> Result<VolumeCapability> {
    let access_type = match access_type(&volume.id, &volume.attachment_mode)? {
        AccessType::Mount(_) => AccessType::Mount(volume.mount_options.clone().unwrap_or_default()),
        AccessType::Block => AccessType::Block,
    };
    let access_mode = access_mode(&volume.id, &volume.access_mode)?;

    Ok(VolumeCapability {
        access_type,
        access_mode,
    })
}

impl From<WireAccessMode> for csi::volume_capability::access_mode::Mode {
    fn from(value: WireAccessMode) -> Self {
        use csi::volume_capability::access_mode::Mode;
        match value {
            WireAccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
            WireAccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
            WireAccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
            WireAccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
            WireAccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
        }
    }
}

impl From<&VolumeCapability> for csi::VolumeCapability {
    fn from(value: &VolumeCapability) -> Self {
        use csi::volume_capability::{self, access_mode::Mode};

        let access_type = match &value.access_type {
            AccessType::Block => {
                volume_capability::AccessType::Block(volume_capability::BlockVolume {})
            }
            AccessType::Mount(opts) => {
                volume_capability::AccessType::Mount(volume_capability::MountVolume {
                    fs_type: opts.fs_type.clone().unwrap_or_default(),
                    mount_flags: opts.mount_flags.clone(),
                    volume_mount_group: String::new(),
                })
            }
        };

        csi::VolumeCapability {
            access_type: Some(access_type),
            access_mode: Some(volume_capability::AccessMode {
                mode: Mode::from(value.access_mode) as i32,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTACHMENTS: [(AttachmentMode, bool); 2] = [
        (AttachmentMode::BlockDevice, true),
        (AttachmentMode::Filesystem, false),
    ];

    fn access_table() -> Vec<(AccessMode, WireAccessMode)> {
        vec![
            (
                AccessMode::SingleNodeReader,
                WireAccessMode::SingleNodeReaderOnly,
            ),
            (AccessMode::SingleNodeWriter, WireAccessMode::SingleNodeWriter),
            (
                AccessMode::MultiNodeReader,
                WireAccessMode::MultiNodeReaderOnly,
            ),
            (
                AccessMode::MultiNodeSingleWriter,
                WireAccessMode::MultiNodeSingleWriter,
            ),
            (
                AccessMode::MultiNodeMultiWriter,
                WireAccessMode::MultiNodeMultiWriter,
            ),
        ]
    }

    #[test]
    fn test_translate_all_known_combinations() {
        for (attachment, is_block) in ATTACHMENTS {
            for (access, expected) in access_table() {
                let vol = Volume::new("vol-1", attachment.clone(), access.clone());
                let cap = translate(&vol).unwrap();
                assert_eq!(cap.access_mode, expected, "{} / {}", attachment, access);
                assert_eq!(cap.is_block(), is_block, "{} / {}", attachment, access);
            }
        }
    }

    #[test]
    fn test_unknown_attachment_mode_is_invalid_state() {
        let vol = Volume::new(
            "vol-1",
            AttachmentMode::from("unknown"),
            AccessMode::SingleNodeWriter,
        );
        match translate(&vol) {
            Err(VolumeError::InvalidState { volume_id, reason }) => {
                assert_eq!(volume_id, "vol-1");
                assert!(reason.contains("attachment mode"));
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_access_mode_is_invalid_state() {
        let vol = Volume::new(
            "vol-1",
            AttachmentMode::Filesystem,
            AccessMode::from("single-node-single-writer"),
        );
        assert!(matches!(
            translate(&vol),
            Err(VolumeError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_mount_options_only_for_mount_access_type() {
        let opts = MountOptions {
            fs_type: Some("xfs".to_string()),
            mount_flags: vec!["noatime".to_string()],
        };

        let mut fs = Volume::new(
            "vol-1",
            AttachmentMode::Filesystem,
            AccessMode::SingleNodeWriter,
        );
        fs.mount_options = Some(opts.clone());
        assert_eq!(translate(&fs).unwrap().access_type, AccessType::Mount(opts.clone()));

        let mut block = Volume::new(
            "vol-1",
            AttachmentMode::BlockDevice,
            AccessMode::SingleNodeWriter,
        );
        block.mount_options = Some(opts);
        assert_eq!(translate(&block).unwrap().access_type, AccessType::Block);
    }

    #[test]
    fn test_proto_conversion() {
        use csi::volume_capability::access_mode::Mode;

        let cap = VolumeCapability {
            access_type: AccessType::Mount(MountOptions {
                fs_type: Some("ext4".to_string()),
                mount_flags: vec![],
            }),
            access_mode: WireAccessMode::MultiNodeSingleWriter,
        };
        let proto = csi::VolumeCapability::from(&cap);

        assert_eq!(
            proto.access_mode.unwrap().mode,
            Mode::MultiNodeSingleWriter as i32
        );
        match proto.access_type {
            Some(csi::volume_capability::AccessType::Mount(m)) => assert_eq!(m.fs_type, "ext4"),
            other => panic!("expected mount access type, got {:?}", other),
        }
    }
}
