//! Host filesystem helpers: mount-point detection and directory management.
//!
//! The manager never mounts anything itself. It only creates the directories
//! the plugin mounts onto and asks the host whether a path is already an
//! active mount.

use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

use tracing::debug;

/// Permissions for staging and publish directories (owner only).
pub const DIR_MODE: u32 = 0o700;

/// Answers whether a path is currently an active mount.
pub trait MountProber: Send + Sync {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;
}

/// Prober backed by the host mount table.
#[derive(Debug, Clone, Default)]
pub struct HostMountProber;

impl MountProber for HostMountProber {
    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        let target = path.to_string_lossy();

        // On Linux, check /proc/mounts for efficiency
        if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
            return Ok(mount_table_contains(&mounts, &target));
        }

        // Fallback to mount command
        let output = Command::new("mount").output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "mount exited with {}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .any(|line| line.split_whitespace().nth(2) == Some(&*target)))
    }
}

/// Check a `/proc/mounts` formatted table for a mount point.
fn mount_table_contains(table: &str, target: &str) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| unescape_mount_field(mount_point) == target)
}

/// Undo the octal escaping the kernel applies to whitespace in mount fields.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3
                && let Ok(byte) = u8::from_str_radix(&digits, 8)
            {
                out.push(byte as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Create a directory (and parents) owned by this process, mode 0700.
/// An existing directory is not an error.
pub async fn ensure_dir(path: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);

    builder.create(path).await
}

/// Remove a directory that the plugin has finished with.
///
/// Missing directories are fine. A directory that is not empty is still in
/// use by something else and is left in place.
pub async fn remove_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed directory");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
            debug!(path = %path.display(), "Directory not empty, leaving in place");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /data/csi/staging/vol-1/rw-file-system-single-node-writer ext4 rw 0 0
/dev/sdc1 /mnt/with\\040space xfs rw 0 0
";

    #[test]
    fn test_mount_table_contains() {
        assert!(mount_table_contains(PROC_MOUNTS, "/"));
        assert!(mount_table_contains(
            PROC_MOUNTS,
            "/data/csi/staging/vol-1/rw-file-system-single-node-writer"
        ));
        assert!(!mount_table_contains(PROC_MOUNTS, "/data/csi/staging/vol-1"));
        assert!(!mount_table_contains(PROC_MOUNTS, "/data"));
    }

    #[test]
    fn test_mount_table_unescapes_whitespace() {
        assert!(mount_table_contains(PROC_MOUNTS, "/mnt/with space"));
        assert_eq!(unescape_mount_field("/plain"), "/plain");
        assert_eq!(unescape_mount_field("/a\\011b"), "/a\tb");
    }

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("staging/vol-1/rw-block-device-single-node-writer");

        ensure_dir(&dir).await.unwrap();
        ensure_dir(&dir).await.unwrap();
        assert!(dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, DIR_MODE);
        }
    }

    #[tokio::test]
    async fn test_ensure_dir_fails_when_path_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("staging");
        std::fs::write(&file, b"not a dir").unwrap();

        assert!(ensure_dir(&file.join("vol-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_dir_tolerates_missing() {
        let tmp = tempfile::tempdir().unwrap();
        remove_dir(&tmp.path().join("missing")).await.unwrap();

        let dir = tmp.path().join("present");
        std::fs::create_dir(&dir).unwrap();
        remove_dir(&dir).await.unwrap();
        assert!(!dir.exists());
    }
}
