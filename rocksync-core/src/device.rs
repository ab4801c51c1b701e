use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::sync::index::device_db_path;

pub const DEVICE_MUSIC_DIR: &str = "Music";
pub const DUMMY_DEVICE_LABEL: &str = "Dummy Device";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub mountpoint: PathBuf,
    pub label: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DeviceInfo {
    pub fn probe(mountpoint: impl Into<PathBuf>, label: Option<String>) -> Self {
        let mountpoint = mountpoint.into();
        let (total_bytes, free_bytes) = match disk_usage(&mountpoint) {
            Ok(usage) => usage,
            Err(err) => {
                debug!(mountpoint = %mountpoint.display(), error = %err, "disk usage unavailable");
                (0, 0)
            }
        };
        let label = label.unwrap_or_else(|| {
            mountpoint
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| mountpoint.to_string_lossy().into_owned())
        });
        Self {
            mountpoint,
            label,
            total_bytes,
            free_bytes,
        }
    }

    /// Destination root mirrored by a sync.
    pub fn music_root(&self) -> PathBuf {
        self.mountpoint.join(DEVICE_MUSIC_DIR)
    }

    pub fn index_path(&self) -> PathBuf {
        device_db_path(&self.mountpoint)
    }
}

/// Source of candidate destination devices.
pub trait DeviceLocator: Send + Sync {
    fn devices(&self) -> Vec<DeviceInfo>;
}

/// Devices named in configuration. The dummy device, when set, is listed
/// first.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredDevices {
    pub mounts: Vec<PathBuf>,
    pub dummy: Option<PathBuf>,
}

impl DeviceLocator for ConfiguredDevices {
    fn devices(&self) -> Vec<DeviceInfo> {
        let mut out = Vec::with_capacity(self.mounts.len() + 1);
        if let Some(dummy) = &self.dummy {
            out.push(DeviceInfo::probe(dummy, Some(DUMMY_DEVICE_LABEL.to_string())));
        }
        out.extend(
            self.mounts
                .iter()
                .filter(|mount| mount.is_dir())
                .map(|mount| DeviceInfo::probe(mount, None)),
        );
        out
    }
}

/// `(total, free)` bytes of the filesystem holding `path`.
#[cfg(unix)]
pub fn disk_usage(path: &Path) -> io::Result<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let fragment = stat.f_frsize as u64;
    Ok((
        (stat.f_blocks as u64).saturating_mul(fragment),
        (stat.f_bavail as u64).saturating_mul(fragment),
    ))
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> io::Result<(u64, u64)> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "disk usage is only available on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dummy_device_comes_first_with_capacity() {
        let dir = tempdir().unwrap();
        let player = dir.path().join("player");
        std::fs::create_dir_all(&player).unwrap();

        let locator = ConfiguredDevices {
            mounts: vec![player.clone(), dir.path().join("unplugged")],
            dummy: Some(dir.path().to_path_buf()),
        };
        let devices = locator.devices();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].label, DUMMY_DEVICE_LABEL);
        assert_eq!(devices[1].label, "player");
        assert_eq!(devices[1].music_root(), player.join("Music"));
        assert_eq!(
            devices[1].index_path(),
            player.join(".rocksync/music_index.sqlite3")
        );
        #[cfg(unix)]
        assert!(devices[0].total_bytes >= devices[0].free_bytes && devices[0].total_bytes > 0);
    }
}
