//! Free-space measurement for cache roots
//!
//! Cache roots are either local directories or network shares
//! (`\\server\share\...`). [`probe_for_path`] picks the right probe for a
//! root; [`SystemDiskSpace`] does that selection on every call and is what the
//! agent uses by default.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Capability to measure free bytes available at a path
pub trait DiskSpaceProbe: Send + Sync {
    /// Free bytes available to the current user on the volume holding `path`
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// Convert bytes to GB (1024^3)
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Convert GB (1024^3) to bytes
pub fn gb_to_bytes(gb: f64) -> u64 {
    if gb <= 0.0 {
        0
    } else {
        (gb * BYTES_PER_GB).ceil() as u64
    }
}

/// Whether a path names a network share (`\\server\share` or `//server/share`)
pub fn is_network_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with(r"\\") || s.starts_with("//")
}

/// Probe for paths on a locally mounted volume
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalVolumeProbe;

impl DiskSpaceProbe for LocalVolumeProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        // The cache root may not exist yet; measure the closest existing ancestor
        let existing = nearest_existing_ancestor(path).ok_or_else(|| {
            Error::DiskSpaceCheckFailed(format!(
                "no existing directory found for {}",
                path.display()
            ))
        })?;

        get_available_space(&existing).map_err(|e| {
            Error::DiskSpaceCheckFailed(format!("{}: {}", existing.display(), e))
        })
    }
}

/// Probe for paths on a network share
///
/// Free space is measured at the share root with a trailing separator, which
/// is the form the platform APIs accept for shares.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetworkShareProbe;

impl NetworkShareProbe {
    /// `\\server\share\` for any path below that share
    pub fn share_root(path: &Path) -> Option<String> {
        let s = path.to_string_lossy();
        let separator = if s.starts_with(r"\\") { '\\' } else { '/' };
        let rest = s.trim_start_matches(['\\', '/']);
        let mut parts = rest.split(['\\', '/']).filter(|p| !p.is_empty());
        let server = parts.next()?;
        let share = parts.next()?;
        Some(format!(
            "{sep}{sep}{server}{sep}{share}{sep}",
            sep = separator
        ))
    }
}

impl DiskSpaceProbe for NetworkShareProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let root = Self::share_root(path).ok_or_else(|| {
            Error::DiskSpaceCheckFailed(format!(
                "{} is not a valid network share path",
                path.display()
            ))
        })?;

        get_available_space(Path::new(&root))
            .map_err(|e| Error::DiskSpaceCheckFailed(format!("{}: {}", root, e)))
    }
}

/// Pick the probe that can measure `path`
pub fn probe_for_path(path: &Path) -> Box<dyn DiskSpaceProbe> {
    if is_network_path(path) {
        Box::new(NetworkShareProbe)
    } else {
        Box::new(LocalVolumeProbe)
    }
}

/// Probe that dispatches to [`LocalVolumeProbe`] or [`NetworkShareProbe`] per path
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDiskSpace;

impl DiskSpaceProbe for SystemDiskSpace {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        probe_for_path(path).free_bytes(path)
    }
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .or_else(|| {
            if path.is_relative() {
                Some(PathBuf::from("."))
            } else {
                None
            }
        })
}

/// Get available disk space for a path
///
/// Returns the number of bytes available to the current user on the
/// filesystem containing the given path.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zeroed before
        // the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail is blocks available to unprivileged users
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out pointer refers to
        // a live, aligned u64 that is only read after a successful call.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}
