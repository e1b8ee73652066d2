//! Overlay mounts exposing each image as a writable view.
//!
//! The extracted rootfs stays read-only as the lower layer; a per-image
//! upper directory catches writes and the kernel combines the two at the
//! active mount point. The mount primitive itself sits behind the
//! [`Mounter`] trait so tests (and non-Linux hosts) can substitute an
//! in-memory implementation.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use crate::layout::StorageLayout;

/// Errors from overlay operations.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("overlay mount failed for {target}: {source}")]
    Mount {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("unmount failed for {target}: {source}")]
    Unmount {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Host mount primitive.
pub trait Mounter: Send + Sync {
    /// Mount an overlay of `lower` + `upper` (scratch `work`) at `target`.
    fn mount_overlay(&self, lower: &Path, upper: &Path, work: &Path, target: &Path)
        -> io::Result<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Whether a mount is currently live at `target`.
    fn is_mounted(&self, target: &Path) -> io::Result<bool>;
}

/// Kernel overlayfs mounter. Linux-only; the stubs on other platforms
/// report the operation as unsupported.
pub struct OverlayMounter;

#[cfg(target_os = "linux")]
impl Mounter for OverlayMounter {
    fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> io::Result<()> {
        use std::ffi::CString;

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );

        let source = CString::new("overlay").expect("static string");
        let fstype = CString::new("overlay").expect("static string");
        let target_c = path_to_cstring(target)?;
        let data_c = CString::new(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target_c.as_ptr(),
                fstype.as_ptr(),
                0,
                data_c.as_ptr() as *const libc::c_void,
            )
        };

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let target_c = path_to_cstring(target)?;

        let rc = unsafe { libc::umount2(target_c.as_ptr(), 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        let needle = target.to_string_lossy();
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mountpoint| mountpoint == needle))
    }
}

#[cfg(target_os = "linux")]
fn path_to_cstring(path: &Path) -> io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

#[cfg(not(target_os = "linux"))]
impl Mounter for OverlayMounter {
    fn mount_overlay(
        &self,
        _lower: &Path,
        _upper: &Path,
        _work: &Path,
        _target: &Path,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "overlay mounts only supported on Linux",
        ))
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "overlay mounts only supported on Linux",
        ))
    }

    fn is_mounted(&self, _target: &Path) -> io::Result<bool> {
        Ok(false)
    }
}

/// In-memory mounter for tests and development.
#[derive(Default)]
pub struct MockMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    fail_mounts: bool,
}

impl MockMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mounter that fails every mount attempt.
    pub fn failing() -> Self {
        Self {
            mounted: Mutex::new(HashSet::new()),
            fail_mounts: true,
        }
    }
}

impl Mounter for MockMounter {
    fn mount_overlay(
        &self,
        lower: &Path,
        _upper: &Path,
        _work: &Path,
        target: &Path,
    ) -> io::Result<()> {
        if self.fail_mounts {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "mock mounter configured to fail",
            ));
        }
        if !lower.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("lower directory missing: {}", lower.display()),
            ));
        }
        self.mounted.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        if self.mounted.lock().unwrap().remove(target) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidInput, "not mounted"))
        }
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        Ok(self.mounted.lock().unwrap().contains(target))
    }
}

/// Materializes and tears down per-image writable views.
pub struct OverlayManager {
    layout: StorageLayout,
    mounter: std::sync::Arc<dyn Mounter>,
}

impl OverlayManager {
    pub fn new(layout: StorageLayout, mounter: std::sync::Arc<dyn Mounter>) -> Self {
        Self { layout, mounter }
    }

    /// Mount the image's overlay at its active directory, creating the
    /// upper/work/active directories first. A mount already live at the
    /// target (e.g. after a restart mid-ACTIVATING) is treated as success.
    pub fn activate(&self, name: &str) -> Result<(), OverlayError> {
        let lower = self.layout.image_root(name);
        let upper = self.layout.upper_dir(name);
        let work = self.layout.work_dir(name);
        let target = self.layout.active_dir(name);

        for dir in [&upper, &work, &target] {
            fs::create_dir_all(dir)?;
        }

        if self.mounter.is_mounted(&target)? {
            debug!(image = %name, target = %target.display(), "Overlay already mounted");
            return Ok(());
        }

        self.mounter
            .mount_overlay(&lower, &upper, &work, &target)
            .map_err(|source| OverlayError::Mount {
                target: target.display().to_string(),
                source,
            })?;

        info!(image = %name, target = %target.display(), "Overlay mounted");
        Ok(())
    }

    /// Unmount the image's active directory. Nothing mounted is a no-op.
    pub fn deactivate(&self, name: &str) -> Result<(), OverlayError> {
        let target = self.layout.active_dir(name);

        if !self.mounter.is_mounted(&target)? {
            return Ok(());
        }

        self.mounter
            .unmount(&target)
            .map_err(|source| OverlayError::Unmount {
                target: target.display().to_string(),
                source,
            })?;

        info!(image = %name, target = %target.display(), "Overlay unmounted");
        Ok(())
    }

    /// Whether the image's overlay is currently mounted.
    pub fn is_active(&self, name: &str) -> Result<bool, OverlayError> {
        Ok(self.mounter.is_mounted(&self.layout.active_dir(name))?)
    }
}
