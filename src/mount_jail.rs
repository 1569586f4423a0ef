/// pivot_root based rootfs isolation
use crate::types::{LxceError, Result};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};
use std::ffi::{CString, OsString};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const TMP_ROOT_TEMPLATE: &str = "tmp.lxce.XXXXXX";
const OLD_ROOT_TEMPLATE: &str = "oldroot.XXXXXX";

/// Create a unique directory from a template ending in `XXXXXX`
fn mkdtemp(template: &Path) -> nix::Result<PathBuf> {
    let template = CString::new(template.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    let mut bytes = template.into_bytes_with_nul();

    let ret = unsafe { libc::mkdtemp(bytes.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return Err(Errno::last());
    }

    bytes.pop();
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

/// Removes a temporary directory unless disarmed
struct DirGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_dir(&self.path) {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Detaches a bind mount unless disarmed
struct MountGuard {
    target: PathBuf,
    armed: bool,
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = umount2(&self.target, MntFlags::MNT_DETACH) {
                log::warn!("Failed to unmount {}: {}", self.target.display(), e);
            }
        }
    }
}

/// Confines the calling process (already in a private mount namespace) to a rootfs
pub struct MountJail<'a> {
    label: &'a str,
    rootfs: &'a Path,
    tmp_base: PathBuf,
}

impl<'a> MountJail<'a> {
    pub fn new(label: &'a str, rootfs: &'a Path) -> Self {
        Self {
            label,
            rootfs,
            tmp_base: PathBuf::from("/tmp"),
        }
    }

    /// Directory holding the temporary new-root mount point
    pub fn with_tmp_base(mut self, base: &Path) -> Self {
        self.tmp_base = base.to_path_buf();
        self
    }

    /// Bind the rootfs, pivot into it and detach the old root
    ///
    /// Temporary directories and the bind mount are rolled back if any step
    /// before the pivot fails.
    pub fn isolate(&self) -> Result<()> {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| self.error(format!("Failed to make / private: {}", e)))?;

        let tmp_root = mkdtemp(&self.tmp_base.join(TMP_ROOT_TEMPLATE))
            .map_err(|e| self.error(format!("Failed to create temp root: {}", e)))?;
        let mut tmp_guard = DirGuard {
            path: tmp_root.clone(),
            armed: true,
        };

        mount(
            Some(self.rootfs),
            &tmp_root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| {
            self.error(format!(
                "Failed to bind {} on {}: {}",
                self.rootfs.display(),
                tmp_root.display(),
                e
            ))
        })?;
        let mut mount_guard = MountGuard {
            target: tmp_root.clone(),
            armed: true,
        };

        let old_root = mkdtemp(&tmp_root.join(OLD_ROOT_TEMPLATE))
            .map_err(|e| self.error(format!("Failed to create old root dir: {}", e)))?;
        let mut old_guard = DirGuard {
            path: old_root.clone(),
            armed: true,
        };

        pivot_root(&tmp_root, &old_root).map_err(|e| {
            self.error(format!(
                "pivot_root {} {} failed: {}",
                tmp_root.display(),
                old_root.display(),
                e
            ))
        })?;

        // host paths are meaningless past this point
        old_guard.armed = false;
        mount_guard.armed = false;
        tmp_guard.armed = false;

        chdir("/").map_err(|e| self.error(format!("chdir / failed: {}", e)))?;

        let inside = old_root_in_new_root(&tmp_root, &old_root)?;
        umount2(&inside, MntFlags::MNT_DETACH).map_err(|e| {
            self.error(format!("Failed to unmount {}: {}", inside.display(), e))
        })?;
        fs::remove_dir(&inside).map_err(|e| {
            self.error(format!("Failed to remove {}: {}", inside.display(), e))
        })?;
        Ok(())
    }

    fn error(&self, msg: String) -> LxceError {
        LxceError::NamespaceSetup(format!("{}: {}", self.label, msg))
    }
}

/// Where `old_root` is visible after pivoting into `new_root`
pub fn old_root_in_new_root(new_root: &Path, old_root: &Path) -> Result<PathBuf> {
    let relative = old_root.strip_prefix(new_root).map_err(|_| {
        LxceError::NamespaceSetup(format!(
            "{} is not below {}",
            old_root.display(),
            new_root.display()
        ))
    })?;
    Ok(Path::new("/").join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_old_root_path_after_pivot() {
        let inside = old_root_in_new_root(
            Path::new("/tmp/tmp.lxce.abc123"),
            Path::new("/tmp/tmp.lxce.abc123/oldroot.xyz789"),
        )
        .unwrap();
        assert_eq!(inside, PathBuf::from("/oldroot.xyz789"));
    }

    #[test]
    fn test_old_root_outside_new_root() {
        assert!(old_root_in_new_root(Path::new("/tmp/a"), Path::new("/tmp/b/old")).is_err());
    }

    #[test]
    fn test_mkdtemp_creates_unique_dirs() {
        let base = tempfile::TempDir::new().unwrap();
        let template = base.path().join(TMP_ROOT_TEMPLATE);

        let first = mkdtemp(&template).unwrap();
        let second = mkdtemp(&template).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir());
        assert_eq!(first.parent(), Some(base.path()));
        assert!(first
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("tmp.lxce.") && !n.ends_with("XXXXXX")));
    }

    #[test]
    fn test_mkdtemp_missing_parent() {
        let base = tempfile::TempDir::new().unwrap();
        let template = base.path().join("absent").join(OLD_ROOT_TEMPLATE);
        assert_eq!(mkdtemp(&template), Err(Errno::ENOENT));
    }

    #[test]
    fn test_dir_guard_rolls_back() {
        let base = tempfile::TempDir::new().unwrap();
        let dir = base.path().join("jail");
        fs::create_dir(&dir).unwrap();
        {
            let _guard = DirGuard {
                path: dir.clone(),
                armed: true,
            };
        }
        assert!(!dir.exists());

        fs::create_dir(&dir).unwrap();
        {
            let mut guard = DirGuard {
                path: dir.clone(),
                armed: true,
            };
            guard.armed = false;
        }
        assert!(dir.exists());
    }
}
