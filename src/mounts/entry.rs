//! Mount entries and mount points

use std::cmp::Ordering;

use super::classify::{guess_display_name, guess_mount_type, guess_system_internal, MountType};

/// An active mount, as read from the mount table
#[derive(Debug, Clone, Eq)]
pub struct UnixMountEntry {
    mount_path: String,
    device_path: String,
    root_path: Option<String>,
    filesystem_type: String,
    options: Option<String>,
    is_read_only: bool,
    is_system_internal: bool,
}

impl UnixMountEntry {
    /// Build an entry. System-internal status is derived from the fields.
    pub fn new(
        device_path: impl Into<String>,
        mount_path: impl Into<String>,
        root_path: Option<&str>,
        filesystem_type: impl Into<String>,
        options: Option<&str>,
        is_read_only: bool,
    ) -> Self {
        let mount_path = mount_path.into();
        let device_path = device_path.into();
        let filesystem_type = filesystem_type.into();
        let is_system_internal =
            guess_system_internal(&mount_path, &filesystem_type, &device_path, root_path);

        Self {
            mount_path,
            device_path,
            root_path: root_path.map(str::to_string),
            filesystem_type,
            options: options.map(str::to_string),
            is_read_only,
            is_system_internal,
        }
    }

    #[must_use]
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    #[must_use]
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Path of the mounted directory within its filesystem, when known
    #[must_use]
    pub fn root_path(&self) -> Option<&str> {
        self.root_path.as_deref()
    }

    #[must_use]
    pub fn filesystem_type(&self) -> &str {
        &self.filesystem_type
    }

    /// Comma separated mount options, when known
    #[must_use]
    pub fn options(&self) -> Option<&str> {
        self.options.as_deref()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    #[must_use]
    pub fn is_system_internal(&self) -> bool {
        self.is_system_internal
    }

    #[must_use]
    pub fn guess_type(&self) -> MountType {
        guess_mount_type(&self.mount_path, &self.device_path, &self.filesystem_type)
    }

    #[must_use]
    pub fn guess_name(&self) -> String {
        guess_display_name(&self.mount_path)
    }

    #[must_use]
    pub fn guess_can_eject(&self) -> bool {
        self.guess_type().can_eject()
    }

    /// Whether a file manager should show this mount.
    ///
    /// Only user-facing locations qualify: `/media/`, `/run/media/<user>/`
    /// and the home directory. Mounts under a dot directory are hidden.
    #[must_use]
    pub fn guess_should_display(&self) -> bool {
        if self.is_system_internal {
            return false;
        }

        let mount_path = self.mount_path.as_str();

        if mount_path.contains("/.") {
            return false;
        }

        let in_runtime_dir = mount_path
            .strip_prefix("/run/media/")
            .is_some_and(|rest| {
                if running_as_root() {
                    return true;
                }
                current_user_name().is_some_and(|user| {
                    rest.strip_prefix(user.as_str())
                        .is_some_and(|tail| tail.starts_with('/'))
                })
            });

        if in_runtime_dir || mount_path.starts_with("/media/") {
            let parent = mount_path.rsplit_once('/').map_or("", |(dir, _)| dir);
            if parent.starts_with("/media/") && !is_accessible(parent) {
                return false;
            }

            if self.device_path.starts_with('/')
                && is_block_device(&self.device_path)
                && !is_accessible(mount_path)
            {
                return false;
            }

            return true;
        }

        dirs::home_dir().is_some_and(|home| {
            let home = home.to_string_lossy();
            mount_path
                .strip_prefix(home.as_ref())
                .is_some_and(|tail| tail.starts_with('/'))
        })
    }
}

impl PartialEq for UnixMountEntry {
    fn eq(&self, other: &Self) -> bool {
        self.mount_path == other.mount_path
            && self.device_path == other.device_path
            && self.root_path == other.root_path
            && self.filesystem_type == other.filesystem_type
            && self.options == other.options
            && self.is_read_only == other.is_read_only
    }
}

impl Ord for UnixMountEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mount_path
            .cmp(&other.mount_path)
            .then_with(|| self.device_path.cmp(&other.device_path))
            .then_with(|| self.root_path.cmp(&other.root_path))
            .then_with(|| self.filesystem_type.cmp(&other.filesystem_type))
            .then_with(|| self.options.cmp(&other.options))
            .then_with(|| self.is_read_only.cmp(&other.is_read_only))
    }
}

impl PartialOrd for UnixMountEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A configured mount, as read from fstab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixMountPoint {
    mount_path: String,
    device_path: String,
    filesystem_type: String,
    options: Option<String>,
    is_read_only: bool,
    is_user_mountable: bool,
    is_loopback: bool,
}

impl UnixMountPoint {
    pub fn new(
        device_path: impl Into<String>,
        mount_path: impl Into<String>,
        filesystem_type: impl Into<String>,
        options: Option<&str>,
        is_read_only: bool,
        is_user_mountable: bool,
        is_loopback: bool,
    ) -> Self {
        Self {
            mount_path: mount_path.into(),
            device_path: device_path.into(),
            filesystem_type: filesystem_type.into(),
            options: options.map(str::to_string),
            is_read_only,
            is_user_mountable,
            is_loopback,
        }
    }

    #[must_use]
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    #[must_use]
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    #[must_use]
    pub fn filesystem_type(&self) -> &str {
        &self.filesystem_type
    }

    #[must_use]
    pub fn options(&self) -> Option<&str> {
        self.options.as_deref()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    #[must_use]
    pub fn is_user_mountable(&self) -> bool {
        self.is_user_mountable
    }

    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.is_loopback
    }

    #[must_use]
    pub fn guess_type(&self) -> MountType {
        guess_mount_type(&self.mount_path, &self.device_path, &self.filesystem_type)
    }

    #[must_use]
    pub fn guess_name(&self) -> String {
        guess_display_name(&self.mount_path)
    }

    #[must_use]
    pub fn guess_can_eject(&self) -> bool {
        self.guess_type().can_eject()
    }
}

impl Ord for UnixMountPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mount_path
            .cmp(&other.mount_path)
            .then_with(|| self.device_path.cmp(&other.device_path))
            .then_with(|| self.filesystem_type.cmp(&other.filesystem_type))
            .then_with(|| self.options.cmp(&other.options))
            .then_with(|| self.is_read_only.cmp(&other.is_read_only))
            .then_with(|| self.is_user_mountable.cmp(&other.is_user_mountable))
            .then_with(|| self.is_loopback.cmp(&other.is_loopback))
    }
}

impl PartialOrd for UnixMountPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // Safety: getuid has no preconditions
    unsafe { libc::getuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

fn current_user_name() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|name| !name.is_empty())
}

#[cfg(unix)]
fn is_accessible(path: &str) -> bool {
    let Ok(path) = std::ffi::CString::new(path) else {
        return false;
    };
    // Safety: `path` is a valid NUL-terminated string
    unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::X_OK) == 0 }
}

#[cfg(not(unix))]
fn is_accessible(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

#[cfg(unix)]
fn is_block_device(path: &str) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

#[cfg(not(unix))]
fn is_block_device(_path: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UnixMountEntry {
        UnixMountEntry::new(
            "/dev/sdb1",
            "/media/usb",
            Some("/"),
            "vfat",
            Some("rw,nosuid"),
            false,
        )
    }

    #[test]
    fn test_copy_compares_equal() {
        let entry = sample();
        let copy = entry.clone();

        assert_eq!(entry, copy);
        assert_eq!(entry.cmp(&copy), Ordering::Equal);
    }

    #[test]
    fn test_ordering() {
        let a = sample();
        let b = UnixMountEntry::new("/dev/sdb1", "/media/usb", None, "vfat", Some("rw,nosuid"), false);
        let c = UnixMountEntry::new("/dev/sdb1", "/media/zip", Some("/"), "vfat", None, true);

        // Missing root path sorts first
        assert!(b < a);
        assert!(a < c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_system_internal_is_derived() {
        let proc_mount = UnixMountEntry::new("proc", "/proc", None, "proc", Some("rw"), false);
        let bind = UnixMountEntry::new("/dev/sda2", "/srv/www", Some("/var/www"), "ext4", None, false);

        assert!(proc_mount.is_system_internal());
        assert!(bind.is_system_internal());
        assert!(!sample().is_system_internal());
        assert!(!proc_mount.guess_should_display());
    }

    #[test]
    fn test_hidden_dot_path() {
        let entry = UnixMountEntry::new("/dev/sdb1", "/media/.hidden/usb", None, "vfat", None, false);
        assert!(!entry.guess_should_display());
    }

    #[test]
    fn test_guess_helpers() {
        let root = UnixMountEntry::new("/dev/sda1", "/", Some("/"), "ext4", None, false);
        let dvd = UnixMountEntry::new("/dev/sr0", "/media/dvd", None, "udf", None, true);

        assert_eq!(root.guess_name(), "Filesystem root");
        assert_eq!(root.guess_type(), MountType::Hd);
        assert_eq!(dvd.guess_name(), "dvd");
        assert!(dvd.guess_can_eject());
    }

    #[test]
    fn test_point_ordering() {
        let a = UnixMountPoint::new("/dev/sr0", "/media/cdrom", "iso9660", Some("ro,user,noauto"), true, true, false);
        let b = UnixMountPoint::new("/dev/sr0", "/media/cdrom", "iso9660", Some("ro,user,noauto"), true, true, true);

        assert!(a < b);
        assert_eq!(a.clone(), a);
        assert!(a.guess_can_eject());
    }
}
