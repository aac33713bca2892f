//! Mount classification: system-internal detection and type guessing

use std::path::Path;

/// Virtual and pseudo filesystems that never hold user data
const SYSTEM_FS_TYPES: &[&str] = &[
    "adfs",
    "afs",
    "auto",
    "autofs",
    "autofs4",
    "cgroup",
    "configfs",
    "cxfs",
    "debugfs",
    "devfs",
    "devpts",
    "devtmpfs",
    "ecryptfs",
    "fdescfs",
    "fusectl",
    "gfs",
    "gfs2",
    "gpfs",
    "hugetlbfs",
    "kernfs",
    "linprocfs",
    "linsysfs",
    "lustre",
    "lustre_lite",
    "mfs",
    "mqueue",
    "ncpfs",
    "nfsd",
    "nullfs",
    "ocfs2",
    "overlay",
    "proc",
    "procfs",
    "pstore",
    "ptyfs",
    "rootfs",
    "rpc_pipefs",
    "securityfs",
    "selinuxfs",
    "sysfs",
    "tmpfs",
    "usbfs",
];

/// Device names used by mounts without a backing device
const SYSTEM_DEVICES: &[&str] = &["none", "sunrpc", "devpts", "nfsd", "/dev/loop", "/dev/vn"];

/// Top-level system directories
const SYSTEM_MOUNT_PATHS: &[&str] = &[
    "/",
    "/bin",
    "/boot",
    "/compat/linux/proc",
    "/compat/linux/sys",
    "/dev",
    "/etc",
    "/home",
    "/lib",
    "/lib64",
    "/libexec",
    "/live/cow",
    "/live/image",
    "/media",
    "/mnt",
    "/opt",
    "/rescue",
    "/root",
    "/sbin",
    "/srv",
    "/tmp",
    "/usr",
    "/usr/X11R6",
    "/usr/local",
    "/usr/obj",
    "/usr/ports",
    "/usr/src",
    "/usr/xobj",
    "/var",
    "/var/crash",
    "/var/local",
    "/var/log",
    "/var/log/audit",
    "/var/mail",
    "/var/run",
    "/run",
    "/var/tmp",
    "/proc",
    "/net",
    "/sys",
];

const SYSTEM_PATH_PREFIXES: &[&str] = &["/dev/", "/proc/", "/sys/"];

/// Whether `mount_path` is a system directory
#[must_use]
pub fn is_mount_path_system_internal(mount_path: &str) -> bool {
    SYSTEM_MOUNT_PATHS.contains(&mount_path)
        || SYSTEM_PATH_PREFIXES.iter().any(|p| mount_path.starts_with(p))
        || mount_path.ends_with("/.gvfs")
}

/// Whether `fs_type` is a virtual or pseudo filesystem
#[must_use]
pub fn is_system_fs_type(fs_type: &str) -> bool {
    SYSTEM_FS_TYPES.contains(&fs_type)
}

/// Whether `device_path` is a placeholder or loop device
#[must_use]
pub fn is_system_device_path(device_path: &str) -> bool {
    SYSTEM_DEVICES.contains(&device_path) || device_path.starts_with("/dev/loop")
}

/// Guess whether a mount is an implementation detail of the system.
///
/// A known root path other than `/` marks a bind mount of a subdirectory.
#[must_use]
pub fn guess_system_internal(
    mount_path: &str,
    fs_type: &str,
    device_path: &str,
    root_path: Option<&str>,
) -> bool {
    is_mount_path_system_internal(mount_path)
        || is_system_fs_type(fs_type)
        || is_system_device_path(device_path)
        || root_path.is_some_and(|root| root != "/")
}

/// Kind of media behind a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountType {
    Unknown,
    Floppy,
    Cdrom,
    Nfs,
    Zip,
    Jaz,
    Memstick,
    Cf,
    Sm,
    Sdmmc,
    Ipod,
    Camera,
    Hd,
}

impl MountType {
    /// Whether media of this kind is usually ejectable
    #[must_use]
    pub fn can_eject(self) -> bool {
        matches!(self, MountType::Ipod | MountType::Cdrom)
    }
}

/// Guess the media type from mount path, device and filesystem
#[must_use]
pub fn guess_mount_type(mount_path: &str, device_path: &str, fs_type: &str) -> MountType {
    let starts = |s: &str, prefixes: &[&str]| prefixes.iter().any(|p| s.starts_with(p));

    let guessed = if matches!(fs_type, "udf" | "iso9660" | "cd9660") {
        MountType::Cdrom
    } else if matches!(fs_type, "nfs" | "nfs4") {
        MountType::Nfs
    } else if starts(device_path, &["/vol/dev/diskette/", "/dev/fd", "/dev/floppy"]) {
        MountType::Floppy
    } else if starts(device_path, &["/dev/cdrom", "/dev/acd", "/dev/cd"]) {
        MountType::Cdrom
    } else if device_path.starts_with("/vol/") {
        let name = mount_path.strip_prefix('/').unwrap_or(mount_path);

        if name.starts_with("cdrom") {
            MountType::Cdrom
        } else if name.starts_with("floppy") {
            MountType::Floppy
        } else if name.starts_with("rmdisk") {
            MountType::Zip
        } else if name.starts_with("jaz") {
            MountType::Jaz
        } else if name.starts_with("memstick") {
            MountType::Memstick
        } else {
            MountType::Unknown
        }
    } else {
        let basename = Path::new(mount_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| mount_path.to_string());

        if starts(&basename, &["cdr", "cdwriter", "burn", "dvdr"]) {
            MountType::Cdrom
        } else if basename.starts_with("floppy") {
            MountType::Floppy
        } else if basename.starts_with("zip") {
            MountType::Zip
        } else if basename.starts_with("jaz") {
            MountType::Jaz
        } else if basename.starts_with("camera") {
            MountType::Camera
        } else if starts(&basename, &["memstick", "memory_stick", "ram"]) {
            MountType::Memstick
        } else if basename.starts_with("compact_flash") {
            MountType::Cf
        } else if basename.starts_with("smart_media") {
            MountType::Sm
        } else if basename.starts_with("sd_mmc") {
            MountType::Sdmmc
        } else if basename.starts_with("ipod") {
            MountType::Ipod
        } else {
            MountType::Unknown
        }
    };

    if guessed == MountType::Unknown {
        MountType::Hd
    } else {
        guessed
    }
}

/// Display name for a mount path
#[must_use]
pub fn guess_display_name(mount_path: &str) -> String {
    if mount_path == "/" {
        return "Filesystem root".to_string();
    }

    Path::new(mount_path)
        .file_name()
        .map_or_else(|| mount_path.to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_internal() {
        assert!(guess_system_internal("/proc", "proc", "proc", None));
        assert!(!guess_system_internal("/home/user/mnt", "ext4", "/dev/sda2", Some("/")));
        assert!(guess_system_internal("/mnt/x", "ext4", "/dev/sda2", Some("/subvol")));
        assert!(guess_system_internal("/run/user/1000/gvfs", "fuse", "/dev/loop3", None));
        assert!(guess_system_internal("/home/user/.gvfs", "fuse", "gvfsd-fuse", None));
        assert!(guess_system_internal("/sys/fs/cgroup", "cgroup2", "cgroup2", None));
        assert!(guess_system_internal("/media/usb", "tmpfs", "tmpfs", None));
        assert!(!guess_system_internal("/media/usb", "vfat", "/dev/sdb1", None));
    }

    #[test]
    fn test_guess_mount_type() {
        assert_eq!(guess_mount_type("/media/dvd", "/dev/sr0", "iso9660"), MountType::Cdrom);
        assert_eq!(guess_mount_type("/srv/data", "server:/data", "nfs4"), MountType::Nfs);
        assert_eq!(guess_mount_type("/mnt/a", "/dev/fd0", "vfat"), MountType::Floppy);
        assert_eq!(guess_mount_type("/media/ipod", "/dev/sdc1", "vfat"), MountType::Ipod);
        assert_eq!(guess_mount_type("/cdrom/x", "/vol/dev/dsk/c0t6", "hsfs"), MountType::Cdrom);
        assert_eq!(guess_mount_type("/data", "/dev/sda3", "ext4"), MountType::Hd);

        assert!(MountType::Cdrom.can_eject());
        assert!(!MountType::Hd.can_eject());
    }

    #[test]
    fn test_guess_display_name() {
        assert_eq!(guess_display_name("/"), "Filesystem root");
        assert_eq!(guess_display_name("/media/usb stick"), "usb stick");
    }
}
