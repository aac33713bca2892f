//! Mount table parsing
//!
//! Two table formats are understood: classic mntent rows
//! (`/etc/mtab`, `/proc/mounts`, `/etc/fstab`) and the Linux
//! `/proc/self/mountinfo` format, which also carries the mounted directory's
//! path within its filesystem.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::debug;

use super::entry::{UnixMountEntry, UnixMountPoint};

/// Placeholder some kernels report for the root filesystem's device
pub const DEV_ROOT: &str = "/dev/root";

/// Linux per-process mount table with root paths
pub const PROC_MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Reads a platform's mount tables
pub trait MountTableBackend: Send + Sync {
    /// Active mounts in `path`, or `None` if it can't be read
    fn read_entries(&self, path: &Path) -> Option<Vec<UnixMountEntry>>;

    /// Configured mount points in `path`, or `None` if it can't be read
    fn read_points(&self, path: &Path) -> Option<Vec<UnixMountPoint>> {
        let contents = fs::read_to_string(path).ok()?;
        Some(parse_mount_points(&contents))
    }
}

/// mntent-style tables. Bind mounts can't be told apart, so repeated
/// devices are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct MntentBackend;

/// `/proc/self/mountinfo`, falling back to mntent rows for tables in that
/// format
#[derive(Debug, Default, Clone, Copy)]
pub struct MountInfoBackend;

impl MountTableBackend for MntentBackend {
    fn read_entries(&self, path: &Path) -> Option<Vec<UnixMountEntry>> {
        let contents = fs::read_to_string(path).ok()?;
        Some(parse_mntent_entries(&contents))
    }
}

impl MountTableBackend for MountInfoBackend {
    fn read_entries(&self, path: &Path) -> Option<Vec<UnixMountEntry>> {
        let contents = fs::read_to_string(path).ok()?;

        let first = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'));

        match first {
            Some(line) if parse_mountinfo_line(line).is_none() => {
                Some(parse_mntent_entries(&contents))
            }
            _ => Some(parse_mountinfo_entries(&contents)),
        }
    }
}

/// The backend for this platform
#[must_use]
pub fn platform_backend() -> Box<dyn MountTableBackend> {
    if cfg!(target_os = "linux") {
        Box::new(MountInfoBackend)
    } else {
        Box::new(MntentBackend)
    }
}

/// Table read for active mounts on this platform
#[must_use]
pub fn default_mtab_read_path() -> PathBuf {
    if cfg!(target_os = "linux") {
        if Path::new(PROC_MOUNTINFO_PATH).exists() {
            PathBuf::from(PROC_MOUNTINFO_PATH)
        } else {
            PathBuf::from("/proc/mounts")
        }
    } else if cfg!(target_os = "solaris") || cfg!(target_os = "illumos") {
        PathBuf::from("/etc/mnttab")
    } else {
        PathBuf::from("/etc/mtab")
    }
}

/// File whose changes signal mount changes on this platform.
///
/// A regular `/etc/mtab` still maintained by userspace wins over the kernel
/// tables.
#[must_use]
pub fn default_mtab_monitor_path() -> PathBuf {
    let mtab = Path::new("/etc/mtab");
    let regular_mtab = fs::symlink_metadata(mtab).is_ok_and(|m| m.file_type().is_file());

    if regular_mtab {
        mtab.to_path_buf()
    } else if !cfg!(target_os = "linux") {
        default_mtab_read_path()
    } else if Path::new(PROC_MOUNTINFO_PATH).exists() {
        PathBuf::from(PROC_MOUNTINFO_PATH)
    } else {
        PathBuf::from("/proc/mounts")
    }
}

/// Static mount point table on this platform
#[must_use]
pub fn default_fstab_path() -> PathBuf {
    if cfg!(target_os = "solaris") || cfg!(target_os = "illumos") {
        PathBuf::from("/etc/vfstab")
    } else {
        PathBuf::from("/etc/fstab")
    }
}

/// One row of an mntent-style table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MntentRow {
    pub fsname: String,
    pub dir: String,
    pub fstype: String,
    pub opts: String,
}

/// One row of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoRow {
    pub root: String,
    pub mount_point: String,
    pub mount_options: String,
    pub fstype: String,
    pub source: String,
    pub super_options: String,
}

impl MountInfoRow {
    /// Per-mount and per-superblock options joined
    #[must_use]
    pub fn options(&self) -> String {
        match (self.mount_options.is_empty(), self.super_options.is_empty()) {
            (false, false) => format!("{},{}", self.mount_options, self.super_options),
            (false, true) => self.mount_options.clone(),
            (true, _) => self.super_options.clone(),
        }
    }
}

/// Parse `fsname dir type opts [freq [passno]]`
#[must_use]
pub fn parse_mntent_line(line: &str) -> Option<MntentRow> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let fsname = unescape_octal(fields.next()?);
    let dir = unescape_octal(fields.next()?);
    let fstype = unescape_octal(fields.next()?);
    let opts = fields.next().map(unescape_octal).unwrap_or_default();

    Some(MntentRow {
        fsname,
        dir,
        fstype,
        opts,
    })
}

/// Parse `id parent major:minor root mount-point options [optional...] - fstype source super-options`
#[must_use]
pub fn parse_mountinfo_line(line: &str) -> Option<MountInfoRow> {
    let (head, tail) = line.split_once(" - ")?;

    let mut head = head.split_whitespace();
    head.next()?.parse::<u64>().ok()?;
    head.next()?.parse::<u64>().ok()?;
    head.next().filter(|dev| dev.contains(':'))?;
    let root = unescape_octal(head.next()?);
    let mount_point = unescape_octal(head.next()?);
    let mount_options = head.next()?.to_string();

    let mut tail = tail.split_whitespace();
    let fstype = unescape_octal(tail.next()?);
    let source = tail.next().map(unescape_octal).unwrap_or_else(|| "none".to_string());
    let super_options = tail.next().unwrap_or_default().to_string();

    Some(MountInfoRow {
        root,
        mount_point,
        mount_options,
        fstype,
        source,
        super_options,
    })
}

/// Whether the comma separated `options` contain `name` or `name=value`
#[must_use]
pub fn has_option(options: &str, name: &str) -> bool {
    options.split(',').any(|opt| {
        opt == name
            || opt
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('='))
    })
}

/// Decode `\NNN` octal escapes as written by the kernel for spaces, tabs,
/// newlines and backslashes
#[must_use]
pub fn unescape_octal(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        && digits[0] <= b'3'
}

fn normalize_device(device: &str) -> String {
    if device == DEV_ROOT {
        resolve_dev_root().to_string()
    } else {
        device.to_string()
    }
}

/// Entries from mntent rows. Later rows repeating a `/`-prefixed device are
/// treated as bind mounts and skipped.
#[must_use]
pub fn parse_mntent_entries(contents: &str) -> Vec<UnixMountEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for row in contents.lines().filter_map(parse_mntent_line) {
        if row.fsname.starts_with('/') && seen.contains(&row.fsname) {
            continue;
        }

        let device = normalize_device(&row.fsname);
        let options = (!row.opts.is_empty()).then_some(row.opts.as_str());

        entries.push(UnixMountEntry::new(
            device.clone(),
            row.dir.as_str(),
            None,
            row.fstype.as_str(),
            options,
            has_option(&row.opts, "ro"),
        ));

        seen.insert(row.fsname);
        seen.insert(device);
    }

    entries
}

/// Entries from mountinfo rows, root paths included
#[must_use]
pub fn parse_mountinfo_entries(contents: &str) -> Vec<UnixMountEntry> {
    contents
        .lines()
        .filter_map(parse_mountinfo_line)
        .map(|row| {
            let options = row.options();
            UnixMountEntry::new(
                normalize_device(&row.source),
                row.mount_point.as_str(),
                Some(row.root.as_str()),
                row.fstype.as_str(),
                (!options.is_empty()).then_some(options.as_str()),
                has_option(&row.mount_options, "ro"),
            )
        })
        .collect()
}

/// Mount points from an fstab-style table
#[must_use]
pub fn parse_mount_points(contents: &str) -> Vec<UnixMountPoint> {
    contents
        .lines()
        .filter_map(parse_mntent_line)
        .filter(|row| !matches!(row.dir.as_str(), "ignore" | "swap" | "none"))
        .filter(|row| !has_option(&row.opts, "bind") && !has_option(&row.opts, "rbind"))
        .map(|row| {
            let opts = row.opts.as_str();
            let user_mountable = row.fstype == "supermount"
                || has_option(opts, "user")
                || has_option(opts, "users")
                || has_option(opts, "owner");
            let loopback = has_option(opts, "loop") || row.fstype == "lofs";

            UnixMountPoint::new(
                normalize_device(&row.fsname),
                row.dir.as_str(),
                row.fstype.as_str(),
                (!opts.is_empty()).then_some(opts),
                has_option(opts, "ro"),
                user_mountable,
                loopback,
            )
        })
        .collect()
}

static RESOLVED_DEV_ROOT: OnceCell<String> = OnceCell::new();

/// Real device behind [`DEV_ROOT`], resolved once per process
pub fn resolve_dev_root() -> &'static str {
    RESOLVED_DEV_ROOT.get_or_init(|| {
        let resolved = find_dev_root().unwrap_or_else(|| DEV_ROOT.to_string());
        debug!("Resolved {} to {}", DEV_ROOT, resolved);
        resolved
    })
}

#[cfg(unix)]
fn find_dev_root() -> Option<String> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let link = fs::symlink_metadata(DEV_ROOT).ok()?;
    if link.file_type().is_symlink() {
        return resolve_symlink(Path::new(DEV_ROOT));
    }

    let root_dev = fs::metadata("/").ok()?.dev();

    let contents = fs::read_to_string(default_mtab_read_path()).ok()?;
    let candidates: Vec<String> = match contents.lines().find_map(parse_mountinfo_line) {
        Some(_) => contents
            .lines()
            .filter_map(parse_mountinfo_line)
            .map(|row| row.source)
            .collect(),
        None => contents
            .lines()
            .filter_map(parse_mntent_line)
            .map(|row| row.fsname)
            .collect(),
    };

    candidates.into_iter().find(|device| {
        device.as_str() != DEV_ROOT
            && fs::metadata(device)
                .is_ok_and(|m| m.file_type().is_block_device() && m.rdev() == root_dev)
    })
}

#[cfg(not(unix))]
fn find_dev_root() -> Option<String> {
    None
}

/// Follow a chain of symlinks and normalize the result lexically
fn resolve_symlink(path: &Path) -> Option<String> {
    let mut current = path.to_path_buf();

    // Bounded in case of a cycle
    for _ in 0..40 {
        let meta = fs::symlink_metadata(&current).ok()?;
        if !meta.file_type().is_symlink() {
            break;
        }

        let target = fs::read_link(&current).ok()?;
        current = match current.parent() {
            Some(dir) if target.is_relative() => dir.join(target),
            _ => target,
        };
    }

    Some(canonicalize_lexically(&current).to_string_lossy().into_owned())
}

/// Collapse `.`, `..` and repeated separators without touching the disk
#[must_use]
pub fn canonicalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw,errors=remount-ro
23 22 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
24 22 8:3 /srv/www /var/www ro,relatime shared:2 - ext4 /dev/sda3 rw
25 22 8:17 / /media/usb\\040stick rw,nosuid master:3 - vfat /dev/sdb1 rw,uid=1000
";

    #[test]
    fn test_parse_mountinfo_line() {
        let row = parse_mountinfo_line(
            "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue",
        )
        .unwrap();

        assert_eq!(row.root, "/mnt1");
        assert_eq!(row.mount_point, "/mnt2");
        assert_eq!(row.fstype, "ext3");
        assert_eq!(row.source, "/dev/root");
        assert_eq!(row.options(), "rw,noatime,rw,errors=continue");

        assert!(parse_mountinfo_line("/dev/sda1 / ext4 rw 0 0").is_none());
    }

    #[test]
    fn test_mountinfo_entries() {
        let entries = parse_mountinfo_entries(MOUNTINFO);
        assert_eq!(entries.len(), 4);

        assert_eq!(entries[0].mount_path(), "/");
        assert_eq!(entries[0].root_path(), Some("/"));
        assert!(entries[0].is_system_internal());

        assert!(entries[2].is_read_only());
        assert_eq!(entries[2].root_path(), Some("/srv/www"));
        assert!(entries[2].is_system_internal());

        assert_eq!(entries[3].mount_path(), "/media/usb stick");
        assert!(!entries[3].is_system_internal());
        assert_eq!(entries[3].options(), Some("rw,nosuid,rw,uid=1000"));
    }

    #[test]
    fn test_mntent_heuristic_drops_repeated_devices() {
        let entries = parse_mntent_entries(
            "/dev/sda2 / ext4 rw 0 0\n\
             proc /proc proc rw 0 0\n\
             /dev/sda2 /srv/bind ext4 rw 0 0\n\
             tmpfs /tmp tmpfs rw 0 0\n\
             tmpfs /run tmpfs rw 0 0\n\
             /dev/sdb1 /mnt/data ext4 ro,noatime 0 0\n",
        );

        let paths: Vec<&str> = entries.iter().map(UnixMountEntry::mount_path).collect();
        assert_eq!(paths, vec!["/", "/proc", "/tmp", "/run", "/mnt/data"]);
        assert!(entries[4].is_read_only());
        assert_eq!(entries[4].root_path(), None);
    }

    #[test]
    fn test_mountinfo_backend_detects_mntent_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtab");
        fs::write(&path, "# header\n/dev/sdb1 /mnt/data ext4 rw 0 0\n").unwrap();

        let entries = MountInfoBackend.read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device_path(), "/dev/sdb1");

        assert!(MountInfoBackend.read_entries(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_mount_points() {
        let points = parse_mount_points(
            "# /etc/fstab\n\
             UUID=abcd / ext4 defaults 0 1\n\
             /dev/sda3 none swap sw 0 0\n\
             /srv/a /srv/b none bind 0 0\n\
             /dev/sr0 /media/cdrom iso9660 ro,user,noauto 0 0\n\
             /dev/sdb1 /mnt/xattr ext4 user_xattr 0 2\n\
             /images/disk.img /mnt/img ext4 loop,owner 0 0\n",
        );

        assert_eq!(points.len(), 4);

        assert_eq!(points[0].device_path(), "UUID=abcd");
        assert!(!points[0].is_user_mountable());

        assert!(points[1].is_read_only());
        assert!(points[1].is_user_mountable());

        assert!(!points[2].is_user_mountable());

        assert!(points[3].is_loopback());
        assert!(points[3].is_user_mountable());
    }

    #[test]
    fn test_has_option() {
        assert!(has_option("rw,user,noauto", "user"));
        assert!(!has_option("rw,user_xattr", "user"));
        assert!(has_option("rw,uid=1000", "uid"));
        assert!(!has_option("", "ro"));
    }

    #[test]
    fn test_unescape_octal() {
        assert_eq!(unescape_octal("/media/my\\040disk"), "/media/my disk");
        assert_eq!(unescape_octal("a\\011b\\134c"), "a\tb\\c");
        assert_eq!(unescape_octal("trailing\\04"), "trailing\\04");
        assert_eq!(unescape_octal("plain"), "plain");
    }

    #[test]
    fn test_canonicalize_lexically() {
        assert_eq!(
            canonicalize_lexically(Path::new("/dev/disk/by-uuid/../../sda1")),
            PathBuf::from("/dev/sda1")
        );
        assert_eq!(canonicalize_lexically(Path::new("/dev//./mapper/root")), PathBuf::from("/dev/mapper/root"));
    }
}
