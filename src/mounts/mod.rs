//! Unix mount tables
//!
//! [`MountTable`] reads the active mount table and the static mount point
//! table and answers "what is mounted where" questions. The free functions
//! in this module query the system table.
//!
//! Every listing comes with a timestamp that can later be handed to
//! [`MountTable::mount_entries_changed_since`] /
//! [`MountTable::mount_points_changed_since`] to check for changes without
//! re-reading the tables.

pub mod backend;
pub mod classify;
pub mod entry;
pub mod monitor;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::MountsConfig;

pub use backend::{MntentBackend, MountInfoBackend, MountTableBackend};
pub use classify::{
    guess_system_internal, is_mount_path_system_internal, is_system_device_path,
    is_system_fs_type, MountType,
};
pub use entry::{UnixMountEntry, UnixMountPoint};
pub use monitor::{MonitorError, MountEvent, MountMonitor};

use monitor::MonitorGroup;

/// State of the watch on a `/proc` mount table
#[derive(Debug, Default)]
pub(crate) struct WatchState {
    pub(crate) running: bool,
    /// When the watch last saw a change
    pub(crate) poller_time: u64,
}

#[derive(Default)]
struct PointsCache {
    timestamp: Option<u64>,
    points: Vec<UnixMountPoint>,
}

/// A pair of mount tables: the active mounts and the configured mount points
pub struct MountTable {
    backend: Box<dyn MountTableBackend>,
    entries_path: PathBuf,
    monitor_path: Option<PathBuf>,
    fstab_path: Option<PathBuf>,
    poll_interval: Duration,
    pub(crate) watch: Mutex<WatchState>,
    points_cache: Mutex<PointsCache>,
    pub(crate) monitors: Mutex<MonitorGroup>,
}

static SYSTEM: Lazy<Arc<MountTable>> =
    Lazy::new(|| Arc::new(MountTable::from_config(&MountsConfig::default())));

/// Microseconds on a process-wide monotonic clock, never zero
pub(crate) fn monotonic_micros() -> u64 {
    static START: Lazy<Instant> = Lazy::new(Instant::now);
    START.elapsed().as_micros() as u64 + 1
}

fn modification_secs(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

impl MountTable {
    /// The tables of the running system
    pub fn system() -> Arc<MountTable> {
        Arc::clone(&SYSTEM)
    }

    /// Tables located per `config`, detected where unset
    #[must_use]
    pub fn from_config(config: &MountsConfig) -> Self {
        let mut builder = Self::builder()
            .poll_interval(config.poll_interval())
            .fstab_path(Some(
                config
                    .fstab_path
                    .clone()
                    .unwrap_or_else(backend::default_fstab_path),
            ));

        builder = match &config.mtab_path {
            Some(path) => builder.entries_path(path).monitor_path(Some(path.clone())),
            None => builder
                .entries_path(backend::default_mtab_read_path())
                .monitor_path(Some(backend::default_mtab_monitor_path())),
        };

        builder.build()
    }

    #[must_use]
    pub fn builder() -> MountTableBuilder {
        MountTableBuilder::default()
    }

    /// Table the active mounts are read from
    #[must_use]
    pub fn entries_path(&self) -> &Path {
        &self.entries_path
    }

    /// File watched for mount changes; `None` means changes are polled
    #[must_use]
    pub fn monitor_path(&self) -> Option<&Path> {
        self.monitor_path.as_deref()
    }

    #[must_use]
    pub fn fstab_path(&self) -> Option<&Path> {
        self.fstab_path.as_deref()
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether a [`MountMonitor`] is currently watching this table
    #[must_use]
    pub fn has_active_monitor(&self) -> bool {
        self.monitors.lock().is_watching()
    }

    /// Read the active mounts with the timestamp to compare against later
    #[must_use]
    pub fn list_mount_entries(&self) -> (Vec<UnixMountEntry>, u64) {
        self.read_entries_from_file(&self.entries_path)
    }

    /// Read active mounts from an explicit table file
    #[must_use]
    pub fn read_entries_from_file(&self, path: &Path) -> (Vec<UnixMountEntry>, u64) {
        let timestamp = self.mounts_timestamp();
        let entries = self.backend.read_entries(path).unwrap_or_default();
        (entries, timestamp)
    }

    /// Read the configured mount points, cached until fstab changes
    #[must_use]
    pub fn list_mount_points(&self) -> (Vec<UnixMountPoint>, u64) {
        let mut cache = self.points_cache.lock();
        let timestamp = self.mount_points_timestamp();

        if cache.timestamp != Some(timestamp) {
            cache.points = match &self.fstab_path {
                Some(path) => self.backend.read_points(path).unwrap_or_default(),
                None => Vec::new(),
            };
            cache.timestamp = Some(timestamp);
        }

        (cache.points.clone(), timestamp)
    }

    /// Read mount points from an explicit table file, bypassing the cache
    #[must_use]
    pub fn read_points_from_file(&self, path: &Path) -> (Vec<UnixMountPoint>, u64) {
        let timestamp = self.mount_points_timestamp();
        let points = self.backend.read_points(path).unwrap_or_default();
        (points, timestamp)
    }

    /// Whether the active mounts may have changed since `time`
    #[must_use]
    pub fn mount_entries_changed_since(&self, time: u64) -> bool {
        self.mounts_timestamp() != time
    }

    /// Whether the mount points may have changed since `time`
    #[must_use]
    pub fn mount_points_changed_since(&self, time: u64) -> bool {
        self.mount_points_timestamp() != time
    }

    /// The active mount at `mount_path`. With stacked mounts the topmost one
    /// wins.
    #[must_use]
    pub fn entry_at(&self, mount_path: impl AsRef<Path>) -> Option<UnixMountEntry> {
        let mount_path = mount_path.as_ref();
        let (entries, _) = self.list_mount_entries();

        entries
            .into_iter()
            .filter(|e| Path::new(e.mount_path()) == mount_path)
            .last()
    }

    /// The active mount containing `file_path`
    #[must_use]
    pub fn entry_for_file(&self, file_path: impl AsRef<Path>) -> Option<UnixMountEntry> {
        let file_path = file_path.as_ref();

        self.entry_at(file_path)
            .or_else(|| find_mount_root(file_path).and_then(|root| self.entry_at(root)))
    }

    /// The configured mount point at `mount_path`
    #[must_use]
    pub fn point_at(&self, mount_path: impl AsRef<Path>) -> Option<UnixMountPoint> {
        let mount_path = mount_path.as_ref();
        let (points, _) = self.list_mount_points();

        points
            .into_iter()
            .filter(|p| Path::new(p.mount_path()) == mount_path)
            .last()
    }

    pub(crate) fn read_entries(&self) -> Vec<UnixMountEntry> {
        self.backend
            .read_entries(&self.entries_path)
            .unwrap_or_default()
    }

    /// Timestamp of the active mount table.
    ///
    /// Kernel tables under `/proc` have no useful mtime: while a watch runs
    /// the time of its last detected change is used, otherwise "now", so
    /// callers always treat their copy as stale.
    pub(crate) fn mounts_timestamp(&self) -> u64 {
        if let Some(path) = self.monitor_path.as_deref() {
            if !path.starts_with("/proc/") {
                return modification_secs(path).unwrap_or(0);
            }
        }

        let watch = self.watch.lock();
        if watch.running {
            watch.poller_time
        } else {
            monotonic_micros()
        }
    }

    fn mount_points_timestamp(&self) -> u64 {
        self.fstab_path
            .as_deref()
            .and_then(modification_secs)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("entries_path", &self.entries_path)
            .field("monitor_path", &self.monitor_path)
            .field("fstab_path", &self.fstab_path)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Builder for [`MountTable`]
pub struct MountTableBuilder {
    backend: Option<Box<dyn MountTableBackend>>,
    entries_path: Option<PathBuf>,
    monitor_path: Option<PathBuf>,
    fstab_path: Option<PathBuf>,
    poll_interval: Duration,
}

impl Default for MountTableBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            entries_path: None,
            monitor_path: None,
            fstab_path: None,
            poll_interval: MountsConfig::default().poll_interval(),
        }
    }
}

impl MountTableBuilder {
    #[must_use]
    pub fn backend(mut self, backend: impl MountTableBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    #[must_use]
    pub fn entries_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.entries_path = Some(path.into());
        self
    }

    /// File watched for changes. Without one, changes are found by polling.
    #[must_use]
    pub fn monitor_path(mut self, path: Option<PathBuf>) -> Self {
        self.monitor_path = path;
        self
    }

    #[must_use]
    pub fn fstab_path(mut self, path: Option<PathBuf>) -> Self {
        self.fstab_path = path;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn build(self) -> MountTable {
        MountTable {
            backend: self.backend.unwrap_or_else(backend::platform_backend),
            entries_path: self
                .entries_path
                .unwrap_or_else(backend::default_mtab_read_path),
            monitor_path: self.monitor_path,
            fstab_path: self.fstab_path,
            poll_interval: self.poll_interval,
            watch: Mutex::new(WatchState::default()),
            points_cache: Mutex::new(PointsCache::default()),
            monitors: Mutex::new(MonitorGroup::default()),
        }
    }
}

/// Topmost directory above `path` on the same device as `path`
#[cfg(unix)]
fn find_mount_root(path: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let path = fs::canonicalize(path).ok()?;
    let device = fs::metadata(&path).ok()?.dev();

    let mut current = path.as_path();
    while let Some(parent) = current.parent() {
        match fs::metadata(parent) {
            Ok(meta) if meta.dev() == device => current = parent,
            _ => break,
        }
    }

    Some(current.to_path_buf())
}

#[cfg(not(unix))]
fn find_mount_root(_path: &Path) -> Option<PathBuf> {
    None
}

/// Active mounts of the system, with their timestamp
#[must_use]
pub fn list_mount_entries() -> (Vec<UnixMountEntry>, u64) {
    MountTable::system().list_mount_entries()
}

/// Configured mount points of the system, with their timestamp
#[must_use]
pub fn list_mount_points() -> (Vec<UnixMountPoint>, u64) {
    MountTable::system().list_mount_points()
}

#[must_use]
pub fn mount_entries_changed_since(time: u64) -> bool {
    MountTable::system().mount_entries_changed_since(time)
}

#[must_use]
pub fn mount_points_changed_since(time: u64) -> bool {
    MountTable::system().mount_points_changed_since(time)
}

#[must_use]
pub fn entry_at(mount_path: impl AsRef<Path>) -> Option<UnixMountEntry> {
    MountTable::system().entry_at(mount_path)
}

#[must_use]
pub fn entry_for_file(file_path: impl AsRef<Path>) -> Option<UnixMountEntry> {
    MountTable::system().entry_for_file(file_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_in(dir: &Path, mtab: &str, fstab: &str) -> MountTable {
        let mtab_path = dir.join("mtab");
        let fstab_path = dir.join("fstab");
        fs::write(&mtab_path, mtab).unwrap();
        fs::write(&fstab_path, fstab).unwrap();

        MountTable::builder()
            .backend(MntentBackend)
            .entries_path(&mtab_path)
            .monitor_path(Some(mtab_path))
            .fstab_path(Some(fstab_path))
            .build()
    }

    #[test]
    fn test_missing_tables_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let table = MountTable::builder()
            .entries_path(dir.path().join("missing-mtab"))
            .fstab_path(Some(dir.path().join("missing-fstab")))
            .build();

        assert!(table.list_mount_entries().0.is_empty());
        assert!(table.list_mount_points().0.is_empty());
        assert_eq!(table.list_mount_points().1, 0);
    }

    #[test]
    fn test_entry_at_prefers_last() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_in(
            dir.path(),
            "/dev/sdb1 /mnt/data ext4 rw 0 0\n\
             tmpfs /mnt/data tmpfs rw 0 0\n",
            "",
        );

        let entry = table.entry_at("/mnt/data").unwrap();
        assert_eq!(entry.filesystem_type(), "tmpfs");
        assert!(table.entry_at("/mnt/other").is_none());
    }

    #[test]
    #[cfg(unix)]
    fn test_entry_for_file_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let root = find_mount_root(&nested).unwrap();
        let table = table_in(
            dir.path(),
            &format!("/dev/test {} testfs rw 0 0\n", root.display()),
            "",
        );

        let entry = table.entry_for_file(&nested).unwrap();
        assert_eq!(Path::new(entry.mount_path()), root);
    }

    #[test]
    fn test_points_cache_returns_copies() {
        let dir = tempfile::tempdir().unwrap();
        let table = table_in(dir.path(), "", "/dev/sr0 /media/cdrom iso9660 ro,user 0 0\n");

        let (mut first, stamp) = table.list_mount_points();
        first.clear();
        let (second, again) = table.list_mount_points();

        assert_eq!(second.len(), 1);
        assert_eq!(stamp, again);
        assert!(!table.mount_points_changed_since(stamp));
        assert!(table.point_at("/media/cdrom").is_some());
    }

    #[test]
    fn test_proc_table_without_watch_is_always_stale() {
        let table = MountTable::builder()
            .entries_path("/proc/self/mounts")
            .monitor_path(Some(PathBuf::from("/proc/self/mountinfo")))
            .build();

        let (_, stamp) = table.list_mount_entries();
        std::thread::sleep(Duration::from_millis(2));
        assert!(table.mount_entries_changed_since(stamp));
    }
}
