//! Mount change notifications
//!
//! A [`MountMonitor`] reports changes of a [`MountTable`] to subscribers.
//! There is one monitor per table per thread; all monitors of a table share
//! one set of watchers, started with the first monitor and stopped when the
//! last one is dropped.
//!
//! How mount changes are noticed depends on the table:
//!
//! * a kernel table under `/proc` is polled for `POLLPRI` on a dedicated
//!   thread,
//! * an ordinary file is watched with `notify`,
//! * without any file to watch, the table is re-read periodically and
//!   compared with the previous read.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::entry::UnixMountEntry;
use super::{monotonic_micros, MountTable};

/// How long the `/proc` watch thread blocks before checking for shutdown
const PROC_POLL_TIMEOUT_MS: i32 = 250;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountEvent {
    /// The set of active mounts changed
    MountsChanged,
    /// The configured mount points changed
    MountPointsChanged,
}

/// Errors raised while setting up a monitor
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Mount monitor must be created inside a tokio runtime")]
    NoRuntime,

    #[error("Failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

struct Member {
    monitor: Weak<MountMonitor>,
    sender: broadcast::Sender<MountEvent>,
}

/// Monitors of one table, keyed by thread
#[derive(Default)]
pub(crate) struct MonitorGroup {
    members: HashMap<ThreadId, Member>,
    watcher: Option<MountWatcher>,
}

impl MonitorGroup {
    pub(crate) fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }
}

/// Change notifications for one [`MountTable`]
pub struct MountMonitor {
    table: Arc<MountTable>,
    context: ThreadId,
    sender: broadcast::Sender<MountEvent>,
}

impl MountMonitor {
    /// The monitor of the system mount table for the calling thread
    ///
    /// # Errors
    /// Returns [`MonitorError::NoRuntime`] outside a tokio runtime.
    pub fn get() -> Result<Arc<Self>, MonitorError> {
        Self::for_table(&MountTable::system())
    }

    /// The monitor of `table` for the calling thread
    ///
    /// # Errors
    /// Returns [`MonitorError::NoRuntime`] outside a tokio runtime.
    pub fn for_table(table: &Arc<MountTable>) -> Result<Arc<Self>, MonitorError> {
        let handle = Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;
        let context = thread::current().id();

        let mut group = table.monitors.lock();

        if let Some(existing) = group.members.get(&context).and_then(|m| m.monitor.upgrade()) {
            return Ok(existing);
        }

        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let monitor = Arc::new(MountMonitor {
            table: Arc::clone(table),
            context,
            sender: sender.clone(),
        });

        group.members.insert(
            context,
            Member {
                monitor: Arc::downgrade(&monitor),
                sender,
            },
        );

        if group.watcher.is_none() {
            group.watcher = Some(MountWatcher::start(table, &handle));
        }

        Ok(monitor)
    }

    /// Receive change events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MountEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn table(&self) -> &Arc<MountTable> {
        &self.table
    }
}

impl Drop for MountMonitor {
    fn drop(&mut self) {
        let this: *const MountMonitor = self;

        let watcher = {
            let mut group = self.table.monitors.lock();

            let is_current = group
                .members
                .get(&self.context)
                .is_some_and(|m| std::ptr::eq(m.monitor.as_ptr(), this));
            if is_current {
                group.members.remove(&self.context);
            }

            if group.members.is_empty() {
                group.watcher.take()
            } else {
                None
            }
        };

        if let Some(watcher) = watcher {
            watcher.stop(&self.table);
        }
    }
}

impl std::fmt::Debug for MountMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountMonitor")
            .field("table", &self.table)
            .field("context", &self.context)
            .finish()
    }
}

fn emit(table: &MountTable, event: MountEvent) {
    let senders: Vec<_> = table
        .monitors
        .lock()
        .members
        .values()
        .map(|m| m.sender.clone())
        .collect();

    debug!("Mount monitor: {:?}", event);
    for sender in senders {
        // No receivers is fine
        let _ = sender.send(event);
    }
}

/// Watches shared by every monitor of a table
#[derive(Default)]
pub(crate) struct MountWatcher {
    fstab_watch: Option<RecommendedWatcher>,
    mtab_watch: Option<RecommendedWatcher>,
    proc_stop: Option<Arc<AtomicBool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MountWatcher {
    fn start(table: &Arc<MountTable>, handle: &Handle) -> Self {
        let mut watcher = Self::default();

        if let Some(path) = table.fstab_path() {
            let (tx, rx) = mpsc::unbounded_channel();
            match watch_file(path, tx) {
                Ok(watch) => {
                    watcher.fstab_watch = Some(watch);
                    watcher.tasks.push(handle.spawn(forward_coalesced(
                        Arc::downgrade(table),
                        rx,
                        MountEvent::MountPointsChanged,
                    )));
                }
                Err(e) => warn!("{}", e),
            }
        }

        match table.monitor_path() {
            Some(path) if path.starts_with("/proc/") => watcher.start_proc_watch(table, path, handle),
            Some(path) => {
                let (tx, rx) = mpsc::unbounded_channel();
                match watch_file(path, tx) {
                    Ok(watch) => {
                        watcher.mtab_watch = Some(watch);
                        watcher.tasks.push(handle.spawn(forward_coalesced(
                            Arc::downgrade(table),
                            rx,
                            MountEvent::MountsChanged,
                        )));
                    }
                    Err(e) => warn!("{}", e),
                }
            }
            None => watcher.start_poller(table, handle),
        }

        watcher
    }

    #[cfg(unix)]
    fn start_proc_watch(&mut self, table: &Arc<MountTable>, path: &Path, handle: &Handle) {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Unable to open {} for mount monitoring: {}", path.display(), e);
                return;
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let spawned = {
            let stop = Arc::clone(&stop);
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("kiln-mount-watch".to_string())
                .spawn(move || poll_proc_table(&file, &stop, &pending, &tx))
        };

        if let Err(e) = spawned {
            warn!("Unable to start mount watch thread: {}", e);
            return;
        }

        {
            let mut watch = table.watch.lock();
            watch.running = true;
            watch.poller_time = monotonic_micros();
        }

        self.proc_stop = Some(stop);
        self.tasks
            .push(handle.spawn(forward_proc_changes(Arc::downgrade(table), rx, pending)));
    }

    #[cfg(not(unix))]
    fn start_proc_watch(&mut self, table: &Arc<MountTable>, _path: &Path, handle: &Handle) {
        self.start_poller(table, handle);
    }

    fn start_poller(&mut self, table: &Arc<MountTable>, handle: &Handle) {
        let snapshot = table.read_entries();

        {
            let mut watch = table.watch.lock();
            watch.running = true;
            watch.poller_time = monotonic_micros();
        }

        self.tasks.push(handle.spawn(poll_mount_changes(
            Arc::downgrade(table),
            table.poll_interval(),
            snapshot,
        )));
    }

    fn stop(self, table: &MountTable) {
        for task in &self.tasks {
            task.abort();
        }

        if let Some(stop) = &self.proc_stop {
            stop.store(true, Ordering::Release);
        }

        table.watch.lock().running = false;
        debug!("Stopped mount monitoring");
    }
}

/// Watch `path` through its directory so that replacing or deleting the file
/// is noticed too
fn watch_file(
    path: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher, MonitorError> {
    let watch_error = |source| MonitorError::Watch {
        path: path.to_path_buf(),
        source,
    };

    let target: Option<OsString> = path.file_name().map(ToOwned::to_owned);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                return;
            };

            if !matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            ) {
                return;
            }

            if event
                .paths
                .iter()
                .any(|p| p.file_name() == target.as_deref())
            {
                let _ = tx.send(());
            }
        },
        notify::Config::default(),
    )
    .map_err(watch_error)?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(watch_error)?;

    Ok(watcher)
}

/// Emit `event` once per burst of file notifications
async fn forward_coalesced(
    table: Weak<MountTable>,
    mut rx: mpsc::UnboundedReceiver<()>,
    event: MountEvent,
) {
    while rx.recv().await.is_some() {
        // Let the rest of the burst arrive, then report it once
        tokio::task::yield_now().await;
        while rx.try_recv().is_ok() {}

        let Some(table) = table.upgrade() else {
            break;
        };
        emit(&table, event);
    }
}

async fn forward_proc_changes(
    table: Weak<MountTable>,
    mut rx: mpsc::UnboundedReceiver<()>,
    pending: Arc<AtomicBool>,
) {
    while rx.recv().await.is_some() {
        pending.store(false, Ordering::Release);

        let Some(table) = table.upgrade() else {
            break;
        };
        table.watch.lock().poller_time = monotonic_micros();
        emit(&table, MountEvent::MountsChanged);
    }
}

/// Block on the table's file descriptor until the kernel flags a mount
/// change. At most one notification is queued at a time.
#[cfg(unix)]
fn poll_proc_table(
    file: &std::fs::File,
    stop: &AtomicBool,
    pending: &AtomicBool,
    tx: &mpsc::UnboundedSender<()>,
) {
    use std::os::unix::io::AsRawFd;

    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };

    while !stop.load(Ordering::Acquire) {
        fds.revents = 0;

        // Safety: `fds` is a valid pollfd and `file` outlives the call
        let ready = unsafe { libc::poll(&mut fds, 1, PROC_POLL_TIMEOUT_MS) };

        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!("Mount table poll failed: {}", err);
            break;
        }

        if ready > 0
            && fds.revents & (libc::POLLPRI | libc::POLLERR) != 0
            && !pending.swap(true, Ordering::AcqRel)
            && tx.send(()).is_err()
        {
            break;
        }
    }
}

async fn poll_mount_changes(
    table: Weak<MountTable>,
    period: Duration,
    mut last: Vec<UnixMountEntry>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(table) = table.upgrade() else {
            break;
        };

        let current = table.read_entries();
        if current != last {
            table.watch.lock().poller_time = monotonic_micros();
            last = current;
            emit(&table, MountEvent::MountsChanged);
        }
    }
}
