//! Filesystem session.
//!
//! A session binds a mountpoint to a handler table and owns everything in
//! between: the dispatcher and its workers, the per-FD write queues, the
//! copy engine, the shutdown machine and the kernel channel. `mount` and
//! `unmount` are idempotent and serialized; concurrent callers share the
//! in-flight attempt rather than racing their own.

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use log::error;
use log::info;
use log::warn;
use nix::unistd::AccessFlags;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::adapter::AdapterShared;
use crate::adapter::FuseChannel;
use crate::copy_range::CopyConfig;
use crate::copy_range::CopyRange;
use crate::copy_range::CopyStats;
use crate::dispatch::BarrierScope;
use crate::dispatch::Dispatcher;
use crate::dispatch::DispatcherConfig;
use crate::dispatch::DispatcherStats;
use crate::errno::Errno;
use crate::ops::ConnectionInfo;
use crate::ops::FuseOps;
use crate::shutdown::ShutdownCallbacks;
use crate::shutdown::ShutdownConfig;
use crate::shutdown::ShutdownManager;
use crate::shutdown::ShutdownPhases;
use crate::shutdown::ShutdownState;
use crate::shutdown::ShutdownStats;
use crate::signals;
use crate::signals::SignalSubscription;
use crate::validate;
use crate::write_queue::WriteCompletion;
use crate::write_queue::WritePriority;
use crate::write_queue::WriteQueueConfig;
use crate::write_queue::WriteQueueStats;
use crate::write_queue::WriteQueues;
use crate::types::Fd;

/// Signal-triggered shutdowns get this overall budget.
const SIGNAL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// Barrier waits cap out rather than hanging a worker forever when no
/// drainer is running.
const BARRIER_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a session is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Built, not yet attached to the kernel.
    Created,
    /// A mount attempt is in flight.
    Mounting,
    /// Serving kernel requests.
    Mounted,
    /// Shutting down.
    Unmounting,
    /// Detached; the session cannot be reused.
    Destroyed,
}

/// Session construction options.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Let any user access the mount (`-o allow_other`).
    pub allow_other: bool,
    /// Let root access the mount (`-o allow_root`).
    pub allow_root: bool,
    /// Install process-wide SIGINT/SIGTERM hooks that run a graceful
    /// shutdown, and require the mountpoint to be a directory.
    pub auto_unmount: bool,
    /// Defer permission checking to the kernel
    /// (`-o default_permissions`); the `access` operation is then never
    /// dispatched.
    pub default_permissions: bool,
    /// Extra `-o` options forwarded to libfuse verbatim.
    pub mount_options: Vec<String>,
    /// Verbose kernel protocol tracing (`-d`).
    pub debug: bool,
    /// Kept for compatibility with multi-channel deployments; the
    /// binding always runs a single kernel loop thread and gets its
    /// concurrency from the dispatcher pool.
    pub single_threaded: bool,
    /// Cap on the kernel's read size; 0 keeps the kernel default.
    pub max_read: u32,
    /// Cap on the kernel's write size; 0 keeps the kernel default.
    pub max_write: u32,
    /// Cap on readahead; 0 keeps the kernel default.
    pub max_readahead: u32,
    /// Default attr/entry cache lifetime for handlers that do not pick
    /// their own.
    pub timeout: Duration,
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
    /// Write-queue tuning.
    pub write_queue: WriteQueueConfig,
    /// Shutdown phase budgets.
    pub shutdown: ShutdownConfig,
    /// Copy-engine tuning.
    pub copy: CopyConfig,
}

impl Default for SessionOptions {
    fn default() -> SessionOptions {
        SessionOptions {
            allow_other: false,
            allow_root: false,
            auto_unmount: false,
            default_permissions: false,
            mount_options: Vec::new(),
            debug: false,
            single_threaded: false,
            max_read: 0,
            max_write: 0,
            max_readahead: 0,
            timeout: crate::ops::DEFAULT_TTL,
            dispatcher: DispatcherConfig::default(),
            write_queue: WriteQueueConfig::default(),
            shutdown: ShutdownConfig::default(),
            copy: CopyConfig::default(),
        }
    }
}

struct SessionCore {
    mountpoint: PathBuf,
    options: SessionOptions,
    dispatcher: Arc<Dispatcher>,
    write_queues: Arc<WriteQueues>,
    copy: Arc<CopyRange>,
    shutdown: Arc<ShutdownManager>,
    adapter: Arc<AdapterShared>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    channel: Mutex<Option<Arc<FuseChannel>>>,
    signal_hook: Mutex<Option<SignalSubscription>>,
}

/// A userspace filesystem session.
pub struct Session {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mountpoint", &self.core.mountpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Builds a session for `mountpoint` around a handler table.
    ///
    /// The mountpoint must be an absolute path to an existing, writable
    /// directory. Handlers for `lookup` and `getattr` are required by the
    /// [`FuseOps`] trait itself; there is nothing mountable without them.
    pub fn new(
        mountpoint: impl AsRef<Path>,
        ops: Arc<dyn FuseOps>,
        options: SessionOptions,
    ) -> io::Result<Session> {
        let mountpoint = mountpoint.as_ref().to_path_buf();
        validate_mountpoint(&mountpoint, &options)?;

        let dispatcher = Arc::new(Dispatcher::new(options.dispatcher, ops));
        let write_queues = Arc::new(WriteQueues::new(options.write_queue));
        let copy = Arc::new(CopyRange::new(options.copy));
        let shutdown = Arc::new(ShutdownManager::new(options.shutdown));

        // Metadata barriers: flush/release wait on the descriptor's
        // queue, fsync on every descriptor open for the inode.
        {
            let write_queues = Arc::clone(&write_queues);
            dispatcher.set_barrier_hook(Box::new(move |scope| {
                let result = match &scope {
                    BarrierScope::Fd(fd) => write_queues.flush(*fd, Some(BARRIER_TIMEOUT)),
                    BarrierScope::Ino(_, fds) => fds
                        .iter()
                        .try_for_each(|fd| write_queues.flush(*fd, Some(BARRIER_TIMEOUT))),
                };
                if let Err(errno) = result {
                    warn!("write barrier {scope:?} gave up: {errno}");
                }
            }));
        }

        let adapter = Arc::new(AdapterShared {
            dispatcher: Arc::clone(&dispatcher),
            conn: parking_lot::RwLock::new(None),
            max_write: options.max_write,
            max_read: options.max_read,
            max_readahead: options.max_readahead,
            default_permissions: options.default_permissions,
            default_ttl: options.timeout,
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            on_channel_lost: Mutex::new(None),
        });

        Ok(Session {
            core: Arc::new(SessionCore {
                mountpoint,
                options,
                dispatcher,
                write_queues,
                copy,
                shutdown,
                adapter,
                state: Mutex::new(SessionState::Created),
                state_changed: Condvar::new(),
                channel: Mutex::new(None),
                signal_hook: Mutex::new(None),
            }),
        })
    }

    /// The configured mountpoint.
    pub fn mountpoint(&self) -> &Path {
        &self.core.mountpoint
    }

    /// Where the session is in its life.
    pub fn state(&self) -> SessionState {
        *self.core.state.lock()
    }

    /// The shutdown machine's phase.
    pub fn shutdown_state(&self) -> ShutdownState {
        self.core.shutdown.state()
    }

    /// Negotiated kernel parameters; `None` before the kernel's init
    /// request has been served.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        *self.core.adapter.conn.read()
    }

    /// Attaches the session to the kernel. Idempotent; a concurrent call
    /// waits for the in-flight attempt and shares its outcome.
    pub fn mount(&self) -> io::Result<()> {
        let core = &self.core;
        {
            let mut state = core.state.lock();
            loop {
                match *state {
                    SessionState::Created => {
                        *state = SessionState::Mounting;
                        break;
                    }
                    SessionState::Mounting => {
                        core.state_changed.wait(&mut state);
                    }
                    SessionState::Mounted => return Ok(()),
                    SessionState::Unmounting | SessionState::Destroyed => {
                        return Err(invalid_input("session has already been shut down"));
                    }
                }
            }
        }

        let result = self.do_mount();
        let mut state = core.state.lock();
        *state = match result {
            Ok(()) => SessionState::Mounted,
            Err(_) => SessionState::Created,
        };
        core.state_changed.notify_all();
        result
    }

    fn do_mount(&self) -> io::Result<()> {
        let core = &self.core;
        let args = mount_args(&core.options);

        // A lost kernel channel takes the whole session down as FAILED.
        {
            let weak = Arc::downgrade(&self.core);
            *core.adapter.on_channel_lost.lock() = Some(Box::new(move |reason| {
                if let Some(core) = weak.upgrade() {
                    std::thread::spawn(move || {
                        error!("kernel channel lost: {reason}");
                        let _ = SessionCore::run_forced(&core, &reason);
                    });
                }
            }));
        }

        let channel = FuseChannel::mount(&core.mountpoint, &args, Arc::clone(&core.adapter))?;
        *core.channel.lock() = Some(Arc::new(channel));
        info!("mounted {}", core.mountpoint.display());

        if core.options.auto_unmount {
            let weak = Arc::downgrade(&self.core);
            let hook = signals::subscribe(Box::new(move |signal| {
                if let Some(core) = weak.upgrade() {
                    info!("auto-unmount on {signal}");
                    let _ = SessionCore::run_graceful(
                        &core,
                        &format!("signal {signal}"),
                        Some(SIGNAL_SHUTDOWN_BUDGET),
                    );
                }
            }));
            *core.signal_hook.lock() = Some(hook);
        }
        Ok(())
    }

    /// Detaches from the kernel through a graceful shutdown. Idempotent.
    pub fn unmount(&self) -> io::Result<()> {
        match SessionCore::run_graceful(&self.core, "unmount requested", None) {
            Ok(_) => Ok(()),
            Err(errno) if errno == Errno::ESHUTDOWN => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    /// Starts a graceful shutdown: drain, unmount, teardown. `timeout`
    /// bounds the whole procedure.
    pub fn initiate_graceful_shutdown(
        &self,
        reason: &str,
        timeout: Option<Duration>,
    ) -> Result<ShutdownStats, Errno> {
        SessionCore::run_graceful(&self.core, reason, timeout)
    }

    /// Cancels everything in flight with `ECANCELED` and unmounts
    /// immediately.
    pub fn force_immediate_shutdown(&self, reason: &str) -> Result<ShutdownStats, Errno> {
        SessionCore::run_forced(&self.core, reason)
    }

    /// Installs shutdown observer callbacks, replacing any previous set.
    pub fn set_shutdown_callbacks(&self, callbacks: ShutdownCallbacks) {
        self.core.shutdown.set_callbacks(callbacks);
    }

    /// Stats from a completed shutdown.
    pub fn shutdown_stats(&self) -> Option<ShutdownStats> {
        self.core.shutdown.stats()
    }

    /// Swaps the handler table between requests. Intended for use
    /// between sessions or during controlled reconfiguration; in-flight
    /// requests finish against the table they started with.
    pub fn replace_ops(&self, ops: Arc<dyn FuseOps>) {
        self.core.dispatcher.replace_ops(ops);
    }

    /// Dispatcher counters.
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.core.dispatcher.stats()
    }

    /// Write-queue counters, summed across descriptors.
    pub fn write_queue_stats(&self) -> WriteQueueStats {
        self.core.write_queues.aggregate_stats()
    }

    /// Copy-engine counters.
    pub fn copy_stats(&self) -> CopyStats {
        self.core.copy.stats()
    }

    /// The session's copy engine, for handlers implementing
    /// `copy_file_range` over real host descriptors.
    pub fn copy_range(&self) -> &CopyRange {
        &self.core.copy
    }

    /// Queues a write for `fd`. See [`WriteQueues::enqueue`].
    pub fn enqueue_write(
        &self,
        fd: Fd,
        offset: u64,
        data: Vec<u8>,
        priority: WritePriority,
        completion: WriteCompletion,
    ) -> Result<u64, Errno> {
        self.core
            .write_queues
            .enqueue(fd, offset, data, priority, completion)
    }

    /// Drains queued writes through `executor` on the calling thread.
    pub fn process_writes<F>(&self, executor: &mut F) -> usize
    where
        F: FnMut(Fd, u64, &[u8]) -> Result<usize, Errno>,
    {
        self.core.write_queues.process_all(executor)
    }

    /// Blocks until `fd`'s queued writes have completed.
    pub fn flush_writes(&self, fd: Fd, timeout: Option<Duration>) -> Result<(), Errno> {
        self.core.write_queues.flush(fd, timeout)
    }

    /// Overrides the queue bound for one descriptor.
    pub fn set_write_queue_limit(&self, fd: Fd, limit: usize) {
        self.core.write_queues.set_fd_limit(fd, limit);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == SessionState::Mounted {
            info!("unmounting {} on drop", self.core.mountpoint.display());
            if let Err(err) = self.unmount() {
                error!(
                    "failed to unmount {}: {err}",
                    self.core.mountpoint.display()
                );
            }
        }
    }
}

impl SessionCore {
    fn run_graceful(
        core: &Arc<SessionCore>,
        reason: &str,
        timeout: Option<Duration>,
    ) -> Result<ShutdownStats, Errno> {
        if !core.begin_shutdown() {
            return Err(Errno::ESHUTDOWN);
        }
        let phases: Arc<dyn ShutdownPhases> = Arc::new(SessionPhases {
            core: Arc::clone(core),
        });
        let result = core.shutdown.initiate_graceful(reason, timeout, &phases);
        core.finish_shutdown();
        result
    }

    fn run_forced(core: &Arc<SessionCore>, reason: &str) -> Result<ShutdownStats, Errno> {
        if !core.begin_shutdown() {
            return Err(Errno::ESHUTDOWN);
        }
        let phases: Arc<dyn ShutdownPhases> = Arc::new(SessionPhases {
            core: Arc::clone(core),
        });
        let result = core.shutdown.force_immediate(reason, &phases);
        core.finish_shutdown();
        result
    }

    /// Claims the unmount path. False when the session never mounted or
    /// someone else already holds it.
    fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            match *state {
                SessionState::Mounted => {
                    *state = SessionState::Unmounting;
                    self.state_changed.notify_all();
                    break;
                }
                SessionState::Created => {
                    // Nothing mounted; go straight to the terminal state.
                    *state = SessionState::Destroyed;
                    self.state_changed.notify_all();
                    return false;
                }
                SessionState::Mounting => {
                    self.state_changed.wait(&mut state);
                }
                SessionState::Unmounting | SessionState::Destroyed => return false,
            }
        }
        self.adapter
            .shutting_down
            .store(true, Ordering::Release);
        true
    }

    fn finish_shutdown(&self) {
        let mut state = self.state.lock();
        *state = SessionState::Destroyed;
        self.state_changed.notify_all();
    }
}

struct SessionPhases {
    core: Arc<SessionCore>,
}

impl ShutdownPhases for SessionPhases {
    fn stop_intake(&self) {
        self.core.dispatcher.stop_accepting();
    }

    fn drain(&self, deadline: Instant) -> bool {
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let dispatcher_idle = self.core.dispatcher.wait_idle(Some(remaining()));
        let queues_empty = self.core.write_queues.flush_all(Some(remaining())).is_ok();
        dispatcher_idle && queues_empty
    }

    fn cancel_all(&self) -> usize {
        self.core.dispatcher.cancel_all() + self.core.write_queues.cancel_all()
    }

    fn unmount(&self) -> io::Result<()> {
        let channel = self.core.channel.lock().clone();
        match channel {
            Some(channel) => channel.unmount(),
            None => Ok(()),
        }
    }

    fn teardown(&self) {
        self.core.signal_hook.lock().take();
        self.core.channel.lock().take();
        self.core.dispatcher.close();
    }
}

fn validate_mountpoint(mountpoint: &Path, options: &SessionOptions) -> io::Result<()> {
    validate::absolute_path(mountpoint)
        .map_err(|_| invalid_input("mountpoint must be an absolute path"))?;
    let metadata = std::fs::metadata(mountpoint)?;
    if !metadata.is_dir() {
        return Err(invalid_input("mountpoint is not a directory"));
    }
    nix::unistd::access(mountpoint, AccessFlags::W_OK)
        .map_err(|_| invalid_input("mountpoint is not writable"))?;
    if options.allow_other && options.allow_root {
        return Err(invalid_input(
            "allow_other and allow_root are mutually exclusive",
        ));
    }
    if options.mount_options.iter().any(|o| o.contains('\0')) {
        return Err(invalid_input("mount option contains NUL"));
    }
    Ok(())
}

fn invalid_input(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

fn mount_args(options: &SessionOptions) -> Vec<CString> {
    let mut args = vec![c_string("fusebind")];
    if options.debug {
        args.push(c_string("-d"));
    }
    let mut push_opt = |opt: &str| {
        args.push(c_string("-o"));
        args.push(c_string(opt));
    };
    if options.allow_other {
        push_opt("allow_other");
    }
    if options.allow_root {
        push_opt("allow_root");
    }
    if options.default_permissions {
        push_opt("default_permissions");
    }
    if options.auto_unmount {
        push_opt("auto_unmount");
    }
    for opt in &options.mount_options {
        push_opt(opt);
    }
    args
}

fn c_string(s: &str) -> CString {
    CString::new(s).expect("mount option contains NUL")
}
