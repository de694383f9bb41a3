//! The kernel-to-handler dispatcher.
//!
//! Adapter threads enqueue typed operations; a small worker pool pops them
//! in priority order and runs the operation wrappers. Each request carries
//! a reply function that is invoked exactly once, whether the handler
//! completes, the queue rejects the request, a timeout fires, or the
//! consumer aborts.
//!
//! Ordering: requests are sharded across workers by inode, so two requests
//! for the same inode at the same priority complete in arrival order.
//! Requests for different inodes may be reordered freely.

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::errno::Errno;
use crate::ops::FuseOps;
use crate::ops::wrap;
use crate::ops::wrap::Operation;
use crate::ops::wrap::Outcome;
use crate::types::Fd;
use crate::types::Ino;
use crate::types::RequestContext;

/// Priority tiers for dispatched requests, scheduled strictly.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum DispatchPriority {
    /// Served before everything else.
    High,
    /// The default tier.
    #[default]
    Normal,
    /// Served only when the higher tiers are empty.
    Low,
}

impl DispatchPriority {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            DispatchPriority::High => 0,
            DispatchPriority::Normal => 1,
            DispatchPriority::Low => 2,
        }
    }
}

/// Dispatcher tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// Total queued-request bound across all priorities; 0 means
    /// unbounded. A full queue rejects new requests with `EAGAIN`.
    pub max_queue_size: usize,
    /// Worker threads popping the queue. More workers mean more handler
    /// concurrency and weaker cross-inode ordering.
    pub worker_threads: usize,
    /// Strict priority scheduling. When off, every request is treated as
    /// `Normal` and served FIFO.
    pub priority_ordering: bool,
}

impl Default for DispatcherConfig {
    fn default() -> DispatcherConfig {
        DispatcherConfig {
            max_queue_size: 0,
            worker_threads: 1,
            priority_ordering: true,
        }
    }
}

/// Per-request dispatch options supplied by the adapter or consumer.
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Priority tier.
    pub priority: DispatchPriority,
    /// Cooperative cancellation signal. Firing it replies `EINTR` and
    /// discards any late handler result.
    pub abort: Option<AbortToken>,
    /// Deadline for the whole request; expiry replies `ETIMEDOUT`.
    pub timeout: Option<Duration>,
}

/// The reply callback attached to every request. Invoked exactly once.
pub type ReplyFn = Box<dyn FnOnce(Result<Outcome, Errno>) + Send + 'static>;

/// Running counters, sampled with [`Dispatcher::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DispatcherStats {
    /// Requests accepted into the queue.
    pub total_dispatched: u64,
    /// Requests whose handler completed (either way).
    pub total_completed: u64,
    /// Requests that ended in an error reply, including rejections.
    pub total_errors: u64,
    /// Requests currently queued.
    pub queue_size_current: usize,
    /// High-water mark of the queue.
    pub queue_size_max: usize,
    /// Mean handler latency over completed requests.
    pub avg_latency_ms: f64,
    /// Time since the dispatcher was built.
    pub uptime_ms: u64,
}

/// A cooperative cancellation handle. Cloned freely; firing any clone
/// cancels the requests it was attached to.
#[derive(Clone, Debug, Default)]
pub struct AbortToken {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    fired: AtomicBool,
    waiters: Mutex<Vec<Weak<ReplySlot>>>,
}

impl AbortToken {
    /// A fresh, unfired token.
    pub fn new() -> AbortToken {
        AbortToken::default()
    }

    /// True once [`fire`](Self::fire) has been called.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Cancels every attached request with `EINTR`. Idempotent.
    pub fn fire(&self) {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for slot in waiters {
            if let Some(slot) = slot.upgrade() {
                slot.cancel(Errno::EINTR);
            }
        }
    }

    fn attach(&self, slot: &Arc<ReplySlot>) {
        if self.is_fired() {
            slot.cancel(Errno::EINTR);
            return;
        }
        self.inner.waiters.lock().push(Arc::downgrade(slot));
        // The token may have fired between the check and the push.
        if self.is_fired() {
            slot.cancel(Errno::EINTR);
        }
    }
}

/// Holds the reply function and enforces exactly-one completion. The
/// cancellation paths (abort, timeout, forced shutdown) go through
/// [`cancel`](Self::cancel); a worker completing a request that was
/// already cancelled silently discards its result, while any other double
/// completion is a bug caught in debug builds.
struct ReplySlot {
    reply: Mutex<Option<ReplyFn>>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplySlot(cancelled: {})", self.cancelled.load(Ordering::Relaxed))
    }
}

impl ReplySlot {
    fn new(reply: ReplyFn) -> Arc<ReplySlot> {
        Arc::new(ReplySlot {
            reply: Mutex::new(Some(reply)),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Normal completion from a worker. Returns false when the slot was
    /// already consumed.
    fn complete(&self, result: Result<Outcome, Errno>) -> bool {
        let reply = self.reply.lock().take();
        match reply {
            Some(reply) => {
                reply(result);
                true
            }
            None => {
                debug_assert!(
                    self.cancelled.load(Ordering::Acquire),
                    "request replied to twice"
                );
                false
            }
        }
    }

    /// Cancellation: reply with `errno` unless the request already
    /// completed, and mark the slot so the late handler result is
    /// discarded quietly.
    fn cancel(&self, errno: Errno) -> bool {
        self.cancelled.store(true, Ordering::Release);
        match self.reply.lock().take() {
            Some(reply) => {
                reply(Err(errno));
                true
            }
            None => false,
        }
    }
}

struct QueuedRequest {
    id: u64,
    ctx: RequestContext,
    op: Operation,
    slot: Arc<ReplySlot>,
    deadline: Option<Instant>,
    enqueued: Instant,
}

struct Shard {
    queues: Mutex<[VecDeque<QueuedRequest>; DispatchPriority::COUNT]>,
    ready: Condvar,
}

impl Shard {
    fn new() -> Shard {
        Shard {
            queues: Mutex::new(Default::default()),
            ready: Condvar::new(),
        }
    }
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
    queue_max: AtomicUsize,
}

struct DeadlineEntry {
    deadline: Instant,
    slot: Weak<ReplySlot>,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for DeadlineEntry {}
impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Earliest deadline first out of the max-heap.
        other.deadline.cmp(&self.deadline)
    }
}

/// A hook the session installs so that metadata barriers can wait on the
/// per-FD write queues before `flush`/`release`/`fsync` handlers run.
pub type BarrierHook = Box<dyn Fn(BarrierScope) + Send + Sync + 'static>;

/// What a metadata barrier must wait for.
#[derive(Clone, Debug)]
pub enum BarrierScope {
    /// All writes previously enqueued for one file handle.
    Fd(Fd),
    /// All writes for every handle currently open on an inode.
    Ino(Ino, Vec<Fd>),
}

struct Shared {
    shards: Vec<Shard>,
    config: DispatcherConfig,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    running: AtomicBool,
    next_id: AtomicU64,
    registry: RwLock<Arc<dyn FuseOps>>,
    counters: Counters,
    started: Instant,
    idle_lock: Mutex<()>,
    idle: Condvar,
    inflight_slots: Mutex<HashMap<u64, Arc<ReplySlot>>>,
    open_fds: Mutex<HashMap<Ino, Vec<Fd>>>,
    barrier: RwLock<Option<BarrierHook>>,
    deadlines: Mutex<BinaryHeap<DeadlineEntry>>,
    deadline_tick: Condvar,
}

impl Shared {
    fn shard_for(&self, ino: Ino) -> &Shard {
        // Cheap integer hash; inodes are often sequential.
        let mut h = ino.0.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= h >> 32;
        &self.shards[(h as usize) % self.shards.len()]
    }

    fn note_idle_if_drained(&self) {
        if self.queued.load(Ordering::Acquire) == 0 && self.in_flight.load(Ordering::Acquire) == 0
        {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }
}

/// The dispatcher. Owns its worker pool; dropping it stops the workers
/// after the queue drains of already-popped requests.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.shared.config)
            .field("queued", &self.shared.queued.load(Ordering::Relaxed))
            .finish()
    }
}

impl Dispatcher {
    /// Builds a dispatcher around a handler table and starts its workers.
    pub fn new(config: DispatcherConfig, ops: Arc<dyn FuseOps>) -> Dispatcher {
        let workers = config.worker_threads.max(1);
        let shared = Arc::new(Shared {
            shards: (0..workers).map(|_| Shard::new()).collect(),
            config,
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            registry: RwLock::new(ops),
            counters: Counters::default(),
            started: Instant::now(),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            inflight_slots: Mutex::new(HashMap::new()),
            open_fds: Mutex::new(HashMap::new()),
            barrier: RwLock::new(None),
            deadlines: Mutex::new(BinaryHeap::new()),
            deadline_tick: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers + 1);
        for idx in 0..workers {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name(format!("fusebind-worker-{idx}"))
                    .spawn(move || worker_loop(&shared, idx))
                    .expect("failed to spawn dispatcher worker"),
            );
        }
        {
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("fusebind-deadline".into())
                    .spawn(move || deadline_loop(&shared))
                    .expect("failed to spawn deadline watcher"),
            );
        }

        Dispatcher {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Swaps the handler table. Takes the registry's exclusive lock; new
    /// requests see the new table, in-flight requests finish on the old
    /// one.
    pub fn replace_ops(&self, ops: Arc<dyn FuseOps>) {
        *self.shared.registry.write() = ops;
    }

    /// The current handler table.
    pub fn ops(&self) -> Arc<dyn FuseOps> {
        Arc::clone(&self.shared.registry.read())
    }

    /// Installs the metadata-barrier hook. At most one; the session wires
    /// this to the write queues.
    pub fn set_barrier_hook(&self, hook: BarrierHook) {
        *self.shared.barrier.write() = Some(hook);
    }

    /// File handles recorded open for `ino`, from successful
    /// `open`/`create` replies that have not seen their `release` yet.
    pub fn fds_of(&self, ino: Ino) -> Vec<Fd> {
        self.shared
            .open_fds
            .lock()
            .get(&ino)
            .cloned()
            .unwrap_or_default()
    }

    /// Enqueues a request. The reply function is consumed here and is
    /// guaranteed to run exactly once: on rejection (`EAGAIN` when full,
    /// `ESHUTDOWN` when draining), cancellation, timeout, or handler
    /// completion.
    pub fn dispatch(
        &self,
        ctx: RequestContext,
        op: Operation,
        opts: DispatchOptions,
        reply: ReplyFn,
    ) {
        let shared = &self.shared;
        let slot = ReplySlot::new(reply);

        if !shared.accepting.load(Ordering::Acquire) {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            slot.cancel(Errno::ESHUTDOWN);
            return;
        }

        let cap = shared.config.max_queue_size;
        if cap > 0 {
            // Reserve a queue position; racing enqueuers may each see the
            // last free one, so re-check after the increment.
            let occupied = shared.queued.fetch_add(1, Ordering::AcqRel);
            if occupied >= cap {
                shared.queued.fetch_sub(1, Ordering::AcqRel);
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                slot.cancel(Errno::EAGAIN);
                return;
            }
        } else {
            shared.queued.fetch_add(1, Ordering::AcqRel);
        }

        if let Some(token) = &opts.abort {
            token.attach(&slot);
        }
        let deadline = opts.timeout.map(|t| Instant::now() + t);
        if let Some(deadline) = deadline {
            shared.deadlines.lock().push(DeadlineEntry {
                deadline,
                slot: Arc::downgrade(&slot),
            });
            shared.deadline_tick.notify_one();
        }

        let priority = if shared.config.priority_ordering {
            opts.priority
        } else {
            DispatchPriority::Normal
        };
        let request = QueuedRequest {
            id: shared.next_id.fetch_add(1, Ordering::Relaxed),
            ctx,
            op,
            slot,
            deadline,
            enqueued: Instant::now(),
        };

        shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let occupied = shared.queued.load(Ordering::Acquire);
        shared
            .counters
            .queue_max
            .fetch_max(occupied, Ordering::Relaxed);

        let shard = shared.shard_for(request.op.ordering_ino());
        let mut queues = shard.queues.lock();
        queues[priority.index()].push_back(request);
        shard.ready.notify_one();
    }

    /// Stops accepting new requests; queued and in-flight work continues.
    pub fn stop_accepting(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    /// True while new requests are accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Blocks until no request is queued or in flight, or the deadline
    /// passes. Returns whether the dispatcher went idle.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let shared = &self.shared;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = shared.idle_lock.lock();
        loop {
            if shared.queued.load(Ordering::Acquire) == 0
                && shared.in_flight.load(Ordering::Acquire) == 0
            {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if shared.idle.wait_until(&mut guard, deadline).timed_out() {
                        return shared.queued.load(Ordering::Acquire) == 0
                            && shared.in_flight.load(Ordering::Acquire) == 0;
                    }
                }
                None => shared.idle.wait(&mut guard),
            }
        }
    }

    /// Cancels every queued request and every in-flight request with
    /// `ECANCELED`. Late handler results are discarded. Returns the number
    /// of requests cancelled.
    pub fn cancel_all(&self) -> usize {
        let shared = &self.shared;
        let mut cancelled = 0;
        for shard in &shared.shards {
            let mut queues = shard.queues.lock();
            for tier in queues.iter_mut() {
                while let Some(request) = tier.pop_front() {
                    shared.queued.fetch_sub(1, Ordering::AcqRel);
                    shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                    request.slot.cancel(Errno::ECANCELED);
                    cancelled += 1;
                }
            }
        }
        for (_, slot) in shared.inflight_slots.lock().iter() {
            if slot.cancel(Errno::ECANCELED) {
                cancelled += 1;
            }
        }
        shared.note_idle_if_drained();
        cancelled
    }

    /// Stops the workers. Queued requests that were not cancelled first
    /// are abandoned with `ESHUTDOWN`.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.accepting.store(false, Ordering::Release);
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for shard in &shared.shards {
            let _guard = shard.queues.lock();
            shard.ready.notify_all();
        }
        {
            // Take the lock so the notify cannot slip between the watcher's
            // running-flag check and its wait.
            let _guard = shared.deadlines.lock();
            shared.deadline_tick.notify_all();
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("dispatcher worker panicked during shutdown");
            }
        }
        // Anything still queued never ran.
        for shard in &shared.shards {
            let mut queues = shard.queues.lock();
            for tier in queues.iter_mut() {
                while let Some(request) = tier.pop_front() {
                    shared.queued.fetch_sub(1, Ordering::AcqRel);
                    request.slot.cancel(Errno::ESHUTDOWN);
                }
            }
        }
        shared.note_idle_if_drained();
    }

    /// A snapshot of the dispatcher counters.
    pub fn stats(&self) -> DispatcherStats {
        let shared = &self.shared;
        let completed = shared.counters.completed.load(Ordering::Relaxed);
        let latency_micros = shared.counters.latency_micros.load(Ordering::Relaxed);
        DispatcherStats {
            total_dispatched: shared.counters.dispatched.load(Ordering::Relaxed),
            total_completed: completed,
            total_errors: shared.counters.errors.load(Ordering::Relaxed),
            queue_size_current: shared.queued.load(Ordering::Acquire),
            queue_size_max: shared.counters.queue_max.load(Ordering::Relaxed),
            avg_latency_ms: if completed == 0 {
                0.0
            } else {
                latency_micros as f64 / completed as f64 / 1000.0
            },
            uptime_ms: shared.started.elapsed().as_millis() as u64,
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn pop_next(shard: &Shard, shared: &Shared) -> Option<QueuedRequest> {
    let mut queues = shard.queues.lock();
    loop {
        for tier in queues.iter_mut() {
            if let Some(request) = tier.pop_front() {
                return Some(request);
            }
        }
        if !shared.running.load(Ordering::Acquire) {
            return None;
        }
        shard.ready.wait(&mut queues);
    }
}

fn worker_loop(shared: &Arc<Shared>, idx: usize) {
    let shard = &shared.shards[idx];
    while let Some(request) = pop_next(shard, shared) {
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        run_request(shared, request);
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        shared.note_idle_if_drained();
    }
}

fn run_request(shared: &Arc<Shared>, request: QueuedRequest) {
    let QueuedRequest {
        id,
        ctx,
        op,
        slot,
        deadline,
        enqueued,
    } = request;

    if slot.cancelled.load(Ordering::Acquire) {
        return;
    }
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            slot.cancel(Errno::ETIMEDOUT);
            return;
        }
    }

    debug!("dispatch {op:?}");
    apply_barrier(shared, &op);

    shared.inflight_slots.lock().insert(id, Arc::clone(&slot));
    let ops = Arc::clone(&shared.registry.read());
    let result = wrap::execute(ops.as_ref(), &ctx, &op);
    shared.inflight_slots.lock().remove(&id);

    track_open_fds(shared, &op, &result);

    let latency = enqueued.elapsed();
    shared
        .counters
        .latency_micros
        .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    shared.counters.completed.fetch_add(1, Ordering::Relaxed);
    if result.is_err() {
        shared.counters.errors.fetch_add(1, Ordering::Relaxed);
    }
    slot.complete(result);
}

/// Flush-type operations observe previously enqueued writes before their
/// handler runs.
fn apply_barrier(shared: &Shared, op: &Operation) {
    let barrier = shared.barrier.read();
    let Some(hook) = barrier.as_ref() else {
        return;
    };
    match op {
        Operation::Flush { fi, .. } | Operation::Release { fi, .. } => {
            hook(BarrierScope::Fd(fi.fh));
        }
        Operation::Fsync { ino, .. } => {
            let fds = shared.open_fds.lock().get(ino).cloned().unwrap_or_default();
            hook(BarrierScope::Ino(*ino, fds));
        }
        _ => {}
    }
}

/// Maintains the inode-to-open-handles map that fsync barriers need.
fn track_open_fds(shared: &Shared, op: &Operation, result: &Result<Outcome, Errno>) {
    match (op, result) {
        (Operation::Open { ino, .. }, Ok(Outcome::Opened(fi))) => {
            shared.open_fds.lock().entry(*ino).or_default().push(fi.fh);
        }
        (Operation::Create { .. }, Ok(Outcome::Created(entry, fi))) => {
            shared
                .open_fds
                .lock()
                .entry(entry.attr.ino)
                .or_default()
                .push(fi.fh);
        }
        (Operation::Release { ino, fi }, Ok(_)) => {
            let mut map = shared.open_fds.lock();
            if let Some(fds) = map.get_mut(ino) {
                fds.retain(|fd| *fd != fi.fh);
                if fds.is_empty() {
                    map.remove(ino);
                }
            }
        }
        _ => {}
    }
}

fn deadline_loop(shared: &Arc<Shared>) {
    let mut guard = shared.deadlines.lock();
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        while let Some(entry) = guard.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = guard.pop().expect("peeked entry vanished");
            if let Some(slot) = entry.slot.upgrade() {
                if slot.cancel(Errno::ETIMEDOUT) {
                    shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        match guard.peek().map(|e| e.deadline) {
            Some(next) => {
                shared.deadline_tick.wait_until(&mut guard, next);
            }
            None => shared.deadline_tick.wait(&mut guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::AttrOut;
    use crate::ops::Entry;
    use crate::ops::OpResult;
    use crate::types::FileAttr;
    use crate::types::FileInfo;
    use crate::types::FileType;
    use crate::types::Mode;
    use std::ffi::OsStr;
    use std::sync::mpsc;

    struct SlowFs {
        delay: Duration,
    }

    impl FuseOps for SlowFs {
        fn lookup(&self, _: &RequestContext, _: Ino, _: &OsStr) -> OpResult<Entry> {
            thread::sleep(self.delay);
            Ok(Entry::new(FileAttr::simple(
                Ino(2),
                Mode::from_parts(FileType::RegularFile, 0o644),
            )))
        }

        fn getattr(&self, _: &RequestContext, ino: Ino, _: Option<&FileInfo>) -> OpResult<AttrOut> {
            thread::sleep(self.delay);
            Ok(AttrOut::new(FileAttr::simple(
                ino,
                Mode::from_parts(FileType::Directory, 0o755),
            )))
        }
    }

    fn lookup_op() -> Operation {
        Operation::Lookup {
            parent: Ino(1),
            name: "file".into(),
        }
    }

    fn make(config: DispatcherConfig, delay: Duration) -> Dispatcher {
        Dispatcher::new(config, Arc::new(SlowFs { delay }))
    }

    #[test]
    fn dispatch_completes_and_counts() {
        let dispatcher = make(DispatcherConfig::default(), Duration::ZERO);
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions::default(),
            Box::new(move |result| tx.send(result.is_ok()).unwrap()),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(dispatcher.wait_idle(Some(Duration::from_secs(5))));
        let stats = dispatcher.stats();
        assert_eq!(stats.total_dispatched, 1);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_errors, 0);
    }

    #[test]
    fn bounded_queue_rejects_with_eagain() {
        let config = DispatcherConfig {
            max_queue_size: 1,
            worker_threads: 1,
            priority_ordering: true,
        };
        let dispatcher = make(config, Duration::from_millis(200));
        let (tx, rx) = mpsc::channel();
        // First request occupies the worker, second fills the queue slot,
        // third must bounce.
        let first = tx.clone();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions::default(),
            Box::new(move |result| first.send(result.map(|_| ())).unwrap()),
        );
        // Let the worker pop the first request so the queue is empty.
        thread::sleep(Duration::from_millis(50));
        let second = tx.clone();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions::default(),
            Box::new(move |result| second.send(result.map(|_| ())).unwrap()),
        );
        let (reject_tx, reject_rx) = mpsc::channel();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions::default(),
            Box::new(move |result| reject_tx.send(result.map(|_| ())).unwrap()),
        );
        assert_eq!(
            reject_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Errno::EAGAIN)
        );
        drop(tx);
        while rx.recv_timeout(Duration::from_secs(5)).is_ok() {}
    }

    #[test]
    fn shutdown_rejects_with_eshutdown() {
        let dispatcher = make(DispatcherConfig::default(), Duration::ZERO);
        dispatcher.stop_accepting();
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions::default(),
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Errno::ESHUTDOWN)
        );
    }

    #[test]
    fn abort_token_replies_eintr_and_discards_result() {
        let dispatcher = make(DispatcherConfig::default(), Duration::from_millis(150));
        let token = AbortToken::new();
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions {
                abort: Some(token.clone()),
                ..DispatchOptions::default()
            },
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        thread::sleep(Duration::from_millis(10));
        token.fire();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Errno::EINTR)
        );
        // The handler finishes later; its result must be dropped, not
        // delivered twice (the channel is gone by then anyway).
        assert!(dispatcher.wait_idle(Some(Duration::from_secs(5))));
    }

    #[test]
    fn timeout_replies_etimedout() {
        let dispatcher = make(DispatcherConfig::default(), Duration::from_millis(300));
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions {
                timeout: Some(Duration::from_millis(30)),
                ..DispatchOptions::default()
            },
            Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(Errno::ETIMEDOUT)
        );
        assert!(dispatcher.wait_idle(Some(Duration::from_secs(5))));
    }

    #[test]
    fn priority_tiers_are_strict() {
        // One worker, stalled on a first request; High then overtakes
        // queued Normal work.
        let dispatcher = make(DispatcherConfig::default(), Duration::from_millis(100));
        let (tx, rx) = mpsc::channel::<&'static str>();

        let first = tx.clone();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions::default(),
            Box::new(move |_| first.send("first").unwrap()),
        );
        thread::sleep(Duration::from_millis(20));

        let normal = tx.clone();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions {
                priority: DispatchPriority::Low,
                ..DispatchOptions::default()
            },
            Box::new(move |_| normal.send("low").unwrap()),
        );
        let high = tx.clone();
        dispatcher.dispatch(
            RequestContext::root(),
            lookup_op(),
            DispatchOptions {
                priority: DispatchPriority::High,
                ..DispatchOptions::default()
            },
            Box::new(move |_| high.send("high").unwrap()),
        );

        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["first", "high", "low"]);
    }

    #[test]
    fn same_inode_same_priority_is_fifo() {
        let dispatcher = make(DispatcherConfig::default(), Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        for i in 0..20u32 {
            let tx = tx.clone();
            dispatcher.dispatch(
                RequestContext::root(),
                lookup_op(),
                DispatchOptions::default(),
                Box::new(move |_| tx.send(i).unwrap()),
            );
        }
        let order: Vec<_> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_all_reports_ecanceled() {
        let dispatcher = make(DispatcherConfig::default(), Duration::from_millis(200));
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            dispatcher.dispatch(
                RequestContext::root(),
                lookup_op(),
                DispatchOptions::default(),
                Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
            );
        }
        thread::sleep(Duration::from_millis(20));
        dispatcher.stop_accepting();
        let cancelled = dispatcher.cancel_all();
        assert!(cancelled >= 2, "queued requests should be cancelled");
        let mut saw_ecanceled = 0;
        for _ in 0..3 {
            if let Ok(Err(errno)) = rx.recv_timeout(Duration::from_secs(2)) {
                if errno == Errno::ECANCELED {
                    saw_ecanceled += 1;
                }
            }
        }
        assert!(saw_ecanceled >= 2);
        assert!(dispatcher.wait_idle(Some(Duration::from_secs(5))));
    }

    #[test]
    fn open_release_tracks_fd_map() {
        struct OpenFs;
        impl FuseOps for OpenFs {
            fn lookup(&self, _: &RequestContext, _: Ino, _: &OsStr) -> OpResult<Entry> {
                Err(Errno::ENOENT)
            }
            fn getattr(&self, _: &RequestContext, _: Ino, _: Option<&FileInfo>) -> OpResult<AttrOut> {
                Err(Errno::ENOENT)
            }
            fn open(
                &self,
                _: &RequestContext,
                _: Ino,
                flags: crate::types::OpenFlags,
            ) -> OpResult<FileInfo> {
                Ok(FileInfo::with_fh(Fd(7), flags))
            }
            fn release(&self, _: &RequestContext, _: Ino, _: &FileInfo) -> OpResult<()> {
                Ok(())
            }
        }
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), Arc::new(OpenFs));
        let (tx, rx) = mpsc::channel();
        let open_tx = tx.clone();
        dispatcher.dispatch(
            RequestContext::root(),
            Operation::Open {
                ino: Ino(42),
                flags: crate::types::OpenFlags::empty(),
            },
            DispatchOptions::default(),
            Box::new(move |r| open_tx.send(r.is_ok()).unwrap()),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(dispatcher.fds_of(Ino(42)), vec![Fd(7)]);

        dispatcher.dispatch(
            RequestContext::root(),
            Operation::Release {
                ino: Ino(42),
                fi: FileInfo::with_fh(Fd(7), crate::types::OpenFlags::empty()),
            },
            DispatchOptions::default(),
            Box::new(move |r| tx.send(r.is_ok()).unwrap()),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(dispatcher.fds_of(Ino(42)).is_empty());
    }
}
