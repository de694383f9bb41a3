//! Per-file-descriptor write queues.
//!
//! Writes for one open file are queued in submission order, optionally
//! bumped across four priority tiers, and drained by an executor the
//! caller supplies. `flush` blocks until every previously enqueued write
//! for the descriptor has completed, which is what gives `release` and
//! `fsync` their barrier semantics.
//!
//! The registry is sharded so two descriptors rarely contend on the same
//! lock; no lock is held while an executor runs.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::types::Fd;

const SHARD_COUNT: usize = 16;

/// Priority tiers for queued writes, drained strictly in this order.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum WritePriority {
    /// Ahead of everything, survives graceful shutdown.
    Urgent,
    /// Ahead of normal traffic, survives graceful shutdown.
    High,
    /// The default tier.
    #[default]
    Normal,
    /// Background writes; first to be dropped on shutdown.
    Low,
}

impl WritePriority {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            WritePriority::Urgent => 0,
            WritePriority::High => 1,
            WritePriority::Normal => 2,
            WritePriority::Low => 3,
        }
    }

    /// Tiers at or above `High` are drained rather than dropped when the
    /// session shuts down.
    pub fn survives_shutdown(self) -> bool {
        matches!(self, WritePriority::Urgent | WritePriority::High)
    }
}

/// Completion callback, invoked exactly once per accepted write with the
/// executor's result.
pub type WriteCompletion = Box<dyn FnOnce(Result<usize, Errno>) + Send + 'static>;

/// Write-queue tuning.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteQueueConfig {
    /// Queued-operation bound applied to each descriptor without an
    /// explicit override; 0 means unbounded.
    pub default_max_queue_size: usize,
}

/// Counters kept per descriptor and, summed, for the whole registry.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WriteQueueStats {
    /// Writes accepted into the queue.
    pub total_ops: u64,
    /// Writes whose executor ran and completion fired successfully.
    pub completed_ops: u64,
    /// Writes that completed with an error (including cancellations).
    pub failed_ops: u64,
    /// Bytes reported written by the executor.
    pub bytes_written: u64,
    /// Operations currently queued.
    pub queue_size_current: usize,
    /// High-water mark of the queue.
    pub queue_size_max: usize,
    /// Mean queue-to-completion latency.
    pub avg_latency_ms: f64,
}

struct WriteOp {
    seq: u64,
    offset: u64,
    data: Vec<u8>,
    completion: WriteCompletion,
    enqueued: Instant,
}

#[derive(Default)]
struct FdStats {
    total_ops: u64,
    completed_ops: u64,
    failed_ops: u64,
    bytes_written: u64,
    queue_size_max: usize,
    latency_micros: u64,
}

struct FdQueue {
    tiers: [VecDeque<WriteOp>; WritePriority::COUNT],
    next_seq: u64,
    limit: usize,
    in_flight: bool,
    stats: FdStats,
}

impl FdQueue {
    fn new(limit: usize) -> FdQueue {
        FdQueue {
            tiers: Default::default(),
            next_seq: 0,
            limit,
            in_flight: false,
            stats: FdStats::default(),
        }
    }

    fn queued(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn is_idle(&self) -> bool {
        !self.in_flight && self.queued() == 0
    }

    fn pop_highest(&mut self) -> Option<(WritePriority, WriteOp)> {
        const TIERS: [WritePriority; 4] = [
            WritePriority::Urgent,
            WritePriority::High,
            WritePriority::Normal,
            WritePriority::Low,
        ];
        for priority in TIERS {
            if let Some(op) = self.tiers[priority.index()].pop_front() {
                return Some((priority, op));
            }
        }
        None
    }
}

struct Shard {
    map: Mutex<HashMap<Fd, FdQueue>>,
    drained: Condvar,
}

/// The per-FD write queue registry.
pub struct WriteQueues {
    shards: Vec<Shard>,
    config: WriteQueueConfig,
    overrides: Mutex<HashMap<Fd, usize>>,
    shutting_down: AtomicBool,
    total_enqueued: AtomicU64,
}

impl std::fmt::Debug for WriteQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueues")
            .field("config", &self.config)
            .field(
                "total_enqueued",
                &self.total_enqueued.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl WriteQueues {
    /// An empty registry.
    pub fn new(config: WriteQueueConfig) -> WriteQueues {
        WriteQueues {
            shards: (0..SHARD_COUNT)
                .map(|_| Shard {
                    map: Mutex::new(HashMap::new()),
                    drained: Condvar::new(),
                })
                .collect(),
            config,
            overrides: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            total_enqueued: AtomicU64::new(0),
        }
    }

    fn shard(&self, fd: Fd) -> &Shard {
        &self.shards[(fd.0 as usize) % SHARD_COUNT]
    }

    /// Overrides the queue bound for one descriptor. Takes effect on its
    /// next first-enqueue; an existing queue keeps its bound.
    pub fn set_fd_limit(&self, fd: Fd, limit: usize) {
        self.overrides.lock().insert(fd, limit);
    }

    /// Queues a write. Returns the per-FD sequence id, monotonically
    /// increasing in submission order. When the descriptor's queue is
    /// full, the completion fires with `EAGAIN` and the same error is
    /// returned.
    pub fn enqueue(
        &self,
        fd: Fd,
        offset: u64,
        data: Vec<u8>,
        priority: WritePriority,
        completion: WriteCompletion,
    ) -> Result<u64, Errno> {
        if self.shutting_down.load(Ordering::Acquire) && !priority.survives_shutdown() {
            completion(Err(Errno::ESHUTDOWN));
            return Err(Errno::ESHUTDOWN);
        }
        let shard = self.shard(fd);
        let mut map = shard.map.lock();
        let queue = map.entry(fd).or_insert_with(|| {
            let limit = self
                .overrides
                .lock()
                .get(&fd)
                .copied()
                .unwrap_or(self.config.default_max_queue_size);
            FdQueue::new(limit)
        });

        if queue.limit > 0 && queue.queued() >= queue.limit {
            drop(map);
            completion(Err(Errno::EAGAIN));
            return Err(Errno::EAGAIN);
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.stats.total_ops += 1;
        queue.tiers[priority.index()].push_back(WriteOp {
            seq,
            offset,
            data,
            completion,
            enqueued: Instant::now(),
        });
        let occupied = queue.queued();
        if occupied > queue.stats.queue_size_max {
            queue.stats.queue_size_max = occupied;
        }
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Drains one descriptor's queue through `executor`, which performs
    /// the actual write and returns bytes written or an errno. Runs on the
    /// caller's thread; the registry lock is dropped around each executor
    /// call. Returns the number of operations completed.
    pub fn process<F>(&self, fd: Fd, executor: &mut F) -> usize
    where
        F: FnMut(Fd, u64, &[u8]) -> Result<usize, Errno>,
    {
        let shard = self.shard(fd);
        let mut completed = 0;
        loop {
            let op = {
                let mut map = shard.map.lock();
                let Some(queue) = map.get_mut(&fd) else {
                    break;
                };
                match queue.pop_highest() {
                    Some((_, op)) => {
                        queue.in_flight = true;
                        op
                    }
                    None => break,
                }
            };

            let result = executor(fd, op.offset, &op.data);
            let latency = op.enqueued.elapsed();
            debug!("write fd {fd} seq {} -> {result:?}", op.seq);
            (op.completion)(result);
            completed += 1;

            let mut map = shard.map.lock();
            if let Some(queue) = map.get_mut(&fd) {
                queue.in_flight = false;
                queue.stats.latency_micros += latency.as_micros() as u64;
                match result {
                    Ok(n) => {
                        queue.stats.completed_ops += 1;
                        queue.stats.bytes_written += n as u64;
                    }
                    Err(_) => queue.stats.failed_ops += 1,
                }
                if queue.is_idle() {
                    shard.drained.notify_all();
                }
            }
        }
        completed
    }

    /// Drains every descriptor. Returns operations completed.
    pub fn process_all<F>(&self, executor: &mut F) -> usize
    where
        F: FnMut(Fd, u64, &[u8]) -> Result<usize, Errno>,
    {
        let fds: Vec<Fd> = self
            .shards
            .iter()
            .flat_map(|s| s.map.lock().keys().copied().collect::<Vec<_>>())
            .collect();
        fds.into_iter().map(|fd| self.process(fd, executor)).sum()
    }

    /// Blocks until every write previously enqueued for `fd` has
    /// completed, or the timeout passes (`ETIMEDOUT`). Draining is the
    /// job of whatever thread calls [`process`](Self::process); this only
    /// waits.
    pub fn flush(&self, fd: Fd, timeout: Option<Duration>) -> Result<(), Errno> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let shard = self.shard(fd);
        let mut map = shard.map.lock();
        loop {
            match map.get(&fd) {
                None => return Ok(()),
                Some(queue) if queue.is_idle() => return Ok(()),
                Some(_) => {}
            }
            match deadline {
                Some(deadline) => {
                    if shard.drained.wait_until(&mut map, deadline).timed_out() {
                        return match map.get(&fd) {
                            Some(queue) if !queue.is_idle() => Err(Errno::ETIMEDOUT),
                            _ => Ok(()),
                        };
                    }
                }
                None => shard.drained.wait(&mut map),
            }
        }
    }

    /// [`flush`](Self::flush) across every descriptor.
    pub fn flush_all(&self, timeout: Option<Duration>) -> Result<(), Errno> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let fds: Vec<Fd> = self
            .shards
            .iter()
            .flat_map(|s| s.map.lock().keys().copied().collect::<Vec<_>>())
            .collect();
        for fd in fds {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Errno::ETIMEDOUT);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.flush(fd, remaining)?;
        }
        Ok(())
    }

    /// Enters shutdown: `URGENT`/`HIGH` writes keep flowing and are
    /// drained through `executor`; queued `NORMAL`/`LOW` writes are
    /// cancelled with `ECANCELED`, as are new ones. Returns
    /// `(drained, cancelled)`.
    pub fn shutdown_drain<F>(&self, executor: &mut F) -> (usize, usize)
    where
        F: FnMut(Fd, u64, &[u8]) -> Result<usize, Errno>,
    {
        self.shutting_down.store(true, Ordering::Release);
        let mut cancelled = 0;
        for shard in &self.shards {
            let mut dropped = Vec::new();
            {
                let mut map = shard.map.lock();
                for queue in map.values_mut() {
                    let before = dropped.len();
                    for tier in [WritePriority::Normal, WritePriority::Low] {
                        dropped.extend(queue.tiers[tier.index()].drain(..));
                    }
                    queue.stats.failed_ops += (dropped.len() - before) as u64;
                }
            }
            cancelled += dropped.len();
            for op in dropped {
                (op.completion)(Err(Errno::ECANCELED));
            }
            {
                let _map = shard.map.lock();
                shard.drained.notify_all();
            }
        }
        let drained = self.process_all(executor);
        (drained, cancelled)
    }

    /// Cancels every queued write in every tier with `ECANCELED` and
    /// refuses new traffic. The forced-shutdown path.
    pub fn cancel_all(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let mut cancelled = 0;
        for shard in &self.shards {
            let mut dropped = Vec::new();
            {
                let mut map = shard.map.lock();
                for queue in map.values_mut() {
                    let before = dropped.len();
                    for tier in queue.tiers.iter_mut() {
                        dropped.extend(tier.drain(..));
                    }
                    queue.stats.failed_ops += (dropped.len() - before) as u64;
                }
            }
            cancelled += dropped.len();
            for op in dropped {
                (op.completion)(Err(Errno::ECANCELED));
            }
            {
                let _map = shard.map.lock();
                shard.drained.notify_all();
            }
        }
        cancelled
    }

    /// Counters for one descriptor, if it ever queued a write.
    pub fn stats(&self, fd: Fd) -> Option<WriteQueueStats> {
        let map = self.shard(fd).map.lock();
        map.get(&fd).map(snapshot)
    }

    /// Counters summed across all descriptors.
    pub fn aggregate_stats(&self) -> WriteQueueStats {
        let mut total = WriteQueueStats::default();
        let mut latency_micros = 0u64;
        for shard in &self.shards {
            for queue in shard.map.lock().values() {
                total.total_ops += queue.stats.total_ops;
                total.completed_ops += queue.stats.completed_ops;
                total.failed_ops += queue.stats.failed_ops;
                total.bytes_written += queue.stats.bytes_written;
                total.queue_size_current += queue.queued();
                total.queue_size_max += queue.stats.queue_size_max;
                latency_micros += queue.stats.latency_micros;
            }
        }
        if total.completed_ops + total.failed_ops > 0 {
            total.avg_latency_ms =
                latency_micros as f64 / (total.completed_ops + total.failed_ops) as f64 / 1000.0;
        }
        total
    }

    /// Drops the (empty) queue state for a released descriptor.
    pub fn forget_fd(&self, fd: Fd) {
        let shard = self.shard(fd);
        let mut map = shard.map.lock();
        if map.get(&fd).is_some_and(FdQueue::is_idle) {
            map.remove(&fd);
        }
        self.overrides.lock().remove(&fd);
    }
}

fn snapshot(queue: &FdQueue) -> WriteQueueStats {
    let finished = queue.stats.completed_ops + queue.stats.failed_ops;
    WriteQueueStats {
        total_ops: queue.stats.total_ops,
        completed_ops: queue.stats.completed_ops,
        failed_ops: queue.stats.failed_ops,
        bytes_written: queue.stats.bytes_written,
        queue_size_current: queue.queued(),
        queue_size_max: queue.stats.queue_size_max,
        avg_latency_ms: if finished == 0 {
            0.0
        } else {
            queue.stats.latency_micros as f64 / finished as f64 / 1000.0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    fn noop_completion() -> WriteCompletion {
        Box::new(|_| {})
    }

    #[test]
    fn urgent_overtakes_normal_but_fifo_within_tier() {
        let queues = WriteQueues::new(WriteQueueConfig::default());
        let fd = Fd(9);
        let (tx, rx) = mpsc::channel();
        for (offset, priority) in [
            (0u64, WritePriority::Normal),
            (4096, WritePriority::Urgent),
            (8192, WritePriority::Normal),
        ] {
            let tx = tx.clone();
            queues
                .enqueue(
                    fd,
                    offset,
                    vec![0; 16],
                    priority,
                    Box::new(move |r| tx.send((offset, r)).unwrap()),
                )
                .unwrap();
        }
        let mut executor_order = Vec::new();
        queues.process(fd, &mut |_, offset, data| {
            executor_order.push(offset);
            Ok(data.len())
        });
        assert_eq!(executor_order, vec![4096, 0, 8192]);
        let completions: Vec<u64> = (0..3).map(|_| rx.recv().unwrap().0).collect();
        assert_eq!(completions, vec![4096, 0, 8192]);
    }

    #[test]
    fn sequence_ids_are_monotonic_per_fd() {
        let queues = WriteQueues::new(WriteQueueConfig::default());
        let a = queues
            .enqueue(Fd(1), 0, vec![1], WritePriority::Normal, noop_completion())
            .unwrap();
        let b = queues
            .enqueue(Fd(1), 0, vec![2], WritePriority::Urgent, noop_completion())
            .unwrap();
        let other = queues
            .enqueue(Fd(2), 0, vec![3], WritePriority::Normal, noop_completion())
            .unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(other, 0);
    }

    #[test]
    fn bounded_fd_queue_rejects_with_eagain() {
        let queues = WriteQueues::new(WriteQueueConfig {
            default_max_queue_size: 2,
        });
        let fd = Fd(3);
        for _ in 0..2 {
            queues
                .enqueue(fd, 0, vec![0], WritePriority::Normal, noop_completion())
                .unwrap();
        }
        let (tx, rx) = mpsc::channel();
        let err = queues.enqueue(
            fd,
            0,
            vec![0],
            WritePriority::Normal,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert_eq!(err, Err(Errno::EAGAIN));
        assert_eq!(rx.recv().unwrap(), Err(Errno::EAGAIN));
    }

    #[test]
    fn per_fd_override_beats_default() {
        let queues = WriteQueues::new(WriteQueueConfig {
            default_max_queue_size: 1,
        });
        queues.set_fd_limit(Fd(5), 3);
        for _ in 0..3 {
            queues
                .enqueue(Fd(5), 0, vec![0], WritePriority::Normal, noop_completion())
                .unwrap();
        }
        assert_eq!(
            queues
                .enqueue(Fd(5), 0, vec![0], WritePriority::Normal, noop_completion())
                .unwrap_err(),
            Errno::EAGAIN
        );
    }

    #[test]
    fn flush_waits_for_completions() {
        let queues = Arc::new(WriteQueues::new(WriteQueueConfig::default()));
        let fd = Fd(7);
        let completed = Arc::new(AtomicU64::new(0));
        for i in 0..10u64 {
            let completed = Arc::clone(&completed);
            queues
                .enqueue(
                    fd,
                    i * 4096,
                    vec![0; 64],
                    WritePriority::Normal,
                    Box::new(move |_| {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }

        let drainer = {
            let queues = Arc::clone(&queues);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queues.process(fd, &mut |_, _, data| Ok(data.len()));
            })
        };
        queues.flush(fd, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 10);
        drainer.join().unwrap();
    }

    #[test]
    fn flush_times_out_without_a_drainer() {
        let queues = WriteQueues::new(WriteQueueConfig::default());
        queues
            .enqueue(Fd(8), 0, vec![0], WritePriority::Normal, noop_completion())
            .unwrap();
        assert_eq!(
            queues.flush(Fd(8), Some(Duration::from_millis(40))),
            Err(Errno::ETIMEDOUT)
        );
    }

    #[test]
    fn shutdown_drains_urgent_and_cancels_normal() {
        let queues = WriteQueues::new(WriteQueueConfig::default());
        let fd = Fd(11);
        let (tx, rx) = mpsc::channel();
        for (i, priority) in [
            WritePriority::Urgent,
            WritePriority::High,
            WritePriority::Normal,
            WritePriority::Low,
        ]
        .into_iter()
        .enumerate()
        {
            let tx = tx.clone();
            queues
                .enqueue(
                    fd,
                    i as u64,
                    vec![0; 8],
                    priority,
                    Box::new(move |r| tx.send((priority, r.map(|_| ()))).unwrap()),
                )
                .unwrap();
        }
        let (drained, cancelled) = queues.shutdown_drain(&mut |_, _, data| Ok(data.len()));
        assert_eq!((drained, cancelled), (2, 2));
        let results: Vec<_> = (0..4).map(|_| rx.recv().unwrap()).collect();
        for (priority, result) in results {
            if priority.survives_shutdown() {
                assert_eq!(result, Ok(()));
            } else {
                assert_eq!(result, Err(Errno::ECANCELED));
            }
        }
        // New low-priority traffic is refused during shutdown.
        assert_eq!(
            queues
                .enqueue(fd, 0, vec![0], WritePriority::Normal, noop_completion())
                .unwrap_err(),
            Errno::ESHUTDOWN
        );
    }

    #[test]
    fn stats_track_bytes_and_counts() {
        let queues = WriteQueues::new(WriteQueueConfig::default());
        let fd = Fd(12);
        for i in 0..4u64 {
            queues
                .enqueue(fd, i * 10, vec![0; 10], WritePriority::Normal, noop_completion())
                .unwrap();
        }
        queues.process(fd, &mut |_, offset, data| {
            if offset == 30 {
                Err(Errno::ENOSPC)
            } else {
                Ok(data.len())
            }
        });
        let stats = queues.stats(fd).unwrap();
        assert_eq!(stats.total_ops, 4);
        assert_eq!(stats.completed_ops, 3);
        assert_eq!(stats.failed_ops, 1);
        assert_eq!(stats.bytes_written, 30);
        assert_eq!(stats.queue_size_current, 0);
        assert_eq!(stats.queue_size_max, 4);

        let aggregate = queues.aggregate_stats();
        assert_eq!(aggregate.total_ops, 4);
    }
}
