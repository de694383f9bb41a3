//! Ordered shutdown.
//!
//! A session winds down through `RUNNING → DRAINING → UNMOUNTING → CLOSED`,
//! with `FAILED` as the sink for phases that hang or error. The manager
//! owns the transitions, the timeouts and the observer callbacks; the
//! session supplies the actual work through [`ShutdownPhases`].
//!
//! Transitions are one-way. A drain that times out is not a failure, the
//! machine moves on and unmounts anyway; an unmount that times out is.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::info;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::errno::Errno;

/// The shutdown phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownState {
    /// Serving requests.
    Running,
    /// Rejecting new requests, finishing queued ones.
    Draining,
    /// Detaching the kernel channel.
    Unmounting,
    /// Fully wound down.
    Closed,
    /// A phase hung or errored; the reason is in the stats.
    Failed,
}

/// Phase timeouts.
#[derive(Clone, Copy, Debug)]
pub struct ShutdownConfig {
    /// Budget for draining queues before unmounting proceeds regardless.
    pub draining_timeout: Duration,
    /// Budget for the unmount itself; exceeding it is fatal.
    pub unmounting_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> ShutdownConfig {
        ShutdownConfig {
            draining_timeout: Duration::from_secs(10),
            unmounting_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened, per phase, once the machine stops.
#[derive(Clone, Debug, Default)]
pub struct ShutdownStats {
    /// The reason handed to the initiating call.
    pub reason: String,
    /// True when every queue drained inside its budget and nothing was
    /// cancelled.
    pub graceful_completion: bool,
    /// Time spent draining.
    pub draining: Duration,
    /// Time spent unmounting.
    pub unmounting: Duration,
    /// Total wall time of the shutdown.
    pub total: Duration,
    /// Requests and writes cancelled (forced shutdown or drain timeout).
    pub cancelled_ops: usize,
}

/// Observer callbacks. At most one set is active per session; installing
/// a new set replaces the old one.
#[derive(Default)]
pub struct ShutdownCallbacks {
    /// Fired once when shutdown begins, with the reason.
    pub on_begin: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Fired at each phase transition.
    pub on_phase: Option<Box<dyn Fn(ShutdownState, &str) + Send + Sync>>,
    /// Fired on reaching `CLOSED`.
    pub on_complete: Option<Box<dyn Fn(&ShutdownStats) + Send + Sync>>,
    /// Fired on reaching `FAILED`.
    pub on_failed: Option<Box<dyn Fn(ShutdownState, &str) + Send + Sync>>,
}

impl std::fmt::Debug for ShutdownCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCallbacks")
            .field("on_begin", &self.on_begin.is_some())
            .field("on_phase", &self.on_phase.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .finish()
    }
}

/// The work a session plugs into the machine.
pub trait ShutdownPhases: Send + Sync + 'static {
    /// Stop accepting new requests; arrivals get `ESHUTDOWN`.
    fn stop_intake(&self);

    /// Drain dispatcher and write queues until `deadline`. Returns true
    /// when everything completed in time.
    fn drain(&self, deadline: Instant) -> bool;

    /// Cancel everything queued and in flight with `ECANCELED`,
    /// returning how many operations that hit.
    fn cancel_all(&self) -> usize;

    /// Detach the kernel channel and stop the session loop.
    fn unmount(&self) -> io::Result<()>;

    /// Release remaining resources. Must not block.
    fn teardown(&self);
}

/// Coordinates one session's shutdown.
pub struct ShutdownManager {
    config: ShutdownConfig,
    state: Mutex<ShutdownState>,
    changed: Condvar,
    callbacks: Mutex<ShutdownCallbacks>,
    stats: Mutex<Option<ShutdownStats>>,
    // Claimed by whichever initiator runs the unmount/teardown tail, so a
    // forced shutdown racing a graceful one cannot unmount twice.
    finishing: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for ShutdownManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownManager")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl ShutdownManager {
    /// A manager in `RUNNING`.
    pub fn new(config: ShutdownConfig) -> ShutdownManager {
        ShutdownManager {
            config,
            state: Mutex::new(ShutdownState::Running),
            changed: Condvar::new(),
            callbacks: Mutex::new(ShutdownCallbacks::default()),
            stats: Mutex::new(None),
            finishing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// The current phase.
    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    /// True once shutdown has started, whatever the outcome.
    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Installs the observer callbacks, replacing any previous set.
    pub fn set_callbacks(&self, callbacks: ShutdownCallbacks) {
        *self.callbacks.lock() = callbacks;
    }

    /// Stats from a finished shutdown, if one ran.
    pub fn stats(&self) -> Option<ShutdownStats> {
        self.stats.lock().clone()
    }

    /// Blocks until the machine reaches `CLOSED` or `FAILED`, or the
    /// timeout passes. Returns the state it observed last.
    pub fn wait_done(&self, timeout: Option<Duration>) -> ShutdownState {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if matches!(*state, ShutdownState::Closed | ShutdownState::Failed) {
                return *state;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return *state;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }

    fn advance(&self, from: &[ShutdownState], to: ShutdownState) -> bool {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            return false;
        }
        *state = to;
        self.changed.notify_all();
        true
    }

    fn phase_note(&self, state: ShutdownState, description: &str) {
        info!("shutdown phase {state:?}: {description}");
        let callbacks = self.callbacks.lock();
        if let Some(on_phase) = &callbacks.on_phase {
            on_phase(state, description);
        }
    }

    fn fail(&self, at: ShutdownState, reason: &str, stats: ShutdownStats) {
        warn!("shutdown failed during {at:?}: {reason}");
        self.advance(
            &[
                ShutdownState::Running,
                ShutdownState::Draining,
                ShutdownState::Unmounting,
            ],
            ShutdownState::Failed,
        );
        *self.stats.lock() = Some(stats);
        let callbacks = self.callbacks.lock();
        if let Some(on_failed) = &callbacks.on_failed {
            on_failed(at, reason);
        }
    }

    /// Runs a graceful shutdown: drain, unmount, teardown. `timeout`
    /// bounds the whole procedure; `None` gives each phase its configured
    /// budget. Idempotent: a second caller waits for the first to finish.
    pub fn initiate_graceful(
        &self,
        reason: &str,
        timeout: Option<Duration>,
        phases: &Arc<dyn ShutdownPhases>,
    ) -> Result<ShutdownStats, Errno> {
        if !self.advance(&[ShutdownState::Running], ShutdownState::Draining) {
            return self.join_existing();
        }
        let begun = Instant::now();
        let total_budget =
            timeout.unwrap_or(self.config.draining_timeout + self.config.unmounting_timeout);
        let hard_deadline = begun + total_budget;

        info!("initiating graceful shutdown: {reason}");
        {
            let callbacks = self.callbacks.lock();
            if let Some(on_begin) = &callbacks.on_begin {
                on_begin(reason);
            }
        }
        self.phase_note(ShutdownState::Draining, "draining request queues");

        phases.stop_intake();
        let drain_deadline =
            (begun + self.config.draining_timeout.min(total_budget)).min(hard_deadline);
        let drained = phases.drain(drain_deadline);
        let draining = begun.elapsed();
        let mut cancelled_ops = 0;
        if !drained {
            // Whatever the drain left behind is cancelled so the unmount
            // does not wait on it.
            cancelled_ops = phases.cancel_all();
            warn!("drain timed out; cancelled {cancelled_ops} operations");
        }

        self.finish(
            reason,
            begun,
            draining,
            drained && cancelled_ops == 0,
            cancelled_ops,
            hard_deadline,
            phases,
        )
    }

    /// Skips draining: cancels everything with `ECANCELED` and unmounts.
    pub fn force_immediate(
        &self,
        reason: &str,
        phases: &Arc<dyn ShutdownPhases>,
    ) -> Result<ShutdownStats, Errno> {
        if !self.advance(
            &[ShutdownState::Running, ShutdownState::Draining],
            ShutdownState::Unmounting,
        ) {
            return self.join_existing();
        }
        let begun = Instant::now();
        info!("forcing immediate shutdown: {reason}");
        {
            let callbacks = self.callbacks.lock();
            if let Some(on_begin) = &callbacks.on_begin {
                on_begin(reason);
            }
        }
        phases.stop_intake();
        let cancelled_ops = phases.cancel_all();
        self.finish(
            reason,
            begun,
            Duration::ZERO,
            false,
            cancelled_ops,
            begun + self.config.unmounting_timeout,
            phases,
        )
    }

    fn finish(
        &self,
        reason: &str,
        begun: Instant,
        draining: Duration,
        graceful: bool,
        cancelled_ops: usize,
        hard_deadline: Instant,
        phases: &Arc<dyn ShutdownPhases>,
    ) -> Result<ShutdownStats, Errno> {
        use std::sync::atomic::Ordering;
        if self.finishing.swap(true, Ordering::AcqRel) {
            return self.join_existing();
        }
        self.advance(
            &[ShutdownState::Draining, ShutdownState::Unmounting],
            ShutdownState::Unmounting,
        );
        self.phase_note(ShutdownState::Unmounting, "detaching kernel channel");

        let unmount_started = Instant::now();
        let budget = hard_deadline
            .saturating_duration_since(unmount_started)
            .min(self.config.unmounting_timeout)
            .max(Duration::from_millis(1));
        let stats_base = |unmounting: Duration| ShutdownStats {
            reason: reason.to_string(),
            graceful_completion: graceful,
            draining,
            unmounting,
            total: begun.elapsed(),
            cancelled_ops,
        };

        match run_unmount_with_timeout(Arc::clone(phases), budget) {
            UnmountOutcome::Done(Ok(())) => {}
            UnmountOutcome::Done(Err(err)) => {
                let stats = stats_base(unmount_started.elapsed());
                self.fail(
                    ShutdownState::Unmounting,
                    &format!("unmount failed: {err}"),
                    stats,
                );
                return Err(Errno::from(err));
            }
            UnmountOutcome::TimedOut => {
                let stats = stats_base(unmount_started.elapsed());
                self.fail(ShutdownState::Unmounting, "unmount timed out", stats);
                return Err(Errno::ETIMEDOUT);
            }
        }
        let unmounting = unmount_started.elapsed();

        phases.teardown();
        self.advance(&[ShutdownState::Unmounting], ShutdownState::Closed);
        self.phase_note(ShutdownState::Closed, "session resources released");

        let stats = stats_base(unmounting);
        *self.stats.lock() = Some(stats.clone());
        {
            let callbacks = self.callbacks.lock();
            if let Some(on_complete) = &callbacks.on_complete {
                on_complete(&stats);
            }
        }
        info!(
            "shutdown complete in {:?} (graceful: {})",
            stats.total, stats.graceful_completion
        );
        Ok(stats)
    }

    /// A second initiator waits out the first and reports its outcome.
    fn join_existing(&self) -> Result<ShutdownStats, Errno> {
        match self.wait_done(None) {
            ShutdownState::Closed => Ok(self.stats().unwrap_or_default()),
            _ => Err(Errno::ESHUTDOWN),
        }
    }
}

enum UnmountOutcome {
    Done(io::Result<()>),
    TimedOut,
}

/// Unmount can wedge on a kernel that never answers; run it on a helper
/// thread so the machine can give up and report `FAILED`. A timed-out
/// helper is left detached, the process is exiting anyway.
fn run_unmount_with_timeout(phases: Arc<dyn ShutdownPhases>, budget: Duration) -> UnmountOutcome {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("fusebind-unmount".into())
        .spawn(move || {
            let _ = tx.send(phases.unmount());
        })
        .expect("failed to spawn unmount helper");
    match rx.recv_timeout(budget) {
        Ok(result) => UnmountOutcome::Done(result),
        Err(_) => UnmountOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct MockPhases {
        intake_stopped: AtomicUsize,
        drains: AtomicUsize,
        cancels: AtomicUsize,
        unmounts: AtomicUsize,
        teardowns: AtomicUsize,
        drain_succeeds: bool,
        pending_to_cancel: usize,
        unmount_hangs: bool,
    }

    impl ShutdownPhases for MockPhases {
        fn stop_intake(&self) {
            self.intake_stopped.fetch_add(1, Ordering::SeqCst);
        }
        fn drain(&self, _deadline: Instant) -> bool {
            self.drains.fetch_add(1, Ordering::SeqCst);
            self.drain_succeeds
        }
        fn cancel_all(&self) -> usize {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.pending_to_cancel
        }
        fn unmount(&self) -> io::Result<()> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            if self.unmount_hangs {
                thread::sleep(Duration::from_secs(60));
            }
            Ok(())
        }
        fn teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick_config() -> ShutdownConfig {
        ShutdownConfig {
            draining_timeout: Duration::from_millis(200),
            unmounting_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn graceful_path_reaches_closed() {
        let manager = ShutdownManager::new(quick_config());
        let phases: Arc<dyn ShutdownPhases> = Arc::new(MockPhases {
            drain_succeeds: true,
            ..MockPhases::default()
        });
        let stats = manager
            .initiate_graceful("test", Some(Duration::from_secs(5)), &phases)
            .unwrap();
        assert_eq!(manager.state(), ShutdownState::Closed);
        assert!(stats.graceful_completion);
        assert_eq!(stats.cancelled_ops, 0);
        assert_eq!(stats.reason, "test");
        assert!(stats.total >= stats.unmounting);
    }

    #[test]
    fn callbacks_fire_in_order() {
        let manager = ShutdownManager::new(quick_config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (begin, phase, complete) = (order.clone(), order.clone(), order.clone());
        manager.set_callbacks(ShutdownCallbacks {
            on_begin: Some(Box::new(move |_| begin.lock().push("begin"))),
            on_phase: Some(Box::new(move |state, _| {
                phase.lock().push(match state {
                    ShutdownState::Draining => "draining",
                    ShutdownState::Unmounting => "unmounting",
                    ShutdownState::Closed => "closed",
                    _ => "other",
                })
            })),
            on_complete: Some(Box::new(move |_| complete.lock().push("complete"))),
            on_failed: None,
        });
        let phases: Arc<dyn ShutdownPhases> = Arc::new(MockPhases {
            drain_succeeds: true,
            ..MockPhases::default()
        });
        manager.initiate_graceful("order", None, &phases).unwrap();
        assert_eq!(
            *order.lock(),
            vec!["begin", "draining", "unmounting", "closed", "complete"]
        );
    }

    #[test]
    fn drain_timeout_cancels_and_proceeds() {
        let manager = ShutdownManager::new(quick_config());
        let mock = Arc::new(MockPhases {
            drain_succeeds: false,
            pending_to_cancel: 7,
            ..MockPhases::default()
        });
        let phases: Arc<dyn ShutdownPhases> = mock.clone();
        let stats = manager.initiate_graceful("stuck", None, &phases).unwrap();
        assert_eq!(manager.state(), ShutdownState::Closed);
        assert!(!stats.graceful_completion);
        assert_eq!(stats.cancelled_ops, 7);
        assert_eq!(mock.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(mock.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hung_unmount_fails_the_machine() {
        let manager = ShutdownManager::new(quick_config());
        let failed_at = Arc::new(Mutex::new(None));
        let record = failed_at.clone();
        manager.set_callbacks(ShutdownCallbacks {
            on_failed: Some(Box::new(move |state, reason| {
                *record.lock() = Some((state, reason.to_string()));
            })),
            ..ShutdownCallbacks::default()
        });
        let phases: Arc<dyn ShutdownPhases> = Arc::new(MockPhases {
            drain_succeeds: true,
            unmount_hangs: true,
            ..MockPhases::default()
        });
        let err = manager
            .initiate_graceful("hang", None, &phases)
            .unwrap_err();
        assert_eq!(err, Errno::ETIMEDOUT);
        assert_eq!(manager.state(), ShutdownState::Failed);
        let (state, reason) = failed_at.lock().clone().unwrap();
        assert_eq!(state, ShutdownState::Unmounting);
        assert!(reason.contains("timed out"));
    }

    #[test]
    fn forced_shutdown_cancels_everything() {
        let manager = ShutdownManager::new(quick_config());
        let mock = Arc::new(MockPhases {
            pending_to_cancel: 12,
            ..MockPhases::default()
        });
        let phases: Arc<dyn ShutdownPhases> = mock.clone();
        let stats = manager.force_immediate("panic button", &phases).unwrap();
        assert_eq!(manager.state(), ShutdownState::Closed);
        assert!(!stats.graceful_completion);
        assert_eq!(stats.cancelled_ops, 12);
        // Draining was skipped.
        assert_eq!(mock.drains.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn second_initiator_joins_the_first() {
        let manager = Arc::new(ShutdownManager::new(quick_config()));
        let phases: Arc<dyn ShutdownPhases> = Arc::new(MockPhases {
            drain_succeeds: true,
            ..MockPhases::default()
        });
        let racer = {
            let manager = manager.clone();
            let phases = phases.clone();
            thread::spawn(move || manager.initiate_graceful("first", None, &phases))
        };
        let second = manager.initiate_graceful("second", None, &phases);
        let first = racer.join().unwrap();
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(manager.state(), ShutdownState::Closed);
    }

    #[test]
    fn transitions_are_one_way() {
        let manager = ShutdownManager::new(quick_config());
        assert!(!manager.is_shutting_down());
        let phases: Arc<dyn ShutdownPhases> = Arc::new(MockPhases {
            drain_succeeds: true,
            ..MockPhases::default()
        });
        manager.initiate_graceful("done", None, &phases).unwrap();
        // A forced shutdown after close is a no-op join, not a restart.
        let again = manager.force_immediate("late", &phases);
        assert!(again.is_ok());
        assert_eq!(manager.state(), ShutdownState::Closed);
    }
}
