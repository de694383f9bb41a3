//! Process-wide SIGINT/SIGTERM hooks for auto-unmount.
//!
//! Several sessions may be mounted in one process; the kernel delivers a
//! signal once. A single handler is installed on first use and fans the
//! event out to every registered session through a self-pipe, which is the
//! only async-signal-safe way to get from handler context back onto a
//! normal thread. After every action has run, the original disposition is
//! restored and the signal re-raised so the process still dies the way
//! the operator expects.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::sync::OnceLock;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

use log::error;
use log::info;
use log::warn;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::signal::sigaction;
use nix::unistd::pipe;
use parking_lot::Mutex;

/// Write end of the self-pipe, stored raw so the handler can reach it
/// without taking locks or allocating.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

static HUB: OnceLock<SignalHub> = OnceLock::new();

type Action = Box<dyn Fn(Signal) + Send + Sync + 'static>;

struct SignalHub {
    actions: Mutex<HashMap<u64, Action>>,
    next_id: AtomicU64,
    // Keeps the read end alive for the monitor thread.
    _pipe_write: OwnedFd,
}

extern "C" fn deliver(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // Only async-signal-safe calls from here.
        unsafe {
            libc::write(fd, std::ptr::from_ref(&byte).cast(), 1);
        }
    }
}

fn install_hub() -> &'static SignalHub {
    HUB.get_or_init(|| {
        let (read_fd, write_fd) = pipe().expect("self-pipe creation failed");
        PIPE_WRITE_FD.store(write_fd.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(deliver),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // Replacing a handler some other library installed would be
            // surprising; only claim default dispositions.
            unsafe {
                match sigaction(signal, &action) {
                    Ok(previous) => {
                        if !matches!(previous.handler(), SigHandler::SigDfl) {
                            warn!("{signal} already had a handler; restoring it");
                            let _ = sigaction(signal, &previous);
                        }
                    }
                    Err(err) => error!("failed to install {signal} handler: {err}"),
                }
            }
        }

        thread::Builder::new()
            .name("fusebind-signals".into())
            .spawn(move || monitor_loop(read_fd))
            .expect("failed to spawn signal monitor");

        SignalHub {
            actions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            _pipe_write: write_fd,
        }
    })
}

fn monitor_loop(read_fd: OwnedFd) {
    let mut byte = [0u8; 1];
    loop {
        match nix::unistd::read(&read_fd, &mut byte) {
            Ok(0) => return,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                error!("signal pipe read failed: {err}");
                return;
            }
        }
        let Ok(signal) = Signal::try_from(byte[0] as i32) else {
            continue;
        };
        info!("caught {signal}, running session shutdown hooks");
        let actions: Vec<u64> = {
            let hub = HUB.get().expect("monitor running before hub");
            hub.actions.lock().keys().copied().collect()
        };
        for id in actions {
            let hub = HUB.get().expect("monitor running before hub");
            let action = hub.actions.lock().remove(&id);
            if let Some(action) = action {
                action(signal);
            }
        }

        // Every session has been told to unmount; hand the signal back to
        // its default disposition so the process terminates normally.
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(signal, &default);
        }
        let _ = nix::sys::signal::raise(signal);
    }
}

/// A registered shutdown hook; dropping it deregisters the action.
#[derive(Debug)]
pub(crate) struct SignalSubscription {
    id: u64,
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(hub) = HUB.get() {
            hub.actions.lock().remove(&self.id);
        }
    }
}

/// Registers `action` to run (once) when SIGINT or SIGTERM arrives. The
/// handler installation happens on first call and is shared by every
/// subscription in the process.
pub(crate) fn subscribe(action: Action) -> SignalSubscription {
    let hub = install_hub();
    let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
    hub.actions.lock().insert(id, action);
    SignalSubscription { id }
}
