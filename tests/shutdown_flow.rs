//! Shutdown under load: pending writes drain, the machine walks its
//! phases, and late arrivals are refused.

mod support;

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

use fusebind::DispatchOptions;
use fusebind::Dispatcher;
use fusebind::DispatcherConfig;
use fusebind::Errno;
use fusebind::Fd;
use fusebind::Operation;
use fusebind::RequestContext;
use fusebind::ROOT_INO;
use fusebind::WritePriority;
use fusebind::WriteQueueConfig;
use fusebind::WriteQueues;
use fusebind::shutdown::ShutdownConfig;
use fusebind::shutdown::ShutdownManager;
use fusebind::shutdown::ShutdownPhases;
use fusebind::shutdown::ShutdownState;

use support::MemFs;

/// Phases that drain a write-queue registry and a dispatcher the way a
/// session does, with a recording sink in place of a kernel channel.
struct EnginePhases {
    dispatcher: Arc<Dispatcher>,
    queues: Arc<WriteQueues>,
    sink: Arc<Mutex<Vec<(Fd, u64, usize)>>>,
    unmounted: AtomicUsize,
}

impl ShutdownPhases for EnginePhases {
    fn stop_intake(&self) {
        self.dispatcher.stop_accepting();
    }

    fn drain(&self, deadline: Instant) -> bool {
        let sink = Arc::clone(&self.sink);
        self.queues.process_all(&mut |fd, offset, data| {
            sink.lock().push((fd, offset, data.len()));
            Ok(data.len())
        });
        let idle = self
            .dispatcher
            .wait_idle(Some(deadline.saturating_duration_since(Instant::now())));
        let flushed = self
            .queues
            .flush_all(Some(deadline.saturating_duration_since(Instant::now())))
            .is_ok();
        idle && flushed
    }

    fn cancel_all(&self) -> usize {
        self.dispatcher.cancel_all() + self.queues.cancel_all()
    }

    fn unmount(&self) -> io::Result<()> {
        self.unmounted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&self) {
        self.dispatcher.close();
    }
}

#[test]
fn fifty_pending_writes_complete_before_close() {
    support::init_logging();
    let fs = Arc::new(MemFs::new());
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), fs));
    let queues = Arc::new(WriteQueues::new(WriteQueueConfig::default()));
    let manager = ShutdownManager::new(ShutdownConfig {
        draining_timeout: Duration::from_secs(5),
        unmounting_timeout: Duration::from_secs(5),
    });

    let completions = Arc::new(AtomicUsize::new(0));
    for i in 0..50u64 {
        let completions = Arc::clone(&completions);
        queues
            .enqueue(
                Fd(9),
                i * 4096,
                vec![0xAB; 512],
                WritePriority::Normal,
                Box::new(move |result| {
                    assert_eq!(result, Ok(512));
                    completions.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }

    let phases: Arc<dyn ShutdownPhases> = Arc::new(EnginePhases {
        dispatcher: Arc::clone(&dispatcher),
        queues: Arc::clone(&queues),
        sink: Arc::new(Mutex::new(Vec::new())),
        unmounted: AtomicUsize::new(0),
    });

    let stats = manager
        .initiate_graceful("test", Some(Duration::from_millis(5000)), &phases)
        .unwrap();

    assert_eq!(manager.state(), ShutdownState::Closed);
    assert_eq!(completions.load(Ordering::SeqCst), 50);
    assert!(stats.graceful_completion);
    assert_eq!(stats.cancelled_ops, 0);

    let queue_stats = queues.stats(Fd(9)).unwrap();
    assert_eq!(queue_stats.completed_ops, 50);
    assert_eq!(queue_stats.bytes_written, 50 * 512);
}

#[test]
fn dispatch_during_draining_yields_eshutdown() {
    let fs = Arc::new(MemFs::new());
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), fs));

    // The shutdown machine's first act is stopping intake; model that
    // point in time directly.
    dispatcher.stop_accepting();

    let (tx, rx) = mpsc::channel();
    dispatcher.dispatch(
        RequestContext::root(),
        Operation::Getattr {
            ino: ROOT_INO,
            fi: None,
        },
        DispatchOptions::default(),
        Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Err(Errno::ESHUTDOWN)
    );
}

#[test]
fn forced_shutdown_during_drain_cancels_the_rest() {
    let fs = Arc::new(MemFs::new());
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), fs));
    let queues = Arc::new(WriteQueues::new(WriteQueueConfig::default()));
    let manager = ShutdownManager::new(ShutdownConfig::default());

    let (tx, rx) = mpsc::channel();
    for i in 0..10u64 {
        let tx = tx.clone();
        queues
            .enqueue(
                Fd(3),
                i * 64,
                vec![0; 64],
                WritePriority::Normal,
                Box::new(move |result| tx.send(result.map(|_| ())).unwrap()),
            )
            .unwrap();
    }

    let phases: Arc<dyn ShutdownPhases> = Arc::new(EnginePhases {
        dispatcher: Arc::clone(&dispatcher),
        queues: Arc::clone(&queues),
        sink: Arc::new(Mutex::new(Vec::new())),
        unmounted: AtomicUsize::new(0),
    });

    let stats = manager.force_immediate("panic", &phases).unwrap();
    assert_eq!(manager.state(), ShutdownState::Closed);
    assert!(!stats.graceful_completion);
    assert_eq!(stats.cancelled_ops, 10);
    for _ in 0..10 {
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Errno::ECANCELED)
        );
    }
}

#[test]
fn write_barrier_orders_flush_after_queued_writes() {
    let fs = Arc::new(MemFs::new());
    let ino = fs.add_file(ROOT_INO, "log.bin", b"");
    let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), fs));
    let queues = Arc::new(WriteQueues::new(WriteQueueConfig::default()));

    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

    {
        let queues = Arc::clone(&queues);
        dispatcher.set_barrier_hook(Box::new(move |scope| {
            if let fusebind::dispatch::BarrierScope::Fd(fd) = scope {
                queues.flush(fd, Some(Duration::from_secs(5))).unwrap();
            }
        }));
    }

    let fd = Fd(7);
    for _ in 0..3 {
        let order = Arc::clone(&order);
        queues
            .enqueue(
                fd,
                0,
                vec![1; 16],
                WritePriority::Normal,
                Box::new(move |_| order.lock().push("write")),
            )
            .unwrap();
    }

    // A drainer that wakes up after the flush is already waiting.
    let drainer = {
        let queues = Arc::clone(&queues);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            queues.process(fd, &mut |_, _, data| Ok(data.len()));
        })
    };

    let (tx, rx) = mpsc::channel();
    let flush_order = Arc::clone(&order);
    dispatcher.dispatch(
        RequestContext::root(),
        Operation::Flush {
            ino,
            fi: fusebind::FileInfo::with_fh(fd, fusebind::OpenFlags::empty()),
        },
        DispatchOptions::default(),
        Box::new(move |result| {
            flush_order.lock().push("flush");
            tx.send(result.map(|_| ())).unwrap();
        }),
    );

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
    drainer.join().unwrap();
    assert_eq!(*order.lock(), vec!["write", "write", "write", "flush"]);
}
