//! FUSE3 low-level binding with a prioritized request dispatcher.
//!
//! A [`Session`] attaches a mountpoint to a handler table implementing
//! [`FuseOps`]. Kernel requests arrive through libfuse3's low-level
//! callbacks, are validated and queued by the [`Dispatcher`], run on a
//! worker pool, and reply to the kernel exactly once with POSIX errnos.
//! Around that core sit per-descriptor [`WriteQueues`] with priority
//! tiers and flush barriers, an ordered shutdown state machine, and a
//! `copy_file_range` engine with a chunked fallback.
//!
//! The kernel wire protocol is libfuse's job; this crate's job is
//! everything between the kernel channel and the handlers.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod adapter;
/// Borrowed-or-owned byte buffers for zero-copy handoff.
pub mod buf;
/// The copy-file-range engine.
pub mod copy_range;
/// The request dispatcher.
pub mod dispatch;
/// The POSIX errno registry.
pub mod errno;
/// Handler trait, typed results and per-operation wrappers.
pub mod ops;
/// Session lifecycle.
pub mod session;
/// The ordered shutdown state machine.
pub mod shutdown;
mod signals;
mod sys;
/// Nanosecond timestamp codec.
pub mod time;
/// The wire data model.
pub mod types;
/// Pre-dispatch input validation.
pub mod validate;
/// Per-descriptor write queues.
pub mod write_queue;

pub use crate::buf::Bytes;
pub use crate::copy_range::CURRENT_OFFSET;
pub use crate::copy_range::CopyConfig;
pub use crate::copy_range::CopyRange;
pub use crate::copy_range::CopyStats;
pub use crate::dispatch::AbortToken;
pub use crate::dispatch::DispatchOptions;
pub use crate::dispatch::DispatchPriority;
pub use crate::dispatch::Dispatcher;
pub use crate::dispatch::DispatcherConfig;
pub use crate::dispatch::DispatcherStats;
pub use crate::errno::Errno;
pub use crate::ops::AttrOut;
pub use crate::ops::ConnectionInfo;
pub use crate::ops::DEFAULT_TTL;
pub use crate::ops::Entry;
pub use crate::ops::FuseOps;
pub use crate::ops::OpResult;
pub use crate::ops::ReaddirOut;
pub use crate::ops::SetattrChanges;
pub use crate::ops::Xattr;
pub use crate::ops::wrap::Operation;
pub use crate::ops::wrap::Outcome;
pub use crate::session::Session;
pub use crate::session::SessionOptions;
pub use crate::session::SessionState;
pub use crate::shutdown::ShutdownCallbacks;
pub use crate::shutdown::ShutdownConfig;
pub use crate::shutdown::ShutdownState;
pub use crate::shutdown::ShutdownStats;
pub use crate::time::TimeOrNow;
pub use crate::time::TimeSpec;
pub use crate::types::AccessMask;
pub use crate::types::AccessMode;
pub use crate::types::Dev;
pub use crate::types::DirEntry;
pub use crate::types::Fd;
pub use crate::types::FileAttr;
pub use crate::types::FileInfo;
pub use crate::types::FileType;
pub use crate::types::Gid;
pub use crate::types::Ino;
pub use crate::types::Mode;
pub use crate::types::OpType;
pub use crate::types::OpenFlags;
pub use crate::types::Pid;
pub use crate::types::ROOT_INO;
pub use crate::types::RenameFlags;
pub use crate::types::RequestContext;
pub use crate::types::SetattrValid;
pub use crate::types::Statvfs;
pub use crate::types::Uid;
pub use crate::types::Whence;
pub use crate::types::XattrSetFlags;
pub use crate::write_queue::WriteCompletion;
pub use crate::write_queue::WritePriority;
pub use crate::write_queue::WriteQueueConfig;
pub use crate::write_queue::WriteQueueStats;
pub use crate::write_queue::WriteQueues;
