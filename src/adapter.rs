//! The kernel adapter: libfuse3 callbacks in, dispatcher requests out.
//!
//! Each extern "C" trampoline copies the kernel's arguments into an owned
//! [`Operation`], captures the request handle in a reply closure, and
//! enqueues the pair. It never blocks: the libfuse loop thread returns to
//! the channel immediately while a dispatcher worker runs the handler and
//! sends the reply from its own thread (libfuse permits replying from any
//! thread).
//!
//! Kernel-owned argument buffers are only valid for the duration of the
//! callback, which is why names and write payloads are copied up front;
//! reply data flows back through [`Bytes`] and is copied into the kernel
//! reply region by `fuse_reply_buf`.

use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

use libc::c_char;
use libc::c_int;
use libc::c_uint;
use libc::c_void;
use libc::off_t;
use libc::size_t;
use log::debug;
use log::error;
use log::warn;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::dispatch::AbortToken;
use crate::dispatch::DispatchOptions;
use crate::dispatch::Dispatcher;
use crate::dispatch::ReplyFn;
use crate::errno::Errno;
use crate::ops::ConnectionInfo;
use crate::ops::Entry;
use crate::ops::SetattrChanges;
use crate::ops::Xattr;
use crate::ops::wrap::Operation;
use crate::ops::wrap::Outcome;
use crate::sys;
use crate::time::TimeOrNow;
use crate::time::TimeSpec;
use crate::types::AccessMask;
use crate::types::Dev;
use crate::types::FileAttr;
use crate::types::FileInfo;
use crate::types::Fd;
use crate::types::Gid;
use crate::types::Ino;
use crate::types::Mode;
use crate::types::OpType;
use crate::types::OpenFlags;
use crate::types::Pid;
use crate::types::RenameFlags;
use crate::types::RequestContext;
use crate::types::SetattrValid;
use crate::types::Statvfs;
use crate::types::Uid;

/// Shared state the trampolines reach through `fuse_req_userdata`.
pub(crate) struct AdapterShared {
    pub(crate) dispatcher: Arc<Dispatcher>,
    /// Negotiated connection parameters, set by the init callback.
    pub(crate) conn: RwLock<Option<ConnectionInfo>>,
    /// Caps applied to the kernel's offers during init; 0 leaves the
    /// kernel value alone.
    pub(crate) max_write: u32,
    pub(crate) max_read: u32,
    pub(crate) max_readahead: u32,
    /// When set, the adapter never registers the `access` callback and
    /// the kernel checks permissions itself.
    pub(crate) default_permissions: bool,
    /// Cache lifetime substituted when a handler keeps the stock
    /// [`crate::ops::DEFAULT_TTL`].
    pub(crate) default_ttl: std::time::Duration,
    /// Raised by the session once shutdown starts, so a loop exit is not
    /// mistaken for a lost channel.
    pub(crate) shutting_down: AtomicBool,
    /// Invoked when the session loop dies outside of shutdown.
    pub(crate) on_channel_lost: Mutex<Option<Box<dyn FnOnce(String) + Send>>>,
}

impl AdapterShared {
    /// Resolves a handler-supplied TTL against the session default.
    fn resolve_ttl(&self, ttl: std::time::Duration) -> std::time::Duration {
        if ttl == crate::ops::DEFAULT_TTL {
            self.default_ttl
        } else {
            ttl
        }
    }
}

/// A raw pointer that crosses threads inside reply closures. The request
/// stays valid until exactly one `fuse_reply_*` consumes it, which the
/// dispatcher's exactly-once contract guarantees.
#[derive(Clone, Copy)]
struct ReqHandle(usize);

unsafe impl Send for SessionPtr {}
unsafe impl Sync for SessionPtr {}

/// The libfuse session pointer, shared with the loop thread.
#[derive(Clone, Copy)]
struct SessionPtr(sys::fuse_session_t);

fn shared_of<'a>(req: sys::fuse_req_t) -> &'a AdapterShared {
    unsafe { &*(sys::fuse_req_userdata(req) as *const AdapterShared) }
}

fn context_of(req: sys::fuse_req_t) -> RequestContext {
    let ctx = unsafe { &*sys::fuse_req_ctx(req) };
    RequestContext {
        uid: Uid(ctx.uid),
        gid: Gid(ctx.gid),
        pid: Pid(ctx.pid as u32),
        umask: Mode(ctx.umask),
    }
}

fn name_of(name: *const c_char) -> OsString {
    let bytes = unsafe { CStr::from_ptr(name) }.to_bytes();
    OsStr::from_bytes(bytes).to_os_string()
}

fn file_info_of(fi: *mut sys::fuse_file_info) -> Option<FileInfo> {
    if fi.is_null() {
        return None;
    }
    let raw = unsafe { &*fi };
    Some(FileInfo {
        fh: Fd(raw.fh),
        flags: OpenFlags::from_bits_retain(raw.flags as u32),
        direct_io: raw.bits & sys::FFI_DIRECT_IO != 0,
        keep_cache: raw.bits & sys::FFI_KEEP_CACHE != 0,
        flush: raw.bits & sys::FFI_FLUSH != 0,
        nonseekable: raw.bits & sys::FFI_NONSEEKABLE != 0,
        cache_readdir: raw.bits & sys::FFI_CACHE_READDIR != 0,
        parallel_direct_writes: raw.bits & sys::FFI_PARALLEL_DIRECT_WRITES != 0,
    })
}

fn file_info_out(fi: &FileInfo) -> sys::fuse_file_info {
    let mut raw = sys::fuse_file_info::zeroed();
    raw.fh = fi.fh.0;
    raw.flags = fi.flags.bits() as c_int;
    if fi.direct_io {
        raw.bits |= sys::FFI_DIRECT_IO;
    }
    if fi.keep_cache {
        raw.bits |= sys::FFI_KEEP_CACHE;
    }
    if fi.flush {
        raw.bits |= sys::FFI_FLUSH;
    }
    if fi.nonseekable {
        raw.bits |= sys::FFI_NONSEEKABLE;
    }
    if fi.cache_readdir {
        raw.bits |= sys::FFI_CACHE_READDIR;
    }
    if fi.parallel_direct_writes {
        raw.bits |= sys::FFI_PARALLEL_DIRECT_WRITES;
    }
    raw
}

fn stat_of(attr: &FileAttr) -> libc::stat {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    st.st_ino = attr.ino.0;
    st.st_mode = attr.mode.0;
    st.st_nlink = attr.nlink as libc::nlink_t;
    st.st_uid = attr.uid.0;
    st.st_gid = attr.gid.0;
    st.st_rdev = attr.rdev.0;
    st.st_size = attr.size as libc::off_t;
    st.st_blksize = attr.blksize as libc::blksize_t;
    st.st_blocks = attr.blocks as libc::blkcnt_t;
    st.st_atime = attr.atime.secs;
    st.st_atime_nsec = attr.atime.nsecs as libc::c_long;
    st.st_mtime = attr.mtime.secs;
    st.st_mtime_nsec = attr.mtime.nsecs as libc::c_long;
    st.st_ctime = attr.ctime.secs;
    st.st_ctime_nsec = attr.ctime.nsecs as libc::c_long;
    st
}

fn entry_param_of(entry: &Entry) -> sys::fuse_entry_param {
    sys::fuse_entry_param {
        ino: entry.attr.ino.0,
        generation: entry.generation,
        attr: stat_of(&entry.attr),
        attr_timeout: entry.attr_ttl.as_secs_f64(),
        entry_timeout: entry.entry_ttl.as_secs_f64(),
    }
}

fn statvfs_of(st: &Statvfs) -> libc::statvfs {
    let mut out: libc::statvfs = unsafe { mem::zeroed() };
    out.f_bsize = st.bsize as libc::c_ulong;
    out.f_frsize = st.frsize as libc::c_ulong;
    out.f_blocks = st.blocks;
    out.f_bfree = st.bfree;
    out.f_bavail = st.bavail;
    out.f_files = st.files;
    out.f_ffree = st.ffree;
    out.f_favail = st.favail;
    out.f_fsid = st.fsid as libc::c_ulong;
    out.f_flag = st.flag as libc::c_ulong;
    out.f_namemax = st.namemax as libc::c_ulong;
    out
}

extern "C" fn interrupt_cb(_req: sys::fuse_req_t, data: *mut c_void) {
    let token = unsafe { &*(data as *const AbortToken) };
    debug!("kernel interrupted an in-flight request");
    token.fire();
}

/// Builds the reply closure for one request and enqueues the operation.
/// `dir_args` carries the kernel's `(size, offset)` for readdir replies.
fn enqueue(req: sys::fuse_req_t, op: Operation, dir_args: Option<(usize, u64)>) {
    let shared = shared_of(req);
    let ctx = context_of(req);
    let op_type = op.op_type();

    let token = AbortToken::new();
    let token_box = Box::into_raw(Box::new(token.clone()));
    unsafe {
        sys::fuse_req_interrupt_func(req, Some(interrupt_cb), token_box as *mut c_void);
    }

    let handle = ReqHandle(req as usize);
    let token_addr = token_box as usize;
    let reply: ReplyFn = Box::new(move |result| {
        let req = handle.0 as sys::fuse_req_t;
        unsafe {
            // Clear the interrupt hook under libfuse's lock before the
            // request object can be freed by the reply.
            sys::fuse_req_interrupt_func(req, None, ptr::null_mut());
        }
        send_reply(req, op_type, result, dir_args);
        drop(unsafe { Box::from_raw(token_addr as *mut AbortToken) });
    });

    shared.dispatcher.dispatch(
        ctx,
        op,
        DispatchOptions {
            abort: Some(token),
            ..DispatchOptions::default()
        },
        reply,
    );
}

unsafe impl Send for ReqHandle {}

fn send_reply(
    req: sys::fuse_req_t,
    op_type: OpType,
    result: Result<Outcome, Errno>,
    dir_args: Option<(usize, u64)>,
) {
    let rc = match result {
        Ok(Outcome::NoReply) => {
            unsafe { sys::fuse_reply_none(req) };
            0
        }
        Ok(Outcome::Unit) => unsafe { sys::fuse_reply_err(req, 0) },
        Ok(Outcome::Entry(mut entry)) => {
            let shared = shared_of(req);
            entry.entry_ttl = shared.resolve_ttl(entry.entry_ttl);
            entry.attr_ttl = shared.resolve_ttl(entry.attr_ttl);
            let param = entry_param_of(&entry);
            unsafe { sys::fuse_reply_entry(req, &param) }
        }
        Ok(Outcome::Attr(out)) => {
            let ttl = shared_of(req).resolve_ttl(out.ttl);
            let st = stat_of(&out.attr);
            unsafe { sys::fuse_reply_attr(req, &st, ttl.as_secs_f64()) }
        }
        Ok(Outcome::LinkTarget(target)) => match CString::new(target.as_bytes()) {
            Ok(target) => unsafe { sys::fuse_reply_readlink(req, target.as_ptr()) },
            Err(_) => unsafe { sys::fuse_reply_err(req, Errno::EIO.code()) },
        },
        Ok(Outcome::Opened(fi)) => {
            let raw = file_info_out(&fi);
            unsafe { sys::fuse_reply_open(req, &raw) }
        }
        Ok(Outcome::Created(mut entry, fi)) => {
            let shared = shared_of(req);
            entry.entry_ttl = shared.resolve_ttl(entry.entry_ttl);
            entry.attr_ttl = shared.resolve_ttl(entry.attr_ttl);
            let param = entry_param_of(&entry);
            let raw = file_info_out(&fi);
            unsafe { sys::fuse_reply_create(req, &param, &raw) }
        }
        Ok(Outcome::Data(data)) => unsafe {
            sys::fuse_reply_buf(req, data.as_slice().as_ptr().cast(), data.len())
        },
        Ok(Outcome::Written(n)) => unsafe { sys::fuse_reply_write(req, n as size_t) },
        Ok(Outcome::Dir(page)) => {
            let (size, offset) = dir_args.unwrap_or((4096, 0));
            return reply_dir(req, &page, size, offset);
        }
        Ok(Outcome::Fs(st)) => {
            let raw = statvfs_of(&st);
            unsafe { sys::fuse_reply_statfs(req, &raw) }
        }
        Ok(Outcome::Xattr(Xattr::Size(n))) => unsafe {
            sys::fuse_reply_xattr(req, n as size_t)
        },
        Ok(Outcome::Xattr(Xattr::Data(data))) => unsafe {
            sys::fuse_reply_buf(req, data.as_slice().as_ptr().cast(), data.len())
        },
        Ok(Outcome::Seek(offset)) => unsafe { sys::fuse_reply_lseek(req, offset as off_t) },
        Ok(Outcome::Copied(n)) => unsafe { sys::fuse_reply_write(req, n as size_t) },
        Err(_) if op_type == OpType::Forget => {
            // Forget never carries a reply, not even an error.
            unsafe { sys::fuse_reply_none(req) };
            0
        }
        Err(errno) if op_type == OpType::Statfs && errno == Errno::ENOSYS => {
            // libfuse answers an unimplemented statfs with neutral
            // defaults rather than an error; match it.
            let raw = statvfs_of(&Statvfs::default());
            unsafe { sys::fuse_reply_statfs(req, &raw) }
        }
        Err(errno) => {
            debug!("{op_type} -> {errno}");
            unsafe { sys::fuse_reply_err(req, errno.code()) }
        }
    };
    if rc != 0 {
        warn!("fuse reply for {op_type} failed with {rc}");
    }
}

/// Encodes one page of directory entries with the kernel-supplied filler.
///
/// Offsets: an entry's own `next_offset` wins; the page-level
/// `next_offset` applies to the final entry; otherwise the cursor
/// advances by one entry per slot from the requested offset.
fn reply_dir(req: sys::fuse_req_t, page: &crate::ops::ReaddirOut, size: usize, offset: u64) {
    let mut buf = vec![0u8; size];
    let mut used = 0usize;
    let count = page.entries.len();

    for (i, entry) in page.entries.iter().enumerate() {
        let Ok(name) = CString::new(entry.name.as_bytes()) else {
            unsafe { sys::fuse_reply_err(req, Errno::EIO.code()) };
            return;
        };
        let mut st: libc::stat = unsafe { mem::zeroed() };
        st.st_ino = entry.ino.0;
        st.st_mode = (entry.kind as u32) << 12;

        let next = entry.next_offset.unwrap_or_else(|| {
            if i == count - 1 {
                page.next_offset.unwrap_or(offset + count as u64)
            } else {
                offset + i as u64 + 1
            }
        });

        let need = unsafe {
            sys::fuse_add_direntry(
                req,
                buf[used..].as_mut_ptr().cast(),
                size - used,
                name.as_ptr(),
                &st,
                next as off_t,
            )
        };
        if need > size - used {
            // Entry does not fit; the kernel will come back at `next`.
            break;
        }
        used += need;
    }
    unsafe { sys::fuse_reply_buf(req, buf.as_ptr().cast(), used) };
}

// ---- extern "C" trampolines -------------------------------------------

extern "C" fn cb_init(userdata: *mut c_void, conn: *mut sys::fuse_conn_info) {
    let shared = unsafe { &*(userdata as *const AdapterShared) };
    let raw = unsafe { &mut *conn };

    if shared.max_write > 0 {
        raw.max_write = raw.max_write.min(shared.max_write);
    }
    if shared.max_read > 0 {
        raw.max_read = if raw.max_read == 0 {
            shared.max_read
        } else {
            raw.max_read.min(shared.max_read)
        };
    }
    if shared.max_readahead > 0 {
        raw.max_readahead = raw.max_readahead.min(shared.max_readahead);
    }
    // The kernel moves write payloads in whole pages; a ragged cap would
    // just be rounded down on its side with a warning.
    let page = page_size::get() as u32;
    if raw.max_write >= page {
        raw.max_write -= raw.max_write % page;
    }

    let mut info = ConnectionInfo {
        proto_major: raw.proto_major,
        proto_minor: raw.proto_minor,
        capabilities: raw.capable,
        max_write: raw.max_write,
        max_readahead: raw.max_readahead,
        max_background: raw.max_background as u16,
        congestion_threshold: raw.congestion_threshold as u16,
    };
    if let Err(errno) = shared.dispatcher.ops().init(&mut info) {
        error!("filesystem init failed: {errno}; session will not serve requests");
    }
    // The handler may lower the negotiated buffer sizes, never raise them.
    raw.max_write = raw.max_write.min(info.max_write.max(4096));
    raw.max_readahead = raw.max_readahead.min(info.max_readahead);

    debug!(
        "FUSE connection: proto {}.{}, max_write {}, max_readahead {}",
        raw.proto_major, raw.proto_minor, raw.max_write, raw.max_readahead
    );
    *shared.conn.write() = Some(info);
}

extern "C" fn cb_destroy(userdata: *mut c_void) {
    let shared = unsafe { &*(userdata as *const AdapterShared) };
    shared.dispatcher.ops().destroy();
}

extern "C" fn cb_lookup(req: sys::fuse_req_t, parent: sys::fuse_ino_t, name: *const c_char) {
    enqueue(
        req,
        Operation::Lookup {
            parent: Ino(parent),
            name: name_of(name),
        },
        None,
    );
}

extern "C" fn cb_forget(req: sys::fuse_req_t, ino: sys::fuse_ino_t, nlookup: u64) {
    enqueue(
        req,
        Operation::Forget {
            ino: Ino(ino),
            nlookup,
        },
        None,
    );
}

extern "C" fn cb_forget_multi(
    req: sys::fuse_req_t,
    count: size_t,
    forgets: *mut sys::fuse_forget_data,
) {
    let nodes = unsafe { std::slice::from_raw_parts(forgets, count) }
        .iter()
        .map(|f| (Ino(f.ino), f.nlookup))
        .collect();
    enqueue(req, Operation::BatchForget { nodes }, None);
}

extern "C" fn cb_getattr(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    fi: *mut sys::fuse_file_info,
) {
    enqueue(
        req,
        Operation::Getattr {
            ino: Ino(ino),
            fi: file_info_of(fi),
        },
        None,
    );
}

extern "C" fn cb_setattr(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    attr: *mut libc::stat,
    to_set: c_int,
    fi: *mut sys::fuse_file_info,
) {
    let st = unsafe { &*attr };
    let valid = SetattrValid::from_bits_truncate(to_set as u32);
    let changes = SetattrChanges {
        mode: valid
            .contains(SetattrValid::MODE)
            .then(|| Mode(st.st_mode)),
        uid: valid.contains(SetattrValid::UID).then(|| Uid(st.st_uid)),
        gid: valid.contains(SetattrValid::GID).then(|| Gid(st.st_gid)),
        size: valid
            .contains(SetattrValid::SIZE)
            .then(|| st.st_size as u64),
        atime: if valid.contains(SetattrValid::ATIME_NOW) {
            Some(TimeOrNow::Now)
        } else if valid.contains(SetattrValid::ATIME) {
            Some(TimeOrNow::SpecificTime(TimeSpec::new(
                st.st_atime,
                st.st_atime_nsec as u32,
            )))
        } else {
            None
        },
        mtime: if valid.contains(SetattrValid::MTIME_NOW) {
            Some(TimeOrNow::Now)
        } else if valid.contains(SetattrValid::MTIME) {
            Some(TimeOrNow::SpecificTime(TimeSpec::new(
                st.st_mtime,
                st.st_mtime_nsec as u32,
            )))
        } else {
            None
        },
        ctime: valid
            .contains(SetattrValid::CTIME)
            .then(|| TimeSpec::new(st.st_ctime, st.st_ctime_nsec as u32)),
        valid,
    };
    enqueue(
        req,
        Operation::Setattr {
            ino: Ino(ino),
            changes,
            fi: file_info_of(fi),
        },
        None,
    );
}

extern "C" fn cb_readlink(req: sys::fuse_req_t, ino: sys::fuse_ino_t) {
    enqueue(req, Operation::Readlink { ino: Ino(ino) }, None);
}

extern "C" fn cb_mknod(
    req: sys::fuse_req_t,
    parent: sys::fuse_ino_t,
    name: *const c_char,
    mode: libc::mode_t,
    rdev: libc::dev_t,
) {
    enqueue(
        req,
        Operation::Mknod {
            parent: Ino(parent),
            name: name_of(name),
            mode: Mode(mode),
            rdev: Dev(rdev),
        },
        None,
    );
}

extern "C" fn cb_mkdir(
    req: sys::fuse_req_t,
    parent: sys::fuse_ino_t,
    name: *const c_char,
    mode: libc::mode_t,
) {
    // The kernel sends permissions only; stamp the type bits on so the
    // mode always says what it is.
    enqueue(
        req,
        Operation::Mkdir {
            parent: Ino(parent),
            name: name_of(name),
            mode: Mode(mode | libc::S_IFDIR),
        },
        None,
    );
}

extern "C" fn cb_unlink(req: sys::fuse_req_t, parent: sys::fuse_ino_t, name: *const c_char) {
    enqueue(
        req,
        Operation::Unlink {
            parent: Ino(parent),
            name: name_of(name),
        },
        None,
    );
}

extern "C" fn cb_rmdir(req: sys::fuse_req_t, parent: sys::fuse_ino_t, name: *const c_char) {
    enqueue(
        req,
        Operation::Rmdir {
            parent: Ino(parent),
            name: name_of(name),
        },
        None,
    );
}

extern "C" fn cb_symlink(
    req: sys::fuse_req_t,
    link: *const c_char,
    parent: sys::fuse_ino_t,
    name: *const c_char,
) {
    enqueue(
        req,
        Operation::Symlink {
            target: PathBuf::from(name_of(link)),
            parent: Ino(parent),
            name: name_of(name),
        },
        None,
    );
}

extern "C" fn cb_rename(
    req: sys::fuse_req_t,
    parent: sys::fuse_ino_t,
    name: *const c_char,
    newparent: sys::fuse_ino_t,
    newname: *const c_char,
    flags: c_uint,
) {
    enqueue(
        req,
        Operation::Rename {
            parent: Ino(parent),
            name: name_of(name),
            newparent: Ino(newparent),
            newname: name_of(newname),
            flags: RenameFlags::from_bits_retain(flags),
        },
        None,
    );
}

extern "C" fn cb_link(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    newparent: sys::fuse_ino_t,
    newname: *const c_char,
) {
    enqueue(
        req,
        Operation::Link {
            ino: Ino(ino),
            newparent: Ino(newparent),
            newname: name_of(newname),
        },
        None,
    );
}

extern "C" fn cb_open(req: sys::fuse_req_t, ino: sys::fuse_ino_t, fi: *mut sys::fuse_file_info) {
    let flags = file_info_of(fi).map(|f| f.flags).unwrap_or_default();
    enqueue(
        req,
        Operation::Open {
            ino: Ino(ino),
            flags,
        },
        None,
    );
}

extern "C" fn cb_read(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    size: size_t,
    off: off_t,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(
        req,
        Operation::Read {
            ino: Ino(ino),
            offset: off,
            size: size as u64,
            fi,
        },
        None,
    );
}

extern "C" fn cb_write(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    buf: *const c_char,
    size: size_t,
    off: off_t,
    fi: *mut sys::fuse_file_info,
) {
    // The kernel reclaims its buffer when this callback returns.
    let data = unsafe { std::slice::from_raw_parts(buf as *const u8, size) }.to_vec();
    let fi = file_info_of(fi).unwrap_or_default();
    let flags = fi.flags;
    enqueue(
        req,
        Operation::Write {
            ino: Ino(ino),
            data,
            offset: off,
            fi,
            flags,
        },
        None,
    );
}

extern "C" fn cb_flush(req: sys::fuse_req_t, ino: sys::fuse_ino_t, fi: *mut sys::fuse_file_info) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(req, Operation::Flush { ino: Ino(ino), fi }, None);
}

extern "C" fn cb_release(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(req, Operation::Release { ino: Ino(ino), fi }, None);
}

extern "C" fn cb_fsync(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    datasync: c_int,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(
        req,
        Operation::Fsync {
            ino: Ino(ino),
            datasync: datasync != 0,
            fi,
        },
        None,
    );
}

extern "C" fn cb_opendir(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    _fi: *mut sys::fuse_file_info,
) {
    enqueue(req, Operation::Opendir { ino: Ino(ino) }, None);
}

extern "C" fn cb_readdir(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    size: size_t,
    off: off_t,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(
        req,
        Operation::Readdir {
            ino: Ino(ino),
            offset: off,
            fi,
        },
        Some((size, off.max(0) as u64)),
    );
}

extern "C" fn cb_releasedir(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(req, Operation::Releasedir { ino: Ino(ino), fi }, None);
}

extern "C" fn cb_fsyncdir(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    datasync: c_int,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(
        req,
        Operation::Fsyncdir {
            ino: Ino(ino),
            datasync: datasync != 0,
            fi,
        },
        None,
    );
}

extern "C" fn cb_statfs(req: sys::fuse_req_t, ino: sys::fuse_ino_t) {
    let ino = if ino == 0 { crate::types::ROOT_INO } else { Ino(ino) };
    enqueue(req, Operation::Statfs { ino }, None);
}

extern "C" fn cb_setxattr(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    name: *const c_char,
    value: *const c_char,
    size: size_t,
    flags: c_int,
) {
    let value = unsafe { std::slice::from_raw_parts(value as *const u8, size) }.to_vec();
    enqueue(
        req,
        Operation::Setxattr {
            ino: Ino(ino),
            name: name_of(name),
            value,
            flags,
        },
        None,
    );
}

extern "C" fn cb_getxattr(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    name: *const c_char,
    size: size_t,
) {
    enqueue(
        req,
        Operation::Getxattr {
            ino: Ino(ino),
            name: name_of(name),
            size: size as u32,
        },
        None,
    );
}

extern "C" fn cb_listxattr(req: sys::fuse_req_t, ino: sys::fuse_ino_t, size: size_t) {
    enqueue(
        req,
        Operation::Listxattr {
            ino: Ino(ino),
            size: size as u32,
        },
        None,
    );
}

extern "C" fn cb_removexattr(req: sys::fuse_req_t, ino: sys::fuse_ino_t, name: *const c_char) {
    enqueue(
        req,
        Operation::Removexattr {
            ino: Ino(ino),
            name: name_of(name),
        },
        None,
    );
}

extern "C" fn cb_access(req: sys::fuse_req_t, ino: sys::fuse_ino_t, mask: c_int) {
    enqueue(
        req,
        Operation::Access {
            ino: Ino(ino),
            mask: AccessMask::from_bits_truncate(mask as u32),
        },
        None,
    );
}

extern "C" fn cb_create(
    req: sys::fuse_req_t,
    parent: sys::fuse_ino_t,
    name: *const c_char,
    mode: libc::mode_t,
    fi: *mut sys::fuse_file_info,
) {
    let flags = file_info_of(fi).map(|f| f.flags).unwrap_or_default();
    enqueue(
        req,
        Operation::Create {
            parent: Ino(parent),
            name: name_of(name),
            mode: Mode(mode),
            flags,
        },
        None,
    );
}

extern "C" fn cb_copy_file_range(
    req: sys::fuse_req_t,
    ino_in: sys::fuse_ino_t,
    off_in: off_t,
    fi_in: *mut sys::fuse_file_info,
    ino_out: sys::fuse_ino_t,
    off_out: off_t,
    fi_out: *mut sys::fuse_file_info,
    len: size_t,
    flags: c_int,
) {
    let fi_in = file_info_of(fi_in).unwrap_or_default();
    let fi_out = file_info_of(fi_out).unwrap_or_default();
    enqueue(
        req,
        Operation::CopyFileRange {
            ino_in: Ino(ino_in),
            fi_in,
            off_in,
            ino_out: Ino(ino_out),
            fi_out,
            off_out,
            len: len as u64,
            flags: flags as u32,
        },
        None,
    );
}

extern "C" fn cb_lseek(
    req: sys::fuse_req_t,
    ino: sys::fuse_ino_t,
    off: off_t,
    whence: c_int,
    fi: *mut sys::fuse_file_info,
) {
    let fi = file_info_of(fi).unwrap_or_default();
    enqueue(
        req,
        Operation::Lseek {
            ino: Ino(ino),
            offset: off,
            whence,
            fi,
        },
        None,
    );
}

fn build_ops(default_permissions: bool) -> sys::fuse_lowlevel_ops {
    let mut ops = sys::fuse_lowlevel_ops {
        init: Some(cb_init),
        destroy: Some(cb_destroy),
        lookup: Some(cb_lookup),
        forget: Some(cb_forget),
        getattr: Some(cb_getattr),
        setattr: Some(cb_setattr),
        readlink: Some(cb_readlink),
        mknod: Some(cb_mknod),
        mkdir: Some(cb_mkdir),
        unlink: Some(cb_unlink),
        rmdir: Some(cb_rmdir),
        symlink: Some(cb_symlink),
        rename: Some(cb_rename),
        link: Some(cb_link),
        open: Some(cb_open),
        read: Some(cb_read),
        write: Some(cb_write),
        flush: Some(cb_flush),
        release: Some(cb_release),
        fsync: Some(cb_fsync),
        opendir: Some(cb_opendir),
        readdir: Some(cb_readdir),
        releasedir: Some(cb_releasedir),
        fsyncdir: Some(cb_fsyncdir),
        statfs: Some(cb_statfs),
        setxattr: Some(cb_setxattr),
        getxattr: Some(cb_getxattr),
        listxattr: Some(cb_listxattr),
        removexattr: Some(cb_removexattr),
        access: Some(cb_access),
        create: Some(cb_create),
        forget_multi: Some(cb_forget_multi),
        copy_file_range: Some(cb_copy_file_range),
        lseek: Some(cb_lseek),
        ..sys::fuse_lowlevel_ops::default()
    };
    if default_permissions {
        ops.access = None;
    }
    ops
}

fn ensure_last_os_error() -> io::Error {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(0) | None => io::Error::other("unspecified libfuse error"),
        _ => err,
    }
}

/// The mounted kernel channel: a libfuse session plus the thread running
/// its loop.
pub(crate) struct FuseChannel {
    session: SessionPtr,
    shared: *const AdapterShared,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    exited: AtomicBool,
}

unsafe impl Send for FuseChannel {}
unsafe impl Sync for FuseChannel {}

impl std::fmt::Debug for FuseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseChannel")
            .field("exited", &self.exited.load(Ordering::Relaxed))
            .finish()
    }
}

impl FuseChannel {
    /// Creates the libfuse session, mounts it, and starts the loop
    /// thread.
    pub(crate) fn mount(
        mountpoint: &Path,
        args: &[CString],
        shared: Arc<AdapterShared>,
    ) -> io::Result<FuseChannel> {
        let c_mountpoint = CString::new(mountpoint.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in mountpoint"))?;

        let argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
        let fuse_args = sys::fuse_args {
            argc: argv.len() as c_int,
            argv: argv.as_ptr(),
            allocated: 0,
        };

        let ops = build_ops(shared.default_permissions);
        let loop_shared = Arc::clone(&shared);
        let userdata = Arc::into_raw(shared);

        let session = unsafe {
            sys::fuse_session_new(
                &fuse_args,
                &ops,
                mem::size_of::<sys::fuse_lowlevel_ops>(),
                userdata as *mut c_void,
            )
        };
        if session.is_null() {
            unsafe { drop(Arc::from_raw(userdata)) };
            return Err(ensure_last_os_error());
        }

        let rc = unsafe { sys::fuse_session_mount(session, c_mountpoint.as_ptr()) };
        if rc != 0 {
            unsafe {
                sys::fuse_session_destroy(session);
                drop(Arc::from_raw(userdata));
            }
            return Err(ensure_last_os_error());
        }

        let session_ptr = SessionPtr(session);
        let loop_thread = thread::Builder::new()
            .name("fusebind-session".into())
            .spawn(move || {
                let session_ptr = session_ptr;
                let rc = unsafe { sys::fuse_session_loop(session_ptr.0) };
                if rc != 0 && !loop_shared.shutting_down.load(Ordering::Acquire) {
                    let reason = format!("FUSE session loop exited with {rc}");
                    error!("{reason}");
                    if let Some(hook) = loop_shared.on_channel_lost.lock().take() {
                        hook(reason);
                    }
                } else {
                    debug!("FUSE session loop finished");
                }
            })?;

        Ok(FuseChannel {
            session: SessionPtr(session),
            shared: userdata,
            loop_thread: Mutex::new(Some(loop_thread)),
            exited: AtomicBool::new(false),
        })
    }

    /// Asks the loop to exit and detaches the mountpoint. Blocks until
    /// the loop thread is gone. Idempotent.
    pub(crate) fn unmount(&self) -> io::Result<()> {
        if self.exited.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        unsafe {
            sys::fuse_session_exit(self.session.0);
            // Unmounting closes /dev/fuse, which unblocks the loop's read.
            sys::fuse_session_unmount(self.session.0);
        }
        if let Some(handle) = self.loop_thread.lock().take() {
            if handle.join().is_err() {
                warn!("FUSE session loop thread panicked");
            }
        }
        Ok(())
    }

}

impl Drop for FuseChannel {
    fn drop(&mut self) {
        let _ = self.unmount();
        unsafe {
            sys::fuse_session_destroy(self.session.0);
            drop(Arc::from_raw(self.shared));
        }
    }
}
