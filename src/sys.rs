//! Native FFI bindings to libfuse3.
//!
//! Only what the adapter needs: session setup/teardown, the low-level
//! operation table, and the reply functions. The FUSE wire protocol is
//! entirely libfuse's business; nothing here parses kernel packets.
//!
//! Struct layouts mirror `fuse_lowlevel.h`/`fuse_common.h` of libfuse
//! 3.2+; the ops table is passed with its size so newer libfuse versions
//! with longer tables stay compatible.

#![allow(missing_docs)]
#![allow(non_camel_case_types)]
#![allow(dead_code)]

use libc::c_char;
use libc::c_int;
use libc::c_uint;
use libc::c_void;
use libc::dev_t;
use libc::mode_t;
use libc::off_t;
use libc::size_t;

/// Opaque request handle; valid until one `fuse_reply_*` consumes it.
pub(crate) type fuse_req_t = *mut c_void;
/// Opaque session handle from `fuse_session_new`.
pub(crate) type fuse_session_t = *mut c_void;
pub(crate) type fuse_ino_t = u64;

type fuse_pollhandle = *mut c_void;
type fuse_bufvec = *mut c_void;

#[repr(C)]
#[derive(Debug)]
pub(crate) struct fuse_args {
    pub(crate) argc: c_int,
    pub(crate) argv: *const *const c_char,
    pub(crate) allocated: c_int,
}

/// `struct fuse_file_info`. The C original packs nine one-bit flags plus
/// padding into two unsigned ints; `bits` is the first word.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct fuse_file_info {
    pub(crate) flags: c_int,
    pub(crate) bits: u32,
    pub(crate) padding2: u32,
    pub(crate) fh: u64,
    pub(crate) lock_owner: u64,
    pub(crate) poll_events: u32,
}

pub(crate) const FFI_WRITEPAGE: u32 = 1 << 0;
pub(crate) const FFI_DIRECT_IO: u32 = 1 << 1;
pub(crate) const FFI_KEEP_CACHE: u32 = 1 << 2;
pub(crate) const FFI_FLUSH: u32 = 1 << 3;
pub(crate) const FFI_NONSEEKABLE: u32 = 1 << 4;
pub(crate) const FFI_FLOCK_RELEASE: u32 = 1 << 5;
pub(crate) const FFI_CACHE_READDIR: u32 = 1 << 6;
pub(crate) const FFI_NOFLUSH: u32 = 1 << 7;
pub(crate) const FFI_PARALLEL_DIRECT_WRITES: u32 = 1 << 8;

impl fuse_file_info {
    pub(crate) fn zeroed() -> fuse_file_info {
        fuse_file_info {
            flags: 0,
            bits: 0,
            padding2: 0,
            fh: 0,
            lock_owner: 0,
            poll_events: 0,
        }
    }
}

/// `struct fuse_entry_param`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct fuse_entry_param {
    pub(crate) ino: fuse_ino_t,
    pub(crate) generation: u64,
    pub(crate) attr: libc::stat,
    pub(crate) attr_timeout: f64,
    pub(crate) entry_timeout: f64,
}

/// `struct fuse_ctx`: the identity of the syscalling process.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct fuse_ctx {
    pub(crate) uid: libc::uid_t,
    pub(crate) gid: libc::gid_t,
    pub(crate) pid: libc::pid_t,
    pub(crate) umask: mode_t,
}

/// `struct fuse_conn_info` as of libfuse 3.2.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct fuse_conn_info {
    pub(crate) proto_major: c_uint,
    pub(crate) proto_minor: c_uint,
    pub(crate) max_write: c_uint,
    pub(crate) max_read: c_uint,
    pub(crate) max_readahead: c_uint,
    pub(crate) capable: c_uint,
    pub(crate) want: c_uint,
    pub(crate) max_background: c_uint,
    pub(crate) congestion_threshold: c_uint,
    pub(crate) time_gran: c_uint,
    pub(crate) reserved: [c_uint; 22],
}

/// One entry of a `forget_multi` batch.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct fuse_forget_data {
    pub(crate) ino: fuse_ino_t,
    pub(crate) nlookup: u64,
}

/// `struct fuse_lowlevel_ops`: one callback slot per kernel operation.
/// Field order is ABI; unimplemented slots stay `None`.
#[repr(C)]
#[derive(Default)]
pub(crate) struct fuse_lowlevel_ops {
    pub(crate) init: Option<extern "C" fn(userdata: *mut c_void, conn: *mut fuse_conn_info)>,
    pub(crate) destroy: Option<extern "C" fn(userdata: *mut c_void)>,
    pub(crate) lookup:
        Option<extern "C" fn(req: fuse_req_t, parent: fuse_ino_t, name: *const c_char)>,
    pub(crate) forget: Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, nlookup: u64)>,
    pub(crate) getattr:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info)>,
    pub(crate) setattr: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            attr: *mut libc::stat,
            to_set: c_int,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) readlink: Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t)>,
    pub(crate) mknod: Option<
        extern "C" fn(
            req: fuse_req_t,
            parent: fuse_ino_t,
            name: *const c_char,
            mode: mode_t,
            rdev: dev_t,
        ),
    >,
    pub(crate) mkdir: Option<
        extern "C" fn(req: fuse_req_t, parent: fuse_ino_t, name: *const c_char, mode: mode_t),
    >,
    pub(crate) unlink:
        Option<extern "C" fn(req: fuse_req_t, parent: fuse_ino_t, name: *const c_char)>,
    pub(crate) rmdir:
        Option<extern "C" fn(req: fuse_req_t, parent: fuse_ino_t, name: *const c_char)>,
    pub(crate) symlink: Option<
        extern "C" fn(
            req: fuse_req_t,
            link: *const c_char,
            parent: fuse_ino_t,
            name: *const c_char,
        ),
    >,
    pub(crate) rename: Option<
        extern "C" fn(
            req: fuse_req_t,
            parent: fuse_ino_t,
            name: *const c_char,
            newparent: fuse_ino_t,
            newname: *const c_char,
            flags: c_uint,
        ),
    >,
    pub(crate) link: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            newparent: fuse_ino_t,
            newname: *const c_char,
        ),
    >,
    pub(crate) open:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info)>,
    pub(crate) read: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            size: size_t,
            off: off_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) write: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            buf: *const c_char,
            size: size_t,
            off: off_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) flush:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info)>,
    pub(crate) release:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info)>,
    pub(crate) fsync: Option<
        extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, datasync: c_int, fi: *mut fuse_file_info),
    >,
    pub(crate) opendir:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info)>,
    pub(crate) readdir: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            size: size_t,
            off: off_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) releasedir:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info)>,
    pub(crate) fsyncdir: Option<
        extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, datasync: c_int, fi: *mut fuse_file_info),
    >,
    pub(crate) statfs: Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t)>,
    pub(crate) setxattr: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            name: *const c_char,
            value: *const c_char,
            size: size_t,
            flags: c_int,
        ),
    >,
    pub(crate) getxattr:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, name: *const c_char, size: size_t)>,
    pub(crate) listxattr: Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, size: size_t)>,
    pub(crate) removexattr:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, name: *const c_char)>,
    pub(crate) access: Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, mask: c_int)>,
    pub(crate) create: Option<
        extern "C" fn(
            req: fuse_req_t,
            parent: fuse_ino_t,
            name: *const c_char,
            mode: mode_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) getlk: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            fi: *mut fuse_file_info,
            lock: *mut libc::flock,
        ),
    >,
    pub(crate) setlk: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            fi: *mut fuse_file_info,
            lock: *mut libc::flock,
            sleep: c_int,
        ),
    >,
    pub(crate) bmap:
        Option<extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, blocksize: size_t, idx: u64)>,
    pub(crate) ioctl: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            cmd: c_uint,
            arg: *mut c_void,
            fi: *mut fuse_file_info,
            flags: c_uint,
            in_buf: *const c_void,
            in_bufsz: size_t,
            out_bufsz: size_t,
        ),
    >,
    pub(crate) poll: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            fi: *mut fuse_file_info,
            ph: *mut fuse_pollhandle,
        ),
    >,
    pub(crate) write_buf: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            bufv: *mut fuse_bufvec,
            off: off_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) retrieve_reply: Option<
        extern "C" fn(
            req: fuse_req_t,
            cookie: *mut c_void,
            ino: fuse_ino_t,
            offset: off_t,
            bufv: *mut fuse_bufvec,
        ),
    >,
    pub(crate) forget_multi:
        Option<extern "C" fn(req: fuse_req_t, count: size_t, forgets: *mut fuse_forget_data)>,
    pub(crate) flock: Option<
        extern "C" fn(req: fuse_req_t, ino: fuse_ino_t, fi: *mut fuse_file_info, op: c_int),
    >,
    pub(crate) fallocate: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            mode: c_int,
            offset: off_t,
            length: off_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) readdirplus: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            size: size_t,
            off: off_t,
            fi: *mut fuse_file_info,
        ),
    >,
    pub(crate) copy_file_range: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino_in: fuse_ino_t,
            off_in: off_t,
            fi_in: *mut fuse_file_info,
            ino_out: fuse_ino_t,
            off_out: off_t,
            fi_out: *mut fuse_file_info,
            len: size_t,
            flags: c_int,
        ),
    >,
    pub(crate) lseek: Option<
        extern "C" fn(
            req: fuse_req_t,
            ino: fuse_ino_t,
            off: off_t,
            whence: c_int,
            fi: *mut fuse_file_info,
        ),
    >,
}

unsafe extern "C" {
    pub(crate) fn fuse_session_new(
        args: *const fuse_args,
        op: *const fuse_lowlevel_ops,
        op_size: size_t,
        userdata: *mut c_void,
    ) -> fuse_session_t;
    pub(crate) fn fuse_session_mount(se: fuse_session_t, mountpoint: *const c_char) -> c_int;
    pub(crate) fn fuse_session_fd(se: fuse_session_t) -> c_int;
    pub(crate) fn fuse_session_loop(se: fuse_session_t) -> c_int;
    pub(crate) fn fuse_session_exit(se: fuse_session_t);
    pub(crate) fn fuse_session_exited(se: fuse_session_t) -> c_int;
    pub(crate) fn fuse_session_unmount(se: fuse_session_t);
    pub(crate) fn fuse_session_destroy(se: fuse_session_t);

    pub(crate) fn fuse_req_userdata(req: fuse_req_t) -> *mut c_void;
    pub(crate) fn fuse_req_ctx(req: fuse_req_t) -> *const fuse_ctx;
    pub(crate) fn fuse_req_interrupt_func(
        req: fuse_req_t,
        func: Option<extern "C" fn(req: fuse_req_t, data: *mut c_void)>,
        data: *mut c_void,
    );

    pub(crate) fn fuse_reply_err(req: fuse_req_t, err: c_int) -> c_int;
    pub(crate) fn fuse_reply_none(req: fuse_req_t);
    pub(crate) fn fuse_reply_entry(req: fuse_req_t, e: *const fuse_entry_param) -> c_int;
    pub(crate) fn fuse_reply_create(
        req: fuse_req_t,
        e: *const fuse_entry_param,
        fi: *const fuse_file_info,
    ) -> c_int;
    pub(crate) fn fuse_reply_attr(
        req: fuse_req_t,
        attr: *const libc::stat,
        attr_timeout: f64,
    ) -> c_int;
    pub(crate) fn fuse_reply_readlink(req: fuse_req_t, link: *const c_char) -> c_int;
    pub(crate) fn fuse_reply_open(req: fuse_req_t, fi: *const fuse_file_info) -> c_int;
    pub(crate) fn fuse_reply_write(req: fuse_req_t, count: size_t) -> c_int;
    pub(crate) fn fuse_reply_buf(req: fuse_req_t, buf: *const c_char, size: size_t) -> c_int;
    pub(crate) fn fuse_reply_statfs(req: fuse_req_t, stbuf: *const libc::statvfs) -> c_int;
    pub(crate) fn fuse_reply_xattr(req: fuse_req_t, count: size_t) -> c_int;
    pub(crate) fn fuse_reply_lseek(req: fuse_req_t, off: off_t) -> c_int;

    pub(crate) fn fuse_add_direntry(
        req: fuse_req_t,
        buf: *mut c_char,
        bufsize: size_t,
        name: *const c_char,
        stbuf: *const libc::stat,
        off: off_t,
    ) -> size_t;
}
