//! Handler trait and typed operation results.
//!
//! A filesystem implements [`FuseOps`]. Only `lookup` and `getattr` are
//! required; every other operation defaults to `ENOSYS`, which the kernel
//! interprets as "not implemented" and degrades gracefully for. Handlers
//! return plain `Result` values; the wrappers in [`wrap`] validate inputs
//! before a handler runs and check result shapes after it returns.

pub mod wrap;

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use crate::buf::Bytes;
use crate::errno::Errno;
use crate::time::TimeOrNow;
use crate::time::TimeSpec;
use crate::types::AccessMask;
use crate::types::Dev;
use crate::types::DirEntry;
use crate::types::FileAttr;
use crate::types::FileInfo;
use crate::types::Gid;
use crate::types::Ino;
use crate::types::Mode;
use crate::types::OpenFlags;
use crate::types::RenameFlags;
use crate::types::RequestContext;
use crate::types::SetattrValid;
use crate::types::Statvfs;
use crate::types::Uid;
use crate::types::Whence;
use crate::types::XattrSetFlags;

/// Result type for every handler.
pub type OpResult<T> = Result<T, Errno>;

/// Default entry/attribute cache lifetime handed to the kernel when a
/// handler does not choose one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// A lookup-style result: attributes plus the cache lifetimes the kernel
/// may hold them for. Returning one of these increments the kernel's
/// lookup count for the inode; `forget` balances it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Entry {
    /// Attributes of the found object.
    pub attr: FileAttr,
    /// Inode generation; bump it when an inode number is reused.
    pub generation: u64,
    /// How long the kernel may cache the name-to-inode binding.
    pub entry_ttl: Duration,
    /// How long the kernel may cache the attributes.
    pub attr_ttl: Duration,
}

impl Entry {
    /// An entry with the default cache lifetimes.
    pub fn new(attr: FileAttr) -> Entry {
        Entry {
            attr,
            generation: 0,
            entry_ttl: DEFAULT_TTL,
            attr_ttl: DEFAULT_TTL,
        }
    }
}

/// A getattr/setattr result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttrOut {
    /// Current attributes.
    pub attr: FileAttr,
    /// How long the kernel may cache them.
    pub ttl: Duration,
}

impl AttrOut {
    /// Attributes with the default cache lifetime.
    pub fn new(attr: FileAttr) -> AttrOut {
        AttrOut {
            attr,
            ttl: DEFAULT_TTL,
        }
    }
}

/// The fields a setattr request wants changed. `valid` says which members
/// are authoritative; the options mirror it for convenient matching.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SetattrChanges {
    /// New mode, when [`SetattrValid::MODE`] is set.
    pub mode: Option<Mode>,
    /// New owner.
    pub uid: Option<Uid>,
    /// New group.
    pub gid: Option<Gid>,
    /// New size (truncate/extend).
    pub size: Option<u64>,
    /// New access time, possibly "now".
    pub atime: Option<TimeOrNow>,
    /// New modification time, possibly "now".
    pub mtime: Option<TimeOrNow>,
    /// New change time.
    pub ctime: Option<TimeSpec>,
    /// The raw validity mask from the kernel.
    pub valid: SetattrValid,
}

/// One page of directory entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReaddirOut {
    /// Entries starting at the requested offset. For offset 0 the handler
    /// is expected to lead with `.` and `..`.
    pub entries: Vec<DirEntry>,
    /// False signals end-of-stream.
    pub has_more: bool,
    /// Where the next page starts, when entries do not carry their own
    /// resume tokens.
    pub next_offset: Option<u64>,
}

/// A getxattr result: either the attribute value or, for a zero-sized
/// probe, just its length.
#[derive(Clone, Debug, PartialEq)]
pub enum Xattr {
    /// Only the value length, replying to a `size == 0` probe.
    Size(u32),
    /// The attribute value.
    Data(Bytes<'static>),
}

/// Negotiated kernel connection parameters, snapshotted at `init` and
/// readable from the session afterwards. The `init` handler may lower the
/// buffer sizes before the reply goes out.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConnectionInfo {
    /// FUSE protocol major version spoken by the kernel.
    pub proto_major: u32,
    /// FUSE protocol minor version.
    pub proto_minor: u32,
    /// Capability bits offered by the kernel.
    pub capabilities: u32,
    /// Largest write payload the kernel will send.
    pub max_write: u32,
    /// Readahead ceiling.
    pub max_readahead: u32,
    /// Maximum queued background requests.
    pub max_background: u16,
    /// Queue depth at which the kernel considers us congested.
    pub congestion_threshold: u16,
}

/// The operations a userspace filesystem provides.
///
/// `lookup` and `getattr` are required: a filesystem that cannot resolve
/// names or describe inodes is not mountable. Everything else has a
/// default body returning `ENOSYS`, except the calls that have no reply
/// (`forget`) or no failure mode (`destroy`).
#[allow(unused_variables, clippy::too_many_arguments)]
pub trait FuseOps: Send + Sync + 'static {
    /// Negotiate connection parameters. Called once before any other
    /// operation; failing here aborts the mount.
    fn init(&self, conn: &mut ConnectionInfo) -> OpResult<()> {
        Ok(())
    }

    /// Final call before the session goes away.
    fn destroy(&self) {}

    /// Resolve `name` under `parent` and return its entry.
    fn lookup(&self, ctx: &RequestContext, parent: Ino, name: &OsStr) -> OpResult<Entry>;

    /// Balance `nlookup` previous lookups of `ino`. No reply is sent.
    fn forget(&self, ctx: &RequestContext, ino: Ino, nlookup: u64) {}

    /// Batched form of [`forget`](Self::forget).
    fn batch_forget(&self, ctx: &RequestContext, nodes: &[(Ino, u64)]) {
        for (ino, nlookup) in nodes {
            self.forget(ctx, *ino, *nlookup);
        }
    }

    /// Get attributes. `fi` is present only when the kernel asks in the
    /// context of an open file.
    fn getattr(&self, ctx: &RequestContext, ino: Ino, fi: Option<&FileInfo>) -> OpResult<AttrOut>;

    /// Change attributes selected by `changes.valid`.
    fn setattr(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        changes: &SetattrChanges,
        fi: Option<&FileInfo>,
    ) -> OpResult<AttrOut> {
        Err(Errno::ENOSYS)
    }

    /// Read the target of a symbolic link.
    fn readlink(&self, ctx: &RequestContext, ino: Ino) -> OpResult<OsString> {
        Err(Errno::ENOSYS)
    }

    /// Create a non-directory node (regular, device, fifo, socket).
    fn mknod(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &OsStr,
        mode: Mode,
        rdev: Dev,
    ) -> OpResult<Entry> {
        Err(Errno::ENOSYS)
    }

    /// Create a directory.
    fn mkdir(&self, ctx: &RequestContext, parent: Ino, name: &OsStr, mode: Mode) -> OpResult<Entry> {
        Err(Errno::ENOSYS)
    }

    /// Remove a file.
    fn unlink(&self, ctx: &RequestContext, parent: Ino, name: &OsStr) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Remove a directory. Must fail with `ENOTEMPTY` when the target
    /// still has entries beyond `.` and `..`.
    fn rmdir(&self, ctx: &RequestContext, parent: Ino, name: &OsStr) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Create a symbolic link at `parent/name` pointing at `target`.
    fn symlink(
        &self,
        ctx: &RequestContext,
        target: &Path,
        parent: Ino,
        name: &OsStr,
    ) -> OpResult<Entry> {
        Err(Errno::ENOSYS)
    }

    /// Rename, honouring `RENAME_NOREPLACE` and `RENAME_EXCHANGE`.
    fn rename(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &OsStr,
        newparent: Ino,
        newname: &OsStr,
        flags: RenameFlags,
    ) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Create a hard link. The returned entry reflects the bumped nlink.
    fn link(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        newparent: Ino,
        newname: &OsStr,
    ) -> OpResult<Entry> {
        Err(Errno::ENOSYS)
    }

    /// Open a file and assign a file handle.
    fn open(&self, ctx: &RequestContext, ino: Ino, flags: OpenFlags) -> OpResult<FileInfo> {
        Err(Errno::ENOSYS)
    }

    /// Read up to `size` bytes at `offset`. Short reads signal EOF; the
    /// result must never exceed `size`.
    fn read(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        offset: u64,
        size: u32,
        fi: &FileInfo,
    ) -> OpResult<Bytes<'static>> {
        Err(Errno::ENOSYS)
    }

    /// Write `data` at `offset`, returning the number of bytes accepted.
    /// Short writes are legal.
    fn write(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
        fi: &FileInfo,
        flags: OpenFlags,
    ) -> OpResult<usize> {
        Err(Errno::ENOSYS)
    }

    /// Called on every close(2) of a descriptor referencing this open.
    /// May run several times per open (dup'd descriptors).
    fn flush(&self, ctx: &RequestContext, ino: Ino, fi: &FileInfo) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Release an open file. Exactly one call per successful open.
    fn release(&self, ctx: &RequestContext, ino: Ino, fi: &FileInfo) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Synchronize file contents; metadata too unless `datasync`.
    fn fsync(&self, ctx: &RequestContext, ino: Ino, datasync: bool, fi: &FileInfo) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Open a directory stream.
    fn opendir(&self, ctx: &RequestContext, ino: Ino) -> OpResult<FileInfo> {
        Err(Errno::ENOSYS)
    }

    /// Return a page of directory entries starting at `offset`. For
    /// `offset == 0` the page should lead with `.` and `..`.
    fn readdir(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        offset: u64,
        fi: &FileInfo,
    ) -> OpResult<ReaddirOut> {
        Err(Errno::ENOSYS)
    }

    /// Release a directory stream. Exactly one call per opendir.
    fn releasedir(&self, ctx: &RequestContext, ino: Ino, fi: &FileInfo) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Synchronize directory contents.
    fn fsyncdir(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        datasync: bool,
        fi: &FileInfo,
    ) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Filesystem statistics.
    fn statfs(&self, ctx: &RequestContext, ino: Ino) -> OpResult<Statvfs> {
        Err(Errno::ENOSYS)
    }

    /// Set an extended attribute.
    fn setxattr(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        name: &OsStr,
        value: &[u8],
        flags: XattrSetFlags,
    ) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Get an extended attribute. A `size == 0` probe asks for the length
    /// only; when `size` is too small for the value, fail with `ERANGE`.
    fn getxattr(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        name: &OsStr,
        size: u32,
    ) -> OpResult<Xattr> {
        Err(Errno::ENOSYS)
    }

    /// List extended attribute names. The probe convention (`size == 0`,
    /// `ERANGE`) is applied by the binding; handlers just return the
    /// names.
    fn listxattr(&self, ctx: &RequestContext, ino: Ino) -> OpResult<Vec<OsString>> {
        Err(Errno::ENOSYS)
    }

    /// Remove an extended attribute.
    fn removexattr(&self, ctx: &RequestContext, ino: Ino, name: &OsStr) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Check access permissions. Not called when the session mounts with
    /// `default_permissions`.
    fn access(&self, ctx: &RequestContext, ino: Ino, mask: AccessMask) -> OpResult<()> {
        Err(Errno::ENOSYS)
    }

    /// Atomically create and open a file.
    fn create(
        &self,
        ctx: &RequestContext,
        parent: Ino,
        name: &OsStr,
        mode: Mode,
        flags: OpenFlags,
    ) -> OpResult<(Entry, FileInfo)> {
        Err(Errno::ENOSYS)
    }

    /// Copy a byte range between two of this filesystem's open files.
    /// `ENOSYS` makes the kernel fall back to read/write through the page
    /// cache.
    fn copy_file_range(
        &self,
        ctx: &RequestContext,
        ino_in: Ino,
        fi_in: &FileInfo,
        off_in: u64,
        ino_out: Ino,
        fi_out: &FileInfo,
        off_out: u64,
        len: u64,
        flags: u32,
    ) -> OpResult<u64> {
        Err(Errno::ENOSYS)
    }

    /// Reposition a file offset, including `SEEK_DATA`/`SEEK_HOLE`
    /// probes whose exact semantics follow the host kernel's lseek(2).
    fn lseek(
        &self,
        ctx: &RequestContext,
        ino: Ino,
        offset: u64,
        whence: Whence,
        fi: &FileInfo,
    ) -> OpResult<u64> {
        Err(Errno::ENOSYS)
    }
}
