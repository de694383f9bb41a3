//! The wire data model: branded integer types, stat records, directory
//! entries and per-open state.
//!
//! Every 64-bit id the kernel hands us gets its own newtype so an inode
//! number cannot be passed where a file handle belongs. The records mirror
//! POSIX `stat`/`statvfs` with the encodings fixed by the FUSE ABI.

use std::ffi::OsString;
use std::fmt;

use bitflags::bitflags;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::time::TimeSpec;

/// An inode number. The consumer filesystem allocates these; the binding
/// only requires them to be non-zero. Ino 1 is the filesystem root.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Ino(pub u64);

/// The root inode, fixed by the FUSE protocol.
pub const ROOT_INO: Ino = Ino(1);

impl Ino {
    /// True for the filesystem root.
    pub const fn is_root(self) -> bool {
        self.0 == ROOT_INO.0
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Ino {
    fn from(value: u64) -> Ino {
        Ino(value)
    }
}

/// A file handle, assigned by the consumer at `open`/`create`/`opendir`
/// and threaded through every operation on that open instance. Opaque to
/// the binding except as a write-queue key.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Fd(pub u64);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Fd {
    fn from(value: u64) -> Fd {
        Fd(value)
    }
}

/// A user id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Uid(pub u32);

/// A group id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Gid(pub u32);

/// A process id.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Pid(pub u32);

/// A device number (`st_rdev`), encoded the Linux way.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Dev(pub u64);

/// File types, tagged with their `d_type` directory-entry codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FileType {
    /// Type not known to the filesystem (`DT_UNKNOWN`)
    Unknown = 0,
    /// Named pipe (`S_IFIFO`)
    NamedPipe = 1,
    /// Character device (`S_IFCHR`)
    CharDevice = 2,
    /// Directory (`S_IFDIR`)
    Directory = 4,
    /// Block device (`S_IFBLK`)
    BlockDevice = 6,
    /// Regular file (`S_IFREG`)
    RegularFile = 8,
    /// Symbolic link (`S_IFLNK`)
    Symlink = 10,
    /// Unix domain socket (`S_IFSOCK`)
    Socket = 12,
}

impl FileType {
    /// The `S_IF*` bits for this type, `0` for `Unknown`.
    pub const fn as_mode_bits(self) -> u32 {
        // d_type codes are the S_IFMT bits shifted right by 12.
        (self as u32) << 12
    }
}

/// A `st_mode` word: file-type bits plus permission bits.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Mode(pub u32);

impl Mode {
    /// Permission bits plus setuid/setgid/sticky.
    pub const PERM_MASK: u32 = 0o7777;

    /// Builds a mode from a file type and permission bits.
    pub const fn from_parts(kind: FileType, perm: u32) -> Mode {
        Mode(kind.as_mode_bits() | (perm & Mode::PERM_MASK))
    }

    /// The file-type portion.
    pub fn file_type(self) -> FileType {
        FileType::try_from(((self.0 & libc::S_IFMT) >> 12) as u8).unwrap_or(FileType::Unknown)
    }

    /// The permission portion (including setuid/setgid/sticky).
    pub const fn permissions(self) -> u32 {
        self.0 & Mode::PERM_MASK
    }

    /// True when the type bits say directory.
    pub const fn is_dir(self) -> bool {
        self.0 & libc::S_IFMT == libc::S_IFDIR
    }

    /// True when the type bits say regular file.
    pub const fn is_reg(self) -> bool {
        self.0 & libc::S_IFMT == libc::S_IFREG
    }

    /// True when any file-type bits are present.
    pub const fn has_type_bits(self) -> bool {
        self.0 & libc::S_IFMT != 0
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#o}", self.0)
    }
}

impl From<u32> for Mode {
    fn from(value: u32) -> Mode {
        Mode(value)
    }
}

bitflags! {
    /// POSIX open(2) flags, as the kernel delivers them.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct OpenFlags: u32 {
        /// Open write-only.
        const WRONLY = libc::O_WRONLY as u32;
        /// Open read-write.
        const RDWR = libc::O_RDWR as u32;
        /// Create if absent.
        const CREAT = libc::O_CREAT as u32;
        /// Fail if it already exists (with `CREAT`).
        const EXCL = libc::O_EXCL as u32;
        /// Truncate on open.
        const TRUNC = libc::O_TRUNC as u32;
        /// Every write appends.
        const APPEND = libc::O_APPEND as u32;
        /// Non-blocking I/O.
        const NONBLOCK = libc::O_NONBLOCK as u32;
        /// Synchronous writes.
        const SYNC = libc::O_SYNC as u32;
        /// Bypass the page cache.
        const DIRECT = libc::O_DIRECT as u32;
        /// Fail unless the target is a directory.
        const DIRECTORY = libc::O_DIRECTORY as u32;
        /// Do not follow a trailing symlink.
        const NOFOLLOW = libc::O_NOFOLLOW as u32;

        // Unknown bits are forwarded untouched.
        const _ = !0;
    }
}

impl OpenFlags {
    /// The access mode: `O_RDONLY`, `O_WRONLY` or `O_RDWR`.
    pub fn access_mode(self) -> AccessMode {
        match self.bits() as i32 & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::WriteOnly,
            libc::O_RDWR => AccessMode::ReadWrite,
            _ => AccessMode::ReadOnly,
        }
    }

    /// True when the flags permit writing.
    pub fn writable(self) -> bool {
        self.access_mode() != AccessMode::ReadOnly
    }
}

/// The three-way open(2) access mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// `O_RDONLY`
    ReadOnly,
    /// `O_WRONLY`
    WriteOnly,
    /// `O_RDWR`
    ReadWrite,
}

bitflags! {
    /// rename(2) flags. Unknown bits are accepted and forwarded to the
    /// handler untouched.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct RenameFlags: u32 {
        /// Fail with `EEXIST` instead of replacing the target.
        const NOREPLACE = 1;
        /// Atomically exchange source and target.
        const EXCHANGE = 2;

        const _ = !0;
    }
}

bitflags! {
    /// access(2) permission mask. `F_OK` is the empty mask.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct AccessMask: u32 {
        /// Execute permission.
        const X_OK = libc::X_OK as u32;
        /// Write permission.
        const W_OK = libc::W_OK as u32;
        /// Read permission.
        const R_OK = libc::R_OK as u32;
    }
}

bitflags! {
    /// Which fields of a setattr request are authoritative. Matches the
    /// kernel's `FATTR_*` encoding.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct SetattrValid: u32 {
        /// `mode` is set.
        const MODE = 1 << 0;
        /// `uid` is set.
        const UID = 1 << 1;
        /// `gid` is set.
        const GID = 1 << 2;
        /// `size` is set.
        const SIZE = 1 << 3;
        /// `atime` is set.
        const ATIME = 1 << 4;
        /// `mtime` is set.
        const MTIME = 1 << 5;
        /// An open file handle accompanies the request.
        const FH = 1 << 6;
        /// Set atime to the current time.
        const ATIME_NOW = 1 << 7;
        /// Set mtime to the current time.
        const MTIME_NOW = 1 << 8;
        /// `ctime` is set.
        const CTIME = 1 << 10;
    }
}

/// setxattr(2) dispositions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum XattrSetFlags {
    /// Create or replace.
    #[default]
    Any = 0,
    /// Fail with `EEXIST` if the attribute exists (`XATTR_CREATE`).
    CreateOnly = libc::XATTR_CREATE,
    /// Fail with `ENODATA` if the attribute is absent (`XATTR_REPLACE`).
    ReplaceOnly = libc::XATTR_REPLACE,
}

/// lseek(2) origins, including the data/hole probes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum Whence {
    /// From the start of the file.
    Set = libc::SEEK_SET,
    /// From the current position.
    Cur = libc::SEEK_CUR,
    /// From the end of the file.
    End = libc::SEEK_END,
    /// To the next data region at or after the offset.
    Data = libc::SEEK_DATA,
    /// To the next hole at or after the offset.
    Hole = libc::SEEK_HOLE,
}

/// File attributes, as returned by `getattr` and embedded in lookup
/// entries. The mode word carries both the file type and the permissions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileAttr {
    /// Inode number
    pub ino: Ino,
    /// File type and permissions
    pub mode: Mode,
    /// Number of hard links
    pub nlink: u32,
    /// Owning user
    pub uid: Uid,
    /// Owning group
    pub gid: Gid,
    /// Device number, for block/char device nodes
    pub rdev: Dev,
    /// Size in bytes
    pub size: u64,
    /// Preferred I/O block size
    pub blksize: u32,
    /// Allocated 512-byte blocks
    pub blocks: u64,
    /// Last access
    pub atime: TimeSpec,
    /// Last content modification
    pub mtime: TimeSpec,
    /// Last status change
    pub ctime: TimeSpec,
    /// Creation time, where the filesystem records one
    pub birthtime: Option<TimeSpec>,
}

impl FileAttr {
    /// A minimal attribute record for the given inode and mode; times at
    /// the epoch, one link, root ownership.
    pub fn simple(ino: Ino, mode: Mode) -> FileAttr {
        FileAttr {
            ino,
            mode,
            nlink: 1,
            uid: Uid(0),
            gid: Gid(0),
            rdev: Dev(0),
            size: 0,
            blksize: 4096,
            blocks: 0,
            atime: TimeSpec::EPOCH,
            mtime: TimeSpec::EPOCH,
            ctime: TimeSpec::EPOCH,
            birthtime: None,
        }
    }
}

/// Filesystem statistics (`statvfs`). All capacity fields are 64-bit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Statvfs {
    /// Filesystem block size
    pub bsize: u32,
    /// Fundamental block size (capacity fields count these)
    pub frsize: u32,
    /// Total blocks
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to unprivileged users
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Free inodes available to unprivileged users
    pub favail: u64,
    /// Filesystem id
    pub fsid: u64,
    /// Mount flags
    pub flag: u32,
    /// Maximum filename length
    pub namemax: u32,
}

impl Default for Statvfs {
    fn default() -> Statvfs {
        // The neutral reply libfuse gives for an unimplemented statfs.
        Statvfs {
            bsize: 512,
            frsize: 512,
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            favail: 0,
            fsid: 0,
            flag: 0,
            namemax: 255,
        }
    }
}

/// One directory entry as produced by a `readdir` handler.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct DirEntry {
    /// Entry name, without any path separators
    pub name: OsString,
    /// Inode of the named object
    pub ino: Ino,
    /// File type, `Unknown` when the filesystem cannot say cheaply
    pub kind: FileType,
    /// Opaque resume token: the offset at which a subsequent `readdir`
    /// continues after this entry. Threaded back verbatim.
    pub next_offset: Option<u64>,
}

impl DirEntry {
    /// Convenience constructor without a resume token.
    pub fn new(name: impl Into<OsString>, ino: Ino, kind: FileType) -> DirEntry {
        DirEntry {
            name: name.into(),
            ino,
            kind,
            next_offset: None,
        }
    }
}

/// Per-open state, created at `open`/`create`/`opendir` and threaded
/// through every subsequent operation on the same open instance. The
/// boolean knobs translate to the kernel's `fuse_file_info` reply bits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    /// Consumer-assigned file handle
    pub fh: Fd,
    /// Flags the file was opened with
    pub flags: OpenFlags,
    /// Bypass the kernel page cache for this open
    pub direct_io: bool,
    /// Keep previously cached pages on open
    pub keep_cache: bool,
    /// The kernel should invoke `flush` on close
    pub flush: bool,
    /// The file is not seekable
    pub nonseekable: bool,
    /// Cache readdir results in the kernel
    pub cache_readdir: bool,
    /// Allow parallel direct writes on this open
    pub parallel_direct_writes: bool,
}

impl FileInfo {
    /// A file-info with the given handle and flags, all knobs off.
    pub fn with_fh(fh: Fd, flags: OpenFlags) -> FileInfo {
        FileInfo {
            fh,
            flags,
            ..FileInfo::default()
        }
    }
}

impl Default for Fd {
    fn default() -> Fd {
        Fd(0)
    }
}

/// The identity of the process behind one kernel request. Captured from
/// the request header by the adapter; immutable for the request lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct RequestContext {
    /// Caller's effective uid
    pub uid: Uid,
    /// Caller's effective gid
    pub gid: Gid,
    /// Caller's process id
    pub pid: Pid,
    /// Caller's umask, meaningful for create-type operations
    pub umask: Mode,
}

impl RequestContext {
    /// A root-owned context, used in tests and for internally generated
    /// requests.
    pub fn root() -> RequestContext {
        RequestContext {
            uid: Uid(0),
            gid: Gid(0),
            pid: Pid(1),
            umask: Mode(0),
        }
    }
}

/// Tags for every operation the binding dispatches.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[allow(missing_docs)]
pub enum OpType {
    Init,
    Destroy,
    Lookup,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Statfs,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
    Access,
    Create,
    CopyFileRange,
    Lseek,
}

impl OpType {
    /// The lower-case syscall-style name.
    pub const fn as_str(self) -> &'static str {
        match self {
            OpType::Init => "init",
            OpType::Destroy => "destroy",
            OpType::Lookup => "lookup",
            OpType::Forget => "forget",
            OpType::Getattr => "getattr",
            OpType::Setattr => "setattr",
            OpType::Readlink => "readlink",
            OpType::Mknod => "mknod",
            OpType::Mkdir => "mkdir",
            OpType::Unlink => "unlink",
            OpType::Rmdir => "rmdir",
            OpType::Symlink => "symlink",
            OpType::Rename => "rename",
            OpType::Link => "link",
            OpType::Open => "open",
            OpType::Read => "read",
            OpType::Write => "write",
            OpType::Flush => "flush",
            OpType::Release => "release",
            OpType::Fsync => "fsync",
            OpType::Opendir => "opendir",
            OpType::Readdir => "readdir",
            OpType::Releasedir => "releasedir",
            OpType::Fsyncdir => "fsyncdir",
            OpType::Statfs => "statfs",
            OpType::Setxattr => "setxattr",
            OpType::Getxattr => "getxattr",
            OpType::Listxattr => "listxattr",
            OpType::Removexattr => "removexattr",
            OpType::Access => "access",
            OpType::Create => "create",
            OpType::CopyFileRange => "copy_file_range",
            OpType::Lseek => "lseek",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
