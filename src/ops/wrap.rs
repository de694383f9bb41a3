//! Per-operation wrappers.
//!
//! One [`execute`] arm per FUSE operation: validate the typed inputs,
//! validate the request context, invoke the handler, then validate the
//! result shape. Validation failures never reach the handler; malformed
//! handler results surface as `EIO`. Neither path retries, the kernel does
//! that where it makes sense.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use log::warn;
use smallvec::SmallVec;

use crate::buf::Bytes;
use crate::errno::Errno;
use crate::ops::AttrOut;
use crate::ops::Entry;
use crate::ops::FuseOps;
use crate::ops::ReaddirOut;
use crate::ops::SetattrChanges;
use crate::ops::Xattr;
use crate::types::AccessMask;
use crate::types::Dev;
use crate::types::FileInfo;
use crate::types::Ino;
use crate::types::Mode;
use crate::types::OpType;
use crate::types::OpenFlags;
use crate::types::RenameFlags;
use crate::types::RequestContext;
use crate::types::Statvfs;
use crate::types::Whence;
use crate::types::XattrSetFlags;
use crate::validate;

/// Linux caps a single xattr value at 64 KiB.
const XATTR_SIZE_MAX: usize = 64 * 1024;

/// One dispatched operation with its owned arguments. Buffers are copied
/// out of the kernel request before queueing; the kernel reclaims its
/// buffer the moment the adapter callback returns.
#[allow(missing_docs)]
pub enum Operation {
    Lookup { parent: Ino, name: OsString },
    Forget { ino: Ino, nlookup: u64 },
    BatchForget { nodes: Vec<(Ino, u64)> },
    Getattr { ino: Ino, fi: Option<FileInfo> },
    Setattr { ino: Ino, changes: SetattrChanges, fi: Option<FileInfo> },
    Readlink { ino: Ino },
    Mknod { parent: Ino, name: OsString, mode: Mode, rdev: Dev },
    Mkdir { parent: Ino, name: OsString, mode: Mode },
    Unlink { parent: Ino, name: OsString },
    Rmdir { parent: Ino, name: OsString },
    Symlink { target: PathBuf, parent: Ino, name: OsString },
    Rename {
        parent: Ino,
        name: OsString,
        newparent: Ino,
        newname: OsString,
        flags: RenameFlags,
    },
    Link { ino: Ino, newparent: Ino, newname: OsString },
    Open { ino: Ino, flags: OpenFlags },
    Read { ino: Ino, offset: i64, size: u64, fi: FileInfo },
    Write { ino: Ino, data: Vec<u8>, offset: i64, fi: FileInfo, flags: OpenFlags },
    Flush { ino: Ino, fi: FileInfo },
    Release { ino: Ino, fi: FileInfo },
    Fsync { ino: Ino, datasync: bool, fi: FileInfo },
    Opendir { ino: Ino },
    Readdir { ino: Ino, offset: i64, fi: FileInfo },
    Releasedir { ino: Ino, fi: FileInfo },
    Fsyncdir { ino: Ino, datasync: bool, fi: FileInfo },
    Statfs { ino: Ino },
    Setxattr { ino: Ino, name: OsString, value: Vec<u8>, flags: i32 },
    Getxattr { ino: Ino, name: OsString, size: u32 },
    Listxattr { ino: Ino, size: u32 },
    Removexattr { ino: Ino, name: OsString },
    Access { ino: Ino, mask: AccessMask },
    Create { parent: Ino, name: OsString, mode: Mode, flags: OpenFlags },
    CopyFileRange {
        ino_in: Ino,
        fi_in: FileInfo,
        off_in: i64,
        ino_out: Ino,
        fi_out: FileInfo,
        off_out: i64,
        len: u64,
        flags: u32,
    },
    Lseek { ino: Ino, offset: i64, whence: i32, fi: FileInfo },
}

impl Operation {
    /// The operation tag.
    pub fn op_type(&self) -> OpType {
        match self {
            Operation::Lookup { .. } => OpType::Lookup,
            Operation::Forget { .. } | Operation::BatchForget { .. } => OpType::Forget,
            Operation::Getattr { .. } => OpType::Getattr,
            Operation::Setattr { .. } => OpType::Setattr,
            Operation::Readlink { .. } => OpType::Readlink,
            Operation::Mknod { .. } => OpType::Mknod,
            Operation::Mkdir { .. } => OpType::Mkdir,
            Operation::Unlink { .. } => OpType::Unlink,
            Operation::Rmdir { .. } => OpType::Rmdir,
            Operation::Symlink { .. } => OpType::Symlink,
            Operation::Rename { .. } => OpType::Rename,
            Operation::Link { .. } => OpType::Link,
            Operation::Open { .. } => OpType::Open,
            Operation::Read { .. } => OpType::Read,
            Operation::Write { .. } => OpType::Write,
            Operation::Flush { .. } => OpType::Flush,
            Operation::Release { .. } => OpType::Release,
            Operation::Fsync { .. } => OpType::Fsync,
            Operation::Opendir { .. } => OpType::Opendir,
            Operation::Readdir { .. } => OpType::Readdir,
            Operation::Releasedir { .. } => OpType::Releasedir,
            Operation::Fsyncdir { .. } => OpType::Fsyncdir,
            Operation::Statfs { .. } => OpType::Statfs,
            Operation::Setxattr { .. } => OpType::Setxattr,
            Operation::Getxattr { .. } => OpType::Getxattr,
            Operation::Listxattr { .. } => OpType::Listxattr,
            Operation::Removexattr { .. } => OpType::Removexattr,
            Operation::Access { .. } => OpType::Access,
            Operation::Create { .. } => OpType::Create,
            Operation::CopyFileRange { .. } => OpType::CopyFileRange,
            Operation::Lseek { .. } => OpType::Lseek,
        }
    }

    /// The inode dispatch ordering keys on: the target for inode ops, the
    /// parent for name ops.
    pub fn ordering_ino(&self) -> Ino {
        match self {
            Operation::Lookup { parent, .. }
            | Operation::Mknod { parent, .. }
            | Operation::Mkdir { parent, .. }
            | Operation::Unlink { parent, .. }
            | Operation::Rmdir { parent, .. }
            | Operation::Symlink { parent, .. }
            | Operation::Rename { parent, .. }
            | Operation::Create { parent, .. } => *parent,
            Operation::Forget { ino, .. }
            | Operation::Getattr { ino, .. }
            | Operation::Setattr { ino, .. }
            | Operation::Readlink { ino }
            | Operation::Link { ino, .. }
            | Operation::Open { ino, .. }
            | Operation::Read { ino, .. }
            | Operation::Write { ino, .. }
            | Operation::Flush { ino, .. }
            | Operation::Release { ino, .. }
            | Operation::Fsync { ino, .. }
            | Operation::Opendir { ino }
            | Operation::Readdir { ino, .. }
            | Operation::Releasedir { ino, .. }
            | Operation::Fsyncdir { ino, .. }
            | Operation::Statfs { ino }
            | Operation::Setxattr { ino, .. }
            | Operation::Getxattr { ino, .. }
            | Operation::Listxattr { ino, .. }
            | Operation::Removexattr { ino, .. }
            | Operation::Access { ino, .. }
            | Operation::Lseek { ino, .. } => *ino,
            Operation::CopyFileRange { ino_out, .. } => *ino_out,
            Operation::BatchForget { .. } => Ino(0),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Write { ino, data, offset, fi, .. } => write!(
                f,
                "write(ino: {ino}, fh: {}, offset: {offset}, data.len(): {})",
                fi.fh,
                data.len()
            ),
            Operation::Read { ino, offset, size, fi } => {
                write!(f, "read(ino: {ino}, fh: {}, offset: {offset}, size: {size})", fi.fh)
            }
            Operation::Lookup { parent, name } => {
                write!(f, "lookup(parent: {parent}, name: {name:?})")
            }
            Operation::Setxattr { ino, name, value, flags } => write!(
                f,
                "setxattr(ino: {ino}, name: {name:?}, value.len(): {}, flags: {flags:#x})",
                value.len()
            ),
            other => write!(f, "{}", other.op_type()),
        }
    }
}

/// The typed result of a completed operation, matched with the reply the
/// adapter owes the kernel.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum Outcome {
    /// Empty reply for unit operations.
    Unit,
    /// No reply at all (`forget`).
    NoReply,
    Entry(Entry),
    Attr(AttrOut),
    LinkTarget(OsString),
    Opened(FileInfo),
    Created(Entry, FileInfo),
    Data(Bytes<'static>),
    Written(usize),
    Dir(ReaddirOut),
    Fs(Statvfs),
    Xattr(Xattr),
    Seek(u64),
    Copied(u64),
}

/// Runs one operation through its wrapper.
pub fn execute(
    ops: &dyn FuseOps,
    ctx: &RequestContext,
    op: &Operation,
) -> Result<Outcome, Errno> {
    // Forget traffic originates inside the kernel and may carry a zero
    // pid; it also has no reply to carry an error anyway.
    if !matches!(
        op,
        Operation::Forget { .. } | Operation::BatchForget { .. }
    ) {
        validate::context(ctx)?;
    }
    match op {
        Operation::Lookup { parent, name } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            // Unlike the create-style entries, lookup may return ino 0: a
            // negative entry whose absence the kernel caches for
            // `entry_ttl`.
            ops.lookup(ctx, *parent, name).map(Outcome::Entry)
        }
        Operation::Forget { ino, nlookup } => {
            ops.forget(ctx, *ino, *nlookup);
            Ok(Outcome::NoReply)
        }
        Operation::BatchForget { nodes } => {
            ops.batch_forget(ctx, nodes);
            Ok(Outcome::NoReply)
        }
        Operation::Getattr { ino, fi } => {
            validate::ino(*ino)?;
            ops.getattr(ctx, *ino, fi.as_ref()).and_then(check_attr)
        }
        Operation::Setattr { ino, changes, fi } => {
            validate::ino(*ino)?;
            check_setattr_changes(changes)?;
            ops.setattr(ctx, *ino, changes, fi.as_ref())
                .and_then(check_attr)
        }
        Operation::Readlink { ino } => {
            validate::ino(*ino)?;
            let target = ops.readlink(ctx, *ino)?;
            if target.is_empty() || target.as_bytes().len() > validate::MAX_PATH_LEN {
                return malformed("readlink", "empty or oversized target");
            }
            Ok(Outcome::LinkTarget(target))
        }
        Operation::Mknod { parent, name, mode, rdev } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            validate::mode_not_directory(*mode)?;
            ops.mknod(ctx, *parent, name, *mode, *rdev).and_then(check_entry)
        }
        Operation::Mkdir { parent, name, mode } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            validate::mode_directory(*mode)?;
            ops.mkdir(ctx, *parent, name, *mode).and_then(check_entry)
        }
        Operation::Unlink { parent, name } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            ops.unlink(ctx, *parent, name).map(|()| Outcome::Unit)
        }
        Operation::Rmdir { parent, name } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            ops.rmdir(ctx, *parent, name).map(|()| Outcome::Unit)
        }
        Operation::Symlink { target, parent, name } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            validate::link_target(target)?;
            ops.symlink(ctx, target, *parent, name).and_then(check_entry)
        }
        Operation::Rename { parent, name, newparent, newname, flags } => {
            validate::ino(*parent)?;
            validate::ino(*newparent)?;
            validate::name(name)?;
            validate::name(newname)?;
            if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE) {
                return Err(Errno::EINVAL);
            }
            ops.rename(ctx, *parent, name, *newparent, newname, *flags)
                .map(|()| Outcome::Unit)
        }
        Operation::Link { ino, newparent, newname } => {
            validate::ino(*ino)?;
            validate::ino(*newparent)?;
            validate::name(newname)?;
            ops.link(ctx, *ino, *newparent, newname).and_then(check_entry)
        }
        Operation::Open { ino, flags } => {
            validate::ino(*ino)?;
            ops.open(ctx, *ino, *flags).map(Outcome::Opened)
        }
        Operation::Read { ino, offset, size, fi } => {
            validate::ino(*ino)?;
            let offset = validate::offset(*offset)?;
            let size = validate::size(*size)?;
            let data = ops.read(ctx, *ino, offset, size as u32, fi)?;
            if data.len() > size {
                return malformed("read", "returned more bytes than requested");
            }
            Ok(Outcome::Data(data))
        }
        Operation::Write { ino, data, offset, fi, flags } => {
            validate::ino(*ino)?;
            let offset = validate::offset(*offset)?;
            validate::size(data.len() as u64)?;
            let written = ops.write(ctx, *ino, data, offset, fi, *flags)?;
            if written > data.len() {
                return malformed("write", "claimed to write more than was supplied");
            }
            Ok(Outcome::Written(written))
        }
        Operation::Flush { ino, fi } => {
            validate::ino(*ino)?;
            ops.flush(ctx, *ino, fi).map(|()| Outcome::Unit)
        }
        Operation::Release { ino, fi } => {
            validate::ino(*ino)?;
            ops.release(ctx, *ino, fi).map(|()| Outcome::Unit)
        }
        Operation::Fsync { ino, datasync, fi } => {
            validate::ino(*ino)?;
            ops.fsync(ctx, *ino, *datasync, fi).map(|()| Outcome::Unit)
        }
        Operation::Opendir { ino } => {
            validate::ino(*ino)?;
            ops.opendir(ctx, *ino).map(Outcome::Opened)
        }
        Operation::Readdir { ino, offset, fi } => {
            validate::ino(*ino)?;
            let offset = validate::offset(*offset)?;
            let page = ops.readdir(ctx, *ino, offset, fi)?;
            check_readdir_page(&page)?;
            Ok(Outcome::Dir(page))
        }
        Operation::Releasedir { ino, fi } => {
            validate::ino(*ino)?;
            ops.releasedir(ctx, *ino, fi).map(|()| Outcome::Unit)
        }
        Operation::Fsyncdir { ino, datasync, fi } => {
            validate::ino(*ino)?;
            ops.fsyncdir(ctx, *ino, *datasync, fi).map(|()| Outcome::Unit)
        }
        Operation::Statfs { ino } => {
            validate::ino(*ino)?;
            let st = ops.statfs(ctx, *ino)?;
            if st.bsize == 0 || st.frsize == 0 {
                return malformed("statfs", "zero block size");
            }
            Ok(Outcome::Fs(st))
        }
        Operation::Setxattr { ino, name, value, flags } => {
            validate::ino(*ino)?;
            validate::xattr_name(name)?;
            if value.len() > XATTR_SIZE_MAX {
                return Err(Errno::E2BIG);
            }
            let flags = XattrSetFlags::try_from(*flags).map_err(|_| Errno::EINVAL)?;
            ops.setxattr(ctx, *ino, name, value, flags).map(|()| Outcome::Unit)
        }
        Operation::Getxattr { ino, name, size } => {
            validate::ino(*ino)?;
            validate::xattr_name(name)?;
            match ops.getxattr(ctx, *ino, name, *size)? {
                Xattr::Size(n) => Ok(Outcome::Xattr(Xattr::Size(n))),
                Xattr::Data(data) => {
                    if *size == 0 {
                        // Handlers may ignore the probe; answer it for them.
                        Ok(Outcome::Xattr(Xattr::Size(data.len() as u32)))
                    } else if data.len() > *size as usize {
                        Err(Errno::ERANGE)
                    } else {
                        Ok(Outcome::Xattr(Xattr::Data(data)))
                    }
                }
            }
        }
        Operation::Listxattr { ino, size } => {
            validate::ino(*ino)?;
            let names = ops.listxattr(ctx, *ino)?;
            // NUL-separated concatenation; nearly always fits inline.
            let mut packed = SmallVec::<[u8; 256]>::new();
            for name in &names {
                if validate::xattr_name(name).is_err() {
                    return malformed("listxattr", "invalid attribute name");
                }
                packed.extend_from_slice(name.as_bytes());
                packed.push(0);
            }
            let total = packed.len() as u32;
            if *size == 0 {
                Ok(Outcome::Xattr(Xattr::Size(total)))
            } else if total > *size {
                Err(Errno::ERANGE)
            } else {
                Ok(Outcome::Xattr(Xattr::Data(Bytes::Owned(packed.into_vec()))))
            }
        }
        Operation::Removexattr { ino, name } => {
            validate::ino(*ino)?;
            validate::xattr_name(name)?;
            ops.removexattr(ctx, *ino, name).map(|()| Outcome::Unit)
        }
        Operation::Access { ino, mask } => {
            validate::ino(*ino)?;
            ops.access(ctx, *ino, *mask).map(|()| Outcome::Unit)
        }
        Operation::Create { parent, name, mode, flags } => {
            validate::ino(*parent)?;
            validate::name(name)?;
            validate::mode_not_directory(*mode)?;
            let (entry, fi) = ops.create(ctx, *parent, name, *mode, *flags)?;
            if entry.attr.ino.0 == 0 {
                return malformed("create", "entry without an inode");
            }
            Ok(Outcome::Created(entry, fi))
        }
        Operation::CopyFileRange {
            ino_in,
            fi_in,
            off_in,
            ino_out,
            fi_out,
            off_out,
            len,
            flags,
        } => {
            validate::ino(*ino_in)?;
            validate::ino(*ino_out)?;
            let off_in = validate::offset(*off_in)?;
            let off_out = validate::offset(*off_out)?;
            let copied = ops.copy_file_range(
                ctx, *ino_in, fi_in, off_in, *ino_out, fi_out, off_out, *len, *flags,
            )?;
            if copied > *len {
                return malformed("copy_file_range", "copied more than requested");
            }
            Ok(Outcome::Copied(copied))
        }
        Operation::Lseek { ino, offset, whence, fi } => {
            validate::ino(*ino)?;
            let offset = validate::offset(*offset)?;
            let whence = Whence::try_from(*whence).map_err(|_| Errno::EINVAL)?;
            ops.lseek(ctx, *ino, offset, whence, fi).map(Outcome::Seek)
        }
    }
}

fn malformed(op: &str, what: &str) -> Result<Outcome, Errno> {
    warn!("{op} handler returned a malformed result: {what}");
    Err(Errno::EIO)
}

fn check_entry(entry: Entry) -> Result<Outcome, Errno> {
    if entry.attr.ino.0 == 0 {
        return malformed("create-style", "entry without an inode");
    }
    Ok(Outcome::Entry(entry))
}

fn check_attr(out: AttrOut) -> Result<Outcome, Errno> {
    if out.attr.ino.0 == 0 {
        return malformed("getattr", "attributes without an inode");
    }
    Ok(Outcome::Attr(out))
}

fn check_setattr_changes(changes: &SetattrChanges) -> Result<(), Errno> {
    use crate::types::SetattrValid as V;
    let v = changes.valid;
    let consistent = (!v.contains(V::MODE) || changes.mode.is_some())
        && (!v.contains(V::UID) || changes.uid.is_some())
        && (!v.contains(V::GID) || changes.gid.is_some())
        && (!v.contains(V::SIZE) || changes.size.is_some())
        && (!v.intersects(V::ATIME | V::ATIME_NOW) || changes.atime.is_some())
        && (!v.intersects(V::MTIME | V::MTIME_NOW) || changes.mtime.is_some());
    if !consistent {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

fn check_readdir_page(page: &ReaddirOut) -> Result<(), Errno> {
    for entry in &page.entries {
        let bytes = entry.name.as_bytes();
        // `.` and `..` are legal (required, even) in readdir output.
        if bytes.is_empty()
            || bytes.len() > validate::MAX_NAME_LEN
            || memchr::memchr2(0, b'/', bytes).is_some()
        {
            warn!("readdir handler produced an invalid entry name");
            return Err(Errno::EIO);
        }
        if entry.ino.0 == 0 {
            warn!("readdir handler produced an entry without an inode");
            return Err(Errno::EIO);
        }
    }
    Ok(())
}
