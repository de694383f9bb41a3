//! POSIX errno registry.
//!
//! Handlers and the dispatcher speak [`Errno`]: a non-zero POSIX error
//! number. The registry maps names to codes and back, carries the canonical
//! message strings, classifies errors, and knows which errors each FUSE
//! operation is expected to produce.
//!
//! On the wire between the binding and the kernel every error is a negative
//! integer; success is 0. [`Errno`] stores the positive magnitude (the way
//! `libc` spells the constants) and [`Errno::to_wire`] negates it.

use std::fmt;
use std::io;
use std::num::NonZeroI32;

#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::types::OpType;

/// A POSIX error number. Always non-zero; success is expressed as `Ok(..)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Errno(NonZeroI32);

/// Name returned by [`code_to_name`] for codes outside the registry.
pub const UNKNOWN_NAME: &str = "UNKNOWN";

macro_rules! errno_registry {
    ($($name:ident => $msg:literal,)+) => {
        #[allow(missing_docs)]
        impl Errno {
            $(pub const $name: Errno = Errno::from_raw(libc::$name);)+
        }

        /// `(code, name, message)` triples in canonical order. Aliases
        /// (`EWOULDBLOCK`, `EDEADLOCK`, `ENOTSUP`) appear after their
        /// canonical entry, so reverse lookup yields the canonical name.
        const REGISTRY: &[(i32, &str, &str)] = &[
            $((libc::$name, stringify!($name), $msg),)+
        ];
    };
}

// Same set the moreutils errno tool enumerates; everything the Linux kernel
// can hand a FUSE daemon.
errno_registry! {
    EPERM => "Operation not permitted",
    ENOENT => "No such file or directory",
    ESRCH => "No such process",
    EINTR => "Interrupted system call",
    EIO => "Input/output error",
    ENXIO => "No such device or address",
    E2BIG => "Argument list too long",
    ENOEXEC => "Exec format error",
    EBADF => "Bad file descriptor",
    ECHILD => "No child processes",
    EAGAIN => "Resource temporarily unavailable",
    EWOULDBLOCK => "Resource temporarily unavailable",
    ENOMEM => "Cannot allocate memory",
    EACCES => "Permission denied",
    EFAULT => "Bad address",
    ENOTBLK => "Block device required",
    EBUSY => "Device or resource busy",
    EEXIST => "File exists",
    EXDEV => "Invalid cross-device link",
    ENODEV => "No such device",
    ENOTDIR => "Not a directory",
    EISDIR => "Is a directory",
    EINVAL => "Invalid argument",
    ENFILE => "Too many open files in system",
    EMFILE => "Too many open files",
    ENOTTY => "Inappropriate ioctl for device",
    ETXTBSY => "Text file busy",
    EFBIG => "File too large",
    ENOSPC => "No space left on device",
    ESPIPE => "Illegal seek",
    EROFS => "Read-only file system",
    EMLINK => "Too many links",
    EPIPE => "Broken pipe",
    EDOM => "Numerical argument out of domain",
    ERANGE => "Numerical result out of range",
    EDEADLK => "Resource deadlock avoided",
    EDEADLOCK => "Resource deadlock avoided",
    ENAMETOOLONG => "File name too long",
    ENOLCK => "No locks available",
    ENOSYS => "Function not implemented",
    ENOTEMPTY => "Directory not empty",
    ELOOP => "Too many levels of symbolic links",
    ENOMSG => "No message of desired type",
    EIDRM => "Identifier removed",
    ECHRNG => "Channel number out of range",
    EL2NSYNC => "Level 2 not synchronized",
    EL3HLT => "Level 3 halted",
    EL3RST => "Level 3 reset",
    ELNRNG => "Link number out of range",
    EUNATCH => "Protocol driver not attached",
    ENOCSI => "No CSI structure available",
    EL2HLT => "Level 2 halted",
    EBADE => "Invalid exchange",
    EBADR => "Invalid request descriptor",
    EXFULL => "Exchange full",
    ENOANO => "No anode",
    EBADRQC => "Invalid request code",
    EBADSLT => "Invalid slot",
    EBFONT => "Bad font file format",
    ENOSTR => "Device not a stream",
    ENODATA => "No data available",
    ETIME => "Timer expired",
    ENOSR => "Out of streams resources",
    ENONET => "Machine is not on the network",
    ENOPKG => "Package not installed",
    EREMOTE => "Object is remote",
    ENOLINK => "Link has been severed",
    EADV => "Advertise error",
    ESRMNT => "Srmount error",
    ECOMM => "Communication error on send",
    EPROTO => "Protocol error",
    EMULTIHOP => "Multihop attempted",
    EDOTDOT => "RFS specific error",
    EBADMSG => "Bad message",
    EOVERFLOW => "Value too large for defined data type",
    ENOTUNIQ => "Name not unique on network",
    EBADFD => "File descriptor in bad state",
    EREMCHG => "Remote address changed",
    ELIBACC => "Can not access a needed shared library",
    ELIBBAD => "Accessing a corrupted shared library",
    ELIBSCN => ".lib section in a.out corrupted",
    ELIBMAX => "Attempting to link in too many shared libraries",
    ELIBEXEC => "Cannot exec a shared library directly",
    EILSEQ => "Invalid or incomplete multibyte or wide character",
    ERESTART => "Interrupted system call should be restarted",
    ESTRPIPE => "Streams pipe error",
    EUSERS => "Too many users",
    ENOTSOCK => "Socket operation on non-socket",
    EDESTADDRREQ => "Destination address required",
    EMSGSIZE => "Message too long",
    EPROTOTYPE => "Protocol wrong type for socket",
    ENOPROTOOPT => "Protocol not available",
    EPROTONOSUPPORT => "Protocol not supported",
    ESOCKTNOSUPPORT => "Socket type not supported",
    EOPNOTSUPP => "Operation not supported",
    ENOTSUP => "Operation not supported",
    EPFNOSUPPORT => "Protocol family not supported",
    EAFNOSUPPORT => "Address family not supported by protocol",
    EADDRINUSE => "Address already in use",
    EADDRNOTAVAIL => "Cannot assign requested address",
    ENETDOWN => "Network is down",
    ENETUNREACH => "Network is unreachable",
    ENETRESET => "Network dropped connection on reset",
    ECONNABORTED => "Software caused connection abort",
    ECONNRESET => "Connection reset by peer",
    ENOBUFS => "No buffer space available",
    EISCONN => "Transport endpoint is already connected",
    ENOTCONN => "Transport endpoint is not connected",
    ESHUTDOWN => "Cannot send after transport endpoint shutdown",
    ETOOMANYREFS => "Too many references: cannot splice",
    ETIMEDOUT => "Connection timed out",
    ECONNREFUSED => "Connection refused",
    EHOSTDOWN => "Host is down",
    EHOSTUNREACH => "No route to host",
    EALREADY => "Operation already in progress",
    EINPROGRESS => "Operation now in progress",
    ESTALE => "Stale file handle",
    EUCLEAN => "Structure needs cleaning",
    ENOTNAM => "Not a XENIX named type file",
    ENAVAIL => "No XENIX semaphores available",
    EISNAM => "Is a named type file",
    EREMOTEIO => "Remote I/O error",
    EDQUOT => "Disk quota exceeded",
    ENOMEDIUM => "No medium found",
    EMEDIUMTYPE => "Wrong medium type",
    ECANCELED => "Operation canceled",
    ENOKEY => "Required key not available",
    EKEYEXPIRED => "Key has expired",
    EKEYREVOKED => "Key has been revoked",
    EKEYREJECTED => "Key was rejected by service",
    EOWNERDEAD => "Owner died",
    ENOTRECOVERABLE => "State not recoverable",
    ERFKILL => "Operation not possible due to RF-kill",
    EHWPOISON => "Memory page has hardware error",
}

impl Errno {
    const fn from_raw(code: i32) -> Errno {
        let magnitude = code.unsigned_abs() as i32;
        match NonZeroI32::new(magnitude) {
            Some(n) => Errno(n),
            None => panic!("errno must be non-zero"),
        }
    }

    /// The positive error number, as `libc` spells it.
    pub const fn code(self) -> i32 {
        self.0.get()
    }

    /// The negative code sent across the kernel boundary.
    pub const fn to_wire(self) -> i32 {
        -self.0.get()
    }

    /// Looks up an errno by numeric code. Either sign is accepted; zero and
    /// codes outside the registry yield `None`.
    pub fn from_code(code: i32) -> Option<Errno> {
        let magnitude = code.unsigned_abs() as i32;
        REGISTRY
            .iter()
            .any(|(c, _, _)| *c == magnitude)
            .then(|| Errno::from_raw(magnitude))
    }

    /// Looks up an errno by symbolic name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Errno> {
        REGISTRY
            .iter()
            .find(|(_, n, _)| n.eq_ignore_ascii_case(name))
            .map(|(c, _, _)| Errno::from_raw(*c))
    }

    /// The symbolic name, or [`UNKNOWN_NAME`] for codes the registry has
    /// never heard of (possible when an `Errno` is built from a raw
    /// `io::Error`).
    pub fn name(self) -> &'static str {
        code_to_name(self.code())
    }

    /// The canonical strerror message.
    pub fn message(self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(c, _, _)| *c == self.code())
            .map(|(_, _, m)| *m)
            .unwrap_or("Unknown error")
    }

    /// Permission-denied family.
    pub const fn is_permission(self) -> bool {
        matches!(self.code(), libc::EPERM | libc::EACCES | libc::EROFS)
    }

    /// Object-missing family.
    pub const fn is_not_found(self) -> bool {
        matches!(self.code(), libc::ENOENT | libc::ENOTDIR | libc::ESTALE)
    }

    /// Object-already-present family.
    pub const fn is_exists(self) -> bool {
        matches!(self.code(), libc::EEXIST | libc::ENOTEMPTY)
    }

    /// Transient conditions worth retrying.
    pub const fn is_temporary(self) -> bool {
        matches!(
            self.code(),
            libc::EAGAIN
                | libc::EINTR
                | libc::EBUSY
                | libc::ETIMEDOUT
                | libc::EINPROGRESS
                | libc::EALREADY
                | libc::ERESTART
        )
    }

    /// Hard device or transport failures.
    pub const fn is_io(self) -> bool {
        matches!(
            self.code(),
            libc::EIO | libc::ENXIO | libc::ENODEV | libc::EPIPE | libc::EREMOTEIO
        )
    }

    /// Malformed-argument family.
    pub const fn is_invalid(self) -> bool {
        matches!(
            self.code(),
            libc::EINVAL | libc::ENAMETOOLONG | libc::E2BIG | libc::ERANGE | libc::EOVERFLOW
        )
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) if code != 0 => Errno::from_raw(code),
            _ => Errno::EIO,
        }
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        match err as i32 {
            0 => Errno::EIO,
            code => Errno::from_raw(code),
        }
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.code())
    }
}

/// Maps a numeric code (either sign) to its symbolic name, or
/// [`UNKNOWN_NAME`].
pub fn code_to_name(code: i32) -> &'static str {
    let magnitude = code.unsigned_abs() as i32;
    REGISTRY
        .iter()
        .find(|(c, _, _)| *c == magnitude)
        .map(|(_, n, _)| *n)
        .unwrap_or(UNKNOWN_NAME)
}

/// Maps a symbolic name (case-insensitive) to the negative wire code, or 0
/// for names the registry does not know. Callers must check for 0.
pub fn name_to_code(name: &str) -> i32 {
    Errno::from_name(name).map(Errno::to_wire).unwrap_or(0)
}

/// The canonical message for a numeric code of either sign.
pub fn message(code: i32) -> &'static str {
    match NonZeroI32::new(code.unsigned_abs() as i32) {
        Some(n) => Errno(n).message(),
        None => "Success",
    }
}

/// Canonicalizes a raw result code: errors become negative, success stays 0.
pub const fn normalize(code: i32) -> i32 {
    if code > 0 { -code } else { code }
}

/// Errors the kernel accepts from each operation without complaint.
///
/// The sets are advisory: the binding never rejects an errno outside the
/// table, but consumers can use it to lint handler behaviour.
pub fn expected_errors(op: OpType) -> &'static [Errno] {
    use Errno as E;

    const LOOKUP: &[Errno] = &[E::ENOENT, E::EACCES, E::ENOTDIR, E::ENAMETOOLONG, E::EIO];
    const ATTR: &[Errno] = &[E::ENOENT, E::EACCES, E::EPERM, E::EIO];
    const CREATE: &[Errno] = &[
        E::EEXIST,
        E::EACCES,
        E::EPERM,
        E::EROFS,
        E::ENOSPC,
        E::EDQUOT,
        E::ENOTDIR,
        E::ENAMETOOLONG,
        E::EIO,
    ];
    const REMOVE: &[Errno] = &[
        E::ENOENT,
        E::EACCES,
        E::EPERM,
        E::EROFS,
        E::ENOTDIR,
        E::EISDIR,
        E::EBUSY,
        E::EIO,
    ];
    const RMDIR: &[Errno] = &[
        E::ENOENT,
        E::EACCES,
        E::EPERM,
        E::EROFS,
        E::ENOTDIR,
        E::ENOTEMPTY,
        E::EBUSY,
        E::EIO,
    ];
    const RENAME: &[Errno] = &[
        E::ENOENT,
        E::EACCES,
        E::EPERM,
        E::EROFS,
        E::EEXIST,
        E::ENOTEMPTY,
        E::EXDEV,
        E::EINVAL,
        E::EIO,
    ];
    const OPEN: &[Errno] = &[
        E::ENOENT,
        E::EACCES,
        E::EPERM,
        E::EISDIR,
        E::ENFILE,
        E::EMFILE,
        E::ETXTBSY,
        E::EIO,
    ];
    const RW: &[Errno] = &[
        E::EBADF,
        E::EAGAIN,
        E::EINTR,
        E::ENOSPC,
        E::EDQUOT,
        E::EFBIG,
        E::EIO,
    ];
    const SYNC: &[Errno] = &[E::EBADF, E::ENOSPC, E::EDQUOT, E::EIO];
    const XATTR: &[Errno] = &[
        E::ENODATA,
        E::ERANGE,
        E::E2BIG,
        E::EEXIST,
        E::EACCES,
        E::EPERM,
        E::ENOSPC,
        E::ENOTSUP,
        E::EIO,
    ];
    const DIR: &[Errno] = &[E::ENOENT, E::EACCES, E::ENOTDIR, E::EBADF, E::EIO];
    const COPY: &[Errno] = &[
        E::EBADF,
        E::EXDEV,
        E::EINVAL,
        E::ENOSPC,
        E::EFBIG,
        E::EISDIR,
        E::EIO,
    ];
    const SEEK: &[Errno] = &[E::EBADF, E::EINVAL, E::ENXIO, E::ESPIPE, E::EIO];
    const STATFS: &[Errno] = &[E::ENOENT, E::EACCES, E::EIO];
    const ACCESS: &[Errno] = &[E::ENOENT, E::EACCES, E::EROFS, E::ENOTDIR, E::EIO];

    match op {
        OpType::Lookup | OpType::Readlink => LOOKUP,
        OpType::Getattr | OpType::Setattr => ATTR,
        OpType::Mknod | OpType::Mkdir | OpType::Symlink | OpType::Link | OpType::Create => CREATE,
        OpType::Unlink => REMOVE,
        OpType::Rmdir => RMDIR,
        OpType::Rename => RENAME,
        OpType::Open | OpType::Opendir => OPEN,
        OpType::Read | OpType::Write => RW,
        OpType::Flush | OpType::Release | OpType::Releasedir => SYNC,
        OpType::Fsync | OpType::Fsyncdir => SYNC,
        OpType::Setxattr | OpType::Getxattr | OpType::Listxattr | OpType::Removexattr => XATTR,
        OpType::Readdir => DIR,
        OpType::CopyFileRange => COPY,
        OpType::Lseek => SEEK,
        OpType::Statfs => STATFS,
        OpType::Access => ACCESS,
        OpType::Forget | OpType::Init | OpType::Destroy => &[],
    }
}
