//! Input validation for dispatched operations.
//!
//! Every check here runs before a handler is invoked and never after; a
//! failed check surfaces as `EINVAL` or `ENAMETOOLONG` without the handler
//! seeing the request. Validators are pure functions over the typed
//! request fields.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::errno::Errno;
use crate::types::Ino;
use crate::types::Mode;
use crate::types::RequestContext;

/// Largest single read or write the dispatcher will accept.
pub const MAX_RW_SIZE: u64 = 128 * 1024 * 1024;

/// Longest accepted directory-entry name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Longest accepted path, in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Inodes are non-zero.
pub fn ino(ino: Ino) -> Result<(), Errno> {
    if ino.0 == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// File offsets are non-negative; the kernel transports them as `i64`.
pub fn offset(offset: i64) -> Result<u64, Errno> {
    u64::try_from(offset).map_err(|_| Errno::EINVAL)
}

/// Read/write sizes are bounded to keep a single request from pinning an
/// unreasonable buffer.
pub fn size(size: u64) -> Result<usize, Errno> {
    if size > MAX_RW_SIZE {
        return Err(Errno::EINVAL);
    }
    Ok(size as usize)
}

/// Directory-entry names: non-empty, at most [`MAX_NAME_LEN`] bytes, no
/// NUL, no `/`, and neither `.` nor `..` (operations that create or remove
/// a sibling cannot address the dots; readdir output is not routed through
/// here and still lists them).
pub fn name(name: &OsStr) -> Result<(), Errno> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(Errno::EINVAL);
    }
    if bytes.len() > MAX_NAME_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if memchr::memchr2(0, b'/', bytes).is_some() {
        return Err(Errno::EINVAL);
    }
    if bytes == b"." || bytes == b".." {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// Symlink targets and other full paths: non-empty, bounded, no NUL.
/// Relative targets are legal for symlinks; absolute ones must stay under
/// the length cap.
pub fn link_target(target: &Path) -> Result<(), Errno> {
    let bytes = target.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(Errno::EINVAL);
    }
    if bytes.len() > MAX_PATH_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    if memchr::memchr(0, bytes).is_some() {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// Absolute paths (mountpoints): must start with `/`, plus the
/// [`link_target`] rules.
pub fn absolute_path(path: &Path) -> Result<(), Errno> {
    link_target(path)?;
    if !path.is_absolute() {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// Modes for `create` and `mknod`: anything but a directory.
pub fn mode_not_directory(mode: Mode) -> Result<(), Errno> {
    if mode.is_dir() {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// Modes for `mkdir`: the wrapper stamps the directory type bits onto the
/// kernel-supplied permissions, so anything else here is a caller bug.
pub fn mode_directory(mode: Mode) -> Result<(), Errno> {
    if !mode.is_dir() {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// The request context the adapter captured: uids and gids are unsigned
/// already, pid must be a real process.
pub fn context(ctx: &RequestContext) -> Result<(), Errno> {
    if ctx.pid.0 == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// Xattr names: non-empty, bounded like entry names, NUL-free. Dots are
/// legal here (`user.mime_type`).
pub fn xattr_name(name: &OsStr) -> Result<(), Errno> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(Errno::EINVAL);
    }
    if bytes.len() > MAX_NAME_LEN {
        return Err(Errno::ERANGE);
    }
    if memchr::memchr(0, bytes).is_some() {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn ino_rejects_zero() {
        assert_eq!(ino(Ino(0)), Err(Errno::EINVAL));
        assert!(ino(Ino(1)).is_ok());
        assert!(ino(Ino(u64::MAX)).is_ok());
    }

    #[test]
    fn offset_rejects_negative() {
        assert_eq!(offset(-1), Err(Errno::EINVAL));
        assert_eq!(offset(0), Ok(0));
        assert_eq!(offset(i64::MAX), Ok(i64::MAX as u64));
    }

    #[test]
    fn size_cap() {
        assert!(size(MAX_RW_SIZE).is_ok());
        assert_eq!(size(MAX_RW_SIZE + 1), Err(Errno::EINVAL));
    }

    #[test]
    fn name_rules() {
        assert!(name(OsStr::new("hello.txt")).is_ok());
        assert_eq!(name(OsStr::new("")), Err(Errno::EINVAL));
        assert_eq!(name(OsStr::new(".")), Err(Errno::EINVAL));
        assert_eq!(name(OsStr::new("..")), Err(Errno::EINVAL));
        assert_eq!(name(OsStr::new("a/b")), Err(Errno::EINVAL));
        let embedded_nul = OsString::from_vec(vec![b'a', 0, b'b']);
        assert_eq!(name(&embedded_nul), Err(Errno::EINVAL));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(name(OsStr::new(&long)), Err(Errno::ENAMETOOLONG));
        let exactly = "x".repeat(MAX_NAME_LEN);
        assert!(name(OsStr::new(&exactly)).is_ok());
        // Dotfiles are names, not dots.
        assert!(name(OsStr::new(".config")).is_ok());
    }

    #[test]
    fn path_rules() {
        assert!(absolute_path(Path::new("/mnt/data")).is_ok());
        assert_eq!(absolute_path(Path::new("relative")), Err(Errno::EINVAL));
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert_eq!(
            absolute_path(Path::new(&long)),
            Err(Errno::ENAMETOOLONG)
        );
        assert!(link_target(Path::new("../sibling")).is_ok());
    }

    #[test]
    fn mode_rules() {
        let file = Mode(libc::S_IFREG | 0o644);
        let dir = Mode(libc::S_IFDIR | 0o755);
        assert!(mode_not_directory(file).is_ok());
        assert_eq!(mode_not_directory(dir), Err(Errno::EINVAL));
        assert!(mode_directory(dir).is_ok());
        assert_eq!(mode_directory(file), Err(Errno::EINVAL));
    }

    #[test]
    fn context_rules() {
        assert!(context(&RequestContext::root()).is_ok());
        let mut bad = RequestContext::root();
        bad.pid = crate::types::Pid(0);
        assert_eq!(context(&bad), Err(Errno::EINVAL));
    }

    #[test]
    fn xattr_name_rules() {
        assert!(xattr_name(OsStr::new("user.mime_type")).is_ok());
        assert_eq!(xattr_name(OsStr::new("")), Err(Errno::EINVAL));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(xattr_name(OsStr::new(&long)), Err(Errno::ERANGE));
    }
}
