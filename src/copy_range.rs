//! Byte-range copies between file descriptors.
//!
//! The fast path is the host kernel's `copy_file_range(2)`, which moves
//! data without bouncing it through userspace and enables server-side
//! copy on filesystems that support it. When the syscall is missing
//! (`ENOSYS`, latched) or refuses a pairing (`EXDEV`, per call), a
//! chunked `pread`/`pwrite` loop takes over with identical semantics.
//!
//! Partial progress wins over errors: once any bytes have moved, an error
//! ends the copy with the byte count rather than the errno, matching the
//! syscall's own contract.

use std::os::fd::BorrowedFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::debug;
use log::warn;
use nix::sys::uio::pread;
use nix::sys::uio::pwrite;
use nix::unistd::read;
use nix::unistd::write;

use crate::errno::Errno;

/// Passing this as an offset means "use the descriptor's current file
/// offset", the way `copy_file_range(2)` treats a NULL offset pointer.
pub const CURRENT_OFFSET: u64 = u64::MAX;

const MIN_CHUNK: usize = 64 * 1024;
const MAX_CHUNK: usize = 8 * 1024 * 1024;
const DEFAULT_CHUNK: usize = 1024 * 1024;

/// Copy engine tuning.
#[derive(Clone, Copy, Debug)]
pub struct CopyConfig {
    /// Buffer size for the fallback loop. Clamped to 64 KiB..=8 MiB.
    pub chunk_size: usize,
    /// Set false to skip the syscall fast path entirely.
    pub use_kernel_copy: bool,
}

impl Default for CopyConfig {
    fn default() -> CopyConfig {
        CopyConfig {
            chunk_size: DEFAULT_CHUNK,
            use_kernel_copy: true,
        }
    }
}

/// Counters sampled with [`CopyRange::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CopyStats {
    /// Copies attempted.
    pub total_operations: u64,
    /// Bytes moved, fast path and fallback combined.
    pub total_bytes_copied: u64,
    /// Whether the kernel fast path is still believed to work.
    pub kernel_copy_supported: bool,
}

/// The copy engine. One per session; cheap enough to build standalone.
#[derive(Debug)]
pub struct CopyRange {
    chunk: usize,
    kernel_supported: AtomicBool,
    operations: AtomicU64,
    bytes: AtomicU64,
}

impl CopyRange {
    /// Builds an engine with the given tuning.
    pub fn new(config: CopyConfig) -> CopyRange {
        CopyRange {
            chunk: config.chunk_size.clamp(MIN_CHUNK, MAX_CHUNK),
            kernel_supported: AtomicBool::new(config.use_kernel_copy),
            operations: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Copies up to `len` bytes from `fd_in` at `off_in` to `fd_out` at
    /// `off_out`. Either offset may be [`CURRENT_OFFSET`] to use the
    /// descriptor's file position. Returns the bytes copied, which is
    /// short when the source runs out.
    pub fn copy(
        &self,
        fd_in: BorrowedFd<'_>,
        off_in: u64,
        fd_out: BorrowedFd<'_>,
        off_out: u64,
        len: u64,
        flags: u32,
    ) -> Result<u64, Errno> {
        // copy_file_range(2) defines no flags yet.
        if flags != 0 {
            return Err(Errno::EINVAL);
        }
        self.operations.fetch_add(1, Ordering::Relaxed);
        if len == 0 {
            return Ok(0);
        }

        let result = if self.kernel_supported.load(Ordering::Acquire) {
            match self.kernel_copy(fd_in, off_in, fd_out, off_out, len) {
                KernelAttempt::Copied(n) => Ok(n),
                KernelAttempt::Fallback { copied } => {
                    // Resume where the fast path stopped.
                    let in_pos = advanced(off_in, copied);
                    let out_pos = advanced(off_out, copied);
                    self.chunked_copy(fd_in, in_pos, fd_out, out_pos, len - copied)
                        .map(|n| n + copied)
                }
                KernelAttempt::Failed(errno) => Err(errno),
            }
        } else {
            self.chunked_copy(fd_in, off_in, fd_out, off_out, len)
        };

        if let Ok(n) = result {
            self.bytes.fetch_add(n, Ordering::Relaxed);
        }
        result
    }

    /// A snapshot of the engine counters.
    pub fn stats(&self) -> CopyStats {
        CopyStats {
            total_operations: self.operations.load(Ordering::Relaxed),
            total_bytes_copied: self.bytes.load(Ordering::Relaxed),
            kernel_copy_supported: self.kernel_supported.load(Ordering::Acquire),
        }
    }

    fn kernel_copy(
        &self,
        fd_in: BorrowedFd<'_>,
        off_in: u64,
        fd_out: BorrowedFd<'_>,
        off_out: u64,
        len: u64,
    ) -> KernelAttempt {
        let mut in_pos = explicit_offset(off_in);
        let mut out_pos = explicit_offset(off_out);
        let mut copied = 0u64;

        while copied < len {
            let want = (len - copied) as usize;
            let attempt = nix::fcntl::copy_file_range(
                fd_in,
                in_pos.as_mut(),
                fd_out,
                out_pos.as_mut(),
                want,
            );
            match attempt {
                Ok(0) => break,
                Ok(n) => copied += n as u64,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ENOSYS) => {
                    // The kernel predates the syscall; stop trying for the
                    // lifetime of this engine.
                    warn!("copy_file_range unsupported by kernel, using chunked fallback");
                    self.kernel_supported.store(false, Ordering::Release);
                    return KernelAttempt::Fallback { copied };
                }
                Err(nix::errno::Errno::EXDEV) => {
                    debug!("copy_file_range refused cross-device copy, falling back");
                    return KernelAttempt::Fallback { copied };
                }
                Err(err) if copied > 0 => {
                    debug!("copy_file_range stopped early after {copied} bytes: {err}");
                    break;
                }
                Err(err) => return KernelAttempt::Failed(Errno::from(err)),
            }
        }
        KernelAttempt::Copied(copied)
    }

    fn chunked_copy(
        &self,
        fd_in: BorrowedFd<'_>,
        off_in: u64,
        fd_out: BorrowedFd<'_>,
        off_out: u64,
        len: u64,
    ) -> Result<u64, Errno> {
        let mut buf = vec![0u8; self.chunk.min(len as usize)];
        let mut copied = 0u64;

        while copied < len {
            let want = ((len - copied) as usize).min(buf.len());
            let read_at = advanced(off_in, copied);
            let got = match read_chunk(fd_in, &mut buf[..want], read_at) {
                Ok(0) => break,
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    return if copied > 0 {
                        Ok(copied)
                    } else {
                        Err(Errno::from(err))
                    };
                }
            };

            let mut written = 0usize;
            while written < got {
                let write_at = advanced(off_out, copied + written as u64);
                match write_chunk(fd_out, &buf[written..got], write_at) {
                    Ok(n) => written += n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(err) => {
                        let total = copied + written as u64;
                        return if total > 0 { Ok(total) } else { Err(Errno::from(err)) };
                    }
                }
            }
            copied += got as u64;
        }
        Ok(copied)
    }
}

enum KernelAttempt {
    Copied(u64),
    Fallback { copied: u64 },
    Failed(Errno),
}

fn explicit_offset(offset: u64) -> Option<i64> {
    (offset != CURRENT_OFFSET).then_some(offset as i64)
}

fn advanced(offset: u64, by: u64) -> u64 {
    if offset == CURRENT_OFFSET {
        CURRENT_OFFSET
    } else {
        offset + by
    }
}

fn read_chunk(fd: BorrowedFd<'_>, buf: &mut [u8], offset: u64) -> nix::Result<usize> {
    if offset == CURRENT_OFFSET {
        read(fd, buf)
    } else {
        pread(fd, buf, offset as i64)
    }
}

fn write_chunk(fd: BorrowedFd<'_>, buf: &[u8], offset: u64) -> nix::Result<usize> {
    if offset == CURRENT_OFFSET {
        write(fd, buf)
    } else {
        pwrite(fd, buf, offset as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write as _;
    use std::os::fd::AsFd;

    /// Deterministic pseudo-random payload, no RNG dependency needed.
    fn payload(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn source_file(data: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    fn contents(f: &mut File) -> Vec<u8> {
        let mut out = Vec::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut out).unwrap();
        out
    }

    fn fallback_engine(chunk_size: usize) -> CopyRange {
        CopyRange::new(CopyConfig {
            chunk_size,
            use_kernel_copy: false,
        })
    }

    #[test]
    fn fallback_matches_input_for_ten_mib() {
        let data = payload(10 * 1024 * 1024);
        let src = source_file(&data);
        let mut dst = tempfile::tempfile().unwrap();

        let engine = fallback_engine(DEFAULT_CHUNK);
        let copied = engine
            .copy(src.as_fd(), 0, dst.as_fd(), 0, data.len() as u64, 0)
            .unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(contents(&mut dst), data);

        let stats = engine.stats();
        assert_eq!(stats.total_operations, 1);
        assert_eq!(stats.total_bytes_copied, data.len() as u64);
        assert!(!stats.kernel_copy_supported);
    }

    #[test]
    fn chunk_size_does_not_change_output() {
        let data = payload(3 * 1024 * 1024 + 977);
        let src = source_file(&data);
        let mut reference = None;
        for chunk in [MIN_CHUNK, 256 * 1024, MAX_CHUNK] {
            let mut dst = tempfile::tempfile().unwrap();
            let engine = fallback_engine(chunk);
            let copied = engine
                .copy(src.as_fd(), 0, dst.as_fd(), 0, data.len() as u64, 0)
                .unwrap();
            assert_eq!(copied, data.len() as u64);
            let out = contents(&mut dst);
            match &reference {
                None => reference = Some(out),
                Some(expected) => assert_eq!(&out, expected),
            }
        }
        assert_eq!(reference.unwrap(), data);
    }

    #[test]
    fn kernel_path_matches_fallback() {
        let data = payload(1024 * 1024 + 13);
        let src = source_file(&data);
        let mut dst = tempfile::tempfile().unwrap();
        let engine = CopyRange::new(CopyConfig::default());
        let copied = engine
            .copy(src.as_fd(), 0, dst.as_fd(), 0, data.len() as u64, 0)
            .unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(contents(&mut dst), data);
    }

    #[test]
    fn short_copy_at_eof() {
        let data = payload(1000);
        let src = source_file(&data);
        let mut dst = tempfile::tempfile().unwrap();
        let engine = fallback_engine(MIN_CHUNK);
        // Ask for far more than the file holds.
        let copied = engine
            .copy(src.as_fd(), 0, dst.as_fd(), 0, 1 << 20, 0)
            .unwrap();
        assert_eq!(copied, 1000);
        assert_eq!(contents(&mut dst), data);
    }

    #[test]
    fn offsets_slice_the_copy() {
        let data = payload(4096);
        let src = source_file(&data);
        let mut dst = tempfile::tempfile().unwrap();
        let engine = fallback_engine(MIN_CHUNK);
        let copied = engine
            .copy(src.as_fd(), 1024, dst.as_fd(), 0, 2048, 0)
            .unwrap();
        assert_eq!(copied, 2048);
        assert_eq!(contents(&mut dst), data[1024..3072].to_vec());
    }

    #[test]
    fn current_offset_sentinel_uses_file_position() {
        let data = payload(8192);
        let mut src = source_file(&data);
        src.seek(SeekFrom::Start(4096)).unwrap();
        let mut dst = tempfile::tempfile().unwrap();
        let engine = fallback_engine(MIN_CHUNK);
        let copied = engine
            .copy(src.as_fd(), CURRENT_OFFSET, dst.as_fd(), 0, 4096, 0)
            .unwrap();
        assert_eq!(copied, 4096);
        assert_eq!(contents(&mut dst), data[4096..].to_vec());
        // The source position advanced with the reads.
        assert_eq!(src.stream_position().unwrap(), 8192);
    }

    #[test]
    fn nonzero_flags_are_rejected() {
        let src = source_file(&[0u8; 16]);
        let dst = tempfile::tempfile().unwrap();
        let engine = fallback_engine(MIN_CHUNK);
        assert_eq!(
            engine.copy(src.as_fd(), 0, dst.as_fd(), 0, 16, 1),
            Err(Errno::EINVAL)
        );
    }
}
