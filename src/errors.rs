//! Errno-style error handling.
//!
//! Every operation in this crate reports failures as a raw OS error number
//! wrapped in [`Errno`]. Lower-filesystem errors pass through unchanged; the
//! union layer itself only ever produces a small set of codes (see the named
//! constants). `EROFS` doubles as a control-flow signal: namespace operations
//! treat it as "retry one branch to the left", which is what drives copy-up.

use std::fmt;
use std::io;

/// A raw OS error number.
///
/// Comparable with the `libc` constants it is constructed from.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Errno>;

impl Errno {
    /// Operation not permitted.
    pub const EPERM: Errno = Errno(libc::EPERM);
    /// No such file or directory.
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    /// I/O error.
    pub const EIO: Errno = Errno(libc::EIO);
    /// Bad file handle.
    pub const EBADF: Errno = Errno(libc::EBADF);
    /// Out of memory.
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    /// Device or resource busy.
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    /// Permission denied.
    pub const EACCES: Errno = Errno(libc::EACCES);
    /// File exists.
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    /// Cross-device link.
    pub const EXDEV: Errno = Errno(libc::EXDEV);
    /// Not a directory.
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    /// Is a directory.
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    /// Invalid argument.
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    /// File name too long.
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    /// Read-only file system.
    pub const EROFS: Errno = Errno(libc::EROFS);
    /// Directory not empty.
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    /// Function not implemented.
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    /// Inappropriate ioctl for device.
    pub const ENOTTY: Errno = Errno(libc::ENOTTY);
    /// Stale file handle.
    pub const ESTALE: Errno = Errno(libc::ESTALE);
    /// Too many levels of symbolic links.
    pub const ELOOP: Errno = Errno(libc::ELOOP);

    /// Wraps a raw error number.
    pub const fn from_i32(code: i32) -> Errno {
        Errno(code)
    }

    /// The raw error number.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// The errno of the calling thread's last failed syscall.
    pub fn last_os_error() -> Errno {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Whether this error should trigger a copy-up retry on the next branch
    /// to the left instead of failing the operation.
    pub const fn is_copyup_err(self) -> bool {
        self.0 == libc::EROFS
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&io::Error::from_raw_os_error(self.0), f)
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) => Errno(code),
            // Synthetic io::Errors (e.g. from the std path helpers) carry no
            // errno; EIO is the closest pass-through.
            None => Errno(libc::EIO),
        }
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno(err as i32)
    }
}

impl From<Errno> for io::Error {
    fn from(err: Errno) -> io::Error {
        io::Error::from_raw_os_error(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copyup_err_is_only_erofs() {
        assert!(Errno::EROFS.is_copyup_err());
        assert!(!Errno::EACCES.is_copyup_err());
        assert!(!Errno::ENOENT.is_copyup_err());
    }

    #[test]
    fn io_error_round_trip() {
        let io_err = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(Errno::from(io_err), Errno::ENOTEMPTY);
        let back: io::Error = Errno::ESTALE.into();
        assert_eq!(back.raw_os_error(), Some(libc::ESTALE));
    }

    #[test]
    fn nix_conversion() {
        assert_eq!(Errno::from(nix::errno::Errno::EROFS), Errno::EROFS);
    }
}
