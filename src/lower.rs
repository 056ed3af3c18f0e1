//! Access layer for the lower filesystems.
//!
//! Branches are ordinary directory trees on the host; everything the union
//! does to them funnels through here. A [`LowerDentry`] names one entry in
//! one branch (parent directory plus final component) together with a stat
//! snapshot when the entry exists. The snapshot is what the fan-out layers
//! above compare generations and times against; it is refreshed by lookup
//! and after every mutation.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use nix::sys::stat::{self, FchmodatFlags, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::{Statvfs, statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, Gid, Uid};

use crate::FileKind;
use crate::errors::Result;

/// Stat snapshot of a lower inode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LowerMeta {
    pub(crate) dev: u64,
    pub(crate) ino: u64,
    pub(crate) mode: u32,
    pub(crate) nlink: u64,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) size: u64,
    pub(crate) blocks: u64,
    pub(crate) rdev: u64,
    pub(crate) atime: SystemTime,
    pub(crate) mtime: SystemTime,
    pub(crate) ctime: SystemTime,
}

impl LowerMeta {
    fn from_metadata(meta: &std::fs::Metadata) -> LowerMeta {
        LowerMeta {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            blocks: meta.blocks(),
            rdev: meta.rdev(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    pub(crate) fn kind(&self) -> FileKind {
        match self.mode & libc::S_IFMT {
            libc::S_IFREG => FileKind::RegularFile,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub(crate) fn is_reg(&self) -> bool {
        self.kind() == FileKind::RegularFile
    }

    pub(crate) fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    /// Permission bits only (no file type).
    pub(crate) fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// The same lower inode? Compared by device and inode number.
    pub(crate) fn same_inode(&self, other: &LowerMeta) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn timespec(time: SystemTime) -> TimeSpec {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(_) => TimeSpec::new(0, 0),
    }
}

/// One name in one branch, positive or negative.
#[derive(Debug, Clone)]
pub(crate) struct LowerDentry {
    dir: PathBuf,
    name: OsString,
    meta: Option<LowerMeta>,
}

impl LowerDentry {
    /// The root of a branch. Must exist.
    pub(crate) fn branch_root(path: &Path) -> Result<LowerDentry> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(LowerDentry {
            dir: path.to_path_buf(),
            name: OsString::new(),
            meta: Some(LowerMeta::from_metadata(&meta)),
        })
    }

    pub(crate) fn path(&self) -> PathBuf {
        if self.name.is_empty() {
            self.dir.clone()
        } else {
            self.dir.join(&self.name)
        }
    }

    pub(crate) fn parent_dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn name(&self) -> &OsStr {
        &self.name
    }

    pub(crate) fn is_positive(&self) -> bool {
        self.meta.is_some()
    }

    pub(crate) fn meta(&self) -> Option<&LowerMeta> {
        self.meta.as_ref()
    }

    /// Re-stats the entry, turning the dentry positive or negative to match
    /// the lower filesystem's current truth.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        *self = lookup_one(&self.dir, &self.name)?;
        Ok(())
    }
}

/// Looks up a single component under a lower directory.
///
/// A missing entry is a *negative* dentry, not an error; only real lower
/// failures (permission, I/O) are reported.
pub(crate) fn lookup_one(dir: &Path, name: &OsStr) -> Result<LowerDentry> {
    let path = dir.join(name);
    let meta = match std::fs::symlink_metadata(&path) {
        Ok(meta) => Some(LowerMeta::from_metadata(&meta)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        // A dangling component of the parent also reads as negative.
        Err(err) if err.raw_os_error() == Some(libc::ENOTDIR) => None,
        Err(err) => return Err(err.into()),
    };
    Ok(LowerDentry {
        dir: dir.to_path_buf(),
        name: name.to_os_string(),
        meta,
    })
}

/// Re-stats a path into a fresh snapshot.
pub(crate) fn stat_path(path: &Path) -> Result<LowerMeta> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok(LowerMeta::from_metadata(&meta))
}

/// Stats an open lower file; survives the name being unlinked.
pub(crate) fn fstat(file: &File) -> Result<LowerMeta> {
    let meta = file.metadata()?;
    Ok(LowerMeta::from_metadata(&meta))
}

/// Whether the lower inode carries the filesystem immutable flag, which
/// denies writes to everyone.
#[cfg(target_os = "linux")]
pub(crate) fn is_immutable(path: &Path) -> bool {
    use std::os::fd::AsRawFd;
    const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
    const FS_IMMUTABLE_FL: libc::c_long = 0x10;
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut flags: libc::c_long = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_GETFLAGS, &mut flags) };
    rc == 0 && (flags & FS_IMMUTABLE_FL) != 0
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn is_immutable(_path: &Path) -> bool {
    false
}

/// Creates a regular file with the given permission bits, exclusively.
pub(crate) fn create(path: &Path, perm: u32) -> Result<LowerMeta> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(perm)
        .open(path)?;
    stat_path(path)
}

pub(crate) fn mkdir(path: &Path, perm: u32) -> Result<LowerMeta> {
    unistd::mkdir(path, Mode::from_bits_truncate(perm))?;
    stat_path(path)
}

pub(crate) fn symlink(target: &Path, path: &Path) -> Result<LowerMeta> {
    std::os::unix::fs::symlink(target, path)?;
    stat_path(path)
}

pub(crate) fn link(existing: &Path, new: &Path) -> Result<LowerMeta> {
    std::fs::hard_link(existing, new)?;
    stat_path(new)
}

pub(crate) fn mknod(path: &Path, mode: u32, rdev: u64) -> Result<LowerMeta> {
    stat::mknod(
        path,
        SFlag::from_bits_truncate(mode & libc::S_IFMT),
        Mode::from_bits_truncate(mode & 0o7777),
        rdev,
    )?;
    stat_path(path)
}

pub(crate) fn unlink(path: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    Ok(())
}

pub(crate) fn rmdir(path: &Path) -> Result<()> {
    std::fs::remove_dir(path)?;
    Ok(())
}

pub(crate) fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)?;
    Ok(())
}

pub(crate) fn read_link(path: &Path) -> Result<PathBuf> {
    Ok(std::fs::read_link(path)?)
}

/// Opens a lower file with raw open(2) flags.
pub(crate) fn open(path: &Path, flags: i32) -> Result<File> {
    let acc = flags & libc::O_ACCMODE;
    let file = std::fs::OpenOptions::new()
        .read(acc == libc::O_RDONLY || acc == libc::O_RDWR)
        .write(acc == libc::O_WRONLY || acc == libc::O_RDWR)
        .truncate(flags & libc::O_TRUNC != 0)
        .custom_flags(flags & !(libc::O_ACCMODE | libc::O_TRUNC | libc::O_CREAT))
        .open(path)?;
    Ok(file)
}

/// Kernel-space read primitive: positional read, no file-offset coupling.
pub(crate) fn pread(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    Ok(nix::sys::uio::pread(file.as_fd(), buf, offset as libc::off_t)?)
}

/// Kernel-space write primitive: positional write, no file-offset coupling.
pub(crate) fn pwrite(file: &File, buf: &[u8], offset: u64) -> Result<usize> {
    Ok(nix::sys::uio::pwrite(file.as_fd(), buf, offset as libc::off_t)?)
}

/// Vectored positional read.
pub(crate) fn preadv(file: &File, bufs: &mut [std::io::IoSliceMut<'_>], offset: u64) -> Result<usize> {
    Ok(nix::sys::uio::preadv(file.as_fd(), bufs, offset as libc::off_t)?)
}

/// Vectored positional write.
pub(crate) fn pwritev(file: &File, bufs: &[std::io::IoSlice<'_>], offset: u64) -> Result<usize> {
    Ok(nix::sys::uio::pwritev(file.as_fd(), bufs, offset as libc::off_t)?)
}

pub(crate) fn fsync(file: &File) -> Result<()> {
    unistd::fsync(file.as_fd())?;
    Ok(())
}

/// Close-time flush of one lower file: push its dirty data down without
/// the full metadata sync an fsync implies.
pub(crate) fn flush(file: &File) -> Result<()> {
    unistd::fdatasync(file.as_fd())?;
    Ok(())
}

pub(crate) fn fdatasync(file: &File) -> Result<()> {
    unistd::fdatasync(file.as_fd())?;
    Ok(())
}

pub(crate) fn truncate(path: &Path, size: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(size)?;
    Ok(())
}

pub(crate) fn chmod(path: &Path, perm: u32) -> Result<()> {
    stat::fchmodat(
        nix::fcntl::AT_FDCWD,
        path,
        Mode::from_bits_truncate(perm),
        FchmodatFlags::FollowSymlink,
    )?;
    Ok(())
}

/// Ownership change; never follows symlinks.
pub(crate) fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    unistd::fchownat(
        nix::fcntl::AT_FDCWD,
        path,
        uid.map(Uid::from_raw),
        gid.map(Gid::from_raw),
        nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
    )?;
    Ok(())
}

pub(crate) fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> Result<()> {
    stat::utimensat(
        nix::fcntl::AT_FDCWD,
        path,
        &timespec(atime),
        &timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

/// Best-effort attribute mirroring after copy-up. Ownership changes need
/// privilege the caller may not have, so failures there only log.
pub(crate) fn copy_attr(path: &Path, src: &LowerMeta) -> Result<()> {
    if !src.is_symlink() {
        chmod(path, src.perm())?;
    }
    if let Err(err) = chown(path, Some(src.uid), Some(src.gid)) {
        warn!("unionfs: copyup of {path:?}: ownership not preserved: {err}");
    }
    set_times(path, src.atime, src.mtime)?;
    Ok(())
}

/// Filesystem statistics of a branch root.
pub(crate) fn statfs(path: &Path) -> Result<Statvfs> {
    Ok(statvfs(path)?)
}

/// A directory stream read in one gulp and sorted by name, so that an
/// entry's position is a stable resume offset across open/release cycles.
pub(crate) fn read_dir_sorted(path: &Path) -> Result<Vec<(OsString, FileKind, u64)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let kind = LowerMeta::from_metadata(&meta).kind();
        entries.push((entry.file_name(), kind, meta.ino()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// What the lower filesystem can do for us, discovered from the object
/// itself rather than assumed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LowerCaps {
    pub(crate) can_writepage: bool,
    pub(crate) can_poll: bool,
    pub(crate) can_fsync: bool,
}

impl LowerCaps {
    pub(crate) fn probe(meta: &LowerMeta) -> LowerCaps {
        let kind = meta.kind();
        LowerCaps {
            can_writepage: kind == FileKind::RegularFile,
            can_poll: matches!(
                kind,
                FileKind::NamedPipe | FileKind::Socket | FileKind::CharDevice
            ),
            can_fsync: matches!(kind, FileKind::RegularFile | FileKind::Directory),
        }
    }
}


/// Classic mode-bit access check against the caller's effective ids.
///
/// The union evaluates lower permissions itself because a lower branch may
/// be probed with credentials that never touch it directly (and because
/// read-only branch handling rewrites part of the result, see
/// `permission`).
pub(crate) fn access_ok(meta: &LowerMeta, mask: crate::AccessMask) -> bool {
    let euid = unistd::Uid::effective();
    if euid.is_root() {
        // Root bypasses rwx checks except execute, which requires at least
        // one x bit somewhere.
        if mask.contains(crate::AccessMask::EXEC) && !meta.is_dir() {
            return meta.perm() & 0o111 != 0;
        }
        return true;
    }
    let class = if euid.as_raw() == meta.uid {
        6
    } else if unistd::Gid::effective().as_raw() == meta.gid {
        3
    } else {
        0
    };
    let bits = (meta.perm() >> class) & 0o7;
    let want = mask.bits();
    bits & want == want
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn negative_lookup_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let ld = lookup_one(dir.path(), OsStr::new("missing")).unwrap();
        assert!(!ld.is_positive());
        assert_eq!(ld.path(), dir.path().join("missing"));
    }

    #[test]
    fn create_then_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let meta = create(&path, 0o640).unwrap();
        assert!(meta.is_reg());
        assert_eq!(meta.perm(), 0o640);

        let ld = lookup_one(dir.path(), OsStr::new("f")).unwrap();
        assert!(ld.is_positive());
        assert!(meta.same_inode(ld.meta().unwrap()));
    }

    #[test]
    fn lookup_through_nondir_parent_is_negative() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        create(&file, 0o644).unwrap();
        let ld = lookup_one(&file, OsStr::new("child")).unwrap();
        assert!(!ld.is_positive());
    }

    #[test]
    fn pread_pwrite_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        create(&path, 0o644).unwrap();
        let file = open(&path, libc::O_RDWR).unwrap();
        assert_eq!(pwrite(&file, b"hello", 3).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(pread(&file, &mut buf, 3).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn sorted_readdir_is_stable() {
        let dir = TempDir::new().unwrap();
        for name in ["c", "a", "b"] {
            create(&dir.path().join(name), 0o644).unwrap();
        }
        let names: Vec<_> = read_dir_sorted(dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _, _)| n)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
