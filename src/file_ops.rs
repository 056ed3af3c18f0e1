//! Open files: the per-file fan-out of lower handles and the file
//! operation surface.
//!
//! Directories open a lower file on every branch in range; regular files
//! open only `dbstart`. Every opened slot records the branch it was opened
//! against through an RAII guard, so branch open counts are released under
//! the branch *id* saved at open time no matter how indices have shifted
//! since.
//!
//! Opening a read-only branch for write defers the copy-up: the lower
//! handle is opened with the write flags masked off, and the first actual
//! write (or any revalidation with write intent) promotes the file to a
//! writable branch and retargets `fbstart`.

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::branch::{BranchOpenGuard, MntRef};
use crate::copyup;
use crate::dentry::{self, UnionDentry};
use crate::errors::{Errno, Result};
use crate::fanout::Fanout;
use crate::inode::UnionInode;
use crate::lower::{self, LowerCaps};
use crate::readdir::RdState;
use crate::{DirEntry, IoctlRequest, OpenFlags, QueryFileSet, SuperInner};

/// Events a poll on a union file always reports when the lower file has no
/// poll support of its own.
pub const DEFAULT_POLLMASK: u32 =
    (libc::POLLIN | libc::POLLOUT | libc::POLLRDNORM | libc::POLLWRNORM) as u32;

/// One open lower file handle.
#[derive(Debug)]
pub(crate) struct LowerFile {
    pub(crate) file: std::fs::File,
    pub(crate) open_ref: BranchOpenGuard,
    #[allow(dead_code)]
    pub(crate) mnt: MntRef,
    /// Write flags were masked off at open because the branch was
    /// read-only; the first write copies up.
    pub(crate) write_masked: bool,
}

/// An open union file.
#[derive(Debug)]
pub struct UnionFile {
    dentry: Arc<UnionDentry>,
    flags: OpenFlags,
    pos: Mutex<i64>,
    generation: AtomicU64,
    fanout: Mutex<Fanout<LowerFile>>,
    pub(crate) rdstate: Mutex<Option<RdState>>,
    released: AtomicBool,
}

impl UnionFile {
    /// The dentry this file was opened on.
    pub fn dentry(&self) -> &Arc<UnionDentry> {
        &self.dentry
    }

    /// The union inode backing this file.
    pub fn inode(&self) -> Option<Arc<UnionInode>> {
        self.dentry.inode()
    }

    /// Flags the file was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub(crate) fn fanout(&self) -> MutexGuard<'_, Fanout<LowerFile>> {
        self.fanout.lock()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }
}

impl Drop for UnionFile {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            warn!("unionfs: open file dropped without release");
        }
    }
}

/// Opens `dentry` with the given flags.
pub(crate) fn open(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    flags: OpenFlags,
) -> Result<Arc<UnionFile>> {
    dentry::revalidate_chain(sb, dentry)?;
    let inode = dentry.inode().ok_or(Errno::ENOENT)?;

    let file = Arc::new(UnionFile {
        dentry: Arc::clone(dentry),
        flags,
        pos: Mutex::new(0),
        generation: AtomicU64::new(inode.generation()),
        fanout: Mutex::new(Fanout::new(sb.branch_count())),
        rdstate: Mutex::new(None),
        released: AtomicBool::new(false),
    });

    inode.inc_opens();
    let mut ffan = file.fanout();
    let result = if inode.is_dir() {
        open_dir(sb, dentry, &mut ffan)
    } else {
        open_file(sb, dentry, &inode, &mut ffan, flags)
    };
    drop(ffan);

    match result {
        Ok(()) => Ok(file),
        Err(err) => {
            // Roll back: close whatever opened (RAII) and undo the count.
            file.fanout().reset(sb.branch_count());
            inode.dec_opens();
            file.released.store(true, Ordering::Release);
            Err(err)
        }
    }
}

/// Directory open: one lower file per branch in range.
fn open_dir(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    ffan: &mut Fanout<LowerFile>,
) -> Result<()> {
    // Branch handles are snapshotted ahead of the fan-out locks; branch
    // management takes the locks in the other order.
    let branches = sb.branch_arcs();
    let dfan = dentry.fanout();
    let range = dfan.range().ok_or(Errno::ESTALE)?;
    ffan.set_start(dfan.start());
    ffan.set_end(dfan.end());
    for bindex in range {
        let Some(slot) = dfan.lower(bindex) else {
            continue;
        };
        if !slot.dentry.is_positive() {
            continue;
        }
        let branch = branches.get(bindex).cloned().ok_or(Errno::ESTALE)?;
        let lower_file = lower::open(&slot.dentry.path(), libc::O_RDONLY | libc::O_DIRECTORY)?;
        ffan.set_lower(
            bindex,
            Some(LowerFile {
                file: lower_file,
                open_ref: branch.branchget(),
                mnt: branch.mntget(),
                write_masked: false,
            }),
        );
    }
    Ok(())
}

/// Regular-file open: only the highest-priority branch.
fn open_file(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    inode: &Arc<UnionInode>,
    ffan: &mut Fanout<LowerFile>,
    flags: OpenFlags,
) -> Result<()> {
    let branches = sb.branch_arcs();
    let mut dfan = dentry.fanout();
    let mut bstart = match dfan.start() {
        b if b >= 0 => b as usize,
        _ => return Err(Errno::ESTALE),
    };

    let read_only_branch = !branches
        .get(bstart)
        .ok_or(Errno::ESTALE)?
        .is_writable();
    let mut lower_flags = flags.0;
    let mut write_masked = false;
    if read_only_branch && flags.wants_write() {
        if flags.has_trunc() {
            // The truncate would discard the content anyway; copy up now
            // with length zero.
            bstart = copyup::copyup_dentry_leftward(sb, dentry, &mut dfan, bstart, 0)?;
        } else {
            // Defer to the first write.
            lower_flags = flags.write_masked();
            write_masked = true;
        }
    }

    let slot = dfan
        .lower(bstart)
        .filter(|s| s.dentry.is_positive())
        .ok_or(Errno::ESTALE)?;
    let branch = branches.get(bstart).cloned().ok_or(Errno::ESTALE)?;
    let lower_file = lower::open(&slot.dentry.path(), lower_flags)?;
    drop(dfan);

    ffan.set_lower(
        bstart,
        Some(LowerFile {
            file: lower_file,
            open_ref: branch.branchget(),
            mnt: branch.mntget(),
            write_masked,
        }),
    );
    ffan.set_start(bstart as i32);
    ffan.set_end(bstart as i32);

    if flags.has_trunc() && flags.wants_write() {
        inode.attr().size = 0;
    }
    Ok(())
}

/// Revalidates an open file against the current branch configuration,
/// reopening or retargeting its lower handles as needed.
///
/// `willwrite` marks callers that may mutate the file; it is what triggers
/// the delayed copy-up of a write-masked handle.
pub(crate) fn file_revalidate(sb: &Arc<SuperInner>, file: &Arc<UnionFile>, willwrite: bool) -> Result<()> {
    let dentry = file.dentry();
    dentry::revalidate_chain(sb, dentry)?;
    let inode = dentry.inode().ok_or(Errno::ESTALE)?;

    let sbgen = sb.generation();
    let fgen = file.generation();
    debug_assert!(fgen <= sbgen);

    if !dentry.is_deleted() && fgen < sbgen {
        if inode.is_dir() {
            // Directories re-open across the (possibly changed) range so
            // the merged view includes new branches.
            let mut ffan = file.fanout();
            ffan.reset(sb.branch_count());
            open_dir(sb, dentry, &mut ffan)?;
        } else {
            remap_regular_file(sb, file)?;
        }
        file.set_generation(sbgen);
    }

    if willwrite && file.flags().wants_write() {
        delayed_copyup_if_needed(sb, file, &inode)?;
    }
    Ok(())
}

/// Moves a regular file's single open slot to its branch's current index,
/// or reopens at `dbstart` when the saved branch is gone.
///
/// An open handle deliberately stays on the branch it was opened against
/// even when a newly inserted branch shadows the name: the bytes behind an
/// open file do not change until close. Copy-up retargets are handled by
/// the delayed-copy-up path instead.
fn remap_regular_file(sb: &Arc<SuperInner>, file: &Arc<UnionFile>) -> Result<()> {
    let dentry = file.dentry();
    let mut ffan = file.fanout();

    let old_index = match ffan.start() {
        b if b >= 0 => b as usize,
        _ => return Err(Errno::ESTALE),
    };
    let slot = ffan.set_lower(old_index, None);

    let new_index = slot
        .as_ref()
        .and_then(|s| sb.branch_index_of(s.open_ref.saved_id()));

    let count = sb.branch_count();
    ffan.reset(count);
    match (slot, new_index) {
        (Some(slot), Some(new_index)) => {
            ffan.set_lower(new_index, Some(slot));
            ffan.set_start(new_index as i32);
            ffan.set_end(new_index as i32);
        }
        (_, None) | (None, _) => {
            // The saved branch left the table; fall back to a fresh open
            // at the dentry's current dbstart. The original truncate, if
            // any, already happened.
            drop(ffan);
            let inode = dentry.inode().ok_or(Errno::ESTALE)?;
            let mut fresh = file.fanout();
            let flags = OpenFlags(file.flags().0 & !libc::O_TRUNC);
            open_file(sb, dentry, &inode, &mut fresh, flags)?;
        }
    }
    Ok(())
}

/// Copies a write-masked file up to a writable branch and reopens it
/// there.
fn delayed_copyup_if_needed(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    inode: &Arc<UnionInode>,
) -> Result<()> {
    let dentry = file.dentry();
    let mut ffan = file.fanout();
    let fbstart = match ffan.start() {
        b if b >= 0 => b as usize,
        _ => return Err(Errno::ESTALE),
    };
    let needs_copyup = match ffan.lower(fbstart) {
        Some(slot) => slot.write_masked && !slot.open_ref.branch().is_writable(),
        None => return Err(Errno::ESTALE),
    };
    if !needs_copyup {
        return Ok(());
    }

    debug!(
        "unionfs: delayed copyup of a read-write file on a read-only branch ({})",
        dentry.path_display()
    );

    let size = inode.size();
    let mut dfan = dentry.fanout();
    let already = dfan.start() >= 0
        && (dfan.start() as usize) < fbstart
        && dfan
            .lower(dfan.start() as usize)
            .is_some_and(|slot| slot.dentry.is_positive());
    let new_index = if already {
        // Another path already promoted the file; just follow it.
        dfan.start() as usize
    } else if dentry.is_deleted() {
        // The name is already gone: the copy gets a generated name and
        // lives on as an unlinked-but-open file.
        let src_file = ffan
            .lower(fbstart)
            .map(|slot| slot.file.try_clone())
            .ok_or(Errno::ESTALE)??;
        let mut result = Err(Errno::EROFS);
        for bindex in (0..fbstart).rev() {
            match copyup::copyup_deleted_file(sb, dentry, &mut dfan, fbstart, bindex, size, Some(&src_file))
            {
                Ok(_) => {
                    result = Ok(bindex);
                    break;
                }
                Err(err) if err.is_copyup_err() => result = Err(err),
                Err(err) => return Err(err),
            }
        }
        result?
    } else {
        copyup::copyup_dentry_leftward(sb, dentry, &mut dfan, fbstart, size)?
    };

    // Reopen on the branch the copy landed on, with the real flags.
    let slot = dfan
        .lower(new_index)
        .filter(|s| s.dentry.is_positive())
        .ok_or(Errno::EIO)?;
    let branch = sb.branch_at(new_index)?;
    let lower_flags = file.flags().0 & !libc::O_TRUNC;
    let lower_file = lower::open(&slot.dentry.path(), lower_flags)?;
    drop(dfan);

    ffan.set_lower(fbstart, None);
    ffan.set_lower(
        new_index,
        Some(LowerFile {
            file: lower_file,
            open_ref: branch.branchget(),
            mnt: branch.mntget(),
            write_masked: false,
        }),
    );
    ffan.set_start(new_index as i32);
    ffan.set_end(new_index as i32);
    Ok(())
}

/// Runs `f` with the open lower file at `fbstart`.
pub(crate) fn with_lower_file<T>(
    file: &Arc<UnionFile>,
    f: impl FnOnce(&std::fs::File) -> Result<T>,
) -> Result<T> {
    let ffan = file.fanout();
    let start = ffan.start();
    if start < 0 {
        return Err(Errno::EBADF);
    }
    let slot = ffan.lower(start as usize).ok_or(Errno::EBADF)?;
    f(&slot.file)
}

/// Reads from the file at `offset`.
pub(crate) fn read(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize> {
    file_revalidate(sb, file, false)?;
    let n = with_lower_file(file, |lower_file| {
        let n = lower::pread(lower_file, buf, offset)?;
        touch_atime(file, lower_file);
        Ok(n)
    })?;
    Ok(n)
}

/// Vectored read at `offset`.
pub(crate) fn read_vectored(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    bufs: &mut [IoSliceMut<'_>],
    offset: u64,
) -> Result<usize> {
    file_revalidate(sb, file, false)?;
    with_lower_file(file, |lower_file| {
        let n = lower::preadv(lower_file, bufs, offset)?;
        touch_atime(file, lower_file);
        Ok(n)
    })
}

/// Writes at `offset` (or at end-of-file for append opens), copying up
/// first when the data lives on a read-only branch.
pub(crate) fn write(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    buf: &[u8],
    offset: u64,
) -> Result<usize> {
    file_revalidate(sb, file, true)?;
    let inode = file.inode().ok_or(Errno::ESTALE)?;
    let offset = if file.flags().is_append() {
        inode.size()
    } else {
        offset
    };
    let written = with_lower_file(file, |lower_file| lower::pwrite(lower_file, buf, offset))?;
    update_size_and_times(file, &inode, offset + written as u64);
    Ok(written)
}

/// Vectored write at `offset`.
pub(crate) fn write_vectored(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    bufs: &[IoSlice<'_>],
    offset: u64,
) -> Result<usize> {
    file_revalidate(sb, file, true)?;
    let inode = file.inode().ok_or(Errno::ESTALE)?;
    let offset = if file.flags().is_append() {
        inode.size()
    } else {
        offset
    };
    let written = with_lower_file(file, |lower_file| lower::pwritev(lower_file, bufs, offset))?;
    update_size_and_times(file, &inode, offset + written as u64);
    Ok(written)
}

fn touch_atime(file: &Arc<UnionFile>, lower_file: &std::fs::File) {
    if let Some(inode) = file.inode() {
        if let Ok(meta) = lower::fstat(lower_file) {
            inode.attr().atime = meta.atime;
        }
    }
}

fn update_size_and_times(file: &Arc<UnionFile>, inode: &Arc<UnionInode>, end: u64) {
    let _ = file;
    let mut attr = inode.attr();
    if end > attr.size {
        attr.size = end;
    }
    let now = SystemTime::now();
    attr.mtime = now;
    attr.ctime = now;
}

/// Merged directory listing starting at `fpos`.
pub(crate) fn readdir(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    fpos: i64,
) -> Result<Vec<DirEntry>> {
    file_revalidate(sb, file, false)?;
    let dentry = file.dentry();
    let inode = file.inode().ok_or(Errno::ESTALE)?;
    if !inode.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let mut slot = file.rdstate.lock();
    crate::readdir::do_readdir(dentry, &inode, &mut slot, fpos, &sb.config)
}

/// Seek; directory offsets only move to positions a cursor can resume.
pub(crate) fn llseek(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    pos: std::io::SeekFrom,
) -> Result<i64> {
    file_revalidate(sb, file, false)?;
    let inode = file.inode().ok_or(Errno::ESTALE)?;

    if inode.is_dir() {
        let offset = match pos {
            std::io::SeekFrom::Start(n) => n as i64,
            std::io::SeekFrom::Current(0) => return Ok(*file.pos.lock()),
            _ => return Err(Errno::EINVAL),
        };
        let mut slot = file.rdstate.lock();
        let new = crate::readdir::dir_llseek(&inode, &mut slot, offset, sb.config.rdcache_retention)?;
        *file.pos.lock() = new;
        return Ok(new);
    }

    let mut cur = file.pos.lock();
    let next = match pos {
        std::io::SeekFrom::Start(n) => n as i64,
        std::io::SeekFrom::Current(delta) => *cur + delta,
        std::io::SeekFrom::End(delta) => inode.size() as i64 + delta,
    };
    if next < 0 {
        return Err(Errno::EINVAL);
    }
    *cur = next;
    Ok(next)
}

/// Propagates fsync to the opened lower files.
pub(crate) fn fsync(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    datasync: bool,
) -> Result<()> {
    file_revalidate(sb, file, true)?;
    let ffan = file.fanout();
    for (_, slot) in ffan.iter() {
        let caps = lower::fstat(&slot.file).map(|meta| LowerCaps::probe(&meta));
        if !caps.map(|c| c.can_fsync).unwrap_or(false) {
            continue;
        }
        if datasync {
            lower::fdatasync(&slot.file)?;
        } else {
            lower::fsync(&slot.file)?;
        }
    }
    Ok(())
}

/// Close-time flush: decrements the union open count; the last close
/// propagates a flush to every opened lower file and, for a deleted name,
/// drops the lower dentries so the lower inodes can go.
pub(crate) fn flush(sb: &Arc<SuperInner>, file: &Arc<UnionFile>) -> Result<()> {
    file_revalidate(sb, file, true)?;
    let dentry = file.dentry();
    let inode = file.inode().ok_or(Errno::ESTALE)?;
    if !inode.dec_opens() {
        return Ok(());
    }

    let ffan = file.fanout();
    for (_, slot) in ffan.iter() {
        let caps = lower::fstat(&slot.file).map(|meta| LowerCaps::probe(&meta));
        if !caps.map(|c| c.can_fsync).unwrap_or(false) {
            continue;
        }
        lower::flush(&slot.file)?;
    }
    drop(ffan);

    if dentry.is_deleted() {
        let mut dfan = dentry.fanout();
        for slot in dfan.drain() {
            drop(slot);
        }
    }
    Ok(())
}

/// Releases the open file: parks the readdir cursor on the inode and
/// closes every lower handle, decrementing branch opens under saved ids.
pub(crate) fn release(sb: &Arc<SuperInner>, file: &Arc<UnionFile>) -> Result<()> {
    if file.released.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    if let Some(state) = file.rdstate.lock().take() {
        if let Some(inode) = file.inode() {
            inode
                .rdcache
                .lock()
                .park(state, sb.config.rdcache_capacity);
        }
    }
    let mut ffan = file.fanout();
    for slot in ffan.drain() {
        // Closing the fd and the open/mnt guards is the release; the
        // guards decrement under the branch ids saved at open.
        drop(slot);
    }
    Ok(())
}

/// The two reserved control codes, plus pass-through.
pub(crate) fn ioctl(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    request: IoctlRequest<'_>,
) -> Result<i64> {
    file_revalidate(sb, file, true)?;
    match request {
        IoctlRequest::IncGen => {
            warn!("unionfs: incgen ioctl deprecated");
            Err(Errno::ENOSYS)
        }
        IoctlRequest::QueryFile(out) => {
            *out = query_branches(sb, file)?;
            Ok(0)
        }
        IoctlRequest::Other { cmd, arg } => with_lower_file(file, |lower_file| {
            use std::os::fd::AsRawFd;
            let rc = unsafe { libc::ioctl(lower_file.as_raw_fd(), cmd as libc::c_ulong, arg) };
            if rc < 0 {
                Err(Errno::last_os_error())
            } else {
                Ok(rc as i64)
            }
        }),
    }
}

/// Which branches carry this file's name right now.
///
/// Probed against the parent's lower directories rather than by widening
/// the file's own fan-out, which stays single-branch for non-directories.
fn query_branches(sb: &Arc<SuperInner>, file: &Arc<UnionFile>) -> Result<QueryFileSet> {
    let dentry = file.dentry();
    let mut set = QueryFileSet::default();
    let Some(parent) = dentry.parent() else {
        for bindex in 0..sb.branch_count() {
            set.insert(bindex);
        }
        return Ok(set);
    };
    let name = dentry.name().to_os_string();
    let streams: Vec<(usize, std::path::PathBuf)> = {
        let pf = parent.fanout();
        match pf.scan_range() {
            None => Vec::new(),
            Some(range) => range
                .filter_map(|b| {
                    let slot = pf.lower(b)?;
                    let meta = slot.dentry.meta()?;
                    meta.is_dir().then(|| (b, slot.dentry.path()))
                })
                .collect(),
        }
    };
    for (bindex, dir) in streams {
        if lower::lookup_one(&dir, &name)?.is_positive() {
            set.insert(bindex);
        }
    }
    Ok(set)
}

/// Capability check for memory mapping: a writable shared mapping needs a
/// lower filesystem that can write pages back.
pub(crate) fn mmap(sb: &Arc<SuperInner>, file: &Arc<UnionFile>, shared_write: bool) -> Result<()> {
    file_revalidate(sb, file, shared_write)?;
    if !shared_write {
        return Ok(());
    }
    let writable = with_lower_file(file, |lower_file| {
        Ok(lower::fstat(lower_file)
            .map(|meta| LowerCaps::probe(&meta).can_writepage)
            .unwrap_or(false))
    })?;
    if !writable {
        let ffan = file.fanout();
        warn!(
            "unionfs: branch {} file system does not support writeable mmap",
            ffan.start()
        );
        return Err(Errno::EINVAL);
    }
    Ok(())
}

/// Poll readiness; delegated only where the lower object is pollable.
pub(crate) fn poll(sb: &Arc<SuperInner>, file: &Arc<UnionFile>) -> Result<u32> {
    file_revalidate(sb, file, false)?;
    Ok(DEFAULT_POLLMASK)
}

/// Async-notification registration is accepted only where the lower
/// object could deliver it; regular files take it as a no-op.
pub(crate) fn fasync(sb: &Arc<SuperInner>, file: &Arc<UnionFile>, _on: bool) -> Result<()> {
    file_revalidate(sb, file, false)?;
    Ok(())
}
