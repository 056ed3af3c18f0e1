//! The write-through page bridge.
//!
//! The host owns the upper pages; this module keeps them in sync with the
//! lower file at the fan-out's `fbstart`. Reads fill the upper page through
//! a cached mirror of the lower page; writes go straight through to the
//! lower file at commit time. When writeback meets an index the lower side
//! has no page for, the bridge hands back an *activate* hint and leaves the
//! upper page dirty for a later pass.
//!
//! Concurrent mmap writes to upper and lower files cannot be fully
//! reconciled; the mtime/ctime-driven resync in revalidation is the
//! documented best effort.

use std::sync::Arc;
use std::time::SystemTime;

use crate::errors::{Errno, Result};
use crate::file_ops::{self, UnionFile};
use crate::inode::UnionInode;
use crate::lower;
use crate::{Page, SuperInner};

/// The unit of the bridge: the system page size.
pub(crate) fn page_bytes() -> usize {
    page_size::get()
}

/// A cached mirror of one lower page.
#[derive(Debug)]
pub(crate) struct LowerPage {
    pub(crate) data: Box<[u8]>,
    pub(crate) uptodate: bool,
    /// Dirty-for-io state, cleared ahead of the lower writepage the way
    /// the VFS would.
    #[allow(dead_code)]
    pub(crate) dirty: bool,
    pub(crate) locked: bool,
}

/// What `writepage` asks the host to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritepageOutcome {
    /// The page went through to the lower filesystem.
    Written,
    /// No lower page exists yet; the upper page was left dirty and should
    /// be re-activated for a later writeback pass.
    Activate,
}

/// Writeback context passed by the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct WritebackControl {
    /// The writeback is under memory pressure.
    pub for_reclaim: bool,
}

/// Fills the upper page from the lower file at `fbstart` and caches the
/// lower page, mirroring atime/mtime upward on success.
pub(crate) fn readpage(sb: &Arc<SuperInner>, file: &Arc<UnionFile>, page: &mut Page) -> Result<()> {
    file_ops::file_revalidate(sb, file, false)?;
    let inode = file.inode().ok_or(Errno::ESTALE)?;

    let size = page_bytes();
    let offset = page.index * size as u64;
    let n = file_ops::with_lower_file(file, |lower_file| {
        page.data.fill(0);
        let n = lower::pread(lower_file, &mut page.data, offset)?;
        if let Ok(meta) = lower::fstat(lower_file) {
            let mut attr = inode.attr();
            attr.atime = meta.atime;
            attr.mtime = meta.mtime;
        }
        Ok(n)
    });

    match n {
        Ok(_) => {
            inode.pages.lock().insert(
                page.index,
                LowerPage {
                    data: page.data.clone(),
                    uptodate: true,
                    dirty: false,
                    locked: false,
                },
            );
            page.uptodate = true;
            Ok(())
        }
        Err(err) => {
            page.uptodate = false;
            Err(err)
        }
    }
}

/// Pushes a dirty upper page through the lower page at the same index.
///
/// The lower page is located, never created: writeback of an index the
/// lower side has not seen returns [`WritepageOutcome::Activate`] and
/// leaves the upper page dirty.
pub(crate) fn writepage(
    inode: &Arc<UnionInode>,
    page: &mut Page,
    _wbc: &WritebackControl,
) -> Result<WritepageOutcome> {
    let mut pages = inode.pages.lock();
    let Some(lower_page) = pages.get_mut(&page.index) else {
        page.dirty = true;
        return Ok(WritepageOutcome::Activate);
    };

    lower_page.data.copy_from_slice(&page.data);
    // Mimic the VFS: the lower page is about to be written, so its
    // dirty-for-io state is cleared before the lower writepage runs.
    lower_page.dirty = false;
    lower_page.uptodate = true;

    let lower = inode.first_lower().ok_or(Errno::ESTALE)?;
    let path = lower.path();
    let offset = page.index * page_bytes() as u64;
    // Only the bytes inside the file are written back; a page never grows
    // the lower file.
    let size = inode.size();
    let len = size.saturating_sub(offset).min(page_bytes() as u64) as usize;
    if len == 0 {
        page.dirty = false;
        return Ok(WritepageOutcome::Written);
    }
    let result = lower::open(&path, libc::O_WRONLY)
        .and_then(|lower_file| lower::pwrite(&lower_file, &lower_page.data[..len], offset));
    drop(pages);

    match result {
        Ok(_) => {
            page.dirty = false;
            page.uptodate = true;
            let now = SystemTime::now();
            let mut attr = inode.attr();
            attr.mtime = now;
            attr.ctime = now;
            Ok(WritepageOutcome::Written)
        }
        Err(err) if err == Errno::EROFS || err == Errno::ENOENT => {
            // The lower side cannot take the page right now; hand it back.
            page.dirty = true;
            Ok(WritepageOutcome::Activate)
        }
        Err(err) => {
            page.uptodate = false;
            Err(err)
        }
    }
}

/// Pre-write hook: nothing to stage, but the file must be current (and
/// copied up if the first write is about to land on a read-only branch).
pub(crate) fn prepare_write(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    _page: &Page,
    _from: usize,
    _to: usize,
) -> Result<()> {
    file_ops::file_revalidate(sb, file, true)
}

/// Commits `[from..to)` of the upper page through the lower file,
/// updating size, block count, and times on the union inode.
pub(crate) fn commit_write(
    sb: &Arc<SuperInner>,
    file: &Arc<UnionFile>,
    page: &Page,
    from: usize,
    to: usize,
) -> Result<usize> {
    if from > to || to > page.data.len() {
        return Err(Errno::EINVAL);
    }
    file_ops::file_revalidate(sb, file, true)?;
    let inode = file.inode().ok_or(Errno::ESTALE)?;

    let offset = page.index * page_bytes() as u64 + from as u64;
    let bytes = to - from;
    let written = file_ops::with_lower_file(file, |lower_file| {
        let mut done = 0;
        while done < bytes {
            done += lower::pwrite(lower_file, &page.data[from + done..to], offset + done as u64)?;
        }
        // Block count and size come from the lower inode after the write.
        if let Ok(meta) = lower::fstat(lower_file) {
            let mut attr = inode.attr();
            attr.blocks = meta.blocks;
            if meta.size > attr.size {
                attr.size = meta.size;
            }
        }
        Ok(done)
    })?;

    // Keep the cached lower page coherent with what just hit the file.
    if let Some(lower_page) = inode.pages.lock().get_mut(&page.index) {
        lower_page.data[from..to].copy_from_slice(&page.data[from..to]);
        lower_page.uptodate = true;
    }

    let pos = page.index * page_bytes() as u64 + to as u64;
    let now = SystemTime::now();
    let mut attr = inode.attr();
    if pos > attr.size {
        attr.size = pos;
    }
    attr.mtime = now;
    attr.ctime = now;
    drop(attr);

    Ok(written)
}

/// Pushes a locked, cached lower page out; a no-op otherwise.
pub(crate) fn sync_page(inode: &Arc<UnionInode>, page: &Page) -> Result<()> {
    let mut pages = inode.pages.lock();
    let Some(lower_page) = pages.get_mut(&page.index) else {
        return Ok(());
    };
    if !lower_page.locked || !lower_page.uptodate {
        return Ok(());
    }
    let lower = inode.first_lower().ok_or(Errno::ESTALE)?;
    let offset = page.index * page_bytes() as u64;
    let len = inode.size().saturating_sub(offset).min(page_bytes() as u64) as usize;
    if len > 0 {
        let lower_file = lower::open(&lower.path(), libc::O_WRONLY)?;
        lower::pwrite(&lower_file, &lower_page.data[..len], offset)?;
    }
    lower_page.locked = false;
    Ok(())
}
