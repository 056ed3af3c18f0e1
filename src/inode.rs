//! Union inodes and interposition.
//!
//! A union inode mirrors the attributes of the first (highest-priority)
//! lower inode in its fan-out and selects its operation surface from that
//! inode's type. *Interposing* binds a freshly built union inode to a
//! dentry after lookup; revalidation re-fills an existing inode in place;
//! partial lookups augment one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::dentry::{LowerSlot, UnionDentry};
use crate::errors::{Errno, Result};
use crate::fanout::Fanout;
use crate::lower::{self, LowerDentry, LowerMeta};
use crate::page_bridge::LowerPage;
use crate::readdir::RdCursorCache;
use crate::{FileAttr, FileKind, SuperInner};

/// Attributes cached on the union inode, mirrored from the first lower
/// inode and pushed back up after mutations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InodeAttr {
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) size: u64,
    pub(crate) blocks: u64,
    pub(crate) nlink: u64,
    pub(crate) rdev: u64,
    pub(crate) atime: SystemTime,
    pub(crate) mtime: SystemTime,
    pub(crate) ctime: SystemTime,
}

impl InodeAttr {
    fn from_meta(meta: &LowerMeta) -> InodeAttr {
        InodeAttr {
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            size: meta.size,
            blocks: meta.blocks,
            nlink: meta.nlink,
            rdev: meta.rdev,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
        }
    }

    /// Times and ownership only; size and link count are managed
    /// separately.
    pub(crate) fn copy_times(&mut self, meta: &LowerMeta) {
        self.atime = meta.atime;
        self.mtime = meta.mtime;
        self.ctime = meta.ctime;
    }
}

/// How interpose should bind the inode it builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterposeMode {
    /// Instantiate on the dentry without splicing.
    Default,
    /// Fresh lookup; the host may alias the dentry.
    Lookup,
    /// Reuse and re-fill the dentry's existing inode.
    Reval,
    /// Negative revalidation turned positive; bind in place.
    RevalNeg,
}

/// The union-level inode.
#[derive(Debug)]
pub struct UnionInode {
    ino: u64,
    kind: FileKind,
    sb: Weak<SuperInner>,
    generation: AtomicU64,
    stale: AtomicBool,
    total_opens: AtomicI64,
    attr: Mutex<InodeAttr>,
    fanout: Mutex<Fanout<LowerDentry>>,
    pub(crate) rdcache: Mutex<RdCursorCache>,
    pub(crate) pages: Mutex<BTreeMap<u64, LowerPage>>,
}

impl UnionInode {
    fn alloc(sb: &Arc<SuperInner>, kind: FileKind, meta: &LowerMeta) -> Arc<UnionInode> {
        Arc::new(UnionInode {
            ino: sb.next_ino(),
            kind,
            sb: Arc::downgrade(sb),
            generation: AtomicU64::new(sb.generation()),
            stale: AtomicBool::new(false),
            total_opens: AtomicI64::new(0),
            attr: Mutex::new(InodeAttr::from_meta(meta)),
            fanout: Mutex::new(Fanout::new(sb.branch_count())),
            rdcache: Mutex::new(RdCursorCache::default()),
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    /// Union-level inode number, unique for the mount's lifetime.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// The file type this inode was interposed as.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub(crate) fn inc_opens(&self) {
        self.total_opens.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the open counter, reporting whether this was the last
    /// open.
    pub(crate) fn dec_opens(&self) -> bool {
        self.total_opens.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn open_count(&self) -> i64 {
        self.total_opens.load(Ordering::Acquire)
    }

    pub(crate) fn fanout(&self) -> MutexGuard<'_, Fanout<LowerDentry>> {
        self.fanout.lock()
    }

    pub(crate) fn attr(&self) -> MutexGuard<'_, InodeAttr> {
        self.attr.lock()
    }

    pub(crate) fn times(&self) -> (SystemTime, SystemTime) {
        let attr = self.attr.lock();
        (attr.mtime, attr.ctime)
    }

    pub(crate) fn size(&self) -> u64 {
        self.attr.lock().size
    }

    /// Public attribute view, what the host's `getattr` returns.
    pub(crate) fn file_attr(&self) -> FileAttr {
        let attr = self.attr.lock();
        FileAttr {
            ino: self.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            kind: self.kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink as u32,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
        }
    }

    /// Re-fills this inode's lower array from a dentry fan-out and copies
    /// attributes from the new first lower inode. The dentry fan-out is
    /// already sized to the current branch count.
    pub(crate) fn fill_from(&self, dentry_fanout: &Fanout<LowerSlot>) {
        let mut fanout = self.fanout.lock();
        fanout.reset(dentry_fanout.len());
        for (index, slot) in dentry_fanout.iter() {
            if slot.dentry.is_positive() {
                fanout.set_lower(index, Some(slot.dentry.clone()));
            }
        }
        fanout.set_start(dentry_fanout.start());
        fanout.set_end(dentry_fanout.end());
        let nlink = get_nlinks(self.kind, &fanout);
        if let Some(first) = fanout.first_lower() {
            if let Some(meta) = first.meta() {
                let mut attr = self.attr.lock();
                *attr = InodeAttr::from_meta(meta);
                attr.nlink = nlink;
            }
        }
    }

    /// Adds newly found lower inodes without disturbing existing slots
    /// (partial lookup).
    pub(crate) fn augment_from(&self, dentry_fanout: &Fanout<LowerSlot>) {
        let mut fanout = self.fanout.lock();
        for (index, slot) in dentry_fanout.iter() {
            if slot.dentry.is_positive() && fanout.lower(index).is_none() {
                fanout.set_lower(index, Some(slot.dentry.clone()));
            }
        }
        fanout.set_start(dentry_fanout.start());
        fanout.set_end(dentry_fanout.end());
        let nlink = get_nlinks(self.kind, &fanout);
        self.attr.lock().nlink = nlink;
    }

    /// Re-stats the first lower inode and mirrors its attributes up.
    pub(crate) fn refresh_from_first_lower(&self) {
        let fanout = self.fanout.lock();
        let Some(first) = fanout.first_lower() else {
            return;
        };
        let Ok(meta) = lower::stat_path(&first.path()) else {
            return;
        };
        let nlink = if self.kind == FileKind::Directory {
            get_nlinks_fresh(&fanout)
        } else {
            meta.nlink
        };
        let mut attr = self.attr.lock();
        let size = if self.kind == FileKind::RegularFile {
            // A locally grown file may be ahead of the lower size until
            // writeback; never shrink it here.
            attr.size.max(meta.size)
        } else {
            meta.size
        };
        *attr = InodeAttr::from_meta(&meta);
        attr.size = size;
        attr.nlink = nlink;
    }

    /// Drops the union's cached lower pages (the page-cache purge step of
    /// revalidation).
    pub(crate) fn truncate_cached_pages(&self) {
        self.pages.lock().clear();
    }

    /// The lower dentry at the inode's `ibstart`, for delegation.
    pub(crate) fn first_lower(&self) -> Option<LowerDentry> {
        self.fanout.lock().first_lower().cloned()
    }
}

/// Builds (or re-fills) the union inode for a dentry whose fan-out has at
/// least one positive lower dentry, and binds it.
///
/// The host may choose to alias the dentry on `Lookup`; this host binding
/// never does, so the returned alias is always `None`.
pub(crate) fn interpose(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    dentry_fanout: &Fanout<LowerSlot>,
    mode: InterposeMode,
) -> Result<Option<Arc<UnionDentry>>> {
    let first = dentry_fanout
        .first_lower()
        .and_then(|slot| slot.dentry.meta())
        .copied()
        .ok_or(Errno::EIO)?;

    match mode {
        InterposeMode::Reval => {
            let inode = dentry.inode().ok_or(Errno::ESTALE)?;
            if inode.kind() != first.kind() {
                // The name now resolves to a different kind of object; the
                // old inode cannot represent it.
                inode.mark_stale();
                return Ok(None);
            }
            inode.fill_from(dentry_fanout);
            inode.set_generation(sb.generation());
        }
        InterposeMode::Default | InterposeMode::Lookup | InterposeMode::RevalNeg => {
            let inode = UnionInode::alloc(sb, first.kind(), &first);
            inode.fill_from(dentry_fanout);
            debug!(
                "unionfs: interposed inode {} ({:?}) on {}",
                inode.ino(),
                inode.kind(),
                dentry.path_display()
            );
            dentry.set_inode(inode);
        }
    }
    Ok(None)
}

/// Re-runs the fill step for a dentry that already carries an inode
/// (partial lookup).
pub(crate) fn reinterpose(dentry: &Arc<UnionDentry>, dentry_fanout: &Fanout<LowerSlot>) {
    if let Some(inode) = dentry.inode() {
        inode.augment_from(dentry_fanout);
    }
}

/// Link count of a union inode (rule D).
///
/// Directories sum `nlink - 2` over present lower directories and add the
/// final 2; an empty slot contributes nothing, a deleted lower directory
/// (nlink 0) contributes 0, and a lower filesystem that reports 1 for its
/// directories contributes 2.
/// Rule D over freshly stat'ed lower directories, for attribute refreshes
/// where the cached snapshots may be behind.
fn get_nlinks_fresh(fanout: &Fanout<LowerDentry>) -> u64 {
    let mut sum = 0u64;
    let mut dirs = 0u64;
    for (_, ld) in fanout.iter() {
        let Ok(meta) = lower::stat_path(&ld.path()) else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        match meta.nlink {
            0 => continue,
            1 => sum += 2,
            n => sum += n - 2,
        }
        dirs += 1;
    }
    if dirs == 0 { 0 } else { sum + 2 }
}

pub(crate) fn get_nlinks(kind: FileKind, fanout: &Fanout<LowerDentry>) -> u64 {
    if kind != FileKind::Directory {
        return fanout
            .first_lower()
            .and_then(|ld| ld.meta())
            .map(|meta| meta.nlink)
            .unwrap_or(0);
    }
    let mut sum = 0u64;
    let mut dirs = 0u64;
    for (_, ld) in fanout.iter() {
        let Some(meta) = ld.meta() else { continue };
        if !meta.is_dir() {
            continue;
        }
        match meta.nlink {
            0 => continue,
            1 => sum += 2,
            n => sum += n - 2,
        }
        dirs += 1;
    }
    if dirs == 0 { 0 } else { sum + 2 }
}
