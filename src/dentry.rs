//! Union dentries and the revalidation protocol.
//!
//! A [`UnionDentry`] binds one path component to a fan-out of lower
//! dentries. The host owns dentries by reference count; parents are held
//! alive by their children, never the other way around, so release runs
//! leaf-first.
//!
//! A dentry whose generation matches the superblock generation is *current*:
//! its branch indices are expressed in the current branch ordering. Any
//! branch reconfiguration bumps the superblock generation, making every
//! dentry (except the root, which branch management refreshes in place)
//! stale at once. Stale dentries are rebuilt by re-running lookup before the
//! operation that found them proceeds; a lower inode whose times moved
//! forward additionally has the union's cached pages purged so readers see
//! the new bytes.

use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::SuperInner;
use crate::branch::MntRef;
use crate::errors::{Errno, Result};
use crate::fanout::Fanout;
use crate::inode::UnionInode;
use crate::lookup::{self, LookupMode};
use crate::lower::{self, LowerDentry};

/// One lower dentry plus the mount reference pinning its branch.
#[derive(Debug, Clone)]
pub(crate) struct LowerSlot {
    pub(crate) dentry: LowerDentry,
    pub(crate) mnt: MntRef,
}

/// A name in the union namespace, fanned out over the branches that carry
/// it.
#[derive(Debug)]
pub struct UnionDentry {
    sb: Weak<SuperInner>,
    parent: Option<Arc<UnionDentry>>,
    name: OsString,
    fanout: Mutex<Fanout<LowerSlot>>,
    generation: AtomicU64,
    unhashed: AtomicBool,
    inode: Mutex<Option<Arc<UnionInode>>>,
}

impl UnionDentry {
    pub(crate) fn new_root(sb: &Arc<SuperInner>, fanout: Fanout<LowerSlot>) -> Arc<UnionDentry> {
        Arc::new(UnionDentry {
            sb: Arc::downgrade(sb),
            parent: None,
            name: OsString::from("/"),
            fanout: Mutex::new(fanout),
            generation: AtomicU64::new(sb.generation()),
            unhashed: AtomicBool::new(false),
            inode: Mutex::new(None),
        })
    }

    /// Allocates a fresh (negative, stale-ranged) child dentry.
    pub(crate) fn alloc(
        sb: &Arc<SuperInner>,
        parent: &Arc<UnionDentry>,
        name: &OsStr,
    ) -> Arc<UnionDentry> {
        Arc::new(UnionDentry {
            sb: Weak::clone(&parent.sb),
            parent: Some(Arc::clone(parent)),
            name: name.to_os_string(),
            fanout: Mutex::new(Fanout::new(sb.branch_count())),
            generation: AtomicU64::new(sb.generation()),
            unhashed: AtomicBool::new(false),
            inode: Mutex::new(None),
        })
    }

    /// The final path component this dentry resolves.
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// The parent dentry; `None` only for the root.
    pub fn parent(&self) -> Option<&Arc<UnionDentry>> {
        self.parent.as_ref()
    }

    /// Whether this is the mount root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn fanout(&self) -> MutexGuard<'_, Fanout<LowerSlot>> {
        self.fanout.lock()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// The union inode bound to this dentry, if it is positive.
    pub fn inode(&self) -> Option<Arc<UnionInode>> {
        self.inode.lock().clone()
    }

    pub(crate) fn set_inode(&self, inode: Arc<UnionInode>) {
        *self.inode.lock() = Some(inode);
    }

    /// Unhashes the dentry: the name is logically gone from the namespace,
    /// though open files may keep the object alive.
    pub(crate) fn d_drop(&self) {
        self.unhashed.store(true, Ordering::Release);
    }

    /// Unhashed and not the root (the root is unhashed but never deleted).
    pub(crate) fn is_deleted(&self) -> bool {
        self.unhashed.load(Ordering::Acquire) && !self.is_root()
    }

    /// Union-visible path, for diagnostics.
    pub(crate) fn path_display(&self) -> String {
        match &self.parent {
            None => "/".to_string(),
            Some(parent) => {
                let base = parent.path_display();
                let name = self.name.to_string_lossy();
                if base.ends_with('/') {
                    format!("{base}{name}")
                } else {
                    format!("{base}/{name}")
                }
            }
        }
    }
}

/// Revalidates `dentry` after making its whole ancestor chain current.
///
/// This is the entry gate every operation that receives an existing dentry
/// passes through. On success the dentry's generation equals the superblock
/// generation and its fan-out indices are expressed in the current branch
/// ordering. `ESTALE` means the chain could not be made current and the
/// host should re-walk the path.
pub(crate) fn revalidate_chain(sb: &Arc<SuperInner>, dentry: &Arc<UnionDentry>) -> Result<()> {
    // An unhashed dentry no longer exists in the namespace; there is
    // nothing to make current. Open-file paths rely on this.
    if dentry.is_deleted() {
        return Ok(());
    }

    let sbgen = sb.generation();

    // Collect the stale ancestors, nearest-first.
    let mut chain: Vec<Arc<UnionDentry>> = Vec::new();
    let mut cursor = dentry.parent().cloned();
    while let Some(node) = cursor {
        if node.generation() == sbgen && !is_newer_lower(&node) {
            break;
        }
        if node.is_root() {
            // Branch management keeps the root stamped; a stale root means
            // the superblock itself is going away.
            warn!("unionfs: root dentry is stale");
            return Err(Errno::ESTALE);
        }
        cursor = node.parent().cloned();
        chain.push(node);
    }

    // Revalidate top-down: a parent must be current before its child.
    for node in chain.iter().rev() {
        revalidate_one(sb, node, sbgen)?;
    }

    revalidate_one(sb, dentry, sbgen)
}

/// Revalidates a single dentry whose parent is already current.
fn revalidate_one(sb: &Arc<SuperInner>, dentry: &Arc<UnionDentry>, sbgen: u64) -> Result<()> {
    if dentry.is_deleted() {
        return Ok(());
    }

    let mut force = false;
    if is_newer_lower(dentry) {
        // A lower filesystem changed underneath us: drop cached pages and
        // force a rebuild so the next read sees the new data.
        purge_inode_data(dentry);
        force = true;
    }

    if !force && dentry.generation() == sbgen {
        // Current by generation; confirm the lower objects themselves have
        // not been swapped out underneath (the lower filesystems' own
        // revalidation step).
        if lower_slots_current(dentry) {
            refresh_cached_attrs(dentry);
            return Ok(());
        }
        force = true;
        purge_inode_data(dentry);
    }

    let positive = dentry.inode().is_some();
    let mode = if positive {
        LookupMode::Reval
    } else {
        LookupMode::RevalNeg
    };
    debug!(
        "unionfs: revalidating {} ({:?}, forced={force})",
        dentry.path_display(),
        mode
    );
    lookup::lookup_backend(sb, dentry, mode)?;

    if let Some(inode) = dentry.inode() {
        if positive && inode.is_stale() {
            // The name went away in every branch while we were stale.
            dentry.d_drop();
            return Err(Errno::ESTALE);
        }
    }
    Ok(())
}

/// Has any lower inode in this dentry's fan-out moved ahead of the union
/// inode's times?
pub(crate) fn is_newer_lower(dentry: &Arc<UnionDentry>) -> bool {
    if dentry.is_root() {
        return false;
    }
    let Some(inode) = dentry.inode() else {
        return false;
    };
    let (mtime, ctime) = inode.times();
    let fanout = inode.fanout();
    for (_, ld) in fanout.iter() {
        let Ok(meta) = lower::stat_path(&ld.path()) else {
            continue;
        };
        if meta.mtime > mtime {
            debug!(
                "unionfs: resyncing with lower inode (new mtime, name={})",
                dentry.path_display()
            );
            return true;
        }
        if meta.ctime > ctime {
            debug!(
                "unionfs: resyncing with lower inode (new ctime, name={})",
                dentry.path_display()
            );
            return true;
        }
    }
    false
}

/// Checks that every lower dentry in the fan-out still names the same lower
/// inode it did when installed.
fn lower_slots_current(dentry: &Arc<UnionDentry>) -> bool {
    let fanout = dentry.fanout();
    for (_, slot) in fanout.iter() {
        let Some(saved) = slot.dentry.meta() else {
            continue;
        };
        match lower::stat_path(&slot.dentry.path()) {
            Ok(current) if current.same_inode(saved) => {}
            _ => return false,
        }
    }
    true
}

/// Mirrors possibly-changed lower attributes into the union inode of a
/// dentry that revalidation found current.
fn refresh_cached_attrs(dentry: &Arc<UnionDentry>) {
    let Some(inode) = dentry.inode() else {
        return;
    };
    inode.refresh_from_first_lower();
}

/// Drops all union-level cached data for the inode and marks the dentry
/// ancient so the next revalidation rebuilds it. Active mappings cannot be
/// revoked; this is the documented best effort.
pub(crate) fn purge_inode_data(dentry: &Arc<UnionDentry>) {
    dentry.set_generation(0);
    if let Some(inode) = dentry.inode() {
        inode.truncate_cached_pages();
    }
}

/// Locks two dentries in address order, the discipline for independent
/// pairs (rename, link).
pub(crate) fn lock_pair<'a>(
    a: &'a Arc<UnionDentry>,
    b: &'a Arc<UnionDentry>,
) -> (
    MutexGuard<'a, Fanout<LowerSlot>>,
    Option<MutexGuard<'a, Fanout<LowerSlot>>>,
) {
    if Arc::ptr_eq(a, b) {
        return (a.fanout(), None);
    }
    let a_addr = Arc::as_ptr(a) as usize;
    let b_addr = Arc::as_ptr(b) as usize;
    if a_addr < b_addr {
        let ga = a.fanout();
        let gb = b.fanout();
        (ga, Some(gb))
    } else {
        let gb = b.fanout();
        let ga = a.fanout();
        (ga, Some(gb))
    }
}
