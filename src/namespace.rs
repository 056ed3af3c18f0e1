//! Namespace operations: create, link, symlink, mkdir, mknod, unlink,
//! rmdir, rename, readlink, permission, setattr.
//!
//! The common shape: revalidate, find the leftmost writable branch at or
//! left of the dentry's `dbstart`, deal with a pre-existing whiteout for
//! the name, perform the lower operation, and walk left with copy-up /
//! parent replication whenever a read-only branch answers `EROFS`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, error, warn};

use crate::copyup;
use crate::dentry::{self, LowerSlot, UnionDentry};
use crate::dirhelper;
use crate::errors::{Errno, Result};
use crate::fanout::Fanout;
use crate::inode::{self, InterposeMode};
use crate::lower::{self, LowerDentry};
use crate::whiteout;
use crate::{AccessMask, FileKind, SetAttr, SuperInner};

/// Creates a regular file on the dentry's creation-target branch.
///
/// A whiteout for the name is not deleted but *renamed over*: truncated to
/// zero, reset to the caller's mode and ownership, and moved into place.
/// That keeps the masking of lower content intact with no window where the
/// name is absent.
pub(crate) fn create(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, perm: u32) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    if d.inode().is_some() {
        return Err(Errno::EEXIST);
    }

    let mut fanout = d.fanout();
    let bstart = positive_start(&fanout, true)?;

    // Whiteout-rename is preferred over delete+create.
    if let Some(target) = fanout.lower(bstart) {
        let wh = whiteout::lookup_whiteout(target.dentry.parent_dir(), d.name())?;
        if wh.is_positive() {
            match create_over_whiteout(sb, d, &mut fanout, bstart, &wh, perm) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_copyup_err() => {
                    // Try the branches to the left via the normal path.
                }
                Err(err) => return Err(err),
            }
        }
    }

    for bindex in (0..=bstart).rev() {
        let ld = match lower_target(sb, d, &fanout, bindex) {
            Ok(ld) => ld,
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        };
        match sb
            .branch_at(bindex)?
            .check_writable()
            .and_then(|_| lower::create(&ld.path(), perm))
        {
            Ok(_) => {
                finish_creation(sb, d, &mut fanout, bindex)?;
                return Ok(());
            }
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        }
    }
    Err(Errno::EROFS)
}

/// The whiteout-rename arm of `create`.
fn create_over_whiteout(
    sb: &Arc<SuperInner>,
    d: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bstart: usize,
    wh: &LowerDentry,
    perm: u32,
) -> Result<()> {
    sb.branch_at(bstart)?.check_writable()?;

    let wh_path = wh.path();
    // Reset the old mask to look freshly created: empty, caller-owned,
    // current times, requested mode.
    lower::truncate(&wh_path, 0)?;
    lower::chmod(&wh_path, perm)?;
    let euid = nix::unistd::Uid::effective().as_raw();
    let egid = nix::unistd::Gid::effective().as_raw();
    if let Err(err) = lower::chown(&wh_path, Some(euid), Some(egid)) {
        warn!("unionfs: create over whiteout: ownership not reset: {err}");
    }
    let now = SystemTime::now();
    lower::set_times(&wh_path, now, now)?;

    let dst = wh_path.with_file_name(d.name());
    lower::rename(&wh_path, &dst)?;
    debug!("unionfs: created {} over its whiteout", d.path_display());

    finish_creation(sb, d, fanout, bstart)
}

/// Creates a symbolic link. Any whiteout is removed first; link text perms
/// are universal.
pub(crate) fn symlink(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, target: &PathBuf) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    if d.inode().is_some() {
        return Err(Errno::EEXIST);
    }
    let mut fanout = d.fanout();
    let bstart = unmask_name(sb, d, &fanout)?;

    for bindex in (0..=bstart).rev() {
        let ld = match lower_target(sb, d, &fanout, bindex) {
            Ok(ld) => ld,
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        };
        match sb
            .branch_at(bindex)?
            .check_writable()
            .and_then(|_| lower::symlink(target, &ld.path()))
        {
            Ok(_) => {
                finish_creation(sb, d, &mut fanout, bindex)?;
                return Ok(());
            }
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        }
    }
    Err(Errno::EROFS)
}

/// Creates a device node, fifo, or socket.
pub(crate) fn mknod(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, mode: u32, rdev: u64) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    if d.inode().is_some() {
        return Err(Errno::EEXIST);
    }
    let mut fanout = d.fanout();
    let bstart = unmask_name(sb, d, &fanout)?;

    for bindex in (0..=bstart).rev() {
        let ld = match lower_target(sb, d, &fanout, bindex) {
            Ok(ld) => ld,
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        };
        match sb
            .branch_at(bindex)?
            .check_writable()
            .and_then(|_| lower::mknod(&ld.path(), mode, rdev))
        {
            Ok(_) => {
                finish_creation(sb, d, &mut fanout, bindex)?;
                return Ok(());
            }
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        }
    }
    Err(Errno::EROFS)
}

/// Creates a directory and marks it opaque, so it overrides any lower
/// directory of the same name.
pub(crate) fn mkdir(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, perm: u32) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    // No EEXIST short-circuit: a directory that exists only on read-only
    // branches is shadowed by a fresh (opaque) one further left. A copy on
    // a writable branch still reports EEXIST from the creation loop.
    let mut fanout = d.fanout();
    let bstart = unmask_name(sb, d, &fanout)?;

    for bindex in (0..=bstart).rev() {
        if sb.branch_at(bindex)?.check_writable().is_err() {
            continue;
        }
        let ld = match lower_target(sb, d, &fanout, bindex) {
            Ok(ld) => ld,
            Err(err) if err.is_copyup_err() => continue,
            Err(err) => return Err(err),
        };
        lower::mkdir(&ld.path(), perm)?;

        // The new directory overrides every lower one; the fresh single
        // slot drops them all.
        finish_creation(sb, d, &mut fanout, bindex)?;

        let lower_path = fanout
            .lower(bindex)
            .map(|slot| slot.dentry.path())
            .ok_or(Errno::EIO)?;
        if let Err(err) = whiteout::make_dir_opaque(&lower_path) {
            // The directory is left behind for inspection.
            error!(
                "unionfs: mkdir: error creating {} in {:?}: {err}",
                whiteout::DIR_OPAQUE,
                lower_path
            );
            return Err(err);
        }
        fanout.set_opaque(bindex as i32);
        return Ok(());
    }
    Err(Errno::EROFS)
}

/// Hard link; source and destination must end up on one branch.
pub(crate) fn link(sb: &Arc<SuperInner>, old: &Arc<UnionDentry>, new: &Arc<UnionDentry>) -> Result<()> {
    dentry::revalidate_chain(sb, old)?;
    dentry::revalidate_chain(sb, new)?;
    let old_inode = old.inode().ok_or(Errno::ENOENT)?;
    if old_inode.is_dir() {
        return Err(Errno::EPERM);
    }
    if new.inode().is_some() {
        return Err(Errno::EEXIST);
    }

    let (mut new_fanout, old_guard) = dentry::lock_pair(new, old);
    let mut old_fanout = old_guard.ok_or(Errno::EINVAL)?;

    // A whiteout at the destination is deleted (not renamed over; the link
    // brings its own content).
    unmask_locked(sb, new, &new_fanout)?;

    let old_bstart = positive_start(&old_fanout, false)?;
    let src_path = old_fanout
        .lower(old_bstart)
        .map(|slot| slot.dentry.path())
        .ok_or(Errno::ESTALE)?;

    // Try the link on the source's branch.
    let target = lower_target(sb, new, &new_fanout, old_bstart)
        .and_then(|ld| {
            sb.branch_at(old_bstart)?.check_writable()?;
            lower::link(&src_path, &ld.path())
        });

    let bindex = match target {
        Ok(_) => old_bstart,
        Err(err) if err.is_copyup_err() => {
            // Copy the source up to a writable branch, then link there.
            let size = old_inode.size();
            let b = copyup::copyup_dentry_leftward(sb, old, &mut old_fanout, old_bstart, size)?;
            let ld = lower_target(sb, new, &new_fanout, b)?;
            let src = old_fanout
                .lower(b)
                .map(|slot| slot.dentry.path())
                .ok_or(Errno::EIO)?;
            lower::link(&src, &ld.path())?;
            b
        }
        Err(err) => return Err(err),
    };

    // Same inode on both names.
    install_fresh_slot(sb, new, &mut new_fanout, bindex)?;
    new.set_inode(Arc::clone(&old_inode));
    {
        // The link bumped the lower link count; mirror it.
        old_inode.refresh_from_first_lower();
    }
    refresh_parent(new);
    new.set_generation(sb.generation());
    Ok(())
}

/// Removes a non-directory name, masking lower copies with a whiteout.
pub(crate) fn unlink(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    let inode = d.inode().ok_or(Errno::ENOENT)?;
    if inode.is_dir() {
        return Err(Errno::EISDIR);
    }

    let mut fanout = d.fanout();
    let bstart = positive_start(&fanout, false)?;
    let path = fanout
        .lower(bstart)
        .map(|slot| slot.dentry.path())
        .ok_or(Errno::ESTALE)?;

    let unlinked = sb
        .branch_at(bstart)?
        .check_writable()
        .and_then(|_| lower::unlink(&path));

    match unlinked {
        Ok(()) => {
            // Copies beneath would resurface the name; mask them.
            if name_exists_below(sb, d, bstart)? {
                whiteout::create_whiteout(sb, d, bstart)?;
            }
        }
        Err(err) if err.is_copyup_err() => {
            if inode.open_count() > 0 {
                // An open file loses its name on a read-only branch by
                // silly rename: copy it up under a generated name and
                // drop the lower name, so the handle lives on with no
                // whiteout residue.
                silly_rename_unlink(sb, d, &mut fanout, bstart)?;
            } else {
                // Can't touch the read-only branch: the whiteout alone
                // masks the name.
                whiteout::create_whiteout(sb, d, bstart)?;
            }
        }
        Err(err) => return Err(err),
    }

    let mut attr = inode.attr();
    attr.nlink = attr.nlink.saturating_sub(1);
    attr.ctime = SystemTime::now();
    drop(attr);
    drop(fanout);

    d.d_drop();
    refresh_parent(d);
    Ok(())
}

/// Removes a logically empty directory, sweeping this branch's whiteouts
/// first and masking lower directories afterwards.
pub(crate) fn rmdir(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    let inode = d.inode().ok_or(Errno::ENOENT)?;
    if !inode.is_dir() {
        return Err(Errno::ENOTDIR);
    }

    let namelist = dirhelper::check_empty(sb, d)?;

    let bstart = positive_start(&d.fanout(), false)?;
    dirhelper::delete_whiteouts(sb, d, bstart, &namelist)?;

    let path = {
        let fanout = d.fanout();
        fanout
            .lower(bstart)
            .map(|slot| slot.dentry.path())
            .ok_or(Errno::ESTALE)?
    };
    sb.branch_at(bstart)?.check_writable()?;
    lower::rmdir(&path)?;

    // Keep identically named lower directories from resurfacing.
    if let Err(err) = whiteout::create_whiteout(sb, d, bstart) {
        warn!(
            "unionfs: rmdir: could not whiteout {}: {err}",
            d.path_display()
        );
    }

    inode.attr().nlink = 0;
    d.d_drop();
    refresh_parent(d);
    Ok(())
}

/// Renames within the union; both names end up on one writable branch.
pub(crate) fn rename(sb: &Arc<SuperInner>, old: &Arc<UnionDentry>, new: &Arc<UnionDentry>) -> Result<()> {
    dentry::revalidate_chain(sb, old)?;
    dentry::revalidate_chain(sb, new)?;
    let old_inode = old.inode().ok_or(Errno::ENOENT)?;

    if let Some(new_inode) = new.inode() {
        match (old_inode.is_dir(), new_inode.is_dir()) {
            (true, false) => return Err(Errno::ENOTDIR),
            (false, true) => return Err(Errno::EISDIR),
            (true, true) => {
                dirhelper::check_empty(sb, new)?;
            }
            (false, false) => {}
        }
    }

    let (mut old_fanout, new_guard) = dentry::lock_pair(old, new);
    let mut new_fanout = new_guard.ok_or(Errno::EINVAL)?;

    let old_bstart = positive_start(&old_fanout, false)?;

    // Unmask the destination on the branch the rename will land on.
    unmask_locked(sb, new, &new_fanout)?;

    let attempt = |bindex: usize,
                   old_fanout: &Fanout<LowerSlot>,
                   new_fanout: &Fanout<LowerSlot>|
     -> Result<usize> {
        sb.branch_at(bindex)?.check_writable()?;
        let src = old_fanout
            .lower(bindex)
            .filter(|slot| slot.dentry.is_positive())
            .map(|slot| slot.dentry.path())
            .ok_or(Errno::EROFS)?;
        // Unlike creation, rename may land on an existing destination.
        let dst = match new_fanout.lower(bindex) {
            Some(slot) => slot.dentry.clone(),
            None => copyup::create_parents(sb, new, bindex)?,
        };
        lower::rename(&src, &dst.path())?;
        Ok(bindex)
    };

    let bindex = match attempt(old_bstart, &old_fanout, &new_fanout) {
        Ok(b) => b,
        Err(err) if err.is_copyup_err() => {
            // Copy the source up, then rename on the writable branch.
            let size = old_inode.size();
            let result = copyup::copyup_dentry_leftward(sb, old, &mut old_fanout, old_bstart, size)
                .and_then(|b| attempt(b, &old_fanout, &new_fanout));
            match result {
                Ok(b) => b,
                Err(err) => {
                    // Failure may have left the fan-out pointing at moved
                    // objects; re-look the lower dentries up.
                    refresh_slot(old, &mut old_fanout, old_bstart);
                    return Err(err);
                }
            }
        }
        Err(err) => return Err(err),
    };

    // The old name may survive in lower branches; mask it.
    if name_exists_below(sb, old, bindex)? {
        whiteout::create_whiteout(sb, old, bindex)?;
    }

    install_fresh_slot(sb, new, &mut new_fanout, bindex)?;
    new.set_inode(Arc::clone(&old_inode));
    new.set_generation(sb.generation());

    // The source dentry no longer names anything.
    refresh_slot(old, &mut old_fanout, bindex);
    drop(old_fanout);
    old.d_drop();

    refresh_parent(old);
    refresh_parent(new);
    Ok(())
}

/// Reads the link text from the first branch and mirrors the atime.
pub(crate) fn readlink(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>) -> Result<PathBuf> {
    dentry::revalidate_chain(sb, d)?;
    let inode = d.inode().ok_or(Errno::ENOENT)?;
    if inode.kind() != FileKind::Symlink {
        return Err(Errno::EINVAL);
    }
    let path = {
        let fanout = d.fanout();
        let bstart = positive_start(&fanout, false)?;
        fanout
            .lower(bstart)
            .map(|slot| slot.dentry.path())
            .ok_or(Errno::ESTALE)?
    };
    let target = lower::read_link(&path)?;
    if let Ok(meta) = lower::stat_path(&path) {
        inode.attr().atime = meta.atime;
    }
    Ok(target)
}

/// Follows the link by resolving its text; the host walks the result.
pub(crate) fn follow_link(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>) -> Result<PathBuf> {
    readlink(sb, d)
}

/// Permission check: the intersection across the lower inodes in range.
///
/// A read-only answer from a non-leftmost branch reads as success, so the
/// write can proceed by copy-up; the leftmost branch's verdict is
/// authoritative. The immutable bit denies writes outright.
pub(crate) fn permission(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, mask: AccessMask) -> Result<()> {
    let inode = d.inode().ok_or(Errno::ENOENT)?;
    let is_file = !inode.is_dir();
    let write_mask = mask.contains(AccessMask::WRITE) && !mask.contains(AccessMask::READ);

    let fanout = inode.fanout();
    if !fanout.is_positive() {
        // Stale after branch management: have the host re-walk.
        return Err(Errno::ESTALE);
    }
    let Some(range) = fanout.range() else {
        return Err(Errno::ESTALE);
    };

    for bindex in range {
        let Some(ld) = fanout.lower(bindex) else {
            continue;
        };
        let Some(meta) = ld.meta() else { continue };
        if !is_file && !meta.is_dir() {
            continue;
        }

        if mask.contains(AccessMask::WRITE) {
            if lower::is_immutable(&ld.path()) {
                return Err(Errno::EACCES);
            }
            let writable_kind = matches!(
                meta.kind(),
                FileKind::RegularFile | FileKind::Directory | FileKind::Symlink
            );
            if bindex > 0
                && writable_kind
                && sb.branch_at(bindex)?.check_writable().is_err()
            {
                // Read-only here only means the write will land further
                // left after copy-up; the verdict is final, branches past
                // this one never get a say.
                break;
            }
        }

        if !lower::access_ok(meta, mask) {
            return Err(Errno::EACCES);
        }

        // Only the leftmost object matters for files and write checks.
        if is_file || write_mask {
            break;
        }
    }
    drop(fanout);

    inode.refresh_from_first_lower();
    Ok(())
}

/// Applies attribute changes on `dbstart`, copying up first when that
/// branch cannot take them.
pub(crate) fn setattr(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, attr: &SetAttr) -> Result<()> {
    dentry::revalidate_chain(sb, d)?;
    let inode = d.inode().ok_or(Errno::ENOENT)?;

    let mut fanout = d.fanout();
    let mut bstart = positive_start(&fanout, false)?;

    if sb.branch_at(bstart)?.check_writable().is_err() {
        // Copy up honoring a pending size change: no point copying bytes a
        // truncate would discard.
        let len = attr.size.unwrap_or_else(|| inode.size());
        bstart = copyup::copyup_dentry_leftward(sb, d, &mut fanout, bstart, len)?;
    }

    let path = fanout
        .lower(bstart)
        .map(|slot| slot.dentry.path())
        .ok_or(Errno::ESTALE)?;

    if let Some(perm) = attr.mode {
        lower::chmod(&path, perm)?;
    }
    if attr.uid.is_some() || attr.gid.is_some() {
        lower::chown(&path, attr.uid, attr.gid)?;
    }
    if let Some(size) = attr.size {
        lower::truncate(&path, size)?;
    }
    if attr.atime.is_some() || attr.mtime.is_some() {
        let meta = lower::stat_path(&path)?;
        lower::set_times(
            &path,
            attr.atime.unwrap_or(meta.atime),
            attr.mtime.unwrap_or(meta.mtime),
        )?;
    }

    // Mirror the result (size included) back into the union inode.
    let meta = lower::stat_path(&path)?;
    {
        let mut iattr = inode.attr();
        iattr.mode = meta.mode;
        iattr.uid = meta.uid;
        iattr.gid = meta.gid;
        iattr.size = meta.size;
        iattr.blocks = meta.blocks;
        iattr.copy_times(&meta);
    }
    refresh_slot(d, &mut fanout, bstart);
    drop(fanout);
    refresh_parent(d);
    Ok(())
}

/// Unlink of an open file whose only copy sits on a read-only branch:
/// copy it up as a silly-renamed temporary and remove the lower name.
fn silly_rename_unlink(
    sb: &Arc<SuperInner>,
    d: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bstart: usize,
) -> Result<()> {
    let size = d.inode().map(|inode| inode.size()).unwrap_or(0);
    let mut err = Errno::EROFS;
    for bindex in (0..bstart).rev() {
        match copyup::copyup_deleted_file(sb, d, fanout, bstart, bindex, size, None) {
            Ok(name) => {
                debug!(
                    "unionfs: silly-renamed {} to {:?} on branch {bindex}",
                    d.path_display(),
                    name
                );
                return Ok(());
            }
            Err(e) if e.is_copyup_err() => err = e,
            Err(e) => return Err(e),
        }
    }
    Err(err)
}

// ---- shared helpers ----

/// The dentry's `dbstart` as an index. `accept_negative` admits the
/// creation-target slot of a negative dentry.
fn positive_start(fanout: &Fanout<LowerSlot>, accept_negative: bool) -> Result<usize> {
    let start = fanout.start();
    if start < 0 {
        return Err(Errno::ESTALE);
    }
    let start = start as usize;
    if !accept_negative {
        let ok = fanout
            .lower(start)
            .is_some_and(|slot| slot.dentry.is_positive());
        if !ok {
            return Err(Errno::ESTALE);
        }
    }
    Ok(start)
}

/// The (negative) lower dentry to create `d`'s name at on `bindex`,
/// replicating parents when the slot is missing.
fn lower_target(
    sb: &Arc<SuperInner>,
    d: &Arc<UnionDentry>,
    fanout: &Fanout<LowerSlot>,
    bindex: usize,
) -> Result<LowerDentry> {
    if let Some(slot) = fanout.lower(bindex) {
        if !slot.dentry.is_positive() {
            return Ok(slot.dentry.clone());
        }
        return Err(Errno::EEXIST);
    }
    copyup::create_parents(sb, d, bindex)
}

/// Deletes a whiteout masking `d`'s name, if one exists at the creation
/// branch. Returns the branch index creation should start from.
fn unmask_name(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, fanout: &Fanout<LowerSlot>) -> Result<usize> {
    let bstart = positive_start(fanout, true)?;
    match unmask_at(sb, d, fanout, bstart)? {
        true => Ok(bstart),
        false => Ok(bstart.saturating_sub(1)),
    }
}

fn unmask_locked(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, fanout: &Fanout<LowerSlot>) -> Result<()> {
    let bstart = positive_start(fanout, true)?;
    unmask_at(sb, d, fanout, bstart).map(|_| ())
}

/// Removes `.wh.<name>` at `bindex` if present. `Ok(true)` means the
/// branch is usable for the subsequent create; `Ok(false)` means the
/// whiteout could not be removed there (read-only) and creation must move
/// left.
fn unmask_at(
    sb: &Arc<SuperInner>,
    d: &Arc<UnionDentry>,
    fanout: &Fanout<LowerSlot>,
    bindex: usize,
) -> Result<bool> {
    let Some(slot) = fanout.lower(bindex) else {
        return Ok(true);
    };
    let wh = whiteout::lookup_whiteout(slot.dentry.parent_dir(), d.name())?;
    if !wh.is_positive() {
        return Ok(true);
    }
    match sb
        .branch_at(bindex)?
        .check_writable()
        .and_then(|_| whiteout::delete_whiteout(sb, &wh))
    {
        Ok(()) => Ok(true),
        Err(err) if err.is_copyup_err() => Ok(false),
        Err(err) => Err(err),
    }
}

/// After a successful lower creation at `bindex`: make that slot the whole
/// fan-out and interpose the inode.
fn finish_creation(
    sb: &Arc<SuperInner>,
    d: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bindex: usize,
) -> Result<()> {
    install_fresh_slot(sb, d, fanout, bindex)?;
    inode::interpose(sb, d, fanout, InterposeMode::Default)?;
    d.set_generation(sb.generation());
    refresh_parent(d);
    Ok(())
}

/// Replaces the fan-out with a single freshly stat'ed slot at `bindex`.
fn install_fresh_slot(
    sb: &Arc<SuperInner>,
    d: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bindex: usize,
) -> Result<()> {
    let parent_dir = match fanout.lower(bindex) {
        Some(slot) => slot.dentry.parent_dir().to_path_buf(),
        None => {
            let parent = d.parent().ok_or(Errno::EINVAL)?;
            let pf = parent.fanout();
            pf.lower(bindex)
                .filter(|slot| slot.dentry.is_positive())
                .map(|slot| slot.dentry.path())
                .ok_or(Errno::ESTALE)?
        }
    };
    let ld = lower::lookup_one(&parent_dir, d.name())?;
    if !ld.is_positive() {
        return Err(Errno::EIO);
    }
    let branch = sb.branch_at(bindex)?;
    for i in 0..fanout.len() {
        fanout.set_lower(i, None);
    }
    fanout.set_lower(
        bindex,
        Some(LowerSlot {
            dentry: ld,
            mnt: branch.mntget(),
        }),
    );
    fanout.set_start(bindex as i32);
    fanout.set_end(bindex as i32);
    Ok(())
}

/// Does the name resolve in any branch strictly below `bindex`?
fn name_exists_below(sb: &Arc<SuperInner>, d: &Arc<UnionDentry>, bindex: usize) -> Result<bool> {
    let parent = match d.parent() {
        Some(parent) => Arc::clone(parent),
        None => return Ok(false),
    };
    let count = sb.branch_count();
    let name = d.name().to_os_string();
    let pf = parent.fanout();
    for b in bindex + 1..count {
        let Some(slot) = pf.lower(b) else { continue };
        let Some(meta) = slot.dentry.meta() else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let ld = lower::lookup_one(&slot.dentry.path(), &name)?;
        if ld.is_positive() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Re-looks up the lower dentry at `bindex` to restore a fan-out after a
/// partial failure or a successful move.
fn refresh_slot(d: &Arc<UnionDentry>, fanout: &mut Fanout<LowerSlot>, bindex: usize) {
    let Some(slot) = fanout.lower_mut(bindex) else {
        return;
    };
    if slot.dentry.refresh().is_err() {
        return;
    }
    let positive = slot.dentry.is_positive();
    if let Some(inode) = d.inode() {
        let mut ifan = inode.fanout();
        if ifan.lower(bindex).is_some() {
            let new = positive.then(|| slot.dentry.clone());
            ifan.set_lower(bindex, new);
        }
    }
    if !positive {
        fanout.set_lower(bindex, None);
        fanout.update_start();
    }
}

/// Mutations change the parent directory's times, size, and link count;
/// mirror them up.
fn refresh_parent(d: &Arc<UnionDentry>) {
    if let Some(parent) = d.parent() {
        if let Some(inode) = parent.inode() {
            inode.refresh_from_first_lower();
        }
    }
}
