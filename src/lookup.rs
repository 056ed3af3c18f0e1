//! The lookup engine.
//!
//! Resolves one path component against a parent fan-out by scanning the
//! parent's branches left to right. A whiteout for the name stops the scan
//! and masks everything below; an opaque marker inside a directory hit
//! stops the accumulation of further directory branches. Regular files and
//! symlinks occupy exactly one branch, directories union across all the
//! branches that carry them.
//!
//! When the whole scan comes up negative, the leftmost negative lower
//! dentry is remembered on the union dentry so a later create knows where
//! to materialize the name.

use std::ffi::OsStr;
use std::sync::Arc;

use log::warn;

use crate::SuperInner;
use crate::branch::Branch;
use crate::dentry::{LowerSlot, UnionDentry};
use crate::errors::{Errno, Result};
use crate::fanout::Fanout;
use crate::inode::{self, InterposeMode};
use crate::lower::{self, LowerDentry, LowerMeta};
use crate::whiteout;
use crate::{FileKind, debug_checks};

/// What kind of resolution is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupMode {
    /// Fresh name resolution on a new dentry.
    Lookup,
    /// Rebuild of a stale positive dentry.
    Reval,
    /// Rebuild of a stale negative dentry.
    RevalNeg,
    /// Fill in branches an existing positive dentry has not scanned yet.
    Partial,
}

/// Fills in branches beyond what an existing positive dentry has resolved.
pub(crate) fn partial_lookup(sb: &Arc<SuperInner>, dentry: &Arc<UnionDentry>) -> Result<()> {
    lookup_backend(sb, dentry, LookupMode::Partial)
}

/// The driver behind lookup and revalidation.
///
/// The parent must already be current. On success the dentry's fan-out and
/// generation reflect the superblock generation captured at entry.
pub(crate) fn lookup_backend(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    mode: LookupMode,
) -> Result<()> {
    // The root is built by mount and refreshed by branch management; it
    // never resolves through here.
    if dentry.is_root() {
        return Ok(());
    }
    let parent = Arc::clone(dentry.parent().ok_or(Errno::EINVAL)?);
    let sbgen = sb.generation();
    let name = dentry.name().to_os_string();

    // No dentries may exist for possible whiteout names.
    if whiteout::is_reserved_name(&name) {
        return Err(Errno::EPERM);
    }

    // Child before parent.
    let mut child = dentry.fanout();
    match mode {
        LookupMode::Partial => {}
        LookupMode::Reval | LookupMode::RevalNeg | LookupMode::Lookup => {
            child.reset(sb.branch_count());
        }
    }

    // Snapshot the parent's scan list; the parent lock is not held across
    // the lower lookups below.
    let scan: Vec<(usize, LowerDentry)> = {
        let pf = parent.fanout();
        match pf.scan_range() {
            None => Vec::new(),
            Some(range) => range
                .filter_map(|b| {
                    let slot = pf.lower(b)?;
                    let meta = slot.dentry.meta()?;
                    meta.is_dir().then(|| (b, slot.dentry.clone()))
                })
                .collect(),
        }
    };

    let branches: Vec<Arc<Branch>> = sb.branch_arcs();

    let mut first_neg: Option<(usize, LowerDentry)> = None;
    let mut wh_stop: Option<(usize, LowerDentry)> = None;
    let mut new_positives = 0usize;

    for (b, parent_ld) in &scan {
        let b = *b;
        if b >= child.len() {
            break;
        }
        if mode == LookupMode::Partial && child.lower(b).is_some() {
            continue;
        }

        let lower_dir = parent_ld.path();

        // Whiteout first: `.wh.<name>` masks this branch and all below.
        let wh = whiteout::lookup_whiteout(&lower_dir, &name)?;
        if let Some(wh_meta) = wh.meta() {
            if wh_meta.is_reg() {
                // With accumulated entries the range already ends at the
                // last positive branch; only a fully masked name records
                // the whiteout's branch as its creation target.
                if !has_positive(&child) {
                    child.set_end(b as i32);
                    child.set_opaque(b as i32);
                    wh_stop = Some((b, parent_ld.clone()));
                }
                break;
            }
            warn!(
                "unionfs: EIO: invalid whiteout entry type {:o}",
                wh_meta.mode
            );
            return Err(Errno::EIO);
        }

        let ld = lower::lookup_one(&lower_dir, &name)?;
        if !ld.is_positive() {
            // Remember the leftmost negative for future creates, but only
            // while the whole fan-out is still negative.
            if first_neg.is_none() && !has_positive(&child) {
                first_neg = Some((b, ld));
            }
            continue;
        }

        let kind = ld.meta().map(LowerMeta::kind).ok_or(Errno::EIO)?;
        let branch = branches.get(b).cloned().ok_or(Errno::ESTALE)?;
        let is_first = !has_positive(&child);
        child.install(
            b,
            LowerSlot {
                dentry: ld.clone(),
                mnt: branch.mntget(),
            },
        );
        new_positives += 1;

        if kind != FileKind::Directory {
            if mode == LookupMode::Partial {
                continue;
            }
            if is_first {
                // Non-directories take exactly one branch.
                break;
            }
            // Mixed directory-over-file stacks keep scanning directories.
            continue;
        }

        if whiteout::is_opaque_dir(sb, &ld)? {
            child.set_end(b as i32);
            child.set_opaque(b as i32);
            break;
        }
    }

    let result = if has_positive(&child) {
        finish_positive(sb, dentry, &mut child, mode, new_positives)
    } else {
        finish_negative(dentry, &mut child, mode, first_neg, wh_stop, &branches, &name)
    };

    if result.is_ok() {
        dentry.set_generation(sbgen);
        // Lower directory traffic bumps the parent's atime; mirror it.
        if let (Some(parent_inode), Some((_, parent_ld))) = (parent.inode(), scan.first()) {
            if let Ok(meta) = lower::stat_path(&parent_ld.path()) {
                parent_inode.attr().atime = meta.atime;
            }
        }
        debug_checks::check_dentry(dentry, &child);
    }
    result
}

fn has_positive(fanout: &Fanout<LowerSlot>) -> bool {
    fanout.iter().any(|(_, slot)| slot.dentry.is_positive())
}

fn finish_positive(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    child: &mut Fanout<LowerSlot>,
    mode: LookupMode,
    new_positives: usize,
) -> Result<()> {
    let imode = match mode {
        LookupMode::Partial => {
            if dentry.inode().is_some() {
                if new_positives > 0 {
                    inode::reinterpose(dentry, child);
                }
                return Ok(());
            }
            // The dentry somehow turned positive; treat it as a negative
            // revalidation and tidy the range first.
            child.update_start();
            InterposeMode::RevalNeg
        }
        LookupMode::Lookup => InterposeMode::Lookup,
        LookupMode::Reval => InterposeMode::Reval,
        LookupMode::RevalNeg => InterposeMode::RevalNeg,
    };
    inode::interpose(sb, dentry, child, imode)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn finish_negative(
    dentry: &Arc<UnionDentry>,
    child: &mut Fanout<LowerSlot>,
    mode: LookupMode,
    first_neg: Option<(usize, LowerDentry)>,
    wh_stop: Option<(usize, LowerDentry)>,
    branches: &[Arc<Branch>],
    name: &OsStr,
) -> Result<()> {
    match mode {
        LookupMode::Partial => Ok(()),
        LookupMode::Reval => {
            // Every branch lost the name: the existing inode has nothing
            // left to show.
            if let Some(inode) = dentry.inode() {
                inode.mark_stale();
            }
            Ok(())
        }
        LookupMode::Lookup | LookupMode::RevalNeg => {
            debug_assert!(
                mode != LookupMode::RevalNeg || dentry.inode().is_none(),
                "negative revalidation of a positive dentry"
            );
            // Give future creates a target: the leftmost negative lower
            // dentry, or on a whiteout-masked name, a target right at the
            // masking branch so the create can reuse the whiteout.
            let (b, ld) = match first_neg {
                Some(found) => found,
                None => {
                    let (b, parent_ld) = wh_stop.ok_or(Errno::ENOENT)?;
                    (b, lower::lookup_one(&parent_ld.path(), name)?)
                }
            };
            let branch = branches.get(b).cloned().ok_or(Errno::ESTALE)?;
            child.set_lower(
                b,
                Some(LowerSlot {
                    dentry: ld,
                    mnt: branch.mntget(),
                }),
            );
            child.set_start(b as i32);
            if child.end() < b as i32 {
                child.set_end(b as i32);
            }
            Ok(())
        }
    }
}
