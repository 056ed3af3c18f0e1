//! Directory emptiness and whiteout sweeps, the helpers behind `rmdir`.
//!
//! A union directory is *logically empty* when every lower entry is either
//! a dot entry, a whiteout, or a name already masked by a whiteout in a
//! higher branch. Removing such a directory means first deleting the
//! whiteouts from the top branch's copy, then removing the lower directory
//! itself.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;

use log::debug;

use crate::dentry::UnionDentry;
use crate::errors::{Errno, Result};
use crate::lookup;
use crate::lower;
use crate::whiteout::{self, strip_whiteout};
use crate::{AccessMask, SuperInner};

/// One name seen while proving emptiness.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilldirNode {
    pub(crate) bindex: usize,
    pub(crate) whiteout: bool,
}

/// Names collected across the lower directories of one union directory.
#[derive(Debug, Default)]
pub(crate) struct NameList {
    entries: HashMap<OsString, FilldirNode>,
}

impl NameList {
    /// The whiteouts recorded for one branch.
    fn whiteouts_in(&self, bindex: usize) -> impl Iterator<Item = &OsString> {
        self.entries
            .iter()
            .filter(move |(_, node)| node.whiteout && node.bindex == bindex)
            .map(|(name, _)| name)
    }
}

/// Proves the directory is logically empty and returns the name list for
/// the subsequent whiteout sweep. `ENOTEMPTY` on the first real entry.
pub(crate) fn check_empty(sb: &Arc<SuperInner>, dentry: &Arc<UnionDentry>) -> Result<NameList> {
    // Branches beyond the current dbend may also hold copies; fill the
    // fan-out before judging.
    lookup::partial_lookup(sb, dentry)?;

    let mut list = NameList::default();

    let streams: Vec<(usize, std::path::PathBuf)> = {
        let fanout = dentry.fanout();
        match fanout.scan_range() {
            None => Vec::new(),
            Some(range) => range
                .filter_map(|b| {
                    let slot = fanout.lower(b)?;
                    let meta = slot.dentry.meta()?;
                    meta.is_dir().then(|| (b, slot.dentry.path()))
                })
                .collect(),
        }
    };

    for (bindex, path) in streams {
        for (name, _, _) in lower::read_dir_sorted(&path)? {
            if name == "." || name == ".." {
                continue;
            }
            match strip_whiteout(&name) {
                Some(masked) => {
                    list.entries
                        .entry(masked)
                        .or_insert(FilldirNode {
                            bindex,
                            whiteout: true,
                        });
                }
                None => {
                    // Masked by a whiteout in a higher branch is fine;
                    // anything else means the directory is not empty.
                    match list.entries.get(&name) {
                        Some(node) if node.whiteout => {}
                        _ => return Err(Errno::ENOTEMPTY),
                    }
                }
            }
        }
    }

    Ok(list)
}

/// Deletes this branch's whiteouts (recorded in `list`) from the lower
/// directory, switching to the serialized I/O queue when the caller's
/// credentials cannot write the directory.
pub(crate) fn delete_whiteouts(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    bindex: usize,
    list: &NameList,
) -> Result<()> {
    sb.branch_at(bindex)?.check_writable()?;

    let lower_dir = {
        let fanout = dentry.fanout();
        fanout
            .lower(bindex)
            .filter(|slot| slot.dentry.is_positive())
            .map(|slot| slot.dentry.path())
            .ok_or(Errno::ESTALE)?
    };
    let dir_meta = lower::stat_path(&lower_dir)?;
    if !dir_meta.is_dir() {
        return Err(Errno::ENOTDIR);
    }

    let names: Vec<OsString> = list
        .whiteouts_in(bindex)
        .map(|name| whiteout::whiteout_name(name))
        .collect();
    debug!(
        "unionfs: deleting {} whiteouts under {:?}",
        names.len(),
        lower_dir
    );

    if lower::access_ok(&dir_meta, AccessMask::WRITE | AccessMask::EXEC) {
        do_delete_whiteouts(&lower_dir, &names)
    } else {
        let dir = lower_dir.clone();
        sb.sioq.run(move || do_delete_whiteouts(&dir, &names))?
    }
}

fn do_delete_whiteouts(lower_dir: &std::path::Path, names: &[OsString]) -> Result<()> {
    for name in names {
        let wh = lower::lookup_one(lower_dir, name)?;
        if wh.is_positive() {
            lower::unlink(&wh.path())?;
        }
    }
    Ok(())
}
