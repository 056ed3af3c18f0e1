//! The copy-up engine.
//!
//! Promotes an object from a lower-priority branch to a higher-priority
//! writable one, so the union can capture mutations to data that lives on
//! read-only storage. The lower copies stay where they are and become
//! shadowed.
//!
//! Copy-up of an open file that has already been unlinked gets a generated
//! name (`.unionfs<inode-hex><counter-hex>`) in the destination, the silly
//! rename trick: the handle stays readable and writable while the name is
//! gone from the namespace.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::SuperInner;
use crate::dentry::{LowerSlot, UnionDentry};
use crate::errors::{Errno, Result};
use crate::fanout::Fanout;
use crate::inode::get_nlinks;
use crate::FileKind;
use crate::lower::{self, LowerDentry};

/// Process-wide counter feeding silly-rename names; fetch-and-increment
/// keeps concurrent copy-ups from colliding.
static SILLY_COUNTER: AtomicU32 = AtomicU32::new(0);

/// `.unionfs<ino as 16 hex digits><counter as 8 hex digits>`; the inode
/// width is two hex digits per inode-number byte.
pub(crate) fn sillyrename_name(ino: u64, counter: u32) -> OsString {
    OsString::from(format!(".unionfs{ino:016x}{counter:08x}"))
}

pub(crate) fn next_silly_counter() -> u32 {
    SILLY_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Replicates the ancestor directory chain of `dentry` onto branch
/// `bindex` and returns the (usually negative) lower dentry for
/// `dentry`'s own name there.
///
/// Newly created directories mirror the mode and ownership of the
/// ancestor's current first lower directory, and are installed into the
/// ancestor's fan-outs so later operations see them.
pub(crate) fn create_parents(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    bindex: usize,
) -> Result<LowerDentry> {
    let branch = sb.branch_at(bindex)?;
    branch.check_writable()?;

    // Ancestors of the target, nearest first, root last.
    let mut chain: Vec<Arc<UnionDentry>> = Vec::new();
    let mut cursor = Arc::clone(dentry.parent().ok_or(Errno::EINVAL)?);
    loop {
        let next = cursor.parent().cloned();
        chain.push(cursor);
        match next {
            Some(parent) => cursor = parent,
            None => break,
        }
    }

    // The root spans every branch by construction.
    let root = chain.pop().ok_or(Errno::EINVAL)?;
    let mut lower_dir: LowerDentry = {
        let rf = root.fanout();
        rf.lower(bindex)
            .filter(|slot| slot.dentry.is_positive())
            .map(|slot| slot.dentry.clone())
            .ok_or(Errno::ESTALE)?
    };

    // Walk back down, creating what is missing.
    for node in chain.into_iter().rev() {
        let mut nf = node.fanout();
        if let Some(slot) = nf.lower(bindex) {
            if slot.dentry.is_positive() {
                lower_dir = slot.dentry.clone();
                continue;
            }
        }

        // Mirror the mode and ownership of the ancestor's current source.
        let src_meta = nf
            .first_lower()
            .and_then(|slot| slot.dentry.meta())
            .copied()
            .ok_or(Errno::ESTALE)?;
        let child_path = lower_dir.path().join(node.name());
        debug!("unionfs: replicating parent {:?}", child_path);
        lower::mkdir(&child_path, src_meta.perm())?;
        if let Err(err) = lower::chown(&child_path, Some(src_meta.uid), Some(src_meta.gid)) {
            warn!("unionfs: parent replication: ownership not preserved: {err}");
        }

        let ld = lower::lookup_one(&lower_dir.path(), node.name())?;
        if !ld.is_positive() {
            return Err(Errno::EIO);
        }
        nf.install(
            bindex,
            LowerSlot {
                dentry: ld.clone(),
                mnt: branch.mntget(),
            },
        );
        if let Some(inode) = node.inode() {
            let mut ifan = inode.fanout();
            if ifan.lower(bindex).is_none() {
                ifan.set_lower(bindex, Some(ld.clone()));
                ifan.set_start(nf.start());
                ifan.set_end(nf.end());
            }
        }
        drop(nf);
        lower_dir = ld;
    }

    lower::lookup_one(&lower_dir.path(), dentry.name())
}

/// Copies the object at `dentry`'s branch `bstart` to branch `new_bindex`,
/// optionally under a different name, then retargets the fan-out.
///
/// `len` bounds how much regular-file content is copied (`0` for an open
/// with truncate, the inode size otherwise). The caller holds the dentry's
/// fan-out lock and passes it in.
pub(crate) fn copyup_dentry(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bstart: usize,
    new_bindex: usize,
    name: Option<&OsStr>,
    len: u64,
    src_file: Option<&std::fs::File>,
) -> Result<()> {
    debug_assert!(new_bindex < bstart);
    let branch = sb.branch_at(new_bindex)?;
    branch.check_writable()?;

    let src = fanout
        .lower(bstart)
        .filter(|slot| slot.dentry.is_positive())
        .map(|slot| slot.dentry.clone())
        .ok_or(Errno::ESTALE)?;
    let src_meta = *src.meta().ok_or(Errno::ESTALE)?;

    // Make sure the destination parent chain exists, then locate the
    // destination name (the dentry's own, unless silly-renaming).
    let dst = create_parents(sb, dentry, new_bindex)?;
    let dst = match name {
        None => dst,
        Some(name) => lower::lookup_one(dst.parent_dir(), name)?,
    };
    if dst.is_positive() {
        return Err(Errno::EEXIST);
    }
    let dst_path = dst.path();

    let copied = match src_meta.kind() {
        FileKind::RegularFile => lower::create(&dst_path, src_meta.perm())
            .and_then(|_| copy_file_bytes(&src.path(), src_file, &dst_path, len)),
        FileKind::Directory => lower::mkdir(&dst_path, src_meta.perm()).map(|_| ()),
        FileKind::Symlink => lower::read_link(&src.path())
            .and_then(|target| lower::symlink(&target, &dst_path))
            .map(|_| ()),
        FileKind::CharDevice | FileKind::BlockDevice | FileKind::NamedPipe | FileKind::Socket => {
            lower::mknod(&dst_path, src_meta.mode, src_meta.rdev).map(|_| ())
        }
    };
    if let Err(err) = copied {
        // Unwind the partial copy; the parents stay, they are harmless.
        let _ = match src_meta.kind() {
            FileKind::Directory => lower::rmdir(&dst_path),
            _ => lower::unlink(&dst_path),
        };
        return Err(err);
    }
    if let Err(err) = lower::copy_attr(&dst_path, &src_meta) {
        warn!("unionfs: copyup of {dst_path:?}: attributes not fully preserved: {err}");
    }

    // Retarget the fan-out: the new copy becomes dbstart, the shadowed
    // lower copies keep their slots.
    let ld = lower::lookup_one(dst.parent_dir(), dst.name())?;
    if !ld.is_positive() {
        return Err(Errno::EIO);
    }
    fanout.set_lower(
        new_bindex,
        Some(LowerSlot {
            dentry: ld.clone(),
            mnt: branch.mntget(),
        }),
    );
    fanout.set_start(new_bindex as i32);
    if fanout.end() < new_bindex as i32 {
        fanout.set_end(new_bindex as i32);
    }

    if let Some(inode) = dentry.inode() {
        let mut ifan = inode.fanout();
        ifan.set_lower(new_bindex, Some(ld.clone()));
        ifan.set_start(new_bindex as i32);
        if ifan.end() < new_bindex as i32 {
            ifan.set_end(new_bindex as i32);
        }
        let nlink = get_nlinks(inode.kind(), &ifan);
        drop(ifan);
        let mut attr = inode.attr();
        attr.nlink = nlink;
        if let Some(new_meta) = ld.meta() {
            attr.copy_times(new_meta);
        }
    }
    dentry.set_generation(sb.generation());

    debug!(
        "unionfs: copied up {} from branch {bstart} to {new_bindex}",
        dentry.path_display()
    );
    Ok(())
}

/// Walks leftward from `start` looking for a writable branch that accepts
/// the copy-up, the standard recovery for `EROFS`.
pub(crate) fn copyup_dentry_leftward(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bstart: usize,
    len: u64,
) -> Result<usize> {
    let mut err = Errno::EROFS;
    for bindex in (0..bstart).rev() {
        match copyup_dentry(sb, dentry, fanout, bstart, bindex, None, len, None) {
            Ok(()) => return Ok(bindex),
            Err(e) if e.is_copyup_err() => err = e,
            Err(e) => return Err(e),
        }
    }
    Err(err)
}

/// Copy-up for an open file whose name is already gone (or about to be):
/// the copy lands under a generated name, after which the source's lower
/// name is unlinked. Returns the generated name.
pub(crate) fn copyup_deleted_file(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    fanout: &mut Fanout<LowerSlot>,
    bstart: usize,
    new_bindex: usize,
    len: u64,
    src_file: Option<&std::fs::File>,
) -> Result<OsString> {
    let src = fanout
        .lower(bstart)
        .filter(|slot| slot.dentry.is_positive())
        .map(|slot| slot.dentry.clone())
        .ok_or(Errno::ESTALE)?;
    let src_ino = src.meta().map(|m| m.ino).ok_or(Errno::ESTALE)?;

    // Probe for an unused temporary name in the source's parent; the
    // create below still catches a collision in the destination.
    let retries = sb.config.sillyrename_retries;
    let mut name = None;
    for _ in 0..retries {
        let candidate = sillyrename_name(src_ino, next_silly_counter());
        let probe = lower::lookup_one(src.parent_dir(), &candidate)?;
        if !probe.is_positive() {
            name = Some(candidate);
            break;
        }
    }
    let name = name.ok_or_else(|| {
        warn!(
            "unionfs: no free sillyrename name for {} after {retries} tries",
            dentry.path_display()
        );
        Errno::EIO
    })?;

    copyup_dentry(sb, dentry, fanout, bstart, new_bindex, Some(&name), len, src_file)?;

    // Bring the source to the same state as an unlinked file. This is a
    // physical removal of the lower name, not a union-level unlink: the
    // branch's read-only mode does not apply, so route around missing
    // credentials through the queue.
    let src_path = src.path();
    if let Err(err) = lower::unlink(&src_path) {
        let queued = sb.sioq.run(move || lower::unlink(&src_path))?;
        if let Err(err2) = queued {
            warn!(
                "unionfs: sillyrename: could not unlink source {:?}: {err} / {err2}",
                src.path()
            );
        }
    }

    Ok(name)
}

/// Streams `len` bytes from the source to `dst` through page-sized
/// buffers. An already-open source handle is used when provided (the
/// source name may be unlinked); otherwise the path is opened read-only.
fn copy_file_bytes(
    src: &std::path::Path,
    src_file: Option<&std::fs::File>,
    dst: &std::path::Path,
    len: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let opened;
    let src_file = match src_file {
        Some(file) => file,
        None => {
            opened = lower::open(src, libc::O_RDONLY)?;
            &opened
        }
    };
    let dst_file = lower::open(dst, libc::O_WRONLY)?;
    let page = page_size::get();
    let mut buf = vec![0u8; page];
    let mut offset = 0u64;
    while offset < len {
        let want = ((len - offset) as usize).min(page);
        let got = lower::pread(src_file, &mut buf[..want], offset)?;
        if got == 0 {
            break;
        }
        let mut written = 0;
        while written < got {
            written += lower::pwrite(&dst_file, &buf[written..got], offset + written as u64)?;
        }
        offset += got as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sillyrename_name_format() {
        let name = sillyrename_name(0x1a2b, 7);
        let s = name.to_string_lossy().into_owned();
        assert!(s.starts_with(".unionfs"));
        // 8 for the prefix tail, 16 hex digits of inode, 8 of counter.
        assert_eq!(s.len(), ".unionfs".len() + 16 + 8);
        assert!(s.contains("0000000000001a2b"));
        assert!(s.ends_with("00000007"));
    }

    #[test]
    fn silly_counter_advances() {
        let a = next_silly_counter();
        let b = next_silly_counter();
        assert_ne!(a, b);
    }
}
