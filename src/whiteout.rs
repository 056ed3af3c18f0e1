//! Whiteouts and opaque-directory markers.
//!
//! A whiteout is a regular file named `.wh.<target>` in a lower branch; it
//! masks `target` in that branch and every branch below. A directory
//! containing `.wh.__dir_opaque` does not union with lower directories of
//! the same logical path. Both names are reserved: nothing in the union
//! namespace may be created with them.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::dentry::UnionDentry;
use crate::errors::{Errno, Result};
use crate::lower::{self, LowerDentry};
use crate::{AccessMask, SuperInner};

/// Marker name prefix.
pub(crate) const WHITEOUT_PREFIX: &[u8] = b".wh.";

/// Basename (without the whiteout prefix) of the opaque-directory marker.
pub(crate) const DIR_OPAQUE_NAME: &[u8] = b"__dir_opaque";

/// Full name of the opaque-directory marker.
pub(crate) const DIR_OPAQUE: &str = ".wh.__dir_opaque";

/// Permission bits whiteout files are created with; their content and mode
/// carry no meaning.
const WHITEOUT_MODE: u32 = 0o644;

/// `.wh.<name>`
pub(crate) fn whiteout_name(name: &OsStr) -> OsString {
    let mut bytes = Vec::with_capacity(WHITEOUT_PREFIX.len() + name.len());
    bytes.extend_from_slice(WHITEOUT_PREFIX);
    bytes.extend_from_slice(name.as_bytes());
    OsString::from_vec(bytes)
}

/// The masked name, if `name` is a whiteout.
pub(crate) fn strip_whiteout(name: &OsStr) -> Option<OsString> {
    let bytes = name.as_bytes();
    if bytes.len() > WHITEOUT_PREFIX.len() && bytes.starts_with(WHITEOUT_PREFIX) {
        Some(OsString::from_vec(bytes[WHITEOUT_PREFIX.len()..].to_vec()))
    } else {
        None
    }
}

/// Names that have no representable meaning in the union: whiteouts and the
/// opaque marker's basename.
pub(crate) fn is_reserved_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.starts_with(WHITEOUT_PREFIX) || bytes.starts_with(DIR_OPAQUE_NAME)
}

/// Looks up the whiteout for `name` under a lower directory.
pub(crate) fn lookup_whiteout(lower_dir: &Path, name: &OsStr) -> Result<LowerDentry> {
    lower::lookup_one(lower_dir, &whiteout_name(name))
}

/// Is this lower directory opaque?
///
/// The probe is a lookup the caller may lack permission for; in that case
/// it runs on the serialized I/O queue, which stands in for credentials the
/// union itself holds.
pub(crate) fn is_opaque_dir(sb: &Arc<SuperInner>, lower_dir: &LowerDentry) -> Result<bool> {
    let meta = lower_dir.meta().ok_or(Errno::ENOENT)?;
    debug_assert!(meta.is_dir());
    let path = lower_dir.path();
    if lower::access_ok(meta, AccessMask::EXEC) {
        let marker = lower::lookup_one(&path, OsStr::new(DIR_OPAQUE))?;
        Ok(marker.is_positive())
    } else {
        sb.sioq
            .run(move || lower::lookup_one(&path, OsStr::new(DIR_OPAQUE)))?
            .map(|marker| marker.is_positive())
    }
}

/// Marks a lower directory opaque by creating `.wh.__dir_opaque` inside it.
pub(crate) fn make_dir_opaque(lower_dir: &Path) -> Result<()> {
    let marker = lower::lookup_one(lower_dir, OsStr::new(DIR_OPAQUE))?;
    if marker.is_positive() {
        return Ok(());
    }
    lower::create(&marker.path(), 0o444)?;
    Ok(())
}

/// Creates a whiteout for `dentry`'s name, trying branch `start` first and
/// proceeding left on read-only branches. Returns the branch index the
/// whiteout landed on.
///
/// Missing parent chains are replicated on the way. A whiteout that already
/// exists (possible under opaque directories) counts as success.
pub(crate) fn create_whiteout(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    start: usize,
) -> Result<usize> {
    let name = dentry.name().to_os_string();
    let mut err = Errno::EINVAL;

    for bindex in (0..=start).rev() {
        let lower_dir = match parent_lower_dir(sb, dentry, bindex) {
            Ok(dir) => dir,
            Err(e) => {
                debug!(
                    "unionfs: create_whiteout: no parent on branch {bindex} for {}: {e}",
                    dentry.path_display()
                );
                err = e;
                continue;
            }
        };

        let wh = lookup_whiteout(&lower_dir, &name)?;
        if wh.is_positive() {
            return Ok(bindex);
        }

        let branch = sb.branch_at(bindex)?;
        match branch
            .check_writable()
            .and_then(|_| lower::create(&wh.path(), WHITEOUT_MODE).map(|_| ()))
        {
            Ok(()) => return Ok(bindex),
            Err(e) if e.is_copyup_err() => {
                err = e;
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        "unionfs: could not create whiteout for {} anywhere",
        dentry.path_display()
    );
    Err(err)
}

/// Removes a whiteout file; used before creations that unmask a name.
pub(crate) fn delete_whiteout(sb: &Arc<SuperInner>, wh: &LowerDentry) -> Result<()> {
    let path = wh.path();
    let dir_meta = lower::stat_path(wh.parent_dir())?;
    if lower::access_ok(&dir_meta, AccessMask::WRITE | AccessMask::EXEC) {
        lower::unlink(&path)
    } else {
        sb.sioq.run(move || lower::unlink(&path))?
    }
}

/// The lower directory of `dentry`'s parent on `bindex`, replicating the
/// ancestor chain there if necessary.
pub(crate) fn parent_lower_dir(
    sb: &Arc<SuperInner>,
    dentry: &Arc<UnionDentry>,
    bindex: usize,
) -> Result<std::path::PathBuf> {
    let parent = dentry.parent().ok_or(Errno::EINVAL)?;
    {
        let pf = parent.fanout();
        if let Some(slot) = pf.lower(bindex) {
            if slot.dentry.is_positive() {
                return Ok(slot.dentry.path());
            }
        }
    }
    let target = crate::copyup::create_parents(sb, dentry, bindex)?;
    Ok(target.parent_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whiteout_names() {
        let wh = whiteout_name(OsStr::new("foo"));
        assert_eq!(wh, OsString::from(".wh.foo"));
        assert_eq!(strip_whiteout(&wh), Some(OsString::from("foo")));
        assert_eq!(strip_whiteout(OsStr::new("foo")), None);
        assert_eq!(strip_whiteout(OsStr::new(".wh.")), None);
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name(OsStr::new(".wh.foo")));
        assert!(is_reserved_name(OsStr::new(".wh.__dir_opaque")));
        assert!(is_reserved_name(OsStr::new("__dir_opaque")));
        assert!(is_reserved_name(OsStr::new("__dir_opaque_suffix")));
        assert!(!is_reserved_name(OsStr::new("regular")));
        assert!(!is_reserved_name(OsStr::new(".whx")));
    }

    #[test]
    fn opaque_marker_is_a_whiteout_name() {
        assert_eq!(
            strip_whiteout(OsStr::new(DIR_OPAQUE)),
            Some(OsString::from("__dir_opaque"))
        );
    }
}
