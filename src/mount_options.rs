//! Mount-option parsing.
//!
//! A union is described by a `dirs=` option: a colon-separated list of
//! branch specifications `path[=mode]` where `mode` is `ro` or `rw`
//! (default `rw`). The leftmost branch is the highest-priority one and must
//! be writable. Example: `dirs=/upper:/mid=rw:/lower=ro`.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::branch::BranchPerms;
use crate::errors::{Errno, Result};

/// Tunables with the defaults inherited from the reference constants.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// Maximum number of branches a union may hold.
    pub max_branches: usize,
    /// How many generated names a silly-rename copy-up tries before giving
    /// up with `EIO`.
    pub sillyrename_retries: u32,
    /// How long a parked readdir cursor stays resumable.
    pub rdcache_retention: Duration,
    /// Upper bound on parked readdir cursors per directory inode.
    pub rdcache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_branches: 128,
            sillyrename_retries: 5,
            rdcache_retention: Duration::from_secs(5),
            rdcache_capacity: 64,
        }
    }
}

/// One parsed branch specification from a `dirs=` list.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BranchSpec {
    /// Root directory of the branch in the lower filesystem.
    pub path: PathBuf,
    /// Access mode of the branch.
    pub perms: BranchPerms,
}

/// Everything needed to mount a union.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MountConfig {
    /// Ordered branch list, index 0 is the highest priority.
    pub branches: Vec<BranchSpec>,
    /// Tunables.
    pub config: Config,
}

impl MountConfig {
    /// Builds a mount configuration from explicit branch specs.
    pub fn new(branches: Vec<BranchSpec>) -> MountConfig {
        MountConfig {
            branches,
            config: Config::default(),
        }
    }

    /// Parses a full option string, e.g. `dirs=/a:/b=ro`.
    ///
    /// Options are comma-separated `name=value` pairs; `dirs` is required
    /// and must appear exactly once. Unknown options are rejected.
    pub fn parse(options: &str) -> Result<MountConfig> {
        let mut branches = None;
        for opt in split_nonempty(options.as_bytes(), b',') {
            let (name, arg) = match memchr::memchr(b'=', opt) {
                Some(pos) => (&opt[..pos], &opt[pos + 1..]),
                None => {
                    warn!("unionfs: option {:?} requires an argument", text(opt));
                    return Err(Errno::EINVAL);
                }
            };
            match name {
                b"dirs" => {
                    if branches.is_some() {
                        warn!("unionfs: multiple dirs= options");
                        return Err(Errno::EINVAL);
                    }
                    branches = Some(parse_dirs(arg)?);
                }
                other => {
                    warn!("unionfs: unrecognized option {:?}", text(other));
                    return Err(Errno::EINVAL);
                }
            }
        }
        match branches {
            Some(branches) => Ok(MountConfig::new(branches)),
            None => {
                warn!("unionfs: dirs= option required");
                Err(Errno::EINVAL)
            }
        }
    }
}

/// Parses the value of a `dirs=` option into an ordered branch list.
pub(crate) fn parse_dirs(value: &[u8]) -> Result<Vec<BranchSpec>> {
    let mut specs = Vec::new();
    for field in split_nonempty(value, b':') {
        let (path, mode) = match memchr::memchr(b'=', field) {
            Some(pos) => (&field[..pos], Some(&field[pos + 1..])),
            None => (field, None),
        };
        if path.is_empty() {
            continue;
        }
        let perms = parse_branch_mode(mode);
        // The leftmost branch takes all the writes; a read-only one would
        // leave the union with nowhere to put them.
        if specs.is_empty() && !perms.contains(BranchPerms::WRITE) {
            warn!("unionfs: leftmost branch must be writable");
            return Err(Errno::EINVAL);
        }
        specs.push(BranchSpec {
            path: PathBuf::from(text(path)),
            perms,
        });
    }
    if specs.is_empty() {
        warn!("unionfs: no branches specified");
        return Err(Errno::EINVAL);
    }
    Ok(specs)
}

/// `ro` and `rw` are the recognized branch modes; anything else (including
/// no mode at all) means read-write.
fn parse_branch_mode(mode: Option<&[u8]>) -> BranchPerms {
    match mode {
        Some(b"ro") => BranchPerms::READ,
        _ => BranchPerms::READ | BranchPerms::WRITE,
    }
}

fn split_nonempty(bytes: &[u8], sep: u8) -> impl Iterator<Item = &[u8]> {
    bytes.split(move |&b| b == sep).filter(|f| !f.is_empty())
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_and_defaults() {
        let cfg = MountConfig::parse("dirs=/a:/b=ro:/c=rw").unwrap();
        assert_eq!(cfg.branches.len(), 3);
        assert_eq!(cfg.branches[0].path, PathBuf::from("/a"));
        assert_eq!(cfg.branches[0].perms, BranchPerms::READ | BranchPerms::WRITE);
        assert_eq!(cfg.branches[1].perms, BranchPerms::READ);
        assert_eq!(cfg.branches[2].perms, BranchPerms::READ | BranchPerms::WRITE);
    }

    #[test]
    fn leftmost_must_be_writable() {
        assert_eq!(
            MountConfig::parse("dirs=/a=ro:/b").unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn rejects_missing_and_duplicate_dirs() {
        assert_eq!(MountConfig::parse("").unwrap_err(), Errno::EINVAL);
        assert_eq!(MountConfig::parse("dirs=").unwrap_err(), Errno::EINVAL);
        assert_eq!(
            MountConfig::parse("dirs=/a,dirs=/b").unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn rejects_unknown_options() {
        assert_eq!(MountConfig::parse("dirs=/a,frob=1").unwrap_err(), Errno::EINVAL);
        assert_eq!(MountConfig::parse("dirs=/a,frob").unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn empty_fields_are_skipped() {
        let cfg = MountConfig::parse("dirs=/a::/b=ro").unwrap();
        assert_eq!(cfg.branches.len(), 2);
    }

    #[test]
    fn unknown_branch_mode_defaults_to_rw() {
        let cfg = MountConfig::parse("dirs=/a=frob").unwrap();
        assert!(cfg.branches[0].perms.contains(BranchPerms::WRITE));
    }
}
