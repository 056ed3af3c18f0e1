//! Directory reading: merge the lower streams, mask whiteouts, stay
//! resumable.
//!
//! Branch streams are visited left to right (stopping at an opaque
//! branch). A hash table of names already returned suppresses duplicates
//! from lower branches; whiteouts are recorded in the same table so the
//! masked names never surface, and the whiteout files themselves are never
//! emitted.
//!
//! The cursor survives close/open cycles for a bounded time: on release it
//! is parked on the inode, keyed by a cookie encoded in the high 12 bits
//! of the returned offset (the low 20 bits count emitted entries), so a
//! remote client can resume a listing through a fresh open.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::hash::{BuildHasher, Hasher, RandomState};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use log::debug;

use crate::DirEntry;
use crate::dentry::UnionDentry;
use crate::mount_options::Config;
use crate::errors::{Errno, Result};
use crate::inode::UnionInode;
use crate::lower;
use crate::whiteout::strip_whiteout;

/// Per-directory offsets use 20 bits; this value doubles as "end of
/// directory".
pub(crate) const DIREOF: u32 = 0xfffff;
/// Cookies are 12 bits and never zero.
pub(crate) const MAX_RDCOOKIE: u32 = 0xfff;
const RDOFF_BITS: u32 = 20;

/// A readdir cursor.
#[derive(Debug)]
pub(crate) struct RdState {
    cookie: u32,
    /// Entries emitted so far, including `.` and `..`.
    offset: u32,
    /// Branch currently being streamed.
    bindex: usize,
    /// Entries consumed within that branch's (sorted) stream, emitted or
    /// not.
    dirpos: u64,
    /// Names already returned or masked: name -> (branch, was-whiteout).
    names: HashMap<OsString, (usize, bool)>,
    /// Every branch stream has been drained.
    eof: bool,
    /// Stamped when the cursor is parked on the inode.
    access: Instant,
}

impl RdState {
    pub(crate) fn new(bindex: usize) -> RdState {
        RdState {
            cookie: next_cookie(),
            offset: 0,
            bindex,
            dirpos: 0,
            names: HashMap::new(),
            eof: false,
            access: Instant::now(),
        }
    }

    /// The file offset encoding of this cursor position.
    pub(crate) fn to_offset(&self) -> i64 {
        (((self.cookie & MAX_RDCOOKIE) << RDOFF_BITS) | (self.offset & DIREOF)) as i64
    }

    pub(crate) fn touch(&mut self) {
        self.access = Instant::now();
    }

    fn at_eof(&self) -> bool {
        self.eof || self.offset >= DIREOF
    }
}

/// Parked cursors of one directory inode, LRU-evicted and time-bounded.
#[derive(Debug, Default)]
pub(crate) struct RdCursorCache {
    states: VecDeque<RdState>,
}

impl RdCursorCache {
    /// Parks a cursor, evicting the oldest past capacity.
    pub(crate) fn park(&mut self, mut state: RdState, capacity: usize) {
        state.touch();
        debug!(
            "unionfs: saving rdstate with cookie {:x} [{}]",
            state.cookie, state.bindex
        );
        self.states.push_back(state);
        while self.states.len() > capacity {
            self.states.pop_front();
        }
    }

    /// Reclaims the cursor matching an encoded offset, dropping expired
    /// ones along the way.
    pub(crate) fn take(&mut self, fpos: i64, retention: Duration) -> Option<RdState> {
        let now = Instant::now();
        self.states
            .retain(|state| now.duration_since(state.access) <= retention);
        let index = self
            .states
            .iter()
            .position(|state| state.to_offset() == fpos)?;
        self.states.remove(index)
    }
}

fn next_cookie() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static HASHER: OnceLock<RandomState> = OnceLock::new();
    let salt = HASHER.get_or_init(RandomState::new);
    loop {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = salt.build_hasher();
        hasher.write_u32(n);
        let cookie = (hasher.finish() as u32) & MAX_RDCOOKIE;
        if cookie != 0 {
            return cookie;
        }
    }
}

/// Reads the next batch of merged entries.
///
/// `fpos` must be 0 (start a fresh listing) or the offset returned with a
/// previously emitted entry, possibly from a cursor parked across a
/// close/open cycle. Anything else is `EINVAL`.
pub(crate) fn do_readdir(
    dentry: &Arc<UnionDentry>,
    inode: &Arc<UnionInode>,
    slot: &mut Option<RdState>,
    fpos: i64,
    config: &Config,
) -> Result<Vec<DirEntry>> {
    let mut state = claim_state(dentry, inode, slot, fpos, config)?;
    let mut out = Vec::new();

    if state.at_eof() {
        *slot = Some(state);
        return Ok(out);
    }

    // The union synthesizes its own dot entries.
    if state.offset == 0 {
        state.offset = 1;
        out.push(DirEntry {
            name: OsString::from("."),
            kind: crate::FileKind::Directory,
            ino: inode.ino(),
            offset: state.to_offset(),
        });
    }
    if state.offset == 1 {
        state.offset = 2;
        let parent_ino = dentry
            .parent()
            .and_then(|p| p.inode())
            .map(|i| i.ino())
            .unwrap_or_else(|| inode.ino());
        out.push(DirEntry {
            name: OsString::from(".."),
            kind: crate::FileKind::Directory,
            ino: parent_ino,
            offset: state.to_offset(),
        });
    }

    // Snapshot the branch directories to stream.
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
        if bindex < state.bindex {
            continue;
        }
        if bindex > state.bindex {
            // A branch we had not reached yet; its stream starts over.
            state.dirpos = 0;
        }
        state.bindex = bindex;
        let entries = lower::read_dir_sorted(&path)?;
        while (state.dirpos as usize) < entries.len() {
            let (name, kind, _ino) = &entries[state.dirpos as usize];
            state.dirpos += 1;
            if !merge_entry(&mut state, bindex, name, *kind, &mut out)? {
                // Offset space exhausted; report what we have.
                *slot = Some(state);
                return Ok(out);
            }
        }
        state.dirpos = 0;
    }

    state.eof = true;
    *slot = Some(state);
    Ok(out)
}

/// Processes one lower entry; returns false when the 20-bit offset space
/// is exhausted.
fn merge_entry(
    state: &mut RdState,
    bindex: usize,
    name: &OsStr,
    kind: crate::FileKind,
    out: &mut Vec<DirEntry>,
) -> Result<bool> {
    if name == "." || name == ".." {
        return Ok(true);
    }
    if let Some(masked) = strip_whiteout(name) {
        match state.names.get(&masked) {
            // A whiteout and a real entry for one name in one branch is a
            // corrupt branch.
            Some((b, false)) if *b == bindex => return Err(Errno::EIO),
            Some(_) => {}
            None => {
                state.names.insert(masked, (bindex, true));
            }
        }
        return Ok(true);
    }
    match state.names.get(name) {
        Some((b, true)) if *b == bindex => return Err(Errno::EIO),
        // Masked by a whiteout above, or already emitted.
        Some(_) => return Ok(true),
        None => {}
    }
    if state.offset >= DIREOF - 1 {
        return Ok(false);
    }
    state.names.insert(name.to_os_string(), (bindex, false));
    state.offset += 1;
    out.push(DirEntry {
        name: name.to_os_string(),
        kind,
        // The branch index serves as the inode hint.
        ino: bindex as u64,
        offset: state.to_offset(),
    });
    Ok(true)
}

/// Produces the cursor for this call: fresh at offset zero, the file's own
/// when it matches, or one reclaimed from the inode cache.
fn claim_state(
    dentry: &Arc<UnionDentry>,
    inode: &Arc<UnionInode>,
    slot: &mut Option<RdState>,
    fpos: i64,
    config: &Config,
) -> Result<RdState> {
    if fpos == 0 {
        let bindex = {
            let fanout = dentry.fanout();
            if fanout.start() >= 0 { fanout.start() as usize } else { 0 }
        };
        return Ok(RdState::new(bindex));
    }
    if let Some(state) = slot.take() {
        let same_cookie = ((fpos as u32) >> RDOFF_BITS) & MAX_RDCOOKIE == state.cookie;
        if state.to_offset() == fpos || (same_cookie && state.at_eof()) {
            return Ok(state);
        }
        // Not where the caller wants to resume; maybe a parked cursor is.
        inode.rdcache.lock().park(state, config.rdcache_capacity);
    }
    inode
        .rdcache
        .lock()
        .take(fpos, config.rdcache_retention)
        .ok_or(Errno::EINVAL)
}

/// Directory llseek: only a rewind to zero or a seek to a live cursor
/// position is meaningful.
pub(crate) fn dir_llseek(
    inode: &Arc<UnionInode>,
    slot: &mut Option<RdState>,
    offset: i64,
    retention: Duration,
) -> Result<i64> {
    if offset == 0 {
        *slot = None;
        return Ok(0);
    }
    if let Some(state) = slot {
        if state.to_offset() == offset {
            return Ok(offset);
        }
    }
    match inode.rdcache.lock().take(offset, retention) {
        Some(state) => {
            *slot = Some(state);
            Ok(offset)
        }
        None => Err(Errno::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_encoding_uses_cookie_and_position() {
        let mut state = RdState::new(0);
        state.offset = 5;
        let encoded = state.to_offset();
        assert_eq!(encoded as u32 & DIREOF, 5);
        assert_eq!((encoded as u32 >> RDOFF_BITS) & MAX_RDCOOKIE, state.cookie);
        assert_ne!(state.cookie, 0);
        assert!(state.cookie <= MAX_RDCOOKIE);
    }

    #[test]
    fn cache_is_lru_bounded_and_time_bounded() {
        let mut cache = RdCursorCache::default();
        let a = RdState::new(0);
        let a_pos = {
            let mut st = a;
            st.offset = 3;
            let pos = st.to_offset();
            cache.park(st, 2);
            pos
        };
        for _ in 0..2 {
            cache.park(RdState::new(0), 2);
        }
        // Evicted by capacity.
        assert!(cache.take(a_pos, Duration::from_secs(60)).is_none());

        let mut b = RdState::new(1);
        b.offset = 7;
        let b_pos = b.to_offset();
        cache.park(b, 2);
        // Expired by retention.
        assert!(cache.take(b_pos, Duration::from_secs(0)).is_none());
    }

    #[test]
    fn cookies_fit_and_vary() {
        let a = RdState::new(0).cookie;
        for _ in 0..100 {
            let c = RdState::new(0).cookie;
            assert!(c > 0 && c <= MAX_RDCOOKIE);
        }
        let _ = a;
    }
}
