//! The branch table: the ordered set of lower directory trees composed by
//! the union.
//!
//! A branch is identified two ways. Its *index* is its current position in
//! the priority order (0 = highest) and shifts when branches are added or
//! removed. Its *id* is immutable for the lifetime of the mount and never
//! reused. Reference counts taken against a branch (mount references, open
//! files) are held through RAII guards that keep the branch record alive,
//! so a release always lands on the branch that was acquired, no matter how
//! the table has been reshuffled since.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use bitflags::bitflags;
use log::warn;

use crate::errors::{Errno, Result};
use crate::mount_options::BranchSpec;

bitflags! {
    /// Access mode of a branch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BranchPerms: u32 {
        /// The branch may be read.
        const READ = 0b01;
        /// The branch may be written.
        const WRITE = 0b10;
    }
}

/// Immutable identifier of a branch, stable across re-indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub u32);

/// One mounted branch.
#[derive(Debug)]
pub(crate) struct Branch {
    id: BranchId,
    root: PathBuf,
    perms: AtomicU32,
    open_files: AtomicI64,
    mnt_refs: AtomicI64,
}

impl Branch {
    fn new(id: BranchId, root: PathBuf, perms: BranchPerms) -> Arc<Branch> {
        Arc::new(Branch {
            id,
            root,
            perms: AtomicU32::new(perms.bits()),
            open_files: AtomicI64::new(0),
            mnt_refs: AtomicI64::new(0),
        })
    }

    pub(crate) fn id(&self) -> BranchId {
        self.id
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn perms(&self) -> BranchPerms {
        BranchPerms::from_bits_truncate(self.perms.load(Ordering::Acquire))
    }

    fn set_perms(&self, perms: BranchPerms) {
        self.perms.store(perms.bits(), Ordering::Release);
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.perms().contains(BranchPerms::WRITE)
    }

    /// `EROFS` when the branch cannot be written, the signal the copy-up
    /// retry loops key on.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_writable() { Ok(()) } else { Err(Errno::EROFS) }
    }

    pub(crate) fn open_count(&self) -> i64 {
        self.open_files.load(Ordering::Acquire)
    }

    pub(crate) fn mnt_count(&self) -> i64 {
        self.mnt_refs.load(Ordering::Acquire)
    }

    /// Takes a mount reference against this branch.
    pub(crate) fn mntget(self: &Arc<Branch>) -> MntRef {
        self.mnt_refs.fetch_add(1, Ordering::AcqRel);
        MntRef {
            branch: Arc::clone(self),
        }
    }

    /// Accounts one open lower file on this branch.
    pub(crate) fn branchget(self: &Arc<Branch>) -> BranchOpenGuard {
        self.open_files.fetch_add(1, Ordering::AcqRel);
        BranchOpenGuard {
            branch: Arc::clone(self),
        }
    }
}

/// A counted mount reference on a branch; released on drop.
#[derive(Debug)]
pub(crate) struct MntRef {
    branch: Arc<Branch>,
}

impl MntRef {
    pub(crate) fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }
}

impl Clone for MntRef {
    fn clone(&self) -> MntRef {
        self.branch.mntget()
    }
}

impl Drop for MntRef {
    fn drop(&mut self) {
        self.branch.mnt_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A counted open-file reference on a branch; released on drop under the
/// branch *id* captured at open time.
#[derive(Debug)]
pub(crate) struct BranchOpenGuard {
    branch: Arc<Branch>,
}

impl BranchOpenGuard {
    pub(crate) fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }

    pub(crate) fn saved_id(&self) -> BranchId {
        self.branch.id
    }
}

impl Drop for BranchOpenGuard {
    fn drop(&mut self) {
        self.branch.open_files.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The ordered branch array plus the id allocator.
///
/// Guarded by the superblock's reader-writer lock: readers are namespace
/// and I/O operations, writers are the branch-management entry points. The
/// superblock generation is bumped by the caller on every mutation here.
#[derive(Debug, Default)]
pub(crate) struct BranchTable {
    branches: Vec<Arc<Branch>>,
    high_branch_id: u32,
}

impl BranchTable {
    pub(crate) fn count(&self) -> usize {
        self.branches.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Arc<Branch>> {
        self.branches.get(index)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Branch>> {
        self.branches.iter()
    }

    pub(crate) fn id_of(&self, index: usize) -> Option<BranchId> {
        self.branches.get(index).map(|b| b.id)
    }

    pub(crate) fn index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id == id)
    }

    /// Validates and appends/inserts a branch at `position`.
    pub(crate) fn add_branch(
        &mut self,
        spec: &BranchSpec,
        position: usize,
        max_branches: usize,
    ) -> Result<usize> {
        if position > self.branches.len() {
            return Err(Errno::EINVAL);
        }
        if self.branches.len() >= max_branches {
            warn!("unionfs: maximum of {max_branches} branches reached");
            return Err(Errno::EINVAL);
        }
        // Branch 0 must stay writable.
        if position == 0 && !spec.perms.contains(BranchPerms::WRITE) {
            return Err(Errno::EINVAL);
        }
        let root = check_branch_dir(&spec.path)?;
        for (i, other) in self.branches.iter().enumerate() {
            if paths_overlap(&root, other.root()) {
                warn!(
                    "unionfs: branch {:?} overlaps branch {} ({:?})",
                    root, i, other.root()
                );
                return Err(Errno::EINVAL);
            }
        }
        self.high_branch_id += 1;
        let branch = Branch::new(BranchId(self.high_branch_id), root, spec.perms);
        self.branches.insert(position, branch);
        Ok(position)
    }

    /// Retires the branch at `index`; refused while it has open files.
    pub(crate) fn remove_branch(&mut self, index: usize) -> Result<Arc<Branch>> {
        if index >= self.branches.len() || self.branches.len() == 1 {
            return Err(Errno::EINVAL);
        }
        let branch = &self.branches[index];
        if branch.open_count() > 0 {
            warn!(
                "unionfs: branch {:?} has {} open files, not removing",
                branch.root(),
                branch.open_count()
            );
            return Err(Errno::EBUSY);
        }
        // Whichever branch ends up leftmost must be writable.
        let new_leftmost = if index == 0 { 1 } else { 0 };
        if !self.branches[new_leftmost].is_writable() {
            return Err(Errno::EINVAL);
        }
        Ok(self.branches.remove(index))
    }

    pub(crate) fn set_perms(&mut self, index: usize, perms: BranchPerms) -> Result<()> {
        if index >= self.branches.len() {
            return Err(Errno::EINVAL);
        }
        if index == 0 && !perms.contains(BranchPerms::WRITE) {
            return Err(Errno::EINVAL);
        }
        self.branches[index].set_perms(perms);
        Ok(())
    }
}

/// Resolves a branch root and verifies it is usable: it must exist and be a
/// directory. Symlinks are followed so the overlap test below compares real
/// locations.
fn check_branch_dir(path: &Path) -> Result<PathBuf> {
    let root = path.canonicalize().map_err(|err| {
        warn!("unionfs: error accessing branch directory {path:?}: {err}");
        Errno::from(err)
    })?;
    let meta = std::fs::metadata(&root)?;
    if !meta.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    Ok(root)
}

/// Ancestor test in both directions: two branches may not lie on the same
/// lower path prefix, or a change through one could invisibly alter the
/// other.
fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(path: &Path, perms: BranchPerms) -> BranchSpec {
        BranchSpec {
            path: path.to_path_buf(),
            perms,
        }
    }

    fn rw() -> BranchPerms {
        BranchPerms::READ | BranchPerms::WRITE
    }

    #[test]
    fn ids_survive_reindexing() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let c = TempDir::new().unwrap();
        let mut table = BranchTable::default();
        table.add_branch(&spec(a.path(), rw()), 0, 128).unwrap();
        table.add_branch(&spec(b.path(), rw()), 1, 128).unwrap();
        let id_a = table.id_of(0).unwrap();
        let id_b = table.id_of(1).unwrap();

        table.add_branch(&spec(c.path(), rw()), 0, 128).unwrap();
        assert_eq!(table.index_of(id_a), Some(1));
        assert_eq!(table.index_of(id_b), Some(2));
        // The new branch got a fresh id even though it sits at index 0.
        assert_ne!(table.id_of(0), Some(id_a));
    }

    #[test]
    fn overlapping_branches_are_rejected() {
        let a = TempDir::new().unwrap();
        let sub = a.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let mut table = BranchTable::default();
        table.add_branch(&spec(a.path(), rw()), 0, 128).unwrap();
        assert_eq!(
            table.add_branch(&spec(&sub, rw()), 1, 128).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn nonexistent_branch_is_rejected() {
        let a = TempDir::new().unwrap();
        let mut table = BranchTable::default();
        let missing = a.path().join("missing");
        assert_eq!(
            table.add_branch(&spec(&missing, rw()), 0, 128).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn open_guard_accounting() {
        let a = TempDir::new().unwrap();
        let mut table = BranchTable::default();
        table.add_branch(&spec(a.path(), rw()), 0, 128).unwrap();
        let branch = Arc::clone(table.get(0).unwrap());

        let open = branch.branchget();
        let mnt = branch.mntget();
        assert_eq!(branch.open_count(), 1);
        assert_eq!(branch.mnt_count(), 1);
        assert_eq!(table.remove_branch(0).unwrap_err(), Errno::EINVAL);

        drop(open);
        drop(mnt);
        assert_eq!(branch.open_count(), 0);
        assert_eq!(branch.mnt_count(), 0);
    }

    #[test]
    fn busy_branch_is_not_removed() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let mut table = BranchTable::default();
        table.add_branch(&spec(a.path(), rw()), 0, 128).unwrap();
        table.add_branch(&spec(b.path(), rw()), 1, 128).unwrap();
        let guard = Arc::clone(table.get(1).unwrap()).branchget();
        assert_eq!(table.remove_branch(1).unwrap_err(), Errno::EBUSY);
        drop(guard);
        table.remove_branch(1).unwrap();
    }

    #[test]
    fn leftmost_stays_writable() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let mut table = BranchTable::default();
        table.add_branch(&spec(a.path(), rw()), 0, 128).unwrap();
        table.add_branch(&spec(b.path(), BranchPerms::READ), 1, 128).unwrap();
        assert_eq!(table.set_perms(0, BranchPerms::READ).unwrap_err(), Errno::EINVAL);
        assert_eq!(
            table.add_branch(&spec(b.path(), BranchPerms::READ), 0, 128).unwrap_err(),
            Errno::EINVAL
        );
        // Removing index 0 would promote a read-only branch.
        assert_eq!(table.remove_branch(0).unwrap_err(), Errno::EINVAL);
    }
}
