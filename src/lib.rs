//! Stackable union filesystem core.
//!
//! An ordered list of directory trees ("branches") is composed into a
//! single logical namespace: reads resolve to the highest-priority branch
//! carrying a name, writes land on a writable branch with content copied
//! up from read-only branches on first write, and deletions are recorded
//! as whiteout markers that mask names in the branches below.
//!
//! The host (whatever plays the role of the VFS) owns the object
//! lifetimes: it holds `Arc` handles to [`UnionDentry`], [`UnionInode`]
//! and [`UnionFile`] and drives the operation surface on [`UnionFs`].
//! Branches can be added, removed, and re-moded at runtime; a generation
//! protocol revalidates every cached fan-out against the new configuration
//! before the next operation uses it.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use bitflags::bitflags;
use log::{debug, info};
use num_enum::TryFromPrimitive;
use parking_lot::RwLock;
use zerocopy::{Immutable, IntoBytes};

pub use crate::branch::{BranchId, BranchPerms};
pub use crate::dentry::UnionDentry;
pub use crate::errors::{Errno, Result};
pub use crate::file_ops::{DEFAULT_POLLMASK, UnionFile};
pub use crate::inode::UnionInode;
pub use crate::mount_options::{BranchSpec, Config, MountConfig};
pub use crate::page_bridge::{WritebackControl, WritepageOutcome};

use crate::branch::{Branch, BranchTable};
use crate::dentry::LowerSlot;
use crate::fanout::Fanout;
use crate::inode::InterposeMode;
use crate::sioq::Sioq;

mod branch;
mod copyup;
mod debug_checks;
mod dentry;
mod dirhelper;
mod errors;
mod fanout;
mod file_ops;
mod inode;
mod lookup;
mod lower;
mod mount_options;
mod namespace;
mod page_bridge;
mod readdir;
mod sioq;
mod whiteout;

/// Inode number of the union root.
pub const UNIONFS_ROOT_INO: u64 = 1;

/// File types a union inode can represent.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileKind {
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

/// File attributes as the host sees them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    /// Union inode number
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Kind of file
    pub kind: FileKind,
    /// Permission bits
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Device id, for special files
    pub rdev: u64,
}

/// Attribute changes for [`UnionFs::setattr`]; unset fields are left
/// alone.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SetAttr {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size (truncate or extend).
    pub size: Option<u64>,
    /// New access time.
    pub atime: Option<SystemTime>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
}

/// One merged directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Entry name.
    pub name: OsString,
    /// Entry type.
    pub kind: FileKind,
    /// Inode hint: the branch index the entry came from.
    pub ino: u64,
    /// Opaque offset to resume the listing after this entry.
    pub offset: i64,
}

/// Raw open(2) flags as passed by the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    /// Read-only open.
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    /// Write-only open.
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    /// Read-write open.
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);

    const WRITE_FLAGS: i32 = libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND;

    /// The open may lead to changes of the file.
    pub fn wants_write(self) -> bool {
        self.0 & Self::WRITE_FLAGS != 0
    }

    /// The open asks for truncation.
    pub fn has_trunc(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    /// Writes go to end-of-file.
    pub fn is_append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }

    /// The same flags with every write intent stripped, for deferred
    /// copy-up opens on read-only branches.
    pub(crate) fn write_masked(self) -> i32 {
        self.0 & !(Self::WRITE_FLAGS | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL)
    }
}

bitflags! {
    /// Access mask for [`UnionFs::permission`], aligned with the rwx
    /// permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMask: u32 {
        /// Execute / search.
        const EXEC = 1;
        /// Write.
        const WRITE = 2;
        /// Read.
        const READ = 4;
    }
}

/// The reserved union control codes (`_IOR(0x15, ...)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum UnionIoctlCmd {
    /// Legacy generation-increment; accepted but unimplemented.
    IncGen = 0x8004_150b,
    /// Report the set of branches containing the file.
    QueryFile = 0x8004_150f,
}

/// Decodes a raw ioctl command into a reserved union control code.
pub fn decode_ioctl(cmd: u32) -> Option<UnionIoctlCmd> {
    UnionIoctlCmd::try_from(cmd).ok()
}

/// A control request on an open union file.
#[derive(Debug)]
pub enum IoctlRequest<'a> {
    /// The deprecated generation-increment control.
    IncGen,
    /// Fill in the set of branches that contain the file.
    QueryFile(&'a mut QueryFileSet),
    /// Anything else is forwarded to the lower file at `fbstart`.
    Other {
        /// Raw command.
        cmd: u64,
        /// Raw argument, passed through untouched.
        arg: u64,
    },
}

/// Fixed-size bit set of branch indices (capacity 1024).
#[derive(Clone, Copy, IntoBytes, Immutable)]
#[repr(transparent)]
pub struct QueryFileSet {
    bits: [u64; 16],
}

impl QueryFileSet {
    /// Marks a branch index as containing the file.
    pub(crate) fn insert(&mut self, index: usize) {
        if index < 1024 {
            self.bits[index / 64] |= 1 << (index % 64);
        }
    }

    /// Whether the branch index contains the file.
    pub fn contains(&self, index: usize) -> bool {
        index < 1024 && self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    /// The raw bit set, little-endian words, for copying to host memory.
    pub fn as_bytes(&self) -> &[u8] {
        IntoBytes::as_bytes(self)
    }
}

impl Default for QueryFileSet {
    fn default() -> Self {
        QueryFileSet { bits: [0; 16] }
    }
}

impl std::fmt::Debug for QueryFileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries((0..1024).filter(|i| self.contains(*i)))
            .finish()
    }
}

/// One page of the host's page cache, as handed to the page bridge.
#[derive(Debug)]
pub struct Page {
    /// Page index within the file (`offset / page size`).
    pub index: u64,
    /// Page content; exactly one system page long.
    pub data: Box<[u8]>,
    /// The content reflects the file.
    pub uptodate: bool,
    /// The content has changes not yet written back.
    pub dirty: bool,
}

impl Page {
    /// A zeroed page at `index`.
    pub fn new(index: u64) -> Page {
        Page {
            index,
            data: vec![0; page_bridge::page_bytes()].into_boxed_slice(),
            uptodate: false,
            dirty: false,
        }
    }
}

/// Filesystem statistics, reported from the leftmost branch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FsStats {
    /// Preferred block size.
    pub block_size: u64,
    /// Total data blocks.
    pub blocks: u64,
    /// Free blocks.
    pub blocks_free: u64,
    /// Blocks available to unprivileged users.
    pub blocks_available: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub files_free: u64,
    /// Maximum filename length.
    pub name_max: u64,
}

/// Superblock-level shared state: branch table, generation, tunables, and
/// the worker/caches module handle.
pub(crate) struct SuperInner {
    pub(crate) branches: RwLock<BranchTable>,
    generation: AtomicU64,
    pub(crate) config: Config,
    pub(crate) sioq: Sioq,
    next_ino: AtomicU64,
    root: OnceLock<Arc<UnionDentry>>,
}

impl std::fmt::Debug for SuperInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperInner")
            .field("generation", &self.generation())
            .field("branches", &self.branch_count())
            .finish_non_exhaustive()
    }
}

impl SuperInner {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation_locked(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn branch_count(&self) -> usize {
        self.branches.read().count()
    }

    pub(crate) fn branch_at(&self, index: usize) -> Result<Arc<Branch>> {
        self.branches.read().get(index).cloned().ok_or(Errno::ESTALE)
    }

    pub(crate) fn branch_arcs(&self) -> Vec<Arc<Branch>> {
        self.branches.read().iter().cloned().collect()
    }

    pub(crate) fn branch_index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.read().index_of(id)
    }

    pub(crate) fn next_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::AcqRel)
    }

    fn root(&self) -> Result<Arc<UnionDentry>> {
        self.root.get().cloned().ok_or(Errno::ESTALE)
    }

    /// Rebuilds the root dentry's (and inode's) fan-out from the branch
    /// table and stamps it with the current generation. Called with the
    /// branch write lock held; the root is by definition always current.
    fn refresh_root(&self, sb: &Arc<SuperInner>, table: &BranchTable) -> Result<()> {
        let root = self.root()?;
        let mut fanout = root.fanout();
        fanout.reset(table.count());
        for (index, branch) in table.iter().enumerate() {
            let ld = lower::LowerDentry::branch_root(branch.root())?;
            fanout.set_lower(
                index,
                Some(LowerSlot {
                    dentry: ld,
                    mnt: branch.mntget(),
                }),
            );
        }
        fanout.set_start(0);
        fanout.set_end(table.count() as i32 - 1);
        if let Some(inode) = root.inode() {
            inode.fill_from(&fanout);
            inode.set_generation(self.generation());
        }
        root.set_generation(self.generation());
        Ok(())
    }
}

/// A mounted union filesystem.
///
/// Dropping the handle tears the mount down; [`UnionFs::unmount`] does the
/// same with error reporting.
#[derive(Debug)]
pub struct UnionFs {
    sb: Arc<SuperInner>,
}

impl UnionFs {
    /// Mounts a union over the branches in `config`.
    pub fn mount(config: MountConfig) -> Result<UnionFs> {
        let sioq = Sioq::start()?;
        let sb = Arc::new(SuperInner {
            branches: RwLock::new(BranchTable::default()),
            generation: AtomicU64::new(1),
            config: config.config.clone(),
            sioq,
            next_ino: AtomicU64::new(UNIONFS_ROOT_INO),
            root: OnceLock::new(),
        });

        {
            let mut table = sb.branches.write();
            for (position, spec) in config.branches.iter().enumerate() {
                table.add_branch(spec, position, sb.config.max_branches)?;
            }
        }

        // Build the root dentry spanning every branch, then interpose its
        // inode.
        let table = sb.branches.read();
        let mut fanout: Fanout<LowerSlot> = Fanout::new(table.count());
        for (index, branch) in table.iter().enumerate() {
            let ld = lower::LowerDentry::branch_root(branch.root())?;
            fanout.set_lower(
                index,
                Some(LowerSlot {
                    dentry: ld,
                    mnt: branch.mntget(),
                }),
            );
        }
        fanout.set_start(0);
        fanout.set_end(table.count() as i32 - 1);
        drop(table);

        let root = UnionDentry::new_root(&sb, fanout);
        {
            let root_fanout = root.fanout();
            inode::interpose(&sb, &root, &root_fanout, InterposeMode::Default)?;
        }
        sb.root
            .set(Arc::clone(&root))
            .map_err(|_| Errno::EINVAL)?;

        info!(
            "unionfs: mounted {} branches, generation {}",
            sb.branch_count(),
            sb.generation()
        );
        Ok(UnionFs { sb })
    }

    /// Convenience: mount from an option string (`dirs=/a:/b=ro`).
    pub fn mount_options(options: &str) -> Result<UnionFs> {
        UnionFs::mount(MountConfig::parse(options)?)
    }

    /// The root dentry.
    pub fn root(&self) -> Arc<UnionDentry> {
        self.sb.root().expect("mounted filesystem has a root")
    }

    /// Current superblock generation.
    pub fn generation(&self) -> u64 {
        self.sb.generation()
    }

    /// Number of branches.
    pub fn branch_count(&self) -> usize {
        self.sb.branch_count()
    }

    /// The immutable id of the branch at `index`.
    pub fn branch_id(&self, index: usize) -> Option<BranchId> {
        self.sb.branches.read().id_of(index)
    }

    /// The current index of the branch with `id`.
    pub fn branch_index(&self, id: BranchId) -> Option<usize> {
        self.sb.branch_index_of(id)
    }

    /// Tears the mount down; fails while lower files are still open.
    pub fn unmount(&self) -> Result<()> {
        let table = self.sb.branches.read();
        for branch in table.iter() {
            if branch.open_count() > 0 {
                return Err(Errno::EBUSY);
            }
        }
        drop(table);
        self.sb.sioq.stop();
        info!("unionfs: unmounted");
        Ok(())
    }

    /// Filesystem statistics, taken from the leftmost branch.
    pub fn statfs(&self) -> Result<FsStats> {
        let branch = self.sb.branch_at(0)?;
        let stats = lower::statfs(branch.root())?;
        Ok(FsStats {
            block_size: stats.block_size(),
            blocks: stats.blocks(),
            blocks_free: stats.blocks_free(),
            blocks_available: stats.blocks_available(),
            files: stats.files(),
            files_free: stats.files_free(),
            name_max: stats.name_max(),
        })
    }

    // ---- branch management ----

    /// Adds a branch at `position` (0 = highest priority).
    pub fn add_branch(&self, path: &Path, perms: BranchPerms, position: usize) -> Result<()> {
        let spec = BranchSpec {
            path: path.to_path_buf(),
            perms,
        };
        let mut table = self.sb.branches.write();
        table.add_branch(&spec, position, self.sb.config.max_branches)?;
        let generation = self.sb.bump_generation_locked();
        self.sb.refresh_root(&self.sb, &table)?;
        debug!(
            "unionfs: added branch {:?} at {position}, generation {generation}",
            path
        );
        Ok(())
    }

    /// Removes the branch at `index`; fails while it has open files.
    pub fn remove_branch(&self, index: usize) -> Result<()> {
        let mut table = self.sb.branches.write();
        let branch = table.remove_branch(index)?;
        let generation = self.sb.bump_generation_locked();
        self.sb.refresh_root(&self.sb, &table)?;
        debug!(
            "unionfs: removed branch {:?}, generation {generation}",
            branch.root()
        );
        Ok(())
    }

    /// Changes the permissions of the branch at `index`.
    pub fn set_branch_perms(&self, index: usize, perms: BranchPerms) -> Result<()> {
        let mut table = self.sb.branches.write();
        table.set_perms(index, perms)?;
        self.sb.bump_generation_locked();
        self.sb.refresh_root(&self.sb, &table)?;
        Ok(())
    }

    /// Forces a generation bump, staleing every cached fan-out.
    pub fn bump_generation(&self) -> Result<()> {
        let table = self.sb.branches.write();
        self.sb.bump_generation_locked();
        self.sb.refresh_root(&self.sb, &table)?;
        Ok(())
    }

    // ---- dentry ops ----

    /// Revalidates a dentry (and its ancestors) against the current
    /// configuration; `ESTALE` asks the host to re-walk the path.
    pub fn revalidate(&self, dentry: &Arc<UnionDentry>) -> Result<()> {
        dentry::revalidate_chain(&self.sb, dentry)
    }

    // ---- inode ops ----

    /// Resolves one path component under a directory dentry.
    ///
    /// The result may be negative (no inode); it then carries the
    /// creation target a later `create`/`mkdir`/... will use.
    pub fn lookup(&self, parent: &Arc<UnionDentry>, name: &OsStr) -> Result<Arc<UnionDentry>> {
        dentry::revalidate_chain(&self.sb, parent)?;
        let parent_inode = parent.inode().ok_or(Errno::ENOENT)?;
        if !parent_inode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if name.is_empty() || name == "." || name == ".." {
            return Err(Errno::EINVAL);
        }
        let child = UnionDentry::alloc(&self.sb, parent, name);
        lookup::lookup_backend(&self.sb, &child, lookup::LookupMode::Lookup)?;
        Ok(child)
    }

    /// Attributes of a (positive) dentry.
    pub fn getattr(&self, dentry: &Arc<UnionDentry>) -> Result<FileAttr> {
        dentry::revalidate_chain(&self.sb, dentry)?;
        let inode = dentry.inode().ok_or(Errno::ENOENT)?;
        Ok(inode.file_attr())
    }

    /// Creates a regular file with the given permission bits.
    pub fn create(&self, dentry: &Arc<UnionDentry>, perm: u32) -> Result<()> {
        namespace::create(&self.sb, dentry, perm)
    }

    /// Creates a hard link `new` to `old`.
    pub fn link(&self, old: &Arc<UnionDentry>, new: &Arc<UnionDentry>) -> Result<()> {
        namespace::link(&self.sb, old, new)
    }

    /// Removes a non-directory name.
    pub fn unlink(&self, dentry: &Arc<UnionDentry>) -> Result<()> {
        namespace::unlink(&self.sb, dentry)
    }

    /// Creates a symbolic link to `target`.
    pub fn symlink(&self, dentry: &Arc<UnionDentry>, target: &Path) -> Result<()> {
        namespace::symlink(&self.sb, dentry, &target.to_path_buf())
    }

    /// Creates a directory; the new directory masks identically named
    /// lower directories.
    pub fn mkdir(&self, dentry: &Arc<UnionDentry>, perm: u32) -> Result<()> {
        namespace::mkdir(&self.sb, dentry, perm)
    }

    /// Removes a logically empty directory.
    pub fn rmdir(&self, dentry: &Arc<UnionDentry>) -> Result<()> {
        namespace::rmdir(&self.sb, dentry)
    }

    /// Creates a device node, fifo, or socket.
    pub fn mknod(&self, dentry: &Arc<UnionDentry>, mode: u32, rdev: u64) -> Result<()> {
        namespace::mknod(&self.sb, dentry, mode, rdev)
    }

    /// Renames `old` to `new`.
    pub fn rename(&self, old: &Arc<UnionDentry>, new: &Arc<UnionDentry>) -> Result<()> {
        namespace::rename(&self.sb, old, new)
    }

    /// Reads a symbolic link's target.
    pub fn readlink(&self, dentry: &Arc<UnionDentry>) -> Result<PathBuf> {
        namespace::readlink(&self.sb, dentry)
    }

    /// Resolves a symbolic link for traversal.
    pub fn follow_link(&self, dentry: &Arc<UnionDentry>) -> Result<PathBuf> {
        namespace::follow_link(&self.sb, dentry)
    }

    /// Checks access to the object across its branches.
    pub fn permission(&self, dentry: &Arc<UnionDentry>, mask: AccessMask) -> Result<()> {
        namespace::permission(&self.sb, dentry, mask)
    }

    /// Applies attribute changes, copying up from read-only branches.
    pub fn setattr(&self, dentry: &Arc<UnionDentry>, attr: &SetAttr) -> Result<()> {
        namespace::setattr(&self.sb, dentry, attr)
    }

    // ---- file ops ----

    /// Opens a dentry; directories fan out over every branch in range.
    pub fn open(&self, dentry: &Arc<UnionDentry>, flags: OpenFlags) -> Result<Arc<UnionFile>> {
        file_ops::open(&self.sb, dentry, flags)
    }

    /// Reads at `offset`.
    pub fn read(&self, file: &Arc<UnionFile>, buf: &mut [u8], offset: u64) -> Result<usize> {
        file_ops::read(&self.sb, file, buf, offset)
    }

    /// Vectored read at `offset`.
    pub fn read_vectored(
        &self,
        file: &Arc<UnionFile>,
        bufs: &mut [std::io::IoSliceMut<'_>],
        offset: u64,
    ) -> Result<usize> {
        file_ops::read_vectored(&self.sb, file, bufs, offset)
    }

    /// Writes at `offset`, copying up on the first write to a read-only
    /// branch.
    pub fn write(&self, file: &Arc<UnionFile>, buf: &[u8], offset: u64) -> Result<usize> {
        file_ops::write(&self.sb, file, buf, offset)
    }

    /// Vectored write at `offset`.
    pub fn write_vectored(
        &self,
        file: &Arc<UnionFile>,
        bufs: &[std::io::IoSlice<'_>],
        offset: u64,
    ) -> Result<usize> {
        file_ops::write_vectored(&self.sb, file, bufs, offset)
    }

    /// Reads the merged directory listing from `offset` (0 restarts; pass
    /// an entry's `offset` to resume after it).
    pub fn readdir(&self, file: &Arc<UnionFile>, offset: i64) -> Result<Vec<DirEntry>> {
        file_ops::readdir(&self.sb, file, offset)
    }

    /// Seeks within the file.
    pub fn llseek(&self, file: &Arc<UnionFile>, pos: std::io::SeekFrom) -> Result<i64> {
        file_ops::llseek(&self.sb, file, pos)
    }

    /// Synchronizes the lower file(s) to storage.
    pub fn fsync(&self, file: &Arc<UnionFile>, datasync: bool) -> Result<()> {
        file_ops::fsync(&self.sb, file, datasync)
    }

    /// Per-close flush accounting.
    pub fn flush(&self, file: &Arc<UnionFile>) -> Result<()> {
        file_ops::flush(&self.sb, file)
    }

    /// Releases the open file and its branch references.
    pub fn release(&self, file: &Arc<UnionFile>) -> Result<()> {
        file_ops::release(&self.sb, file)
    }

    /// Control requests: the two reserved codes, or pass-through.
    pub fn ioctl(&self, file: &Arc<UnionFile>, request: IoctlRequest<'_>) -> Result<i64> {
        file_ops::ioctl(&self.sb, file, request)
    }

    /// Capability check before the host memory-maps the file.
    pub fn mmap(&self, file: &Arc<UnionFile>, shared_write: bool) -> Result<()> {
        file_ops::mmap(&self.sb, file, shared_write)
    }

    /// Poll readiness of the file.
    pub fn poll(&self, file: &Arc<UnionFile>) -> Result<u32> {
        file_ops::poll(&self.sb, file)
    }

    /// Async-notification registration.
    pub fn fasync(&self, file: &Arc<UnionFile>, on: bool) -> Result<()> {
        file_ops::fasync(&self.sb, file, on)
    }

    // ---- address-space ops ----

    /// Fills an upper page from the lower file.
    pub fn readpage(&self, file: &Arc<UnionFile>, page: &mut Page) -> Result<()> {
        page_bridge::readpage(&self.sb, file, page)
    }

    /// Writes a dirty upper page through the lower page at the same
    /// index.
    pub fn writepage(
        &self,
        inode: &Arc<UnionInode>,
        page: &mut Page,
        wbc: &WritebackControl,
    ) -> Result<WritepageOutcome> {
        page_bridge::writepage(inode, page, wbc)
    }

    /// Prepares a ranged page write (revalidation only).
    pub fn prepare_write(
        &self,
        file: &Arc<UnionFile>,
        page: &Page,
        from: usize,
        to: usize,
    ) -> Result<()> {
        page_bridge::prepare_write(&self.sb, file, page, from, to)
    }

    /// Commits `[from..to)` of the page through the lower file.
    pub fn commit_write(
        &self,
        file: &Arc<UnionFile>,
        page: &Page,
        from: usize,
        to: usize,
    ) -> Result<usize> {
        page_bridge::commit_write(&self.sb, file, page, from, to)
    }

    /// Pushes a cached, locked lower page out.
    pub fn sync_page(&self, inode: &Arc<UnionInode>, page: &Page) -> Result<()> {
        page_bridge::sync_page(inode, page)
    }
}
