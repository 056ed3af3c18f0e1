//! Operation-level coverage: lookup shadowing, readdir merging and
//! cursors, link/rename/setattr with copy-up, permission intersection,
//! the reserved ioctls, the page bridge, and branch management.

mod common;

use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;

use common::*;
use tempfile::TempDir;
use unionfs::{
    AccessMask, BranchPerms, Errno, FileKind, IoctlRequest, OpenFlags, Page, QueryFileSet,
    SetAttr, UnionFs, WritebackControl, WritepageOutcome,
};

#[test]
fn lookup_resolves_highest_priority_branch() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "x", b"upper");
    write_lower(b.path(), "x", b"lower-shadowed");
    write_lower(b.path(), "only-lower", b"b");
    let fs = mount_rw_ro(&a, &b);

    let x = walk(&fs, "/x").unwrap();
    assert_eq!(fs.getattr(&x).unwrap().size, 5);

    let lower_only = walk(&fs, "/only-lower").unwrap();
    assert_eq!(fs.getattr(&lower_only).unwrap().size, 1);
    assert_eq!(fs.getattr(&lower_only).unwrap().kind, FileKind::RegularFile);

    assert!(!exists(&fs, "/missing"));
    fs.unmount().unwrap();
}

#[test]
fn directories_union_across_branches() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    std::fs::create_dir(a.path().join("d")).unwrap();
    std::fs::create_dir(b.path().join("d")).unwrap();
    write_lower(&a.path().join("d"), "from-a", b"1");
    write_lower(&b.path().join("d"), "from-b", b"2");
    let fs = mount_rw_ro(&a, &b);

    assert!(exists(&fs, "/d/from-a"));
    assert!(exists(&fs, "/d/from-b"));

    let d = walk(&fs, "/d").unwrap();
    let attr = fs.getattr(&d).unwrap();
    assert_eq!(attr.kind, FileKind::Directory);
    // Rule D: (2-2) + (2-2) + 2 for two empty-of-subdirs lower dirs.
    assert_eq!(attr.nlink, 2);
    fs.unmount().unwrap();
}

#[test]
fn readdir_merges_masks_and_dedupes() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "a", b"");
    write_lower(a.path(), "c", b"upper");
    write_lower(a.path(), ".wh.d", b"");
    write_lower(b.path(), "b", b"");
    write_lower(b.path(), "c", b"lower");
    write_lower(b.path(), "d", b"masked");
    let fs = mount_rw_ro(&a, &b);

    let root = fs.root();
    let handle = fs.open(&root, OpenFlags::RDONLY).unwrap();
    let entries = fs.readdir(&handle, 0).unwrap();
    let names: Vec<_> = entries
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, [".", "..", "a", "c", "b"], "got {names:?}");

    // Offsets are strictly increasing and resumable.
    for pair in entries.windows(2) {
        assert!(pair[1].offset > pair[0].offset);
    }
    let rest = fs.readdir(&handle, entries.last().unwrap().offset).unwrap();
    assert!(rest.is_empty());

    // The cursor survives a close/open cycle for the same directory.
    let resume_at = entries.last().unwrap().offset;
    fs.release(&handle).unwrap();
    let reopened = fs.open(&root, OpenFlags::RDONLY).unwrap();
    let resumed = fs.readdir(&reopened, resume_at).unwrap();
    assert!(resumed.is_empty(), "resumed listing was at its end");
    fs.release(&reopened).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn dir_llseek_rewinds_and_rejects_garbage() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "one", b"");
    let fs = mount_rw_ro(&a, &b);

    let root = fs.root();
    let handle = fs.open(&root, OpenFlags::RDONLY).unwrap();
    let first = fs.readdir(&handle, 0).unwrap();
    assert_eq!(first.len(), 3);

    assert_eq!(fs.llseek(&handle, SeekFrom::Start(0)).unwrap(), 0);
    let again = fs.readdir(&handle, 0).unwrap();
    assert_eq!(again.len(), 3);

    assert_eq!(
        fs.llseek(&handle, SeekFrom::Start(0x7f00_0001)).unwrap_err(),
        Errno::EINVAL
    );
    fs.release(&handle).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn link_shares_the_inode_on_one_branch() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "src", b"data");
    let fs = mount_rw_ro(&a, &b);

    let src = walk(&fs, "/src").unwrap();
    let dst = walk(&fs, "/dst").unwrap();
    fs.link(&src, &dst).unwrap();

    let src_attr = fs.getattr(&src).unwrap();
    let dst_attr = fs.getattr(&dst).unwrap();
    assert_eq!(src_attr.ino, dst_attr.ino);
    assert_eq!(dst_attr.nlink, 2);
    assert_eq!(read_lower(a.path(), "dst"), b"data");
    fs.unmount().unwrap();
}

#[test]
fn link_copies_up_cross_branch_sources() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "src", b"ro data");
    let fs = mount_rw_ro(&a, &b);

    let src = walk(&fs, "/src").unwrap();
    let dst = walk(&fs, "/dst").unwrap();
    fs.link(&src, &dst).unwrap();

    // Source was promoted to A so both names share one lower inode there.
    assert_eq!(read_lower(a.path(), "src"), b"ro data");
    assert_eq!(read_lower(a.path(), "dst"), b"ro data");
    let src_meta = std::fs::metadata(a.path().join("src")).unwrap();
    assert_eq!(std::os::unix::fs::MetadataExt::nlink(&src_meta), 2);
    fs.unmount().unwrap();
}

#[test]
fn rename_unifies_on_a_writable_branch_and_masks_the_old_name() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "old", b"contents");
    let fs = mount_rw_ro(&a, &b);

    let old = walk(&fs, "/old").unwrap();
    let new = walk(&fs, "/new").unwrap();
    fs.rename(&old, &new).unwrap();

    assert_eq!(read_lower(a.path(), "new"), b"contents");
    assert!(a.path().join(".wh.old").exists(), "old name masked below");
    assert!(!exists(&fs, "/old"));
    assert_eq!(fs.getattr(&walk(&fs, "/new").unwrap()).unwrap().size, 8);
    fs.unmount().unwrap();
}

#[test]
fn setattr_honors_pending_truncate_during_copyup() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "y", b"hello world");
    let fs = mount_rw_ro(&a, &b);

    let y = walk(&fs, "/y").unwrap();
    fs.setattr(
        &y,
        &SetAttr {
            size: Some(5),
            ..SetAttr::default()
        },
    )
    .unwrap();

    assert_eq!(read_lower(a.path(), "y"), b"hello");
    assert_eq!(fs.getattr(&y).unwrap().size, 5);
    assert_eq!(read_lower(b.path(), "y"), b"hello world");
    fs.unmount().unwrap();
}

#[test]
fn setattr_chmod_lands_on_dbstart() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "f", b"x");
    let fs = mount_rw_ro(&a, &b);

    let f = walk(&fs, "/f").unwrap();
    fs.setattr(
        &f,
        &SetAttr {
            mode: Some(0o640),
            ..SetAttr::default()
        },
    )
    .unwrap();
    let meta = std::fs::metadata(a.path().join("f")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
    assert_eq!(fs.getattr(&f).unwrap().perm, 0o640);
    fs.unmount().unwrap();
}

#[test]
fn permission_intersects_and_enables_copyup() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "mine", b"x");
    write_lower(b.path(), "ro-only", b"y");
    std::fs::set_permissions(
        a.path().join("mine"),
        std::fs::Permissions::from_mode(0o400),
    )
    .unwrap();
    let fs = mount_rw_ro(&a, &b);

    let mine = walk(&fs, "/mine").unwrap();
    fs.permission(&mine, AccessMask::READ).unwrap();
    if !nix::unistd::geteuid().is_root() {
        assert_eq!(
            fs.permission(&mine, AccessMask::WRITE).unwrap_err(),
            Errno::EACCES
        );
    }

    // Write intent on a non-leftmost read-only branch reads as success so
    // the write can proceed by copy-up.
    let ro = walk(&fs, "/ro-only").unwrap();
    fs.permission(&ro, AccessMask::WRITE).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn write_permission_stops_at_the_read_only_bypass() {
    init_logging();
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let c = TempDir::new().unwrap();
    // The directory exists on the read-only middle branch and, write
    // protected, on a writable lower one.
    std::fs::create_dir(b.path().join("d")).unwrap();
    std::fs::create_dir(c.path().join("d")).unwrap();
    std::fs::set_permissions(
        c.path().join("d"),
        std::fs::Permissions::from_mode(0o555),
    )
    .unwrap();
    let options = format!(
        "dirs={}:{}=ro:{}",
        a.path().display(),
        b.path().display(),
        c.path().display()
    );
    let fs = UnionFs::mount_options(&options).unwrap();

    // The bypass on the read-only branch settles the write verdict; the
    // write-protected copy further down never gets a say.
    let d = walk(&fs, "/d").unwrap();
    fs.permission(&d, AccessMask::WRITE).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn flush_propagates_across_the_open_fanout() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "f", b"flush me");
    std::fs::create_dir(a.path().join("d")).unwrap();
    std::fs::create_dir(b.path().join("d")).unwrap();
    let fs = mount_rw_ro(&a, &b);

    let f = walk(&fs, "/f").unwrap();
    let file = fs.open(&f, OpenFlags::RDWR).unwrap();
    fs.write(&file, b"dirty", 0).unwrap();
    fs.flush(&file).unwrap();
    fs.release(&file).unwrap();
    assert_eq!(read_lower(a.path(), "f"), b"dirty me");

    // Directories flush every branch in range.
    let d = walk(&fs, "/d").unwrap();
    let handle = fs.open(&d, OpenFlags::RDONLY).unwrap();
    fs.flush(&handle).unwrap();
    fs.release(&handle).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn queryfile_reports_branches_and_incgen_is_gone() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "x", b"1");
    write_lower(b.path(), "x", b"2");
    write_lower(b.path(), "lower-only", b"3");
    let fs = mount_rw_ro(&a, &b);

    let x = walk(&fs, "/x").unwrap();
    let file = fs.open(&x, OpenFlags::RDONLY).unwrap();

    let mut set = QueryFileSet::default();
    fs.ioctl(&file, IoctlRequest::QueryFile(&mut set)).unwrap();
    assert!(set.contains(0));
    assert!(set.contains(1));
    assert!(!set.contains(2));
    assert_eq!(set.as_bytes().len(), 128, "1024-bit capacity");

    assert_eq!(
        fs.ioctl(&file, IoctlRequest::IncGen).unwrap_err(),
        Errno::ENOSYS
    );
    fs.release(&file).unwrap();

    let lo = walk(&fs, "/lower-only").unwrap();
    let file = fs.open(&lo, OpenFlags::RDONLY).unwrap();
    let mut set = QueryFileSet::default();
    fs.ioctl(&file, IoctlRequest::QueryFile(&mut set)).unwrap();
    assert!(!set.contains(0));
    assert!(set.contains(1));
    fs.release(&file).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn page_bridge_round_trip() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "f", b"page bridge test data");
    let fs = mount_rw_ro(&a, &b);

    let f = walk(&fs, "/f").unwrap();
    let file = fs.open(&f, OpenFlags::RDWR).unwrap();
    let inode = file.inode().unwrap();

    let mut page = Page::new(0);
    fs.readpage(&file, &mut page).unwrap();
    assert!(page.uptodate);
    assert_eq!(&page.data[..21], b"page bridge test data");

    // Commit a ranged write through the lower file.
    page.data[..5].copy_from_slice(b"EDGES");
    assert_eq!(fs.commit_write(&file, &page, 0, 5).unwrap(), 5);
    let mut expected = b"page bridge test data".to_vec();
    expected[..5].copy_from_slice(b"EDGES");
    assert_eq!(read_lower(a.path(), "f"), expected);

    // Writeback through the cached lower page.
    page.data[..5].copy_from_slice(b"WRITE");
    page.dirty = true;
    let outcome = fs
        .writepage(&inode, &mut page, &WritebackControl::default())
        .unwrap();
    assert_eq!(outcome, WritepageOutcome::Written);
    assert!(!page.dirty);
    assert_eq!(&read_lower(a.path(), "f")[..5], b"WRITE");

    // No lower page at this index: the host is asked to re-activate.
    let mut far = Page::new(7);
    far.dirty = true;
    let outcome = fs
        .writepage(&inode, &mut far, &WritebackControl::default())
        .unwrap();
    assert_eq!(outcome, WritepageOutcome::Activate);
    assert!(far.dirty);

    fs.release(&file).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn out_of_band_lower_change_resyncs() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "x", b"one");
    let fs = mount_rw_ro(&a, &b);

    let x = walk(&fs, "/x").unwrap();
    assert_eq!(fs.getattr(&x).unwrap().size, 3);

    // Change the lower file behind the union's back, pushing its mtime
    // clearly past the cached one (robust against coarse timestamps).
    write_lower(a.path(), "x", b"four!");
    let future = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
    let secs = future
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    nix::sys::stat::utimensat(
        nix::fcntl::AT_FDCWD,
        &a.path().join("x"),
        &nix::sys::time::TimeSpec::new(secs, 0),
        &nix::sys::time::TimeSpec::new(secs, 0),
        nix::sys::stat::UtimensatFlags::NoFollowSymlink,
    )
    .unwrap();

    // The next operation notices the newer lower times and resyncs.
    assert_eq!(fs.getattr(&x).unwrap().size, 5);
    fs.unmount().unwrap();
}

#[test]
fn branch_management_guards() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "y", b"on b");
    let fs = mount_rw_ro(&a, &b);

    let y = walk(&fs, "/y").unwrap();
    let file = fs.open(&y, OpenFlags::RDONLY).unwrap();

    // The open file pins branch B.
    assert_eq!(fs.remove_branch(1).unwrap_err(), Errno::EBUSY);
    assert_eq!(fs.unmount().unwrap_err(), Errno::EBUSY);

    fs.release(&file).unwrap();
    fs.remove_branch(1).unwrap();
    assert_eq!(fs.branch_count(), 1);
    assert!(!exists(&fs, "/y"), "the name went with its branch");

    // The last branch cannot go, and branch 0 must stay writable.
    assert_eq!(fs.remove_branch(0).unwrap_err(), Errno::EINVAL);
    assert_eq!(
        fs.set_branch_perms(0, BranchPerms::READ).unwrap_err(),
        Errno::EINVAL
    );
    fs.unmount().unwrap();
}

#[test]
fn branch_ids_are_stable_across_reindexing() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let fs = mount_rw_rw(&a, &b);

    let id_a = fs.branch_id(0).unwrap();
    let gen_before = fs.generation();

    let c = TempDir::new().unwrap();
    fs.add_branch(c.path(), BranchPerms::READ | BranchPerms::WRITE, 0)
        .unwrap();

    assert!(fs.generation() > gen_before, "mutation bumps the generation");
    assert_eq!(fs.branch_index(id_a), Some(1));
    assert_ne!(fs.branch_id(0), Some(id_a));
    fs.unmount().unwrap();
}

#[test]
fn symlink_round_trip() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let fs = mount_rw_ro(&a, &b);

    let l = walk(&fs, "/l").unwrap();
    fs.symlink(&l, std::path::Path::new("target/elsewhere")).unwrap();

    let l = walk(&fs, "/l").unwrap();
    assert_eq!(fs.getattr(&l).unwrap().kind, FileKind::Symlink);
    assert_eq!(
        fs.readlink(&l).unwrap(),
        std::path::PathBuf::from("target/elsewhere")
    );
    fs.unmount().unwrap();
}

#[test]
fn mknod_creates_fifos() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let fs = mount_rw_ro(&a, &b);

    let p = walk(&fs, "/pipe").unwrap();
    fs.mknod(&p, libc::S_IFIFO | 0o644, 0).unwrap();

    let p = walk(&fs, "/pipe").unwrap();
    assert_eq!(fs.getattr(&p).unwrap().kind, FileKind::NamedPipe);
    fs.unmount().unwrap();
}

#[test]
fn statfs_reports_the_leftmost_branch() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let fs = mount_rw_ro(&a, &b);
    let stats = fs.statfs().unwrap();
    assert!(stats.blocks > 0);
    assert!(stats.block_size > 0);
    fs.unmount().unwrap();
}

#[test]
fn append_writes_land_at_eof() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "log", b"start");
    let fs = mount_rw_ro(&a, &b);

    let log = walk(&fs, "/log").unwrap();
    let file = fs
        .open(&log, OpenFlags(libc::O_WRONLY | libc::O_APPEND))
        .unwrap();
    fs.write(&file, b"+more", 0).unwrap();
    fs.release(&file).unwrap();
    assert_eq!(read_lower(a.path(), "log"), b"start+more");
    fs.unmount().unwrap();
}

#[test]
fn open_with_truncate_on_read_only_branch_copies_up_empty() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "t", b"to be discarded");
    let fs = mount_rw_ro(&a, &b);

    let t = walk(&fs, "/t").unwrap();
    let file = fs
        .open(&t, OpenFlags(libc::O_RDWR | libc::O_TRUNC))
        .unwrap();

    // The copy-up happened at open, with size zero.
    assert_eq!(std::fs::metadata(a.path().join("t")).unwrap().len(), 0);
    fs.write(&file, b"fresh", 0).unwrap();
    fs.release(&file).unwrap();
    assert_eq!(read_lower(a.path(), "t"), b"fresh");
    assert_eq!(read_lower(b.path(), "t"), b"to be discarded");
    fs.unmount().unwrap();
}

#[test]
fn mount_rejects_bad_configurations() {
    init_logging();
    let a = TempDir::new().unwrap();

    // Overlapping branches.
    let sub = a.path().join("sub");
    std::fs::create_dir(&sub).unwrap();
    let options = format!("dirs={}:{}", a.path().display(), sub.display());
    assert!(UnionFs::mount_options(&options).is_err());

    // Missing branch directory.
    let missing = a.path().join("missing");
    let options = format!("dirs={}:{}", a.path().display(), missing.display());
    assert_eq!(
        UnionFs::mount_options(&options).unwrap_err(),
        Errno::ENOENT
    );
}
