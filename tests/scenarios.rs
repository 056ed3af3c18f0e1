//! End-to-end scenarios over real lower directories.

mod common;

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;

use common::*;
use tempfile::TempDir;
use unionfs::{BranchPerms, Errno, OpenFlags};

/// Creating a file over a whiteout renames the whiteout in place instead
/// of deleting it, so the lower content stays masked with no gap.
#[test]
fn whiteout_rename_on_create() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "foo", b"lower content");
    write_lower(a.path(), ".wh.foo", b"");
    let fs = mount_rw_ro(&a, &b);

    let foo = walk(&fs, "/foo").unwrap();
    assert!(foo.inode().is_none(), "whiteout must mask B/foo");

    fs.create(&foo, 0o644).unwrap();

    assert!(!a.path().join(".wh.foo").exists());
    let meta = std::fs::metadata(a.path().join("foo")).unwrap();
    assert_eq!(meta.len(), 0);
    assert_eq!(meta.permissions().mode() & 0o7777, 0o644);

    let again = walk(&fs, "/foo").unwrap();
    let attr = fs.getattr(&again).unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(attr.perm, 0o644);

    fs.unmount().unwrap();
}

/// Unlinking an open file whose only copy is on a read-only branch silly
/// renames it: the handle keeps working, the name is gone, and no
/// whiteout is left behind.
#[test]
fn sillyrename_copyup_of_open_unlinked_file() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "bar", b"original");
    let fs = mount_rw_ro(&a, &b);

    let bar = walk(&fs, "/bar").unwrap();
    let file = fs.open(&bar, OpenFlags::RDWR).unwrap();

    fs.unlink(&bar).unwrap();

    let payload = vec![0xabu8; 4096];
    assert_eq!(fs.write(&file, &payload, 0).unwrap(), 4096);
    let mut back = vec![0u8; 4096];
    assert_eq!(fs.read(&file, &mut back, 0).unwrap(), 4096);
    assert_eq!(back, payload);

    fs.flush(&file).unwrap();
    fs.release(&file).unwrap();

    let names = lower_names(a.path());
    assert!(!names.iter().any(|n| n == "bar"));
    assert!(!names.iter().any(|n| n == ".wh.bar"));
    let silly: Vec<_> = names.iter().filter(|n| n.starts_with(".unionfs")).collect();
    assert_eq!(silly.len(), 1, "exactly one sillyrename file in A: {names:?}");
    let silly_meta = std::fs::metadata(a.path().join(silly[0])).unwrap();
    assert_eq!(silly_meta.len(), 4096);

    assert!(!exists(&fs, "/bar"));
    fs.unmount().unwrap();
}

/// A fresh mkdir masks an identically named lower directory's contents.
#[test]
fn opaque_mkdir_masks_lower_contents() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    std::fs::create_dir(b.path().join("dir")).unwrap();
    write_lower(&b.path().join("dir"), "file", b"hidden");
    let fs = mount_rw_ro(&a, &b);

    let dir = walk(&fs, "/dir").unwrap();
    fs.mkdir(&dir, 0o755).unwrap();

    assert!(a.path().join("dir").join(".wh.__dir_opaque").exists());

    let handle = fs.open(&dir, OpenFlags::RDONLY).unwrap();
    let entries = fs.readdir(&handle, 0).unwrap();
    let names: Vec<_> = entries
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, [".", ".."], "only dot entries: {names:?}");
    fs.release(&handle).unwrap();

    // A re-walk agrees: the lower file is invisible.
    assert!(!exists(&fs, "/dir/file"));
    fs.unmount().unwrap();
}

/// rmdir refuses a directory with real lower entries; once they are
/// whiteout-masked it succeeds and cleans its own whiteouts up.
#[test]
fn rmdir_with_lower_only_entries() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    std::fs::create_dir(b.path().join("d")).unwrap();
    write_lower(&b.path().join("d"), "a", b"1");
    write_lower(&b.path().join("d"), "b", b"2");
    let fs = mount_rw_ro(&a, &b);

    let d = walk(&fs, "/d").unwrap();
    assert_eq!(fs.rmdir(&d).unwrap_err(), Errno::ENOTEMPTY);

    fs.unlink(&walk(&fs, "/d/a").unwrap()).unwrap();
    fs.unlink(&walk(&fs, "/d/b").unwrap()).unwrap();
    assert!(a.path().join("d").join(".wh.a").exists());
    assert!(a.path().join("d").join(".wh.b").exists());

    let d = walk(&fs, "/d").unwrap();
    fs.rmdir(&d).unwrap();

    assert!(!a.path().join("d").exists(), "A/d and its whiteouts are gone");
    assert!(!exists(&fs, "/d"), "the union name is masked");
    fs.unmount().unwrap();
}

/// A branch added at the highest priority is seen by fresh opens while
/// already-open handles keep reading the branch they were opened on.
#[test]
fn branch_add_while_file_open() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(a.path(), "x", b"from-a");
    let fs = mount_rw_rw(&a, &b);

    let x = walk(&fs, "/x").unwrap();
    let open_before = fs.open(&x, OpenFlags::RDONLY).unwrap();

    let c = TempDir::new().unwrap();
    write_lower(c.path(), "x", b"from-c");
    fs.add_branch(c.path(), BranchPerms::READ | BranchPerms::WRITE, 0)
        .unwrap();
    assert_eq!(fs.branch_count(), 3);

    let mut buf = vec![0u8; 16];
    let n = fs.read(&open_before, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"from-a", "open handle sticks to its branch");

    let fresh = walk(&fs, "/x").unwrap();
    let open_after = fs.open(&fresh, OpenFlags::RDONLY).unwrap();
    let n = fs.read(&open_after, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"from-c", "fresh opens resolve the new branch");

    fs.release(&open_before).unwrap();
    fs.release(&open_after).unwrap();
    fs.unmount().unwrap();
}

/// Opening read-write on a read-only branch defers the copy-up to the
/// first write, which promotes the file and applies the write on the
/// writable branch.
#[test]
fn delayed_copyup_on_first_write() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_lower(b.path(), "y", b"hello world");
    let fs = mount_rw_ro(&a, &b);

    let y = walk(&fs, "/y").unwrap();
    let file = fs.open(&y, OpenFlags::RDWR).unwrap();
    assert!(!a.path().join("y").exists(), "no copy-up before the write");

    assert_eq!(fs.write(&file, b"X", 0).unwrap(), 1);

    let copied = read_lower(a.path(), "y");
    assert_eq!(copied, b"Xello world");
    assert_eq!(read_lower(b.path(), "y"), b"hello world", "lower copy shadowed, not changed");

    let mut buf = vec![0u8; 16];
    let n = fs.read(&file, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"Xello world");

    fs.flush(&file).unwrap();
    fs.release(&file).unwrap();
    fs.unmount().unwrap();
}

/// The reserved marker names cannot be created through the union.
#[test]
fn reserved_names_are_rejected() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let fs = mount_rw_ro(&a, &b);

    let root = fs.root();
    assert_eq!(
        fs.lookup(&root, OsStr::new(".wh.anything")).unwrap_err(),
        Errno::EPERM
    );
    assert_eq!(
        fs.lookup(&root, OsStr::new("__dir_opaque")).unwrap_err(),
        Errno::EPERM
    );
    fs.unmount().unwrap();
}
