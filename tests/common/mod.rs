//! Shared helpers for the integration tests: build branch directories,
//! mount unions over them, and walk paths component by component the way a
//! host VFS would.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use unionfs::{MountConfig, Result, UnionDentry, UnionFs};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mounts `dirs=<a>:<b>=ro`.
pub fn mount_rw_ro(a: &TempDir, b: &TempDir) -> UnionFs {
    init_logging();
    let options = format!("dirs={}:{}=ro", a.path().display(), b.path().display());
    UnionFs::mount(MountConfig::parse(&options).unwrap()).unwrap()
}

/// Mounts `dirs=<a>:<b>` (both writable).
pub fn mount_rw_rw(a: &TempDir, b: &TempDir) -> UnionFs {
    init_logging();
    let options = format!("dirs={}:{}", a.path().display(), b.path().display());
    UnionFs::mount(MountConfig::parse(&options).unwrap()).unwrap()
}

/// Walks an absolute union path, component by component.
pub fn walk(fs: &UnionFs, path: &str) -> Result<Arc<UnionDentry>> {
    let mut dentry = fs.root();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        dentry = fs.lookup(&dentry, OsStr::new(component))?;
    }
    Ok(dentry)
}

/// Whether the union resolves `path` to an existing object.
pub fn exists(fs: &UnionFs, path: &str) -> bool {
    walk(fs, path).map(|d| d.inode().is_some()).unwrap_or(false)
}

pub fn write_lower(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).unwrap();
}

pub fn read_lower(dir: &Path, name: &str) -> Vec<u8> {
    std::fs::read(dir.join(name)).unwrap()
}

/// Names present in a lower directory, sorted.
pub fn lower_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
