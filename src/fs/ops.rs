//! The operation table a mount runtime drives.
//!
//! Every method takes virtual paths (absolute, `/`-prefixed) or a handle
//! produced by `open`/`create`. Failures carry the host errno; see
//! [`LoopbackError::errno`](crate::error::LoopbackError::errno).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use fuser::{FileAttr, FileType, TimeOrNow};

use super::handles::FileHandle;
use crate::error::Result;

/// Filesystem-wide statistics, as reported by statvfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// One name from a backing directory.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: OsString,
}

/// Receives directory entries in host order. Returning `true` means "full":
/// no further entries are wanted.
pub type EntrySink<'a> = dyn FnMut(DirEntry) -> bool + 'a;

pub trait Operations: Send + Sync + 'static {
    fn getattr(&self, path: &Path) -> Result<FileAttr>;

    /// Check `mask` (`R_OK`/`W_OK`/`X_OK`/`F_OK`) without opening.
    fn access(&self, path: &Path, mask: i32) -> Result<()>;

    fn readlink(&self, path: &Path) -> Result<PathBuf>;

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()>;

    fn rmdir(&self, path: &Path) -> Result<()>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Hard link `to` to the existing `from`.
    fn link(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create a symlink at `link` pointing at `target`.
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    fn statfs(&self, path: &Path) -> Result<StatFs>;

    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    /// `None` leaves that id unchanged.
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()>;

    fn truncate(&self, path: &Path, size: u64) -> Result<()>;

    /// `None` leaves that timestamp unchanged.
    fn utime(&self, path: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> Result<()>;

    /// Feed every entry of the directory to `sink`. The backing directory is
    /// reopened on each call; there is no cursor.
    fn readdir(&self, path: &Path, sink: &mut EntrySink<'_>) -> Result<()>;

    fn create(&self, path: &Path, mode: u32) -> Result<FileHandle>;

    fn open(&self, path: &Path) -> Result<FileHandle>;

    /// Read up to `buf.len()` bytes at `offset`. Short reads are returned
    /// as is; zero means end of file.
    fn read(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `data` at `offset`, returning the count the host accepted.
    fn write(&self, handle: &FileHandle, data: &[u8], offset: u64) -> Result<usize>;

    fn flush(&self, handle: &FileHandle) -> Result<()>;

    fn fsync(&self, handle: &FileHandle, datasync: bool) -> Result<()>;

    fn ftruncate(&self, handle: &FileHandle, size: u64) -> Result<()>;

    fn fgetattr(&self, handle: &FileHandle) -> Result<FileAttr>;

    fn release(&self, handle: FileHandle) -> Result<()>;
}
