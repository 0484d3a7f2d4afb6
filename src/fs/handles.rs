use dashmap::DashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LoopbackError, Result};

/// One open backing file. Produced by `open`/`create` and consumed by
/// `release`; it cannot be copied, so a released handle cannot be reused.
#[derive(Debug)]
pub struct FileHandle(OwnedFd);

impl FileHandle {
    /// Take ownership of a freshly opened descriptor.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        FileHandle(OwnedFd::from_raw_fd(fd))
    }

    /// Give up the descriptor without closing it.
    pub fn into_raw(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl AsRawFd for FileHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// A handle the kernel holds on to, plus the virtual path it was opened as.
#[derive(Debug)]
pub struct OpenFile {
    pub handle: FileHandle,
    pub path: PathBuf,
}

/// Summary of an open file, for reporting why a mount is busy.
#[derive(Debug, Clone)]
pub struct OpenFileInfo {
    pub fh: u64,
    pub path: PathBuf,
}

/// Maps the `u64` handed to the kernel to the handle it stands for.
pub struct HandleTable {
    handles: DashMap<u64, OpenFile>,
    next_fh: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, handle: FileHandle, path: PathBuf) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, OpenFile { handle, path });
        fh
    }

    /// Look up a live handle. Unknown or released ids are `EBADF`.
    pub fn get(&self, fh: u64) -> Result<dashmap::mapref::one::Ref<'_, u64, OpenFile>> {
        self.handles.get(&fh).ok_or(LoopbackError::InvalidHandle(fh))
    }

    pub fn remove(&self, fh: u64) -> Result<OpenFile> {
        self.handles
            .remove(&fh)
            .map(|(_, v)| v)
            .ok_or(LoopbackError::InvalidHandle(fh))
    }

    /// Snapshot of open files, sorted by handle id.
    pub fn list_open(&self) -> Vec<OpenFileInfo> {
        let mut open: Vec<OpenFileInfo> = self
            .handles
            .iter()
            .map(|e| OpenFileInfo {
                fh: *e.key(),
                path: e.value().path.clone(),
            })
            .collect();
        open.sort_by_key(|info| info.fh);
        open
    }
}
