//! Host filesystem implementation of [`Operations`]: resolve the virtual path,
//! call the matching libc primitive, hand back its result.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use fuser::{FileAttr, FileType, TimeOrNow};
use tracing::debug;

use super::handles::FileHandle;
use super::ops::{DirEntry, EntrySink, Operations, StatFs};
use super::passthrough::*;
use crate::error::{LoopbackError, Result};
use crate::resolve::BackingRoot;

pub struct Loopback {
    root: BackingRoot,
}

impl Loopback {
    pub fn new(root: BackingRoot) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &BackingRoot {
        &self.root
    }

    fn resolve_c(&self, path: &Path) -> Result<std::ffi::CString> {
        path_to_cstring(&self.root.resolve(path)?)
    }

    /// Absolute targets name a virtual path and are moved under the backing
    /// root; relative targets are already relative to the link's directory.
    fn symlink_target(&self, target: &Path) -> Result<PathBuf> {
        if target.is_absolute() {
            self.root.resolve(target)
        } else {
            Ok(target.to_path_buf())
        }
    }
}

fn to_timespec(t: Option<TimeOrNow>) -> libc::timespec {
    match t {
        Some(TimeOrNow::SpecificTime(st)) => {
            let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            }
        }
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

#[cfg(not(target_os = "macos"))]
fn datasync(fd: libc::c_int) -> libc::c_int {
    unsafe { libc::fdatasync(fd) }
}

// No fdatasync on macOS; a full fsync covers it.
#[cfg(target_os = "macos")]
fn datasync(fd: libc::c_int) -> libc::c_int {
    unsafe { libc::fsync(fd) }
}

/// Kind of a directory entry. Hosts that leave `d_type` unset get an lstat.
/// If that fails as well (the entry went away mid-walk) the entry keeps the
/// `d_type` mapping's regular-file default; the kernel looks it up again
/// before using it.
fn entry_kind(dir: &Path, raw: &RawDirEntry) -> FileType {
    if raw.d_type != libc::DT_UNKNOWN {
        return dtype_to_filetype(raw.d_type);
    }
    match lstat(&dir.join(&raw.name)) {
        Ok(st) => mode_to_filetype(st.st_mode as u32),
        Err(e) => {
            debug!("readdir: lstat of {:?} failed: {}", raw.name, e);
            dtype_to_filetype(raw.d_type)
        }
    }
}

fn open_handle(c_path: &std::ffi::CStr, flags: libc::c_int, mode: u32) -> Result<FileHandle> {
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(LoopbackError::last_os_error());
    }
    Ok(unsafe { FileHandle::from_raw(fd) })
}

impl Operations for Loopback {
    fn getattr(&self, path: &Path) -> Result<FileAttr> {
        let full = self.root.resolve(path)?;
        Ok(stat_to_file_attr(&lstat(&full)?))
    }

    fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::access(c_path.as_ptr(), mask) })
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let full = self.root.resolve(path)?;
        Ok(std::fs::read_link(&full)?)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::mkdir(c_path.as_ptr(), mode as libc::mode_t) })
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::rmdir(c_path.as_ptr()) })
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::unlink(c_path.as_ptr()) })
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let old_c = self.resolve_c(from)?;
        let new_c = self.resolve_c(to)?;
        cvt(unsafe { libc::rename(old_c.as_ptr(), new_c.as_ptr()) })
    }

    fn link(&self, from: &Path, to: &Path) -> Result<()> {
        let old_c = self.resolve_c(from)?;
        let new_c = self.resolve_c(to)?;
        cvt(unsafe { libc::link(old_c.as_ptr(), new_c.as_ptr()) })
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let c_target = path_to_cstring(&self.symlink_target(target)?)?;
        let c_link = self.resolve_c(link)?;
        cvt(unsafe { libc::symlink(c_target.as_ptr(), c_link.as_ptr()) })
    }

    fn statfs(&self, path: &Path) -> Result<StatFs> {
        let c_path = self.resolve_c(path)?;
        unsafe {
            let mut st: libc::statvfs = std::mem::zeroed();
            cvt(libc::statvfs(c_path.as_ptr(), &mut st))?;
            Ok(StatFs {
                blocks: st.f_blocks as u64,
                bfree: st.f_bfree as u64,
                bavail: st.f_bavail as u64,
                files: st.f_files as u64,
                ffree: st.f_ffree as u64,
                bsize: st.f_bsize as u32,
                namelen: st.f_namemax as u32,
                frsize: st.f_frsize as u32,
            })
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) })
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        let new_uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
        let new_gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);
        cvt(unsafe { libc::chown(c_path.as_ptr(), new_uid, new_gid) })
    }

    fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        cvt(unsafe { libc::truncate(c_path.as_ptr(), size as libc::off_t) })
    }

    fn utime(&self, path: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> Result<()> {
        let c_path = self.resolve_c(path)?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        cvt(unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) })
    }

    fn readdir(&self, path: &Path, sink: &mut EntrySink<'_>) -> Result<()> {
        let full = self.root.resolve(path)?;
        let mut stream = DirStream::open(&full)?;
        while let Some(raw) = stream.next_entry()? {
            let kind = entry_kind(&full, &raw);
            let full_up = sink(DirEntry {
                ino: raw.ino,
                kind,
                name: raw.name,
            });
            if full_up {
                break;
            }
        }
        Ok(())
    }

    fn create(&self, path: &Path, mode: u32) -> Result<FileHandle> {
        let c_path = self.resolve_c(path)?;
        let handle = open_handle(&c_path, libc::O_CREAT | libc::O_TRUNC | libc::O_RDWR, mode)?;
        debug!("create: {} fd={}", path.display(), handle.as_raw_fd());
        Ok(handle)
    }

    fn open(&self, path: &Path) -> Result<FileHandle> {
        let c_path = self.resolve_c(path)?;
        let handle = open_handle(&c_path, libc::O_RDWR | libc::O_APPEND, 0)?;
        debug!("open: {} fd={}", path.display(), handle.as_raw_fd());
        Ok(handle)
    }

    fn read(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = unsafe {
            libc::pread(
                handle.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        cvt_len(n)
    }

    fn write(&self, handle: &FileHandle, data: &[u8], offset: u64) -> Result<usize> {
        let n = unsafe {
            libc::pwrite(
                handle.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                offset as libc::off_t,
            )
        };
        cvt_len(n)
    }

    fn flush(&self, handle: &FileHandle) -> Result<()> {
        cvt(unsafe { libc::fsync(handle.as_raw_fd()) })
    }

    fn fsync(&self, handle: &FileHandle, datasync_only: bool) -> Result<()> {
        let fd = handle.as_raw_fd();
        if datasync_only {
            cvt(datasync(fd))
        } else {
            cvt(unsafe { libc::fsync(fd) })
        }
    }

    fn ftruncate(&self, handle: &FileHandle, size: u64) -> Result<()> {
        cvt(unsafe { libc::ftruncate(handle.as_raw_fd(), size as libc::off_t) })
    }

    fn fgetattr(&self, handle: &FileHandle) -> Result<FileAttr> {
        Ok(stat_to_file_attr(&fstat(handle.as_raw_fd())?))
    }

    fn release(&self, handle: FileHandle) -> Result<()> {
        let fd = handle.into_raw();
        debug!("release: fd={}", fd);
        cvt(unsafe { libc::close(fd) })
    }
}
