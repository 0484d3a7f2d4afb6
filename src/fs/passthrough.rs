/// Host-side helpers for the loopback operations.
/// These wrap the libc primitives and convert between host and FUSE types.
use std::ffi::{CStr, CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::FileAttr;

use crate::error::{LoopbackError, Result};

/// Convert libc::stat to fuser::FileAttr.
pub fn stat_to_file_attr(st: &libc::stat) -> FileAttr {
    FileAttr {
        ino: fuser::INodeNo(st.st_ino),
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time_from_parts(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime: system_time_from_parts(st.st_mtime as i64, st.st_mtime_nsec as i64),
        ctime: system_time_from_parts(st.st_ctime as i64, st.st_ctime_nsec as i64),
        crtime: birth_time(st),
        kind: mode_to_filetype(st.st_mode as u32),
        perm: (st.st_mode as u32 & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: bsd_flags(st),
    }
}

#[cfg(target_os = "macos")]
fn birth_time(st: &libc::stat) -> SystemTime {
    system_time_from_parts(st.st_birthtime, st.st_birthtime_nsec)
}

#[cfg(not(target_os = "macos"))]
fn birth_time(_st: &libc::stat) -> SystemTime {
    UNIX_EPOCH
}

#[cfg(target_os = "macos")]
fn bsd_flags(st: &libc::stat) -> u32 {
    st.st_flags
}

#[cfg(not(target_os = "macos"))]
fn bsd_flags(_st: &libc::stat) -> u32 {
    0
}

fn system_time_from_parts(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH
    }
}

pub fn mode_to_filetype(mode: u32) -> fuser::FileType {
    let fmt = mode & (libc::S_IFMT as u32);
    match fmt {
        x if x == libc::S_IFREG as u32 => fuser::FileType::RegularFile,
        x if x == libc::S_IFDIR as u32 => fuser::FileType::Directory,
        x if x == libc::S_IFLNK as u32 => fuser::FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => fuser::FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => fuser::FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => fuser::FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => fuser::FileType::Socket,
        _ => fuser::FileType::RegularFile,
    }
}

/// Map a `d_type` from readdir to a file type. Unknown types fall back to
/// regular files; the kernel re-checks with lookup before trusting it.
pub fn dtype_to_filetype(d_type: u8) -> fuser::FileType {
    match d_type {
        libc::DT_DIR => fuser::FileType::Directory,
        libc::DT_LNK => fuser::FileType::Symlink,
        libc::DT_BLK => fuser::FileType::BlockDevice,
        libc::DT_CHR => fuser::FileType::CharDevice,
        libc::DT_FIFO => fuser::FileType::NamedPipe,
        libc::DT_SOCK => fuser::FileType::Socket,
        _ => fuser::FileType::RegularFile,
    }
}

/// Turn a libc return code into a Result, reading errno on failure.
pub fn cvt(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(LoopbackError::last_os_error())
    }
}

/// Same as `cvt` for calls that return a byte count.
pub fn cvt_len(n: libc::ssize_t) -> Result<usize> {
    if n < 0 {
        Err(LoopbackError::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Perform lstat() on a path.
pub fn lstat(path: &Path) -> Result<libc::stat> {
    let c_path = path_to_cstring(path)?;
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        cvt(libc::lstat(c_path.as_ptr(), &mut st))?;
        Ok(st)
    }
}

/// Perform fstat() on a file descriptor.
pub fn fstat(fd: RawFd) -> Result<libc::stat> {
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        cvt(libc::fstat(fd, &mut st))?;
        Ok(st)
    }
}

pub fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LoopbackError::NulInPath(path.to_path_buf()))
}

/// An open host directory stream. Closed on drop, so every exit path out of
/// a directory walk releases it.
pub struct DirStream {
    dp: *mut libc::DIR,
}

/// One raw entry from a host directory stream.
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub ino: u64,
    pub d_type: u8,
    pub name: OsString,
}

impl DirStream {
    pub fn open(path: &Path) -> Result<Self> {
        let c_path = path_to_cstring(path)?;
        let dp = unsafe { libc::opendir(c_path.as_ptr()) };
        if dp.is_null() {
            return Err(LoopbackError::last_os_error());
        }
        Ok(Self { dp })
    }

    /// Next entry, `Ok(None)` at end of stream.
    pub fn next_entry(&mut self) -> Result<Option<RawDirEntry>> {
        // readdir() signals both end-of-stream and failure with NULL; errno
        // tells them apart, so it has to be cleared first.
        unsafe {
            nix::errno::Errno::clear();
            let ent = libc::readdir(self.dp);
            if ent.is_null() {
                let err = std::io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(0) | None => Ok(None),
                    Some(_) => Err(LoopbackError::Io(err)),
                };
            }
            let ent = &*ent;
            let name = CStr::from_ptr(ent.d_name.as_ptr()).to_bytes().to_vec();
            Ok(Some(RawDirEntry {
                ino: ent.d_ino as u64,
                d_type: ent.d_type,
                name: OsString::from_vec(name),
            }))
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dp);
        }
    }
}
