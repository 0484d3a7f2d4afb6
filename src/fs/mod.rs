pub mod handles;
pub mod inodes;
pub mod loopback;
pub mod ops;
pub mod passthrough;

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    AccessFlags, BsdFileFlags, Errno, FileAttr, FileHandle, Filesystem, FopenFlags, Generation,
    INodeNo, KernelConfig, LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, RenameFlags,
    Request, TimeOrNow, WriteFlags,
};
use tracing::{debug, info};

use self::handles::HandleTable;
use self::inodes::{alias_host_ino, kernel_ino, InodeTable, ROOT_INO};
use self::loopback::Loopback;
use self::ops::{DirEntry, Operations, StatFs};
use crate::config::LoopbackConfig;
use crate::error::{LoopbackError, Result};
use crate::resolve::BackingRoot;

const TTL: Duration = Duration::from_secs(1);

fn not_found() -> LoopbackError {
    LoopbackError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
}

/// Bridges fuser's inode-addressed requests to a path-addressed
/// [`Operations`] table.
pub struct LoopbackFs<O: Operations = Loopback> {
    ops: O,
    /// Inode table mapping inodes <-> virtual paths.
    pub inodes: InodeTable,
    /// Open file handles, shared with the mount supervisor.
    pub file_handles: Arc<HandleTable>,
}

impl LoopbackFs<Loopback> {
    pub fn new(config: &LoopbackConfig) -> Self {
        let root = BackingRoot::new(config.backing.clone(), config.policy);
        Self::with_ops(Loopback::new(root))
    }
}

impl<O: Operations> LoopbackFs<O> {
    pub fn with_ops(ops: O) -> Self {
        Self {
            ops,
            inodes: InodeTable::new(),
            file_handles: Arc::new(HandleTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes.get_path(ino).ok_or_else(not_found)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.path_of(parent)?.join(name))
    }

    /// Give the entry its kernel inode number and remember the path under it.
    fn register(&self, path: &Path, attr: &mut FileAttr) {
        let ino = kernel_ino(u64::from(attr.ino), path);
        attr.ino = INodeNo(ino);
        if ino != ROOT_INO {
            self.inodes.insert(ino, path.to_path_buf());
        }
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        self.entry_attr(&path)
    }

    fn entry_attr(&self, path: &Path) -> Result<FileAttr> {
        let mut attr = self.ops.getattr(path)?;
        self.register(path, &mut attr);
        Ok(attr)
    }

    /// Attributes of `ino`. With a handle the open instance is asked
    /// directly, so this works after its name is renamed or unlinked.
    pub(crate) fn attr(&self, ino: u64, fh: Option<u64>) -> Result<FileAttr> {
        let mut attr = match fh {
            Some(fh) => self.handle_attr(fh)?,
            None => self.ops.getattr(&self.path_of(ino)?)?,
        };
        attr.ino = INodeNo(ino);
        Ok(attr)
    }

    fn handle_attr(&self, fh: u64) -> Result<FileAttr> {
        let open = self.file_handles.get(fh)?;
        self.ops.fgetattr(&open.handle)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_attr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        if let (Some(size), Some(fh)) = (size, fh) {
            let open = self.file_handles.get(fh)?;
            self.ops.ftruncate(&open.handle, size)?;
        }

        let by_path = mode.is_some()
            || uid.is_some()
            || gid.is_some()
            || atime.is_some()
            || mtime.is_some()
            || (size.is_some() && fh.is_none());
        if by_path {
            let path = self.path_of(ino)?;
            if let (Some(size), None) = (size, fh) {
                self.ops.truncate(&path, size)?;
            }
            if let Some(mode) = mode {
                self.ops.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.ops.chown(&path, uid, gid)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.ops.utime(&path, atime, mtime)?;
            }
        }

        self.attr(ino, fh)
    }

    pub(crate) fn open_file(&self, ino: u64) -> Result<u64> {
        let path = self.path_of(ino)?;
        let handle = self.ops.open(&path)?;
        Ok(self.file_handles.alloc(handle, path))
    }

    pub(crate) fn create_file(&self, parent: u64, name: &OsStr, mode: u32) -> Result<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let handle = self.ops.create(&path, mode)?;
        let mut attr = match self.ops.fgetattr(&handle) {
            Ok(attr) => attr,
            Err(e) => {
                let _ = self.ops.release(handle);
                return Err(e);
            }
        };
        self.register(&path, &mut attr);
        let fh = self.file_handles.alloc(handle, path);
        Ok((attr, fh))
    }

    pub(crate) fn read_file(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let open = self.file_handles.get(fh)?;
        let mut buf = vec![0u8; size as usize];
        let n = self.ops.read(&open.handle, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn write_file(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let open = self.file_handles.get(fh)?;
        self.ops.write(&open.handle, data, offset)
    }

    pub(crate) fn release_file(&self, fh: u64) -> Result<()> {
        let open = self.file_handles.remove(fh)?;
        self.ops.release(open.handle)
    }

    /// Every entry of the directory, in host order. The kernel pages through
    /// with offsets, so each call re-reads the directory from the start.
    pub(crate) fn dir_entries(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let path = self.path_of(ino)?;
        let mut entries = Vec::new();
        self.ops.readdir(&path, &mut |entry: DirEntry| {
            entries.push(entry);
            false
        })?;
        Ok(entries)
    }

    /// Unlink a file (or remove a directory) and drop that name. Other hard
    /// links to the same inode stay mapped.
    pub(crate) fn remove_entry(&self, parent: u64, name: &OsStr, is_dir: bool) -> Result<()> {
        let path = self.child_path(parent, name)?;
        if is_dir {
            self.ops.rmdir(&path)?;
        } else {
            self.ops.unlink(&path)?;
        }
        self.inodes.remove_by_path(&path);
        Ok(())
    }

    pub(crate) fn link_entry(&self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr> {
        let from = self.path_of(ino)?;
        let to = self.child_path(newparent, newname)?;
        self.ops.link(&from, &to)?;
        self.entry_attr(&to)
    }

    pub(crate) fn rename_path(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(newparent, newname)?;
        self.ops.rename(&from, &to)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    fn stat_fs(&self, ino: u64) -> Result<StatFs> {
        let path = self.path_of(ino).unwrap_or_else(|_| PathBuf::from("/"));
        self.ops.statfs(&path)
    }
}

impl<O: Operations> Filesystem for LoopbackFs<O> {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        info!("loopfs filesystem initialized");
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let parent = u64::from(parent);
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        let ino = u64::from(ino);
        debug!("getattr(ino={}, fh={:?})", ino, fh);

        match self.attr(ino, fh.map(u64::from)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let ino = u64::from(ino);
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        match self.set_attr(ino, mode, uid, gid, size, atime, mtime, fh.map(u64::from)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let ino = u64::from(ino);
        debug!("readlink(ino={})", ino);

        match self.path_of(ino).and_then(|p| self.ops.readlink(&p)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn mknod(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("mknod(parent={}, name={:?}, mode={:#o}, rdev={})", parent, name, mode, rdev);

        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.mknod(&path, mode, u64::from(rdev))?;
            self.entry_attr(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);

        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.mkdir(&path, mode)?;
            self.entry_attr(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("unlink(parent={}, name={:?})", parent, name);

        match self.remove_entry(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("rmdir(parent={}, name={:?})", parent, name);

        match self.remove_entry(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn symlink(
        &self,
        _req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let result = self.child_path(parent, link_name).and_then(|link| {
            self.ops.symlink(target, &link)?;
            self.entry_attr(&link)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let parent = u64::from(parent);
        let newparent = u64::from(newparent);
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        match self.rename_path(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn link(
        &self,
        _req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let ino = u64::from(ino);
        let newparent = u64::from(newparent);
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        match self.link_entry(ino, newparent, newname) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let ino = u64::from(ino);
        debug!("open(ino={}, flags={})", ino, flags.0);

        match self.open_file(ino) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.read_file(fh, offset, size) {
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("write(ino={}, fh={}, offset={}, size={})", ino, fh, offset, data.len());

        match self.write_file(fh, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn flush(&self, _req: &Request, ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("flush(ino={}, fh={})", ino, fh);

        let result = self
            .file_handles
            .get(fh)
            .and_then(|open| self.ops.flush(&open.handle));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fh = u64::from(fh);
        debug!("release(fh={})", fh);

        match self.release_file(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn fsync(&self, _req: &Request, ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        let result = self
            .file_handles
            .get(fh)
            .and_then(|open| self.ops.fsync(&open.handle, datasync));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let ino = u64::from(ino);
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(Errno::from(e));
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let entry_ino = alias_host_ino(entry.ino);
            if reply.add(INodeNo(entry_ino), (i + 1) as u64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let ino = u64::from(ino);
        debug!("statfs(ino={})", ino);

        match self.stat_fs(ino) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        debug!("access(ino={}, mask={:?})", ino, mask);

        match self.path_of(ino).and_then(|p| self.ops.access(&p, mask.bits())) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent = u64::from(parent);
        debug!("create(parent={}, name={:?}, mode={:#o}, flags={})", parent, name, mode, flags);

        match self.create_file(parent, name, mode) {
            Ok((attr, fh)) => {
                reply.created(&TTL, &attr, Generation(0), FileHandle(fh), FopenFlags::empty())
            }
            Err(e) => reply.error(Errno::from(e)),
        }
    }
}
