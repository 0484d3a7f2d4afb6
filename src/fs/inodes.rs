use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// Inode the kernel uses for the mount root.
pub const ROOT_INO: u64 = 1;

/// Stands in for a backing entry whose host inode number is `ROOT_INO`
/// (vfat and some FUSE-backed stores hand that out).
pub const HOST_ROOT_ALIAS: u64 = u64::MAX;

/// A host inode number with `ROOT_INO` moved out of the way.
pub fn alias_host_ino(host_ino: u64) -> u64 {
    if host_ino == ROOT_INO {
        HOST_ROOT_ALIAS
    } else {
        host_ino
    }
}

/// Inode number the kernel sees for a backing entry at `path`.
pub fn kernel_ino(host_ino: u64, path: &Path) -> u64 {
    if path == Path::new("/") {
        ROOT_INO
    } else {
        alias_host_ino(host_ino)
    }
}

/// Maps the inode numbers handed to the kernel to virtual paths and back.
/// A hard-linked inode is known under every name it was looked up by, so
/// removing one name leaves the others reachable.
pub struct InodeTable {
    /// Names per inode, oldest first.
    ino_to_paths: DashMap<u64, Vec<PathBuf>>,
    path_to_ino: DashMap<PathBuf, u64>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            ino_to_paths: DashMap::new(),
            path_to_ino: DashMap::new(),
        };
        table.insert(ROOT_INO, PathBuf::from("/"));
        table
    }

    /// Record `path` as a name of `ino`. A path previously bound to another
    /// inode is moved over.
    pub fn insert(&self, ino: u64, path: PathBuf) {
        if let Some(old_ino) = self.get_ino(&path) {
            if old_ino == ino {
                return;
            }
            self.forget_name(old_ino, &path);
        }
        self.path_to_ino.insert(path.clone(), ino);
        self.ino_to_paths.entry(ino).or_default().push(path);
    }

    /// The most recently registered name of `ino`.
    pub fn get_path(&self, ino: u64) -> Option<PathBuf> {
        self.ino_to_paths.get(&ino).and_then(|paths| paths.last().cloned())
    }

    pub fn get_ino(&self, path: &Path) -> Option<u64> {
        self.path_to_ino.get(path).map(|r| *r.value())
    }

    /// Drop one name. The inode stays mapped while it has other names.
    pub fn remove_by_path(&self, path: &Path) {
        if path == Path::new("/") {
            return;
        }
        if let Some((_, ino)) = self.path_to_ino.remove(path) {
            self.forget_name(ino, path);
        }
    }

    fn forget_name(&self, ino: u64, path: &Path) {
        if let Some(mut paths) = self.ino_to_paths.get_mut(&ino) {
            paths.retain(|p| p != path);
        }
        self.ino_to_paths.remove_if(&ino, |_, paths| paths.is_empty());
    }

    /// Move `old_path` and everything below it to `new_path`.
    pub fn rename(&self, old_path: &Path, new_path: &Path) {
        self.remove_by_path(new_path);

        let moved: Vec<(PathBuf, u64)> = self
            .path_to_ino
            .iter()
            .filter(|e| e.key().starts_with(old_path))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (path, ino) in moved {
            let suffix = path.strip_prefix(old_path).unwrap_or(Path::new(""));
            let renamed = if suffix.as_os_str().is_empty() {
                new_path.to_path_buf()
            } else {
                new_path.join(suffix)
            };
            self.path_to_ino.remove(&path);
            if let Some(mut paths) = self.ino_to_paths.get_mut(&ino) {
                for p in paths.iter_mut().filter(|p| **p == path) {
                    *p = renamed.clone();
                }
            }
            self.path_to_ino.insert(renamed, ino);
        }
    }
}
