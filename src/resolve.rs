//! Virtual path to backing path resolution.
//!
//! A virtual path is what a user of the mount sees (`/a/b.txt`). The backing
//! path is the same bytes appended to the backing root. Resolution is purely
//! textual: nothing here touches the filesystem.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{LoopbackError, Result};

/// Longest backing path a syscall accepts, excluding the terminating NUL.
pub const MAX_BACKING_PATH: usize = libc::PATH_MAX as usize - 1;

/// How `..` segments in virtual paths are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalPolicy {
    /// Pass `..` through untouched. The caller is trusted, and the backing
    /// store's own permissions are the only guard.
    #[default]
    Trusted,
    /// Reject any virtual path whose `..` segments climb above the root.
    Confined,
}

/// The directory every virtual path is resolved under.
#[derive(Debug, Clone)]
pub struct BackingRoot {
    root: PathBuf,
    policy: TraversalPolicy,
}

impl BackingRoot {
    pub fn new(root: impl Into<PathBuf>, policy: TraversalPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> TraversalPolicy {
        self.policy
    }

    /// Map a virtual path to its backing path: `root ++ virtual_path`.
    pub fn resolve(&self, virtual_path: &Path) -> Result<PathBuf> {
        debug_assert!(
            virtual_path.as_os_str().as_bytes().first() == Some(&b'/'),
            "virtual path must be absolute: {:?}",
            virtual_path
        );

        if self.policy == TraversalPolicy::Confined && escapes_root(virtual_path) {
            return Err(LoopbackError::EscapesRoot(virtual_path.to_path_buf()));
        }

        let root = self.root.as_os_str();
        let rest = virtual_path.as_os_str();
        let len = root.len() + rest.len();
        if len > MAX_BACKING_PATH {
            return Err(LoopbackError::PathTooLong {
                len,
                max: MAX_BACKING_PATH,
            });
        }

        let mut buf = OsString::with_capacity(len);
        buf.push(root);
        buf.push(rest);
        let backing = PathBuf::from(buf);
        debug!("resolve: {} -> {}", virtual_path.display(), backing.display());
        Ok(backing)
    }
}

/// Walk the path lexically and report whether `..` ever goes above the start.
fn escapes_root(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    false
}
