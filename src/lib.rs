//! A loopback FUSE filesystem: every operation on the mount is redirected to
//! the same path under a backing directory.

pub mod config;
pub mod error;
pub mod fs;
pub mod resolve;

pub use error::{LoopbackError, Result};
pub use fs::handles::FileHandle;
pub use fs::loopback::Loopback;
pub use fs::ops::{DirEntry, Operations, StatFs};
pub use fs::LoopbackFs;
pub use resolve::{BackingRoot, TraversalPolicy};
