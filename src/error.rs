use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoopbackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backing path too long: {len} bytes (max {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("Path escapes backing root: {0}")]
    EscapesRoot(PathBuf),

    #[error("Path contains a NUL byte: {0}")]
    NulInPath(PathBuf),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),
}

impl LoopbackError {
    /// The host error code this failure is reported as.
    pub fn errno(&self) -> i32 {
        match self {
            LoopbackError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            LoopbackError::PathTooLong { .. } => libc::ENAMETOOLONG,
            LoopbackError::EscapesRoot(_) => libc::EACCES,
            LoopbackError::NulInPath(_) => libc::EINVAL,
            LoopbackError::InvalidHandle(_) => libc::EBADF,
        }
    }

    /// Negated errno, the value a C-style operation table would return.
    pub fn status(&self) -> i32 {
        -self.errno()
    }

    /// Capture `errno` from the last failed libc call.
    pub fn last_os_error() -> Self {
        LoopbackError::Io(std::io::Error::last_os_error())
    }
}

impl From<LoopbackError> for fuser::Errno {
    fn from(e: LoopbackError) -> Self {
        match e {
            LoopbackError::Io(io) => fuser::Errno::from(io),
            other => fuser::Errno::from(std::io::Error::from_raw_os_error(other.errno())),
        }
    }
}

pub type Result<T> = std::result::Result<T, LoopbackError>;
