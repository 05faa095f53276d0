use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SporkError>;

#[derive(Debug, Error)]
pub enum SporkError {
    #[error("no such file or directory")]
    NoSuchFile,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("stale file handle")]
    StaleHandle,
    #[error("consensus unavailable")]
    ConsensusUnavailable,
    #[error("peer transport: {0}")]
    Transport(String),
    #[error("corrupted state: {0}")]
    Corruption(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SporkError {
    /// Errno the VFS adapter reports for this error.
    pub fn to_errno(&self) -> i32 {
        match self {
            SporkError::NoSuchFile => libc::ENOENT,
            SporkError::FileAlreadyExists => libc::EEXIST,
            SporkError::DirectoryNotEmpty => libc::ENOTEMPTY,
            SporkError::StaleHandle => libc::ESTALE,
            // Transient: the caller may retry once a leader is reachable again.
            SporkError::ConsensusUnavailable => libc::EAGAIN,
            SporkError::Transport(_) | SporkError::Corruption(_) | SporkError::Io(_) => libc::EIO,
        }
    }
}
