use common::prelude::ClientError;

/// Failure of a single filesystem request
///
/// Every variant is fatal to the request only. The adapter turns it into an
/// errno for the kernel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InodeError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    Exists,

    #[error("read-only mount")]
    ReadOnly,

    #[error("permission denied")]
    AccessDenied,

    #[error("invalid name")]
    InvalidName,

    #[error("file too large")]
    FileTooLarge,

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("mount is no longer active")]
    Unmounted,

    #[error("inode store error: {0}")]
    Store(String),

    #[error("cloud request failed: {0}")]
    Client(ClientError),
}

impl From<ClientError> for InodeError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotFound => InodeError::NotFound,
            ClientError::Exists(_) => InodeError::Exists,
            ClientError::NotDirectory => InodeError::NotDirectory,
            ClientError::IsDirectory => InodeError::IsDirectory,
            ClientError::NotEmpty => InodeError::NotEmpty,
            ClientError::AccessDenied => InodeError::AccessDenied,
            other => InodeError::Client(other),
        }
    }
}
