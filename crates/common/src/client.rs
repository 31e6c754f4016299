//! Cloud client boundary
//!
//! The mount service never talks to the backend directly. Everything it needs
//! (node lookup, listings, content transfer and mutation) goes through the
//! [`Client`] trait so the backend can be swapped for a local directory or an
//! in-memory tree.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a file or folder in the cloud backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(u64);

impl NodeHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NodeHandle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        u64::from_str_radix(s, 16).map(Self)
    }
}

/// Metadata describing a single cloud node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub handle: NodeHandle,
    /// `None` only for the root of the account's tree
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub is_directory: bool,
    /// Size in bytes, zero for directories
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub modified: i64,
}

/// Errors returned by a [`Client`]
///
/// Cloneable so a single fetch result can be handed to every waiter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("node not found")]
    NotFound,

    #[error("node already exists: {0}")]
    Exists(String),

    #[error("node is not a directory")]
    NotDirectory,

    #[error("node is a directory")]
    IsDirectory,

    #[error("directory is not empty")]
    NotEmpty,

    #[error("access denied")]
    AccessDenied,

    #[error("cloud backend unavailable: {0}")]
    Unavailable(String),

    #[error("cloud i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => ClientError::NotFound,
            ErrorKind::AlreadyExists => ClientError::Exists(err.to_string()),
            ErrorKind::PermissionDenied => ClientError::AccessDenied,
            _ => ClientError::Io(err.to_string()),
        }
    }
}

/// Operations the mount service needs from the cloud backend
#[async_trait::async_trait]
pub trait Client: Send + Sync + 'static {
    /// Fetch a node by handle
    async fn get(&self, handle: NodeHandle) -> Result<NodeInfo, ClientError>;

    /// Fetch the child of `parent` called `name`
    async fn child(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, ClientError>;

    /// List every child of `parent`
    async fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>, ClientError>;

    /// Download the full content of a file
    async fn read(&self, handle: NodeHandle) -> Result<Vec<u8>, ClientError>;

    /// Upload `data` as `name` under `parent`, replacing an existing file
    async fn upload(
        &self,
        parent: NodeHandle,
        name: &str,
        data: Vec<u8>,
    ) -> Result<NodeInfo, ClientError>;

    async fn make_directory(&self, parent: NodeHandle, name: &str)
        -> Result<NodeInfo, ClientError>;

    /// Move and/or rename a node
    async fn move_node(
        &self,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
    ) -> Result<NodeInfo, ClientError>;

    async fn remove(&self, handle: NodeHandle) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display_is_fixed_width_hex() {
        let handle = NodeHandle::new(0xbeef);
        assert_eq!(handle.to_string(), "000000000000beef");
        assert_eq!("000000000000beef".parse::<NodeHandle>().unwrap(), handle);
        assert_eq!("0xbeef".parse::<NodeHandle>().unwrap(), handle);
    }

    #[test]
    fn test_handle_rejects_garbage() {
        assert!("not-a-handle".parse::<NodeHandle>().is_err());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(ClientError::from(err), ClientError::NotFound);

        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(ClientError::from(err), ClientError::AccessDenied);
    }
}
