//! A [`Client`] serving a local directory as the cloud tree
//!
//! Node handles are inode numbers, so they survive renames and restarts the
//! way cloud handles do. Handles seen while listing are remembered; an
//! unknown handle triggers a walk of the whole tree.

use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;

use common::prelude::{Client, ClientError, NodeHandle, NodeInfo};

pub struct LocalClient {
    root: PathBuf,
    root_handle: NodeHandle,
    /// Handle to absolute path
    paths: RwLock<HashMap<NodeHandle, PathBuf>>,
}

fn handle_of(metadata: &Metadata) -> NodeHandle {
    NodeHandle::new(metadata.ino())
}

fn modified(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_secs() as i64)
        .unwrap_or_default()
}

fn check_name(name: &str) -> Result<(), ClientError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ClientError::NotFound);
    }
    Ok(())
}

fn walk(dir: &Path, target: NodeHandle) -> std::io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if handle_of(&metadata) == target {
            return Ok(Some(entry.path()));
        }
        if metadata.is_dir() {
            if let Some(found) = walk(&entry.path(), target)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

impl LocalClient {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, ClientError> {
        let root = tokio::fs::canonicalize(root.as_ref()).await?;
        let metadata = tokio::fs::metadata(&root).await?;
        if !metadata.is_dir() {
            return Err(ClientError::NotDirectory);
        }

        let root_handle = handle_of(&metadata);
        let mut paths = HashMap::new();
        paths.insert(root_handle, root.clone());

        Ok(Self {
            root,
            root_handle,
            paths: RwLock::new(paths),
        })
    }

    pub fn root(&self) -> NodeHandle {
        self.root_handle
    }

    /// Handle of the node at `relative` below the root
    pub async fn resolve(&self, relative: impl AsRef<Path>) -> Result<NodeHandle, ClientError> {
        let path = self.root.join(relative.as_ref());
        let path = tokio::fs::canonicalize(&path).await?;
        if !path.starts_with(&self.root) {
            return Err(ClientError::AccessDenied);
        }

        let metadata = tokio::fs::metadata(&path).await?;
        let handle = handle_of(&metadata);
        self.paths.write().insert(handle, path);
        Ok(handle)
    }

    async fn path_of(&self, handle: NodeHandle) -> Result<PathBuf, ClientError> {
        let known = self.paths.read().get(&handle).cloned();
        if let Some(path) = known {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if handle_of(&metadata) == handle => return Ok(path),
                _ => {
                    self.paths.write().remove(&handle);
                }
            }
        }

        let root = self.root.clone();
        let found = tokio::task::spawn_blocking(move || walk(&root, handle))
            .await
            .map_err(|e| ClientError::Io(e.to_string()))??;

        match found {
            Some(path) => {
                self.paths.write().insert(handle, path.clone());
                Ok(path)
            }
            None => Err(ClientError::NotFound),
        }
    }

    async fn info(&self, path: &Path) -> Result<NodeInfo, ClientError> {
        let metadata = tokio::fs::symlink_metadata(path).await?;
        let handle = handle_of(&metadata);

        let parent = match handle == self.root_handle {
            true => None,
            false => {
                let parent = path.parent().ok_or(ClientError::NotFound)?;
                let parent_metadata = tokio::fs::metadata(parent).await?;
                Some(handle_of(&parent_metadata))
            }
        };

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.paths.write().insert(handle, path.to_path_buf());

        Ok(NodeInfo {
            handle,
            parent,
            name,
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: modified(&metadata),
        })
    }

    async fn directory(&self, handle: NodeHandle) -> Result<PathBuf, ClientError> {
        let path = self.path_of(handle).await?;
        if !tokio::fs::metadata(&path).await?.is_dir() {
            return Err(ClientError::NotDirectory);
        }
        Ok(path)
    }
}

#[async_trait::async_trait]
impl Client for LocalClient {
    async fn get(&self, handle: NodeHandle) -> Result<NodeInfo, ClientError> {
        let path = self.path_of(handle).await?;
        self.info(&path).await
    }

    async fn child(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, ClientError> {
        check_name(name)?;
        let dir = self.directory(parent).await?;
        self.info(&dir.join(name)).await
    }

    async fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>, ClientError> {
        let dir = self.directory(parent).await?;

        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            match self.info(&entry.path()).await {
                Ok(info) => children.push(info),
                // raced with a removal
                Err(ClientError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn read(&self, handle: NodeHandle) -> Result<Vec<u8>, ClientError> {
        let path = self.path_of(handle).await?;
        if tokio::fs::metadata(&path).await?.is_dir() {
            return Err(ClientError::IsDirectory);
        }
        Ok(tokio::fs::read(&path).await?)
    }

    async fn upload(
        &self,
        parent: NodeHandle,
        name: &str,
        data: Vec<u8>,
    ) -> Result<NodeInfo, ClientError> {
        check_name(name)?;
        let target = self.directory(parent).await?.join(name);
        if let Ok(metadata) = tokio::fs::metadata(&target).await {
            if metadata.is_dir() {
                return Err(ClientError::IsDirectory);
            }
        }

        tokio::fs::write(&target, data).await?;
        self.info(&target).await
    }

    async fn make_directory(
        &self,
        parent: NodeHandle,
        name: &str,
    ) -> Result<NodeInfo, ClientError> {
        check_name(name)?;
        let target = self.directory(parent).await?.join(name);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(ClientError::Exists(name.to_string()));
        }

        tokio::fs::create_dir(&target).await?;
        self.info(&target).await
    }

    async fn move_node(
        &self,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: &str,
    ) -> Result<NodeInfo, ClientError> {
        check_name(new_name)?;
        if handle == self.root_handle {
            return Err(ClientError::AccessDenied);
        }

        let source = self.path_of(handle).await?;
        let target = self.directory(new_parent).await?.join(new_name);
        if target.starts_with(&source) {
            return Err(ClientError::AccessDenied);
        }

        tokio::fs::rename(&source, &target).await?;
        self.info(&target).await
    }

    async fn remove(&self, handle: NodeHandle) -> Result<(), ClientError> {
        if handle == self.root_handle {
            return Err(ClientError::AccessDenied);
        }

        let path = self.path_of(handle).await?;
        let metadata = tokio::fs::symlink_metadata(&path).await?;
        if metadata.is_dir() {
            let mut entries = tokio::fs::read_dir(&path).await?;
            if entries.next_entry().await?.is_some() {
                return Err(ClientError::NotEmpty);
            }
            tokio::fs::remove_dir(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }

        self.paths.write().remove(&handle);
        Ok(())
    }
}

impl std::fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClient")
            .field("root", &self.root)
            .field("root_handle", &self.root_handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, LocalClient) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.txt"), b"hello").unwrap();
        let client = LocalClient::new(dir.path()).await.unwrap();
        (dir, client)
    }

    #[tokio::test]
    async fn test_root_and_children() {
        let (_dir, client) = setup().await;

        let root = client.get(client.root()).await.unwrap();
        assert!(root.is_directory);
        assert_eq!(root.parent, None);

        let docs = client.child(client.root(), "docs").await.unwrap();
        assert!(docs.is_directory);
        assert_eq!(docs.parent, Some(client.root()));

        let children = client.children(docs.handle).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "readme.txt");
        assert_eq!(children[0].size, 5);
    }

    #[tokio::test]
    async fn test_handle_survives_rename() {
        let (_dir, client) = setup().await;

        let file = client.resolve("docs/readme.txt").await.unwrap();
        let moved = client
            .move_node(file, client.root(), "moved.txt")
            .await
            .unwrap();
        assert_eq!(moved.handle, file);
        assert_eq!(moved.parent, Some(client.root()));
        assert_eq!(client.read(file).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_unknown_handle_is_found_by_walking() {
        let (dir, client) = setup().await;

        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), b"x").unwrap();
        let ino = std::fs::metadata(dir.path().join("a/b/deep.txt"))
            .unwrap()
            .ino();

        let info = client.get(NodeHandle::new(ino)).await.unwrap();
        assert_eq!(info.name, "deep.txt");
    }

    #[tokio::test]
    async fn test_upload_mkdir_remove() {
        let (_dir, client) = setup().await;

        let dir = client.make_directory(client.root(), "new").await.unwrap();
        assert!(matches!(
            client.make_directory(client.root(), "new").await,
            Err(ClientError::Exists(_))
        ));

        let file = client.upload(dir.handle, "f.bin", vec![1, 2, 3]).await.unwrap();
        assert_eq!(file.size, 3);

        assert_eq!(client.remove(dir.handle).await, Err(ClientError::NotEmpty));
        client.remove(file.handle).await.unwrap();
        client.remove(dir.handle).await.unwrap();
        assert_eq!(
            client.child(client.root(), "new").await.unwrap_err(),
            ClientError::NotFound
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_escape() {
        let (_dir, client) = setup().await;
        assert_eq!(
            client.resolve("..").await.unwrap_err(),
            ClientError::AccessDenied
        );
    }
}
