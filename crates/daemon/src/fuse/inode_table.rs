//! Bidirectional inode ↔ node handle mapping for one mount
//!
//! The kernel identifies files by 64-bit inode numbers and counts how many
//! times it has looked each one up. A binding lives until the kernel forgets
//! every lookup of it. Inode numbers themselves come from the mount's
//! [`InodeStore`](super::inode_store::InodeStore) so they stay stable across
//! remounts.

use std::collections::HashMap;

use common::prelude::NodeHandle;

#[derive(Debug)]
pub struct InodeTable {
    handle_to_inode: HashMap<NodeHandle, u64>,
    inode_to_handle: HashMap<u64, NodeHandle>,
    /// Outstanding kernel lookups per inode
    lookups: HashMap<u64, u64>,
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    /// Create a table with the mount root pre-registered
    pub fn new(root: NodeHandle) -> Self {
        let mut table = Self {
            handle_to_inode: HashMap::new(),
            inode_to_handle: HashMap::new(),
            lookups: HashMap::new(),
        };
        table.bind(Self::ROOT_INODE, root);
        table
    }

    /// Bind `inode` to `handle`, replacing any stale binding of either
    pub fn bind(&mut self, inode: u64, handle: NodeHandle) {
        if let Some(old_handle) = self.inode_to_handle.insert(inode, handle) {
            if old_handle != handle {
                self.handle_to_inode.remove(&old_handle);
            }
        }
        if let Some(old_inode) = self.handle_to_inode.insert(handle, inode) {
            if old_inode != inode {
                self.inode_to_handle.remove(&old_inode);
                self.lookups.remove(&old_inode);
            }
        }
    }

    pub fn inode(&self, handle: NodeHandle) -> Option<u64> {
        self.handle_to_inode.get(&handle).copied()
    }

    pub fn handle(&self, inode: u64) -> Option<NodeHandle> {
        self.inode_to_handle.get(&inode).copied()
    }

    /// Record one kernel lookup of `inode`
    pub fn remember(&mut self, inode: u64) {
        if self.inode_to_handle.contains_key(&inode) {
            *self.lookups.entry(inode).or_insert(0) += 1;
        }
    }

    /// Drop `count` kernel lookups of `inode`
    ///
    /// Returns the handle whose binding was released once the count reaches
    /// zero. The root is never released.
    pub fn forget(&mut self, inode: u64, count: u64) -> Option<NodeHandle> {
        let remaining = match self.lookups.get_mut(&inode) {
            Some(lookups) => {
                *lookups = lookups.saturating_sub(count);
                *lookups
            }
            None => 0,
        };

        if remaining > 0 || inode == Self::ROOT_INODE {
            return None;
        }

        self.lookups.remove(&inode);
        let handle = self.inode_to_handle.remove(&inode)?;
        self.handle_to_inode.remove(&handle);
        Some(handle)
    }

    /// Drop the binding of a node that no longer exists
    pub fn remove_handle(&mut self, handle: NodeHandle) -> Option<u64> {
        let inode = self.handle_to_inode.get(&handle).copied()?;
        if inode == Self::ROOT_INODE {
            return None;
        }
        self.handle_to_inode.remove(&handle);
        self.inode_to_handle.remove(&inode);
        self.lookups.remove(&inode);
        Some(inode)
    }

    /// Number of bound inodes, including the root
    pub fn len(&self) -> usize {
        self.inode_to_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_handle.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: NodeHandle = NodeHandle::new(0x100);

    #[test]
    fn test_root_is_preregistered() {
        let table = InodeTable::new(ROOT);
        assert_eq!(table.inode(ROOT), Some(InodeTable::ROOT_INODE));
        assert_eq!(table.handle(InodeTable::ROOT_INODE), Some(ROOT));
    }

    #[test]
    fn test_forget_releases_after_last_lookup() {
        let mut table = InodeTable::new(ROOT);
        let file = NodeHandle::new(7);
        table.bind(2, file);
        table.remember(2);
        table.remember(2);

        assert_eq!(table.forget(2, 1), None);
        assert_eq!(table.handle(2), Some(file));

        assert_eq!(table.forget(2, 1), Some(file));
        assert_eq!(table.handle(2), None);
        assert_eq!(table.inode(file), None);
    }

    #[test]
    fn test_root_is_never_forgotten() {
        let mut table = InodeTable::new(ROOT);
        table.remember(InodeTable::ROOT_INODE);
        assert_eq!(table.forget(InodeTable::ROOT_INODE, 10), None);
        assert_eq!(table.remove_handle(ROOT), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rebind_replaces_stale_mapping() {
        let mut table = InodeTable::new(ROOT);
        let a = NodeHandle::new(7);
        let b = NodeHandle::new(8);
        table.bind(2, a);
        table.bind(2, b);

        assert_eq!(table.inode(a), None);
        assert_eq!(table.handle(2), Some(b));
    }
}
