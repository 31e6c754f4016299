//! Per-mount on-disk inode bindings
//!
//! Each mount keeps a small sqlite file that assigns every cloud handle it
//! has seen a stable inode number. Numbers are never reused, so a handle
//! keeps its inode across remounts and a reused number can never alias a
//! different node. Inode 1 is always the mount root.
//!
//! The store is created at [`BASELINE_VERSION`] and only moves between
//! schema versions through explicit upgrade/downgrade calls.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use time::OffsetDateTime;

use common::prelude::NodeHandle;

use crate::database::migrations::{Migration, MigrationError, MigrationOutcome, Migrator};
use crate::database::sqlite_pool;
use crate::database::types::DHandle;

use super::inode_table::InodeTable;

static INODE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create inodes",
        upgrade: &[r#"
            CREATE TABLE inodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                handle TEXT NOT NULL UNIQUE,
                bound_at INTEGER NOT NULL
            )
            "#],
        downgrade: &["DROP TABLE inodes"],
    },
    Migration {
        version: 2,
        description: "index inodes by binding time",
        upgrade: &["CREATE INDEX inodes_by_bound_at ON inodes (bound_at)"],
        downgrade: &["DROP INDEX inodes_by_bound_at"],
    },
];

pub static INODE_MIGRATOR: Migrator = Migrator::new(INODE_MIGRATIONS);

/// Schema version a fresh store is created at
pub const BASELINE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("inode store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("inode store migration failed: {0}")]
    Migration(#[from] MigrationError),
}

#[derive(Clone, Debug)]
pub struct InodeStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl InodeStore {
    /// Open or create the store at `path` for a mount rooted at `root`
    pub async fn open(path: &Path, root: NodeHandle) -> Result<Self, StoreError> {
        let pool = sqlite_pool(Some(path)).await?;
        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.prepare(root).await?;
        Ok(store)
    }

    pub async fn in_memory(root: NodeHandle) -> Result<Self, StoreError> {
        let pool = sqlite_pool(None).await?;
        let store = Self { pool, path: None };
        store.prepare(root).await?;
        Ok(store)
    }

    /// Open an existing store without binding a root, for schema migration only
    pub async fn open_for_migration(path: &Path) -> Result<Self, StoreError> {
        let pool = sqlite_pool(Some(path)).await?;
        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        if store.version().await? == 0 {
            INODE_MIGRATOR.upgrade(&store.pool, BASELINE_VERSION).await?;
        }
        Ok(store)
    }

    async fn prepare(&self, root: NodeHandle) -> Result<(), StoreError> {
        if self.version().await? < BASELINE_VERSION {
            INODE_MIGRATOR.upgrade(&self.pool, BASELINE_VERSION).await?;
        }

        let bound: Option<DHandle> = sqlx::query_scalar("SELECT handle FROM inodes WHERE id = ?1")
            .bind(InodeTable::ROOT_INODE as i64)
            .fetch_optional(&self.pool)
            .await?;

        match bound {
            Some(handle) if *handle == root => Ok(()),
            existing => {
                // the store belonged to a different root; its bindings are meaningless now
                if existing.is_some() {
                    tracing::warn!("inode store root changed, discarding bindings");
                }
                let mut tx = self.pool.begin().await?;
                sqlx::query("DELETE FROM inodes").execute(&mut *tx).await?;
                sqlx::query("INSERT INTO inodes (id, handle, bound_at) VALUES (?1, ?2, ?3)")
                    .bind(InodeTable::ROOT_INODE as i64)
                    .bind(DHandle::from(root))
                    .bind(now())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }

    /// The inode bound to `handle`, binding a fresh one if needed
    pub async fn bind(&self, handle: NodeHandle) -> Result<u64, StoreError> {
        sqlx::query("INSERT INTO inodes (handle, bound_at) VALUES (?1, ?2) ON CONFLICT(handle) DO NOTHING")
            .bind(DHandle::from(handle))
            .bind(now())
            .execute(&self.pool)
            .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM inodes WHERE handle = ?1")
            .bind(DHandle::from(handle))
            .fetch_one(&self.pool)
            .await?;
        Ok(id as u64)
    }

    /// The inode already bound to `handle`, if any
    pub async fn lookup(&self, handle: NodeHandle) -> Result<Option<u64>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM inodes WHERE handle = ?1")
            .bind(DHandle::from(handle))
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(|id| id as u64))
    }

    pub async fn version(&self) -> Result<u32, StoreError> {
        Ok(INODE_MIGRATOR.current(&self.pool).await?)
    }

    pub async fn upgrade(&self, target: u32) -> Result<MigrationOutcome, StoreError> {
        Ok(INODE_MIGRATOR.upgrade(&self.pool, target).await?)
    }

    pub async fn downgrade(&self, target: u32) -> Result<MigrationOutcome, StoreError> {
        Ok(INODE_MIGRATOR.downgrade(&self.pool, target).await?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: NodeHandle = NodeHandle::new(0x100);

    #[tokio::test]
    async fn test_fresh_store_is_at_baseline() {
        let store = InodeStore::in_memory(ROOT).await.unwrap();
        assert_eq!(store.version().await.unwrap(), BASELINE_VERSION);
        assert_eq!(store.lookup(ROOT).await.unwrap(), Some(InodeTable::ROOT_INODE));
    }

    #[tokio::test]
    async fn test_bindings_are_stable_and_never_reused() {
        let store = InodeStore::in_memory(ROOT).await.unwrap();
        let a = store.bind(NodeHandle::new(1)).await.unwrap();
        let b = store.bind(NodeHandle::new(2)).await.unwrap();

        assert!(a > InodeTable::ROOT_INODE);
        assert_ne!(a, b);
        assert_eq!(store.bind(NodeHandle::new(1)).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_bindings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m1.db");

        let store = InodeStore::open(&path, ROOT).await.unwrap();
        let inode = store.bind(NodeHandle::new(42)).await.unwrap();
        store.close().await;

        let store = InodeStore::open(&path, ROOT).await.unwrap();
        assert_eq!(store.lookup(NodeHandle::new(42)).await.unwrap(), Some(inode));
    }

    #[tokio::test]
    async fn test_new_root_discards_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m1.db");

        let store = InodeStore::open(&path, ROOT).await.unwrap();
        store.bind(NodeHandle::new(42)).await.unwrap();
        store.close().await;

        let other_root = NodeHandle::new(0x200);
        let store = InodeStore::open(&path, other_root).await.unwrap();
        assert_eq!(store.lookup(NodeHandle::new(42)).await.unwrap(), None);
        assert_eq!(
            store.lookup(other_root).await.unwrap(),
            Some(InodeTable::ROOT_INODE)
        );
    }

    #[tokio::test]
    async fn test_upgrade_then_downgrade() {
        let store = InodeStore::in_memory(ROOT).await.unwrap();

        let outcome = store.upgrade(2).await.unwrap();
        assert_eq!(outcome, MigrationOutcome { from: 1, to: 2 });
        assert!(!store.upgrade(2).await.unwrap().changed());

        let outcome = store.downgrade(1).await.unwrap();
        assert_eq!(outcome, MigrationOutcome { from: 2, to: 1 });

        // bindings are untouched by the index migration
        assert_eq!(store.lookup(ROOT).await.unwrap(), Some(InodeTable::ROOT_INODE));
    }
}
