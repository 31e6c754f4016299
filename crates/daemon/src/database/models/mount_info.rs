use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{FromRow, Row, Sqlite};

use common::prelude::{NodeHandle, NormalizedPath};

use crate::database::types::{DHandle, LogLevel};
use crate::database::Database;

/// Longest mount name accepted, in bytes
pub const MAX_NAME_LENGTH: usize = 255;

/// Per-mount configuration
///
/// `enable_at_startup` only makes sense for a persistent mount; see
/// [`MountFlags::sanitized`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct MountFlags {
    pub name: String,
    pub enable_at_startup: bool,
    pub persistent: bool,
    pub read_only: bool,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl MountFlags {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Clear `enable_at_startup` on a transient mount
    pub fn sanitized(mut self) -> Self {
        if !self.persistent {
            self.enable_at_startup = false;
        }
        self
    }
}

/// A mount record: which cloud node is exposed where, and how
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountInfo {
    pub flags: MountFlags,
    pub handle: NodeHandle,
    pub path: NormalizedPath,
}

impl MountInfo {
    pub fn new(flags: MountFlags, handle: NodeHandle, path: NormalizedPath) -> Self {
        Self {
            flags,
            handle,
            path,
        }
    }

    pub fn name(&self) -> &str {
        &self.flags.name
    }

    /// Bind every column in the canonical order:
    /// name, path, handle, enable_at_startup, persistent, read_only, log_level
    fn bind_fields<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.flags.name.as_str())
            .bind(self.path.to_string())
            .bind(DHandle::from(self.handle))
            .bind(self.flags.enable_at_startup)
            .bind(self.flags.persistent)
            .bind(self.flags.read_only)
            .bind(self.flags.log_level)
    }

    /// Persist a new record
    pub async fn insert(&self, db: &Database) -> Result<(), sqlx::Error> {
        let query = sqlx::query(
            r#"
            INSERT INTO mounts (
                name, path, handle, enable_at_startup, persistent, read_only, log_level
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        );
        self.bind_fields(query).execute(&**db).await?;
        Ok(())
    }

    /// Get a mount by name
    pub async fn get(name: &str, db: &Database) -> Result<Option<MountInfo>, sqlx::Error> {
        sqlx::query_as::<_, MountInfo>(
            r#"
            SELECT name, path, handle, enable_at_startup, persistent, read_only, log_level
            FROM mounts
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&**db)
        .await
    }

    /// Get the mount rooted at `path`
    pub async fn by_path(
        path: &NormalizedPath,
        db: &Database,
    ) -> Result<Option<MountInfo>, sqlx::Error> {
        sqlx::query_as::<_, MountInfo>(
            r#"
            SELECT name, path, handle, enable_at_startup, persistent, read_only, log_level
            FROM mounts
            WHERE path = ?1
            "#,
        )
        .bind(path.to_string())
        .fetch_optional(&**db)
        .await
    }

    /// List all persisted mounts
    pub async fn list(db: &Database) -> Result<Vec<MountInfo>, sqlx::Error> {
        sqlx::query_as::<_, MountInfo>(
            r#"
            SELECT name, path, handle, enable_at_startup, persistent, read_only, log_level
            FROM mounts
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&**db)
        .await
    }

    /// Get all mounts that should be enabled when the service starts
    pub async fn startup_list(db: &Database) -> Result<Vec<MountInfo>, sqlx::Error> {
        sqlx::query_as::<_, MountInfo>(
            r#"
            SELECT name, path, handle, enable_at_startup, persistent, read_only, log_level
            FROM mounts
            WHERE enable_at_startup = 1
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&**db)
        .await
    }

    /// Overwrite the record currently stored as `name` with `self`
    ///
    /// Handles renames: `self` may carry a different name.
    pub async fn replace(&self, name: &str, db: &Database) -> Result<bool, sqlx::Error> {
        let query = sqlx::query(
            r#"
            UPDATE mounts
            SET name = ?1, path = ?2, handle = ?3, enable_at_startup = ?4,
                persistent = ?5, read_only = ?6, log_level = ?7
            WHERE name = ?8
            "#,
        );
        let result = self.bind_fields(query).bind(name).execute(&**db).await?;

        Ok(result.rows_affected() > 0)
    }

    /// Update only the startup flag of a mount
    pub async fn set_enable_at_startup(
        name: &str,
        enable_at_startup: bool,
        db: &Database,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE mounts SET enable_at_startup = ?1 WHERE name = ?2")
            .bind(enable_at_startup)
            .bind(name)
            .execute(&**db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a mount
    pub async fn delete(name: &str, db: &Database) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM mounts WHERE name = ?1")
            .bind(name)
            .execute(&**db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

impl<'r> FromRow<'r, SqliteRow> for MountInfo {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let path: String = row.try_get("path")?;
        let path = NormalizedPath::new(&path).map_err(|e| sqlx::Error::ColumnDecode {
            index: "path".to_string(),
            source: Box::new(e),
        })?;
        let handle: DHandle = row.try_get("handle")?;

        Ok(Self {
            flags: MountFlags {
                name: row.try_get("name")?,
                enable_at_startup: row.try_get("enable_at_startup")?,
                persistent: row.try_get("persistent")?,
                read_only: row.try_get("read_only")?,
                log_level: row.try_get("log_level")?,
            },
            handle: handle.into(),
            path,
        })
    }
}

/// True if `err` is a UNIQUE constraint violation on `column` of `mounts`
pub fn is_unique_violation(err: &sqlx::Error, column: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.message().contains(&format!("mounts.{}", column))
        }
        _ => false,
    }
}
