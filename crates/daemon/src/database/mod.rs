pub mod migrations;
pub mod models;
pub mod types;

use std::ops::Deref;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use migrations::{Migration, MigrationError, Migrator};

/// Schema of the mount database
static MOUNT_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create mounts",
        upgrade: &[r#"
            CREATE TABLE mounts (
                name TEXT NOT NULL PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                handle TEXT NOT NULL,
                enable_at_startup INTEGER NOT NULL DEFAULT 0,
                persistent INTEGER NOT NULL DEFAULT 1,
                read_only INTEGER NOT NULL DEFAULT 0
            )
            "#],
        downgrade: &["DROP TABLE mounts"],
    },
    Migration {
        version: 2,
        description: "add per-mount log level",
        upgrade: &["ALTER TABLE mounts ADD COLUMN log_level TEXT NOT NULL DEFAULT 'info'"],
        downgrade: &["ALTER TABLE mounts DROP COLUMN log_level"],
    },
];

pub static MOUNT_MIGRATOR: Migrator = Migrator::new(MOUNT_MIGRATIONS);

/// The mount database
///
/// Holds only persistent mounts. Always built to the latest schema on open.
#[derive(Clone, Debug)]
pub struct Database(SqlitePool);

#[allow(dead_code)]
pub type DatabaseConnection = sqlx::SqliteConnection;

impl Database {
    pub async fn connect(database_url: &url::Url) -> Result<Self, DatabaseSetupError> {
        if database_url.scheme() != "sqlite" {
            return Err(DatabaseSetupError::UnknownDbType(
                database_url.scheme().to_string(),
            ));
        }

        let path = database_url.path();
        if path.is_empty() || path == ":memory:" {
            return Self::in_memory().await;
        }
        Self::open(Path::new(path)).await
    }

    /// Open (creating if needed) a database file
    pub async fn open(path: &Path) -> Result<Self, DatabaseSetupError> {
        let pool = sqlite_pool(Some(path))
            .await
            .map_err(DatabaseSetupError::Unavailable)?;
        Self::build(pool).await
    }

    pub async fn in_memory() -> Result<Self, DatabaseSetupError> {
        let pool = sqlite_pool(None)
            .await
            .map_err(DatabaseSetupError::Unavailable)?;
        Self::build(pool).await
    }

    async fn build(pool: SqlitePool) -> Result<Self, DatabaseSetupError> {
        let outcome = MOUNT_MIGRATOR.upgrade(&pool, MOUNT_MIGRATOR.latest()).await?;
        if outcome.changed() {
            tracing::info!(
                "mount database migrated from version {} to {}",
                outcome.from,
                outcome.to
            );
        }
        Ok(Self(pool))
    }

    pub async fn schema_version(&self) -> Result<u32, MigrationError> {
        MOUNT_MIGRATOR.current(&self.0).await
    }
}

impl Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Open a sqlite pool on `path`, or a private in-memory database
///
/// Writes are serialized by sqlite itself; WAL lets readers proceed
/// alongside the single writer.
pub(crate) async fn sqlite_pool(path: Option<&Path>) -> Result<SqlitePool, sqlx::Error> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await
        }
        None => {
            // every in-memory connection is its own database, so pin exactly one
            let options = SqliteConnectOptions::new().filename(":memory:");

            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("error occurred while attempting database migration: {0}")]
    MigrationFailed(#[from] MigrationError),

    #[error("unable to perform initial connection and check of the database: {0}")]
    Unavailable(sqlx::Error),

    #[error("requested database type was not recognized: {0}")]
    UnknownDbType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory_builds_latest_schema() {
        let url = url::Url::parse("sqlite::memory:").unwrap();
        let db = Database::connect(&url).await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), MOUNT_MIGRATOR.latest());
    }

    #[tokio::test]
    async fn test_connect_rejects_other_schemes() {
        let url = url::Url::parse("postgres://localhost/mounts").unwrap();
        assert!(matches!(
            Database::connect(&url).await,
            Err(DatabaseSetupError::UnknownDbType(_))
        ));
    }

    #[tokio::test]
    async fn test_open_file_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("mounts.sqlite");

        let db = Database::open(&path).await.unwrap();
        drop(db);

        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), 2);
    }
}
