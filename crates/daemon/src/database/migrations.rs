//! Versioned schema migrations
//!
//! Every database carries a `schema_version` table with one row per applied
//! version. Upgrades and downgrades run inside a single transaction, so a
//! failure at any step leaves the schema at the version it started from.

use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;

/// One schema version: the statements that introduce it and undo it
#[derive(Debug)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub upgrade: &'static [&'static str],
    pub downgrade: &'static [&'static str],
}

/// Result of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from: u32,
    pub to: u32,
}

impl MigrationOutcome {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema is at version {found}, newer than the latest known version {latest}")]
    UnknownVersion { found: u32, latest: u32 },
}

/// Applies an ordered list of migrations, numbered from 1
#[derive(Debug, Clone, Copy)]
pub struct Migrator {
    migrations: &'static [Migration],
}

impl Migrator {
    pub const fn new(migrations: &'static [Migration]) -> Self {
        Self { migrations }
    }

    pub fn latest(&self) -> u32 {
        self.migrations.len() as u32
    }

    /// The highest applied version, 0 for a fresh database
    pub async fn current(&self, pool: &SqlitePool) -> Result<u32, MigrationError> {
        let mut conn = pool.acquire().await?;
        ensure_version_table(&mut conn).await?;
        current_version(&mut conn).await
    }

    /// Apply every missing version up to `target`, clamped to the latest
    pub async fn upgrade(
        &self,
        pool: &SqlitePool,
        target: u32,
    ) -> Result<MigrationOutcome, MigrationError> {
        let target = target.min(self.latest());
        let mut tx = pool.begin().await?;
        ensure_version_table(&mut tx).await?;

        let from = current_version(&mut tx).await?;
        if from >= target {
            tx.commit().await?;
            return Ok(MigrationOutcome { from, to: from });
        }

        for migration in &self.migrations[from as usize..target as usize] {
            tracing::debug!(
                version = migration.version,
                "applying migration: {}",
                migration.description
            );
            for statement in migration.upgrade {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
                .bind(migration.version as i64)
                .bind(OffsetDateTime::now_utc().unix_timestamp())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(MigrationOutcome { from, to: target })
    }

    /// Revert every applied version above `target`
    pub async fn downgrade(
        &self,
        pool: &SqlitePool,
        target: u32,
    ) -> Result<MigrationOutcome, MigrationError> {
        let mut tx = pool.begin().await?;
        ensure_version_table(&mut tx).await?;

        let from = current_version(&mut tx).await?;
        if from > self.latest() {
            return Err(MigrationError::UnknownVersion {
                found: from,
                latest: self.latest(),
            });
        }
        if from <= target {
            tx.commit().await?;
            return Ok(MigrationOutcome { from, to: from });
        }

        for migration in self.migrations[target as usize..from as usize].iter().rev() {
            tracing::debug!(
                version = migration.version,
                "reverting migration: {}",
                migration.description
            );
            for statement in migration.downgrade {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("DELETE FROM schema_version WHERE version = ?1")
                .bind(migration.version as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(MigrationOutcome { from, to: target })
    }
}

async fn ensure_version_table(conn: &mut SqliteConnection) -> Result<(), MigrationError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn current_version(conn: &mut SqliteConnection) -> Result<u32, MigrationError> {
    let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version.max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite_pool;

    const CREATE_NOTES: Migration = Migration {
        version: 1,
        description: "create notes",
        upgrade: &["CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)"],
        downgrade: &["DROP TABLE notes"],
    };

    const ADD_PINNED: Migration = Migration {
        version: 2,
        description: "add notes.pinned",
        upgrade: &["ALTER TABLE notes ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0"],
        downgrade: &["ALTER TABLE notes DROP COLUMN pinned"],
    };

    static MIGRATIONS: &[Migration] = &[CREATE_NOTES, ADD_PINNED];

    static BROKEN: Migrator = Migrator::new(&[
        CREATE_NOTES,
        ADD_PINNED,
        Migration {
            version: 3,
            description: "broken step",
            upgrade: &[
                "CREATE INDEX notes_by_pinned ON notes (pinned)",
                "THIS IS NOT SQL",
            ],
            downgrade: &["DROP INDEX notes_by_pinned"],
        },
    ]);

    static MIGRATOR: Migrator = Migrator::new(MIGRATIONS);

    #[tokio::test]
    async fn test_upgrade_and_downgrade() {
        let pool = sqlite_pool(None).await.unwrap();
        assert_eq!(MIGRATOR.current(&pool).await.unwrap(), 0);

        let outcome = MIGRATOR.upgrade(&pool, 2).await.unwrap();
        assert_eq!(outcome, MigrationOutcome { from: 0, to: 2 });
        assert_eq!(MIGRATOR.current(&pool).await.unwrap(), 2);

        // re-applying is a no-op
        let outcome = MIGRATOR.upgrade(&pool, 2).await.unwrap();
        assert!(!outcome.changed());

        let outcome = MIGRATOR.downgrade(&pool, 1).await.unwrap();
        assert_eq!(outcome, MigrationOutcome { from: 2, to: 1 });

        // pinned is gone again
        let result = sqlx::query("SELECT pinned FROM notes").fetch_all(&pool).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_upgrade_leaves_prior_version() {
        let pool = sqlite_pool(None).await.unwrap();
        MIGRATOR.upgrade(&pool, 2).await.unwrap();

        assert!(BROKEN.upgrade(&pool, 3).await.is_err());
        assert_eq!(BROKEN.current(&pool).await.unwrap(), 2);

        // the index from the first statement of the broken step was rolled back
        let indexes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'notes_by_pinned'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(indexes, 0);
    }

    #[tokio::test]
    async fn test_upgrade_clamps_to_latest() {
        let pool = sqlite_pool(None).await.unwrap();
        let outcome = MIGRATOR.upgrade(&pool, 99).await.unwrap();
        assert_eq!(outcome, MigrationOutcome { from: 0, to: 2 });
    }
}
