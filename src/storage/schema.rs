use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

/// Tables in dependency order. `wipe_all` and `store_stats` walk this list.
pub(crate) const TABLES: &[&str] = &[
    "accounts",
    "articles",
    "html_snapshots",
    "assets",
    "resource_maps",
    "comments",
    "comment_replies",
    "export_jobs",
];

// ============================================================================
// Options
// ============================================================================

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Upper bound on pooled connections. In-memory databases always use one.
    pub max_connections: u32,
    /// How long SQLite waits on a held lock before returning SQLITE_BUSY.
    pub busy_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

// ============================================================================
// Database
// ============================================================================

/// Owned handle to the archive store. Cloning shares the pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database with default options and run migrations.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        Self::open_with(path, &DatabaseOptions::default()).await
    }

    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema could not be applied.
    pub async fn open_with(path: &str, opts: &DatabaseOptions) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // Pre-create the file with owner-only permissions so there is no window
        // where the archive exists with default umask permissions.
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.as_os_str().is_empty() || parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .busy_timeout(opts.busy_timeout)
            .foreign_keys(true);
        if !in_memory {
            // WAL: readers never block the single writer and vice versa.
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection would otherwise see its own empty database.
        let max_connections = if in_memory {
            1
        } else {
            opts.max_connections.max(1)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        tracing::info!(path = %path, max_connections, "Opened archive database");
        Ok(db)
    }

    /// Close every pooled connection. Further calls on this handle (or any
    /// clone of it) fail with a pool-closed error.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Closed archive database");
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. A failure rolls back the whole migration.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Account aggregates: crawl progress + identity
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                completed INTEGER NOT NULL DEFAULT 0,
                count INTEGER NOT NULL DEFAULT 0,
                articles INTEGER NOT NULL DEFAULT 0,
                total_count INTEGER NOT NULL DEFAULT 0,
                nickname TEXT NOT NULL DEFAULT '',
                avatar TEXT NOT NULL DEFAULT '',
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Articles: key is "<account_id>:<article_id>", payload is the JSON article
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                key TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                article_id TEXT NOT NULL,
                link TEXT NOT NULL UNIQUE,
                create_time INTEGER NOT NULL,
                provisional_origin INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Cursor pagination: WHERE account_id = ? AND create_time < ? ORDER BY create_time DESC
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_account_time ON articles(account_id, create_time DESC, key DESC)",
        )
        .execute(&mut *tx)
        .await?;

        for table in ["html_snapshots", "assets"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    url TEXT PRIMARY KEY,
                    account_id TEXT NOT NULL,
                    title TEXT NOT NULL DEFAULT '',
                    payload BLOB NOT NULL,
                    side_id TEXT,
                    updated_at INTEGER NOT NULL
                )
            "#
            ))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource_maps (
                url TEXT PRIMARY KEY,
                resources TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comments (
                url TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Two key columns instead of a concatenated string: collision-free for any pair
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS comment_replies (
                url TEXT NOT NULL,
                content_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (url, content_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS export_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                format TEXT NOT NULL,
                links TEXT NOT NULL,
                account_id TEXT,
                status TEXT NOT NULL,
                error TEXT,
                output_path TEXT,
                digest TEXT,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_export_jobs_user ON export_jobs(user_id)")
            .execute(&mut *tx)
            .await?;

        // Commit all migrations atomically
        tx.commit().await?;

        Ok(())
    }
}
