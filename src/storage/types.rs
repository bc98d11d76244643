use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another feedvault process appears to be using the database. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A required identifying field was missing or malformed. Raised before any
    /// storage access, so the call had no side effects.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A multi-statement operation failed and was rolled back.
    #[error("Transaction '{op}' failed and was rolled back: {source}")]
    Transaction {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A stored JSON payload could not be encoded or decoded
    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    pub(crate) fn transaction(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| DatabaseError::Transaction { op, source }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        DatabaseError::Validation(msg.into())
    }
}

/// Result alias used by every store operation.
pub type StoreResult<T> = std::result::Result<T, DatabaseError>;

// ============================================================================
// Accounts
// ============================================================================

/// Crawl progress and identity metadata for one tracked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountAggregate {
    pub account_id: String,
    pub completed: bool,
    pub count: i64,
    pub articles: i64,
    pub total_count: i64,
    pub nickname: String,
    pub avatar: String,
    pub create_time: i64,
    pub update_time: i64,
}

/// Progress patch submitted by the crawler after a sync pass.
///
/// `count` and `articles` are deltas and are added to the stored totals.
/// Every other field replaces the stored value only when supplied; an empty
/// nickname or avatar counts as not supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSync {
    pub account_id: String,
    pub completed: Option<bool>,
    pub count: i64,
    pub articles: i64,
    pub total_count: Option<i64>,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
}

/// One entry of a bulk account-list import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountIdentity {
    pub account_id: String,
    pub nickname: String,
    pub avatar: String,
}

// ============================================================================
// Articles
// ============================================================================

/// Placeholder owner for articles observed before their account is known.
pub const PROVISIONAL_ACCOUNT_ID: &str = "PROVISIONAL";

/// Primary key of an article: `"<account_id>:<article_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArticleKey {
    pub account_id: String,
    pub article_id: String,
}

impl ArticleKey {
    pub fn new(account_id: impl Into<String>, article_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            article_id: article_id.into(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.account_id == PROVISIONAL_ACCOUNT_ID
    }

    pub(crate) fn validate(&self) -> StoreResult<()> {
        validate_account_id(&self.account_id)?;
        if self.article_id.is_empty() {
            return Err(DatabaseError::validation("article id is required"));
        }
        Ok(())
    }
}

impl fmt::Display for ArticleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.article_id)
    }
}

impl FromStr for ArticleKey {
    type Err = DatabaseError;

    /// Account ids never contain `:`, so the first separator splits the key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (account_id, article_id) = s
            .split_once(':')
            .ok_or_else(|| DatabaseError::validation(format!("malformed article key '{s}'")))?;
        let key = ArticleKey::new(account_id, article_id);
        key.validate()?;
        Ok(key)
    }
}

pub(crate) fn validate_account_id(account_id: &str) -> StoreResult<()> {
    if account_id.is_empty() {
        return Err(DatabaseError::validation("account id is required"));
    }
    if account_id.contains(':') {
        return Err(DatabaseError::validation(format!(
            "account id '{account_id}' must not contain ':'"
        )));
    }
    Ok(())
}

/// Stored article. The whole value is persisted as the row payload; `link`,
/// `account_id` and `create_time` are also indexed columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub account_id: String,
    pub article_id: String,
    pub link: String,
    /// Epoch seconds. Drives cursor pagination.
    pub create_time: i64,
    #[serde(default)]
    pub title: String,
    /// Raw or derived content as delivered by the crawler. Never inspected.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Set when the record was first stored under the provisional account.
    #[serde(default)]
    pub provisional_origin: bool,
}

impl Article {
    pub fn key(&self) -> ArticleKey {
        ArticleKey::new(self.account_id.clone(), self.article_id.clone())
    }

    pub fn is_provisional(&self) -> bool {
        self.account_id == PROVISIONAL_ACCOUNT_ID
    }
}

/// Result of [`Database::remap_identity`](super::Database::remap_identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemapOutcome {
    /// The provisional record was moved to this key.
    Remapped(ArticleKey),
    /// No provisional record exists; the link is already stored under this key.
    AlreadyResolved(ArticleKey),
    /// Nothing is stored for the link.
    NotFound,
    /// The target key already holds the same article under another link
    /// (`existing_link`). Nothing was changed; the provisional record stays.
    Conflict {
        key: ArticleKey,
        existing_link: String,
    },
}

// ============================================================================
// Blobs and side channels
// ============================================================================

/// Which binary snapshot table to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Html,
    Asset,
}

impl BlobKind {
    pub(crate) fn table(self) -> &'static str {
        match self {
            BlobKind::Html => "html_snapshots",
            BlobKind::Asset => "assets",
        }
    }
}

/// Binary snapshot of a page or asset, keyed by canonical URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSnapshot {
    pub url: String,
    pub account_id: String,
    pub title: String,
    pub payload: Vec<u8>,
    pub side_id: Option<String>,
    /// Set by the store on write; ignored on `put_blob`.
    pub updated_at: i64,
}

impl BlobSnapshot {
    pub fn new(
        url: impl Into<String>,
        account_id: impl Into<String>,
        title: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            url: url.into(),
            account_id: account_id.into(),
            title: title.into(),
            payload,
            side_id: None,
            updated_at: 0,
        }
    }

    pub fn with_side_id(mut self, side_id: impl Into<String>) -> Self {
        self.side_id = Some(side_id.into());
        self
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BlobRow {
    pub url: String,
    pub account_id: String,
    pub title: String,
    pub payload: Vec<u8>,
    pub side_id: Option<String>,
    pub updated_at: i64,
}

impl BlobRow {
    pub(crate) fn into_snapshot(self) -> BlobSnapshot {
        BlobSnapshot {
            url: self.url,
            account_id: self.account_id,
            title: self.title,
            payload: self.payload,
            side_id: self.side_id,
            updated_at: self.updated_at,
        }
    }
}

// ============================================================================
// Maintenance
// ============================================================================

/// Rows removed from each table by [`Database::wipe_all`](super::Database::wipe_all).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WipeReport {
    pub tables: Vec<(&'static str, u64)>,
}

impl WipeReport {
    pub fn total(&self) -> u64 {
        self.tables.iter().map(|(_, n)| n).sum()
    }
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tables: Vec<(&'static str, i64)>,
}
