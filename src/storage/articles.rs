use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::types::{
    validate_account_id, Article, ArticleKey, DatabaseError, RemapOutcome, StoreResult,
    PROVISIONAL_ACCOUNT_ID,
};
use crate::util::canonical_article_link;

/// Canonicalize a caller-supplied link, mapping failures to `Validation`.
fn article_link(link: &str) -> StoreResult<String> {
    canonical_article_link(link).map_err(|e| DatabaseError::validation(format!("{e}: '{link}'")))
}

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Store an article under `article.key()`, replacing any previous version.
    ///
    /// The link is canonicalized before writing. `link` is unique, so a row
    /// under a different key with the same link is replaced as well: a link
    /// never maps to two records.
    ///
    /// A provisional article whose link is already stored under a resolved
    /// account is not written, so resolved content is never demoted back to
    /// the provisional namespace. Returns whether the article was written.
    pub async fn put_article(&self, article: &Article) -> StoreResult<bool> {
        article.key().validate()?;
        let mut article = article.clone();
        article.link = article_link(&article.link)?;
        let payload = serde_json::to_string(&article)?;
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT OR REPLACE INTO articles
                (key, account_id, article_id, link, create_time, provisional_origin, payload, updated_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT (? AND EXISTS (
                SELECT 1 FROM articles WHERE link = ? AND account_id <> ?
            ))
        "#,
        )
        .bind(article.key().to_string())
        .bind(&article.account_id)
        .bind(&article.article_id)
        .bind(&article.link)
        .bind(article.create_time)
        .bind(article.provisional_origin)
        .bind(&payload)
        .bind(now)
        .bind(article.is_provisional())
        .bind(&article.link)
        .bind(PROVISIONAL_ACCOUNT_ID)
        .execute(&self.pool)
        .await?;

        let written = result.rows_affected() > 0;
        if !written {
            tracing::debug!(
                link = %article.link,
                "Skipped provisional article: link already belongs to a resolved account"
            );
        }
        Ok(written)
    }

    /// Point lookup by primary key.
    pub async fn get_article(&self, key: &ArticleKey) -> StoreResult<Option<Article>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM articles WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        decode_optional(row)
    }

    /// Point lookup by link (canonicalized before lookup).
    pub async fn get_article_by_link(&self, link: &str) -> StoreResult<Option<Article>> {
        let link = article_link(link)?;
        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM articles WHERE link = ?")
            .bind(&link)
            .fetch_optional(&self.pool)
            .await?;
        decode_optional(row)
    }

    /// Batch lookup by link, for export jobs.
    ///
    /// Returns one entry per input link, in input order; `None` marks links
    /// with no stored article. Chunks at 500 links per query to stay under
    /// SQLite's bind-parameter limit.
    pub async fn articles_by_links(&self, links: &[String]) -> StoreResult<Vec<Option<Article>>> {
        if links.is_empty() {
            return Ok(Vec::new());
        }

        let canonical_links = links
            .iter()
            .map(|l| article_link(l))
            .collect::<StoreResult<Vec<_>>>()?;

        const CHUNK_SIZE: usize = 500;
        let mut found = std::collections::HashMap::with_capacity(links.len());

        for chunk in canonical_links.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT link, payload FROM articles WHERE link IN (");
            let mut separated = builder.separated(", ");
            for link in chunk {
                separated.push_bind(link);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String, String)> =
                builder.build_query_as().fetch_all(&self.pool).await?;
            for (link, payload) in rows {
                found.insert(link, serde_json::from_str::<Article>(&payload)?);
            }
        }

        Ok(canonical_links
            .iter()
            .map(|link| found.get(link).cloned())
            .collect())
    }

    // ========================================================================
    // Cursor Pagination
    // ========================================================================

    /// All articles of `account_id` with `create_time` strictly before the
    /// cursor, newest first.
    ///
    /// Ties on `create_time` are ordered by key, descending. Successive calls
    /// with the oldest `create_time` of the previous page as the next cursor
    /// walk the feed backward with no record returned twice.
    ///
    /// # Errors
    ///
    /// `Validation` when the account id or the cursor is missing.
    pub async fn cursor_page(
        &self,
        account_id: &str,
        before: Option<i64>,
    ) -> StoreResult<Vec<Article>> {
        let before = validate_cursor(account_id, before)?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT payload FROM articles
            WHERE account_id = ? AND create_time < ?
            ORDER BY create_time DESC, key DESC
        "#,
        )
        .bind(account_id)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(
            account_id = %account_id,
            before,
            returned = rows.len(),
            "cursor_page"
        );
        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(DatabaseError::from))
            .collect()
    }

    /// Whether [`cursor_page`](Self::cursor_page) would return anything. Lets a
    /// crawl stop once it reaches content that is already cached.
    pub async fn exists_before(&self, account_id: &str, before: Option<i64>) -> StoreResult<bool> {
        let before = validate_cursor(account_id, before)?;

        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM articles WHERE account_id = ? AND create_time < ?)",
        )
        .bind(account_id)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Identity Remap
    // ========================================================================

    /// Move the provisional article for `link` under `resolved_account_id`.
    ///
    /// Within one transaction the provisional row is deleted and re-inserted as
    /// `"<resolved_account_id>:<article_id>"` with its `account_id` updated and
    /// `provisional_origin` set. Any failure rolls the transaction back and the
    /// provisional row stays untouched.
    ///
    /// Calling again with the same account returns `AlreadyResolved` and
    /// changes nothing. When the resolved key is already stored under a
    /// different link, nothing changes either and `Conflict` names that link.
    pub async fn remap_identity(
        &self,
        link: &str,
        resolved_account_id: &str,
    ) -> StoreResult<RemapOutcome> {
        validate_account_id(resolved_account_id)?;
        if resolved_account_id == PROVISIONAL_ACCOUNT_ID {
            return Err(DatabaseError::validation(
                "cannot remap onto the provisional account",
            ));
        }
        let link = article_link(link)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DatabaseError::transaction("remap_identity"))?;

        let outcome = match remap_in_tx(&mut tx, &link, resolved_account_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Explicit rollback so the connection is clean before reuse
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed remap failed");
                }
                return Err(match e {
                    RemapError::Sql(source) => DatabaseError::Transaction {
                        op: "remap_identity",
                        source,
                    },
                    RemapError::Payload(e) => DatabaseError::Payload(e),
                });
            }
        };

        if let RemapOutcome::Conflict { key, existing_link } = &outcome {
            // Undo the delete: the provisional record stays where it was
            tx.rollback()
                .await
                .map_err(DatabaseError::transaction("remap_identity"))?;
            tracing::warn!(
                link = %link,
                key = %key,
                existing_link = %existing_link,
                "Remap refused: target key already stored under another link"
            );
            return Ok(outcome);
        }

        tx.commit()
            .await
            .map_err(DatabaseError::transaction("remap_identity"))?;

        match &outcome {
            RemapOutcome::Remapped(key) => {
                tracing::info!(link = %link, key = %key, "Remapped provisional article")
            }
            RemapOutcome::AlreadyResolved(key) => {
                tracing::debug!(link = %link, key = %key, "Remap skipped: already resolved")
            }
            RemapOutcome::NotFound => {
                tracing::debug!(link = %link, "Remap skipped: link not stored")
            }
            RemapOutcome::Conflict { .. } => {}
        }
        Ok(outcome)
    }
}

enum RemapError {
    Sql(sqlx::Error),
    Payload(serde_json::Error),
}

impl From<sqlx::Error> for RemapError {
    fn from(e: sqlx::Error) -> Self {
        RemapError::Sql(e)
    }
}

impl From<serde_json::Error> for RemapError {
    fn from(e: serde_json::Error) -> Self {
        RemapError::Payload(e)
    }
}

/// Body of [`Database::remap_identity`]. The delete comes first so the
/// transaction takes the write lock on its first statement; a `Conflict`
/// result leaves the delete for the caller to roll back.
async fn remap_in_tx(
    conn: &mut SqliteConnection,
    link: &str,
    resolved_account_id: &str,
) -> Result<RemapOutcome, RemapError> {
    let removed: Option<(String,)> = sqlx::query_as(
        "DELETE FROM articles WHERE link = ? AND account_id = ? RETURNING payload",
    )
    .bind(link)
    .bind(PROVISIONAL_ACCOUNT_ID)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((payload,)) = removed else {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT key FROM articles WHERE link = ?")
                .bind(link)
                .fetch_optional(&mut *conn)
                .await?;
        return Ok(match existing {
            Some((key,)) => match key.parse::<ArticleKey>() {
                Ok(key) => RemapOutcome::AlreadyResolved(key),
                Err(_) => RemapOutcome::NotFound,
            },
            None => RemapOutcome::NotFound,
        });
    };

    let mut article: Article = serde_json::from_str(&payload)?;
    article.account_id = resolved_account_id.to_string();
    article.provisional_origin = true;
    let key = article.key();

    let occupied: Option<(String,)> = sqlx::query_as("SELECT link FROM articles WHERE key = ?")
        .bind(key.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    if let Some((existing_link,)) = occupied {
        return Ok(RemapOutcome::Conflict { key, existing_link });
    }

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO articles
            (key, account_id, article_id, link, create_time, provisional_origin, payload, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
    "#,
    )
    .bind(key.to_string())
    .bind(&article.account_id)
    .bind(&article.article_id)
    .bind(&article.link)
    .bind(article.create_time)
    .bind(serde_json::to_string(&article)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(RemapOutcome::Remapped(key))
}

fn validate_cursor(account_id: &str, before: Option<i64>) -> StoreResult<i64> {
    if account_id.is_empty() {
        return Err(DatabaseError::validation("account id is required"));
    }
    before.ok_or_else(|| DatabaseError::validation("cursor timestamp is required"))
}

fn decode_optional(row: Option<(String,)>) -> StoreResult<Option<Article>> {
    row.map(|(payload,)| serde_json::from_str(&payload))
        .transpose()
        .map_err(DatabaseError::from)
}
