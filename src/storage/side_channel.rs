use serde::{de::DeserializeOwned, Serialize};

use super::schema::Database;
use super::snapshots::resource_url;
use super::types::{DatabaseError, StoreResult};

/// Separator of the display form of a comment-reply key. Rejected inside
/// either key component, so the display form is unambiguous.
pub const REPLY_KEY_SEPARATOR: char = '\u{1f}';

/// Display form of a comment-reply key: `url + U+001F + content_id`.
pub fn reply_key(url: &str, content_id: &str) -> String {
    format!("{url}{REPLY_KEY_SEPARATOR}{content_id}")
}

impl Database {
    // ========================================================================
    // Resource Maps
    // ========================================================================

    /// Store the ordered list of resource URLs referenced by a page.
    pub async fn put_resource_map(&self, url: &str, resources: &[String]) -> StoreResult<()> {
        let url = resource_url(url)?;
        let encoded = serde_json::to_string(resources)?;
        sqlx::query(
            r#"
            INSERT INTO resource_maps (url, resources, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET resources = excluded.resources, updated_at = excluded.updated_at
        "#,
        )
        .bind(&url)
        .bind(&encoded)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_resource_map(&self, url: &str) -> StoreResult<Option<Vec<String>>> {
        let url = resource_url(url)?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT resources FROM resource_maps WHERE url = ?")
                .bind(&url)
                .fetch_optional(&self.pool)
                .await?;
        decode(row)
    }

    // ========================================================================
    // Comments
    // ========================================================================

    /// Store the comment payload of an article page.
    pub async fn put_comment<T: Serialize>(&self, url: &str, payload: &T) -> StoreResult<()> {
        let url = resource_url(url)?;
        let encoded = serde_json::to_string(payload)?;
        sqlx::query(
            r#"
            INSERT INTO comments (url, payload, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
        "#,
        )
        .bind(&url)
        .bind(&encoded)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_comment<T: DeserializeOwned>(&self, url: &str) -> StoreResult<Option<T>> {
        let url = resource_url(url)?;
        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM comments WHERE url = ?")
            .bind(&url)
            .fetch_optional(&self.pool)
            .await?;
        decode(row)
    }

    // ========================================================================
    // Comment Replies
    // ========================================================================

    /// Store the replies to one comment, keyed by page URL and comment content id.
    pub async fn put_comment_reply<T: Serialize>(
        &self,
        url: &str,
        content_id: &str,
        payload: &T,
    ) -> StoreResult<()> {
        let (url, content_id) = reply_components(url, content_id)?;
        let encoded = serde_json::to_string(payload)?;
        sqlx::query(
            r#"
            INSERT INTO comment_replies (url, content_id, payload, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(url, content_id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
        "#,
        )
        .bind(&url)
        .bind(content_id)
        .bind(&encoded)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_comment_reply<T: DeserializeOwned>(
        &self,
        url: &str,
        content_id: &str,
    ) -> StoreResult<Option<T>> {
        let (url, content_id) = reply_components(url, content_id)?;
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM comment_replies WHERE url = ? AND content_id = ?",
        )
        .bind(&url)
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;
        decode(row)
    }
}

fn reply_components<'a>(url: &str, content_id: &'a str) -> StoreResult<(String, &'a str)> {
    if content_id.is_empty() {
        return Err(DatabaseError::validation("comment content id is required"));
    }
    if url.contains(REPLY_KEY_SEPARATOR) || content_id.contains(REPLY_KEY_SEPARATOR) {
        return Err(DatabaseError::validation(
            "comment reply key components must not contain U+001F",
        ));
    }
    Ok((resource_url(url)?, content_id))
}

fn decode<T: DeserializeOwned>(row: Option<(String,)>) -> StoreResult<Option<T>> {
    row.map(|(payload,)| serde_json::from_str(&payload))
        .transpose()
        .map_err(DatabaseError::from)
}
