use super::schema::Database;
use super::types::{BlobKind, BlobRow, BlobSnapshot, DatabaseError, StoreResult};
use crate::util::canonical_url;

/// Canonicalize a snapshot or side-channel URL, mapping failures to
/// `Validation`. Only the fragment is dropped; the query is part of the key.
pub(crate) fn resource_url(url: &str) -> StoreResult<String> {
    canonical_url(url).map_err(|e| DatabaseError::validation(format!("{e}: '{url}'")))
}

impl Database {
    // ========================================================================
    // Blob Snapshot Operations (HTML pages, assets)
    // ========================================================================

    /// Store a binary snapshot, replacing any previous one for the same URL.
    ///
    /// The URL loses its fragment but keeps its query; the payload is stored
    /// as-is and never inspected. `snapshot.updated_at` is ignored and set to
    /// now. Page snapshots that export jobs should find are keyed by the
    /// article's stored [`link`](crate::storage::Article::link).
    pub async fn put_blob(&self, kind: BlobKind, snapshot: &BlobSnapshot) -> StoreResult<()> {
        let url = resource_url(&snapshot.url)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(&format!(
            r#"
            INSERT OR REPLACE INTO {}
                (url, account_id, title, payload, side_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
        "#,
            kind.table()
        ))
        .bind(&url)
        .bind(&snapshot.account_id)
        .bind(&snapshot.title)
        .bind(&snapshot.payload)
        .bind(&snapshot.side_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            table = kind.table(),
            url = %url,
            size_bytes = snapshot.payload.len(),
            "Stored blob snapshot"
        );
        Ok(())
    }

    /// Get a snapshot with its metadata. `None` when nothing is stored.
    pub async fn get_blob(&self, kind: BlobKind, url: &str) -> StoreResult<Option<BlobSnapshot>> {
        let url = resource_url(url)?;
        let row = sqlx::query_as::<_, BlobRow>(&format!(
            "SELECT url, account_id, title, payload, side_id, updated_at FROM {} WHERE url = ?",
            kind.table()
        ))
        .bind(&url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BlobRow::into_snapshot))
    }

    /// Delete a snapshot. Absent rows are not an error.
    ///
    /// Returns whether a row was removed.
    pub async fn delete_blob(&self, kind: BlobKind, url: &str) -> StoreResult<bool> {
        let url = resource_url(url)?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE url = ?", kind.table()))
            .bind(&url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{BlobKind, BlobSnapshot, Database, DatabaseError};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn html(url: &str, body: &[u8]) -> BlobSnapshot {
        BlobSnapshot::new(url, "acct1", "Page title", body.to_vec())
    }

    #[tokio::test]
    async fn test_put_get_is_byte_identical() {
        let db = test_db().await;
        let payload: Vec<u8> = (0..=255u8).chain([0, 0, 0xff]).collect();
        let snapshot = BlobSnapshot::new("https://cdn.example.com/a.png", "acct1", "", payload)
            .with_side_id("asset-7");
        db.put_blob(BlobKind::Asset, &snapshot).await.unwrap();

        let stored = db
            .get_blob(BlobKind::Asset, "https://cdn.example.com/a.png")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload, snapshot.payload);
        assert_eq!(stored.side_id.as_deref(), Some("asset-7"));
        assert_eq!(stored.account_id, "acct1");
        assert!(stored.updated_at > 0);
    }

    #[tokio::test]
    async fn test_put_replaces_on_conflict() {
        let db = test_db().await;
        db.put_blob(BlobKind::Html, &html("https://mp.example.com/s/1", b"<p>old</p>"))
            .await
            .unwrap();
        db.put_blob(BlobKind::Html, &html("https://mp.example.com/s/1", b"<p>new</p>"))
            .await
            .unwrap();

        let stored = db
            .get_blob(BlobKind::Html, "https://mp.example.com/s/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload, b"<p>new</p>".to_vec());
        assert!(stored.side_id.is_none());
    }

    #[tokio::test]
    async fn test_kinds_are_separate_tables() {
        let db = test_db().await;
        db.put_blob(BlobKind::Html, &html("https://mp.example.com/s/1", b"page"))
            .await
            .unwrap();
        assert!(db
            .get_blob(BlobKind::Asset, "https://mp.example.com/s/1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_url_is_canonicalized() {
        let db = test_db().await;
        db.put_blob(BlobKind::Html, &html("https://MP.example.com/s/1#rd", b"page"))
            .await
            .unwrap();
        let stored = db
            .get_blob(BlobKind::Html, "https://mp.example.com/s/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.url, "https://mp.example.com/s/1");
    }

    #[tokio::test]
    async fn test_assets_differing_by_query_are_distinct() {
        let db = test_db().await;
        let v1 = "https://cdn.example.com/app.css?version=1";
        let v2 = "https://cdn.example.com/app.css?version=2";
        db.put_blob(BlobKind::Asset, &html(v1, b"v1")).await.unwrap();
        db.put_blob(BlobKind::Asset, &html(v2, b"v2")).await.unwrap();

        let first = db.get_blob(BlobKind::Asset, v1).await.unwrap().unwrap();
        let second = db.get_blob(BlobKind::Asset, v2).await.unwrap().unwrap();
        assert_eq!(first.payload, b"v1".to_vec());
        assert_eq!(first.url, v1);
        assert_eq!(second.payload, b"v2".to_vec());
    }

    #[tokio::test]
    async fn test_delete_is_unconditional() {
        let db = test_db().await;
        let url = "https://mp.example.com/s/1";
        assert!(!db.delete_blob(BlobKind::Html, url).await.unwrap());

        db.put_blob(BlobKind::Html, &html(url, b"page")).await.unwrap();
        assert!(db.delete_blob(BlobKind::Html, url).await.unwrap());
        assert!(db.get_blob(BlobKind::Html, url).await.unwrap().is_none());
        assert!(!db.delete_blob(BlobKind::Html, url).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_payload_round_trips() {
        let db = test_db().await;
        let url = "https://cdn.example.com/empty";
        db.put_blob(BlobKind::Asset, &html(url, b"")).await.unwrap();
        let stored = db.get_blob(BlobKind::Asset, url).await.unwrap().unwrap();
        assert!(stored.payload.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let db = test_db().await;
        assert!(matches!(
            db.put_blob(BlobKind::Html, &html("relative/path", b"x")).await,
            Err(DatabaseError::Validation(_))
        ));
    }
}
