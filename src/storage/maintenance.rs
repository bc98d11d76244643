use super::schema::{Database, TABLES};
use super::types::{DatabaseError, StoreResult, StoreStats, WipeReport};

impl Database {
    // ========================================================================
    // Maintenance Operations
    // ========================================================================

    /// Delete every row of every table in one transaction.
    ///
    /// A failure part-way rolls back all tables, so the store is either fully
    /// cleared or unchanged.
    pub async fn wipe_all(&self) -> StoreResult<WipeReport> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DatabaseError::transaction("wipe_all"))?;

        let mut report = WipeReport::default();
        for table in TABLES {
            let result = sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::transaction("wipe_all"))?;
            report.tables.push((*table, result.rows_affected()));
        }

        tx.commit()
            .await
            .map_err(DatabaseError::transaction("wipe_all"))?;

        tracing::info!(rows = report.total(), "Wiped archive store");
        Ok(report)
    }

    /// Row count of every table, in schema order.
    pub async fn store_stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats::default();
        for table in TABLES {
            let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            stats.tables.push((*table, row.0));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{
        AccountSync, Article, BlobKind, BlobSnapshot, Database, DatabaseError,
        PROVISIONAL_ACCOUNT_ID,
    };

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    const PAGE: &str = "https://mp.example.com/s/1";

    async fn populate(db: &Database) {
        db.upsert_sync(&AccountSync {
            account_id: "acct1".to_string(),
            count: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        db.put_article(&Article {
            account_id: "acct1".to_string(),
            article_id: "1".to_string(),
            link: PAGE.to_string(),
            create_time: 1000,
            title: String::new(),
            content: serde_json::Value::Null,
            provisional_origin: false,
        })
        .await
        .unwrap();
        db.put_article(&Article {
            account_id: PROVISIONAL_ACCOUNT_ID.to_string(),
            article_id: "2".to_string(),
            link: "https://mp.example.com/s/2".to_string(),
            create_time: 900,
            title: String::new(),
            content: serde_json::Value::Null,
            provisional_origin: false,
        })
        .await
        .unwrap();
        for kind in [BlobKind::Html, BlobKind::Asset] {
            db.put_blob(kind, &BlobSnapshot::new(PAGE, "acct1", "t", b"x".to_vec()))
                .await
                .unwrap();
        }
        db.put_resource_map(PAGE, &["https://cdn.example.com/a.png".to_string()])
            .await
            .unwrap();
        db.put_comment(PAGE, &serde_json::json!([])).await.unwrap();
        db.put_comment_reply(PAGE, "1", &serde_json::json!([]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wipe_all_clears_every_table() {
        let db = test_db().await;
        populate(&db).await;

        let report = db.wipe_all().await.unwrap();
        assert_eq!(report.total(), 8);

        assert!(db.get_account("acct1").await.unwrap().is_none());
        assert!(db.get_article_by_link(PAGE).await.unwrap().is_none());
        assert!(db.get_blob(BlobKind::Html, PAGE).await.unwrap().is_none());
        assert!(db.get_blob(BlobKind::Asset, PAGE).await.unwrap().is_none());
        assert!(db.get_resource_map(PAGE).await.unwrap().is_none());
        assert!(db
            .get_comment::<serde_json::Value>(PAGE)
            .await
            .unwrap()
            .is_none());
        assert!(db
            .get_comment_reply::<serde_json::Value>(PAGE, "1")
            .await
            .unwrap()
            .is_none());

        let stats = db.store_stats().await.unwrap();
        assert!(stats.tables.iter().all(|(_, n)| *n == 0));
    }

    #[tokio::test]
    async fn test_wipe_all_on_empty_store() {
        let db = test_db().await;
        assert_eq!(db.wipe_all().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_failed_wipe_leaves_store_unchanged() {
        let db = test_db().await;
        populate(&db).await;
        sqlx::query(
            r#"
            CREATE TRIGGER fail_wipe BEFORE DELETE ON comments
            BEGIN SELECT RAISE(ABORT, 'injected fault'); END
        "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let result = db.wipe_all().await;
        assert!(matches!(
            result,
            Err(DatabaseError::Transaction { op: "wipe_all", .. })
        ));

        // Tables cleared before the fault were rolled back
        assert!(db.get_account("acct1").await.unwrap().is_some());
        assert!(db.get_article_by_link(PAGE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_stats_counts_rows() {
        let db = test_db().await;
        populate(&db).await;
        let stats = db.store_stats().await.unwrap();
        let articles = stats
            .tables
            .iter()
            .find(|(t, _)| *t == "articles")
            .map(|(_, n)| *n);
        assert_eq!(articles, Some(2));
    }
}
