use super::schema::Database;
use super::types::{
    validate_account_id, AccountAggregate, AccountIdentity, AccountSync, DatabaseError,
    StoreResult,
};

const ACCOUNT_COLUMNS: &str =
    "account_id, completed, count, articles, total_count, nickname, avatar, create_time, update_time";

impl Database {
    // ========================================================================
    // Account Aggregate Operations
    // ========================================================================

    /// Merge a crawl-progress patch into the account's aggregate.
    ///
    /// Creates the record when absent (counters start at 0). When present,
    /// `count` and `articles` are added, `completed` and `total_count` replace
    /// the stored value when supplied, `nickname` and `avatar` replace it when
    /// non-empty, and `update_time` is set to now.
    ///
    /// The merge is a single `INSERT ... ON CONFLICT DO UPDATE` statement, so
    /// concurrent patches for one account serialize on SQLite's write lock and
    /// none is lost.
    pub async fn upsert_sync(&self, patch: &AccountSync) -> StoreResult<AccountAggregate> {
        validate_account_id(&patch.account_id)?;
        let now = chrono::Utc::now().timestamp();

        let sql = format!(
            r#"
            INSERT INTO accounts ({ACCOUNT_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                completed = COALESCE(?, accounts.completed),
                count = accounts.count + excluded.count,
                articles = accounts.articles + excluded.articles,
                total_count = COALESCE(?, accounts.total_count),
                nickname = CASE WHEN excluded.nickname <> '' THEN excluded.nickname ELSE accounts.nickname END,
                avatar = CASE WHEN excluded.avatar <> '' THEN excluded.avatar ELSE accounts.avatar END,
                update_time = excluded.update_time
            RETURNING {ACCOUNT_COLUMNS}
        "#
        );

        let merged = sqlx::query_as::<_, AccountAggregate>(&sql)
            .bind(&patch.account_id)
            .bind(patch.completed.unwrap_or(false))
            .bind(patch.count)
            .bind(patch.articles)
            .bind(patch.total_count.unwrap_or(0))
            .bind(patch.nickname.as_deref().unwrap_or(""))
            .bind(patch.avatar.as_deref().unwrap_or(""))
            .bind(now)
            .bind(now)
            .bind(patch.completed)
            .bind(patch.total_count)
            .fetch_one(&self.pool)
            .await?;

        tracing::debug!(
            account_id = %merged.account_id,
            count = merged.count,
            articles = merged.articles,
            total_count = merged.total_count,
            "Merged account sync patch"
        );
        Ok(merged)
    }

    /// Replace an account's identity fields and reset its crawl progress.
    ///
    /// Counters go back to 0, `completed` to false, and both timestamps to now,
    /// which is the state of a freshly created aggregate. Used by the bulk
    /// account-list import, independent of crawl-progress merging.
    pub async fn import_identity(&self, identity: &AccountIdentity) -> StoreResult<()> {
        validate_account_id(&identity.account_id)?;
        let now = chrono::Utc::now().timestamp();
        Self::import_identity_on(&self.pool, identity, now).await?;
        Ok(())
    }

    /// Apply [`import_identity`](Self::import_identity) to every entry in one
    /// transaction. Either all entries are imported or none is.
    ///
    /// Returns the number of accounts imported.
    pub async fn import_identities(&self, identities: &[AccountIdentity]) -> StoreResult<usize> {
        for identity in identities {
            validate_account_id(&identity.account_id)?;
        }
        if identities.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DatabaseError::transaction("import_identities"))?;
        for identity in identities {
            Self::import_identity_on(&mut *tx, identity, now)
                .await
                .map_err(DatabaseError::transaction("import_identities"))?;
        }
        tx.commit()
            .await
            .map_err(DatabaseError::transaction("import_identities"))?;

        tracing::info!(accounts = identities.len(), "Imported account list");
        Ok(identities.len())
    }

    async fn import_identity_on<'e, E>(
        executor: E,
        identity: &AccountIdentity,
        now: i64,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(&format!(
            r#"
            INSERT INTO accounts ({ACCOUNT_COLUMNS})
            VALUES (?, 0, 0, 0, 0, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                completed = 0,
                count = 0,
                articles = 0,
                total_count = 0,
                nickname = excluded.nickname,
                avatar = excluded.avatar,
                create_time = excluded.create_time,
                update_time = excluded.update_time
        "#
        ))
        .bind(&identity.account_id)
        .bind(&identity.nickname)
        .bind(&identity.avatar)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Get one account aggregate. `None` when the account was never stored.
    pub async fn get_account(&self, account_id: &str) -> StoreResult<Option<AccountAggregate>> {
        let account = sqlx::query_as::<_, AccountAggregate>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// All account aggregates, ordered by account id.
    pub async fn list_accounts(&self) -> StoreResult<Vec<AccountAggregate>> {
        let accounts = sqlx::query_as::<_, AccountAggregate>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY account_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{AccountIdentity, AccountSync, Database, DatabaseError};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn sync(account_id: &str, count: i64, articles: i64, total: i64) -> AccountSync {
        AccountSync {
            account_id: account_id.to_string(),
            count,
            articles,
            total_count: Some(total),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_missing_account_returns_none() {
        let db = test_db().await;
        assert!(db.get_account("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_creates_with_supplied_fields() {
        let db = test_db().await;
        let merged = db
            .upsert_sync(&AccountSync {
                account_id: "acct1".to_string(),
                count: 3,
                articles: 2,
                nickname: Some("Daily Notes".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(merged.count, 3);
        assert_eq!(merged.articles, 2);
        assert_eq!(merged.total_count, 0);
        assert!(!merged.completed);
        assert_eq!(merged.nickname, "Daily Notes");
        assert_eq!(merged.avatar, "");
        assert_eq!(db.get_account("acct1").await.unwrap(), Some(merged));
    }

    #[tokio::test]
    async fn test_upsert_twice_adds_counters_and_replaces_total() {
        let db = test_db().await;
        db.upsert_sync(&sync("acct1", 5, 5, 5)).await.unwrap();
        let merged = db.upsert_sync(&sync("acct1", 5, 5, 5)).await.unwrap();

        assert_eq!(merged.count, 10);
        assert_eq!(merged.articles, 10);
        assert_eq!(merged.total_count, 5);
    }

    #[tokio::test]
    async fn test_upsert_keeps_identity_when_patch_is_empty() {
        let db = test_db().await;
        db.upsert_sync(&AccountSync {
            account_id: "acct1".to_string(),
            nickname: Some("First".to_string()),
            avatar: Some("https://img.example.com/a.png".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let merged = db
            .upsert_sync(&AccountSync {
                account_id: "acct1".to_string(),
                nickname: Some(String::new()),
                avatar: None,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(merged.nickname, "First");
        assert_eq!(merged.avatar, "https://img.example.com/a.png");

        let merged = db
            .upsert_sync(&AccountSync {
                account_id: "acct1".to_string(),
                nickname: Some("Second".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(merged.nickname, "Second");
    }

    #[tokio::test]
    async fn test_upsert_completed_only_replaced_when_supplied() {
        let db = test_db().await;
        db.upsert_sync(&AccountSync {
            account_id: "acct1".to_string(),
            completed: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();

        let merged = db.upsert_sync(&sync("acct1", 1, 1, 9)).await.unwrap();
        assert!(merged.completed);
        assert_eq!(merged.total_count, 9);

        // total_count not supplied: keep the last value
        let merged = db
            .upsert_sync(&AccountSync {
                account_id: "acct1".to_string(),
                completed: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!merged.completed);
        assert_eq!(merged.total_count, 9);
    }

    #[tokio::test]
    async fn test_upsert_sets_update_time_not_create_time() {
        let db = test_db().await;
        db.upsert_sync(&sync("acct1", 1, 1, 1)).await.unwrap();
        sqlx::query("UPDATE accounts SET create_time = 100, update_time = 100")
            .execute(&db.pool)
            .await
            .unwrap();

        let merged = db.upsert_sync(&sync("acct1", 1, 1, 1)).await.unwrap();
        assert_eq!(merged.create_time, 100);
        assert!(merged.update_time > 100);
    }

    #[tokio::test]
    async fn test_upsert_rejects_missing_account_id() {
        let db = test_db().await;
        let result = db.upsert_sync(&AccountSync::default()).await;
        assert!(matches!(result, Err(DatabaseError::Validation(_))));
        assert!(db.list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let db = test_db().await;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.upsert_sync(&sync("acct1", 2, 1, 7)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let account = db.get_account("acct1").await.unwrap().unwrap();
        assert_eq!(account.count, 40);
        assert_eq!(account.articles, 20);
        assert_eq!(account.total_count, 7);
    }

    #[tokio::test]
    async fn test_import_identity_resets_progress() {
        let db = test_db().await;
        db.upsert_sync(&AccountSync {
            account_id: "acct1".to_string(),
            completed: Some(true),
            count: 12,
            articles: 10,
            total_count: Some(30),
            nickname: Some("Old".to_string()),
            avatar: Some("old.png".to_string()),
        })
        .await
        .unwrap();

        db.import_identity(&AccountIdentity {
            account_id: "acct1".to_string(),
            nickname: "New".to_string(),
            avatar: "new.png".to_string(),
        })
        .await
        .unwrap();

        let account = db.get_account("acct1").await.unwrap().unwrap();
        assert_eq!(account.nickname, "New");
        assert_eq!(account.avatar, "new.png");
        assert_eq!(account.count, 0);
        assert_eq!(account.articles, 0);
        assert_eq!(account.total_count, 0);
        assert!(!account.completed);
        assert_eq!(account.create_time, account.update_time);
    }

    #[tokio::test]
    async fn test_import_identities_bulk() {
        let db = test_db().await;
        let list: Vec<AccountIdentity> = (0..3)
            .map(|i| AccountIdentity {
                account_id: format!("acct{i}"),
                nickname: format!("Account {i}"),
                avatar: String::new(),
            })
            .collect();

        assert_eq!(db.import_identities(&list).await.unwrap(), 3);
        let accounts = db.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 3);
        assert_eq!(accounts[2].nickname, "Account 2");
    }

    #[tokio::test]
    async fn test_import_identities_rejects_whole_batch_on_invalid_entry() {
        let db = test_db().await;
        let list = vec![
            AccountIdentity {
                account_id: "acct1".to_string(),
                ..Default::default()
            },
            AccountIdentity::default(),
        ];

        let result = db.import_identities(&list).await;
        assert!(matches!(result, Err(DatabaseError::Validation(_))));
        assert!(db.get_account("acct1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_identities_rolls_back_on_storage_fault() {
        let db = test_db().await;
        sqlx::query(
            r#"
            CREATE TRIGGER fail_import BEFORE INSERT ON accounts
            WHEN NEW.account_id = 'broken'
            BEGIN SELECT RAISE(ABORT, 'injected fault'); END
        "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let list = vec![
            AccountIdentity {
                account_id: "acct1".to_string(),
                ..Default::default()
            },
            AccountIdentity {
                account_id: "broken".to_string(),
                ..Default::default()
            },
        ];
        let result = db.import_identities(&list).await;
        assert!(matches!(
            result,
            Err(DatabaseError::Transaction {
                op: "import_identities",
                ..
            })
        ));
        assert!(db.get_account("acct1").await.unwrap().is_none());
    }
}
