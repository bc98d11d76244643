use std::fmt;
use std::str::FromStr;

use super::schema::Database;
use super::types::{DatabaseError, StoreResult};

/// Lifecycle of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DatabaseError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Persisted export job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJobRecord {
    pub id: i64,
    pub user_id: String,
    pub format: String,
    pub links: Vec<String>,
    pub account_id: Option<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub output_path: Option<String>,
    /// Hex SHA-256 of the written output.
    pub digest: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    user_id: String,
    format: String,
    links: String,
    account_id: Option<String>,
    status: String,
    error: Option<String>,
    output_path: Option<String>,
    digest: Option<String>,
    created_at: i64,
    finished_at: Option<i64>,
}

impl JobRow {
    fn into_record(self) -> StoreResult<ExportJobRecord> {
        Ok(ExportJobRecord {
            id: self.id,
            user_id: self.user_id,
            format: self.format,
            links: serde_json::from_str(&self.links)?,
            account_id: self.account_id,
            status: self.status.parse()?,
            error: self.error,
            output_path: self.output_path,
            digest: self.digest,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}

/// Outcome of a user-scoped job deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDeletion {
    /// The row is gone. `output_path` is the path it held at deletion time.
    Deleted { output_path: Option<String> },
    /// No job with that id exists (already deleted or never created).
    Absent,
    /// The job belongs to another user; nothing was deleted.
    NotOwner,
}

impl Database {
    // ========================================================================
    // Export Job Operations
    // ========================================================================

    /// Persist a new `pending` job and return its id.
    pub async fn insert_export_job(
        &self,
        user_id: &str,
        format: &str,
        links: &[String],
        account_id: Option<&str>,
    ) -> StoreResult<i64> {
        let links = serde_json::to_string(links)?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO export_jobs (user_id, format, links, account_id, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(user_id)
        .bind(format)
        .bind(&links)
        .bind(account_id)
        .bind(JobStatus::Pending.as_str())
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_export_job(&self, id: i64) -> StoreResult<Option<ExportJobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, user_id, format, links, account_id, status, error,
                   output_path, digest, created_at, finished_at
            FROM export_jobs
            WHERE id = ?
        "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_record).transpose()
    }

    /// Move a job to `status`. Finished statuses also stamp `finished_at`.
    ///
    /// Jobs that are already finished are left alone, so a late update from a
    /// cancelled task cannot overwrite the recorded outcome. Returns whether a
    /// row changed.
    pub async fn set_export_job_status(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let finished_at = status
            .is_finished()
            .then(|| chrono::Utc::now().timestamp());
        let result = sqlx::query(
            r#"
            UPDATE export_jobs SET status = ?, error = ?, finished_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(finished_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a successful export.
    pub async fn complete_export_job(
        &self,
        id: i64,
        output_path: &str,
        digest: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = ?, output_path = ?, digest = ?, error = NULL, finished_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
        "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(output_path)
        .bind(digest)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a job on behalf of `user_id`.
    ///
    /// The ownership check is part of the `DELETE`, so a job is never removed
    /// for a user that does not own it. The output path is read by the same
    /// statement, so a completion recorded just before the delete is not
    /// missed.
    pub async fn delete_export_job(&self, user_id: &str, id: i64) -> StoreResult<JobDeletion> {
        let deleted: Option<(Option<String>,)> = sqlx::query_as(
            "DELETE FROM export_jobs WHERE id = ? AND user_id = ? RETURNING output_path",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((output_path,)) = deleted {
            return Ok(JobDeletion::Deleted { output_path });
        }

        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM export_jobs WHERE id = ?)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(if exists.0 {
            JobDeletion::NotOwner
        } else {
            JobDeletion::Absent
        })
    }
}
