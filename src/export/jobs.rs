use anyhow::Context;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ExportBundle, ExportError, ExportFormat, ExportItem, JobId, JsonRenderer, Renderer,
};
use crate::storage::{
    BlobKind, Database, ExportJobRecord, JobDeletion, JobStatus,
};
use crate::util::canonical_article_link;

/// How a background job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { path: PathBuf, digest: String },
    Failed(String),
    Cancelled,
}

/// Completion notice sent on the events channel once per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub outcome: JobOutcome,
}

/// Creates, runs and deletes export jobs.
///
/// `create_job` returns as soon as the job row exists; the job runs on its own
/// task. Failures are recorded on the job row, logged and reported as a
/// [`JobEvent`], never returned to the caller that created the job.
#[derive(Clone)]
pub struct ExportJobs {
    db: Database,
    output_dir: PathBuf,
    renderers: HashMap<ExportFormat, Arc<dyn Renderer>>,
    events: mpsc::Sender<JobEvent>,
    running: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl ExportJobs {
    /// New pipeline writing into `output_dir`, with [`JsonRenderer`] registered
    /// for `json`.
    pub fn new(db: Database, output_dir: impl Into<PathBuf>, events: mpsc::Sender<JobEvent>) -> Self {
        let mut renderers: HashMap<ExportFormat, Arc<dyn Renderer>> = HashMap::new();
        renderers.insert(ExportFormat::Json, Arc::new(JsonRenderer));
        Self {
            db,
            output_dir: output_dir.into(),
            renderers,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register (or replace) the renderer for a format.
    pub fn with_renderer(mut self, format: ExportFormat, renderer: Arc<dyn Renderer>) -> Self {
        self.renderers.insert(format, renderer);
        self
    }

    /// Validate the request, persist the job and start it in the background.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` or `Validation` before anything is stored;
    /// `Storage` if the job row could not be written.
    pub async fn create_job(
        &self,
        user_id: &str,
        format: &str,
        links: &[String],
        account_id: Option<&str>,
    ) -> Result<JobId, ExportError> {
        if user_id.trim().is_empty() {
            return Err(ExportError::Validation("user id is required".to_string()));
        }
        let format: ExportFormat = format.parse()?;
        if links.is_empty() {
            return Err(ExportError::Validation(
                "at least one article link is required".to_string(),
            ));
        }
        for link in links {
            canonical_article_link(link)
                .map_err(|e| ExportError::Validation(format!("{e}: '{link}'")))?;
        }
        let account_id = account_id.filter(|a| !a.is_empty());

        let id = JobId(
            self.db
                .insert_export_job(user_id, format.as_str(), links, account_id)
                .await?,
        );

        let token = self.shutdown.child_token();
        self.running_jobs().insert(id, token.clone());

        let pipeline = self.clone();
        let links = links.to_vec();
        let account_id = account_id.map(str::to_string);
        tokio::spawn(async move {
            pipeline.run(id, format, links, account_id, token).await;
        });

        tracing::info!(job_id = %id, user_id = %user_id, format = %format, "Export job created");
        Ok(id)
    }

    /// Delete a job owned by `user_id`, cancelling it if it is still running.
    ///
    /// Returns `Ok(false)` when the job does not exist, so repeated deletes
    /// succeed. An output file recorded before the delete is removed here; a
    /// task that finishes writing after the delete removes its own file.
    ///
    /// # Errors
    ///
    /// `Forbidden` when the job belongs to another user; nothing is changed.
    pub async fn delete_job(&self, user_id: &str, job_id: JobId) -> Result<bool, ExportError> {
        let output_path = match self.db.delete_export_job(user_id, job_id.0).await? {
            JobDeletion::Deleted { output_path } => output_path,
            JobDeletion::Absent => return Ok(false),
            JobDeletion::NotOwner => {
                tracing::warn!(job_id = %job_id, user_id = %user_id, "Rejected cross-user job deletion");
                return Err(ExportError::Forbidden(job_id));
            }
        };

        if let Some(token) = self.running_jobs().remove(&job_id) {
            token.cancel();
        }
        if let Some(path) = output_path.as_deref() {
            remove_output(Path::new(path)).await;
        }

        tracing::info!(job_id = %job_id, "Export job deleted");
        Ok(true)
    }

    /// Current state of a job.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<ExportJobRecord>, ExportError> {
        Ok(self.db.get_export_job(job_id.0).await?)
    }

    /// Cancel every job still running. Used at shutdown.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    fn running_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        // A panic while holding the lock cannot leave the map inconsistent
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn output_path(&self, id: JobId, format: ExportFormat) -> PathBuf {
        self.output_dir.join(format!("{id}.{}", format.extension()))
    }

    async fn run(
        self,
        id: JobId,
        format: ExportFormat,
        links: Vec<String>,
        account_id: Option<String>,
        token: CancellationToken,
    ) {
        let rendered = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.prepare(id, format, &links, account_id.as_deref()) => Some(result),
        };

        // Nothing touches the output directory until rendering is done and
        // the job is still wanted; the write itself is never interrupted.
        let outcome = match rendered {
            None => JobOutcome::Cancelled,
            Some(Err(e)) => JobOutcome::Failed(format!("{e:#}")),
            Some(Ok(_)) if token.is_cancelled() => JobOutcome::Cancelled,
            Some(Ok(bytes)) => match self.write_output(id, format, &bytes).await {
                Ok((path, digest)) => JobOutcome::Completed { path, digest },
                Err(e) => JobOutcome::Failed(format!("{e:#}")),
            },
        };
        self.running_jobs().remove(&id);

        let outcome = self.record(id, outcome).await;
        let _ = self.events.send(JobEvent { job_id: id, outcome }).await;
    }

    /// Persist the outcome on the job row and return what actually happened.
    ///
    /// A completed job whose row is gone by the time it is recorded was
    /// deleted mid-write: its output is removed and it counts as cancelled.
    async fn record(&self, id: JobId, outcome: JobOutcome) -> JobOutcome {
        let (outcome, recorded) = match outcome {
            JobOutcome::Completed { path, digest } => {
                match self
                    .db
                    .complete_export_job(id.0, &path.to_string_lossy(), &digest)
                    .await
                {
                    Ok(true) => {
                        tracing::info!(job_id = %id, path = %path.display(), "Export job completed");
                        return JobOutcome::Completed { path, digest };
                    }
                    Ok(false) => {
                        tracing::info!(job_id = %id, "Export job removed while writing, discarding output");
                        remove_output(&path).await;
                        return JobOutcome::Cancelled;
                    }
                    Err(e) => (JobOutcome::Completed { path, digest }, Err(e)),
                }
            }
            JobOutcome::Failed(error) => {
                tracing::warn!(job_id = %id, error = %error, "Export job failed");
                let recorded = self
                    .db
                    .set_export_job_status(id.0, JobStatus::Failed, Some(&error))
                    .await;
                (JobOutcome::Failed(error), recorded)
            }
            JobOutcome::Cancelled => {
                tracing::info!(job_id = %id, "Export job cancelled");
                let recorded = self
                    .db
                    .set_export_job_status(id.0, JobStatus::Cancelled, None)
                    .await;
                (JobOutcome::Cancelled, recorded)
            }
        };
        if let Err(e) = recorded {
            tracing::warn!(job_id = %id, error = %e, "Failed to record export job outcome");
        }
        outcome
    }

    /// Mark the job running, resolve its links and render the bundle.
    async fn prepare(
        &self,
        id: JobId,
        format: ExportFormat,
        links: &[String],
        account_id: Option<&str>,
    ) -> anyhow::Result<Vec<u8>> {
        self.db
            .set_export_job_status(id.0, JobStatus::Running, None)
            .await?;

        let renderer = self
            .renderers
            .get(&format)
            .cloned()
            .with_context(|| format!("no renderer registered for format '{format}'"))?;

        let bundle = self.resolve(id, format, links, account_id).await?;
        tracing::debug!(job_id = %id, items = bundle.items.len(), "Resolved export bundle");

        tokio::task::spawn_blocking(move || renderer.render(&bundle))
            .await
            .context("renderer task panicked")?
    }

    /// Write `<output_dir>/<id>.<ext>` and return its path and hex SHA-256.
    async fn write_output(
        &self,
        id: JobId,
        format: ExportFormat,
        bytes: &[u8],
    ) -> anyhow::Result<(PathBuf, String)> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        let path = self.output_path(id, format);
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            remove_output(&path).await;
            return Err(anyhow::Error::new(e).context(format!("writing {}", path.display())));
        }

        let digest = format!("{:x}", Sha256::digest(bytes));
        Ok((path, digest))
    }

    /// Load every requested article from the archive. Links that are not
    /// archived fail the job; nothing is fetched from the external source.
    async fn resolve(
        &self,
        id: JobId,
        format: ExportFormat,
        links: &[String],
        account_id: Option<&str>,
    ) -> anyhow::Result<ExportBundle> {
        let found = self.db.articles_by_links(links).await?;

        let missing: Vec<&str> = links
            .iter()
            .zip(&found)
            .filter(|(_, article)| article.is_none())
            .map(|(link, _)| link.as_str())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "{} of {} links are not archived: {}",
                missing.len(),
                links.len(),
                missing.join(", ")
            );
        }

        let mut items = Vec::with_capacity(found.len());
        for article in found.into_iter().flatten() {
            let html = self.db.get_blob(BlobKind::Html, &article.link).await?;
            items.push(ExportItem { article, html });
        }

        let account = match account_id {
            Some(account_id) => self.db.get_account(account_id).await?,
            None => None,
        };

        Ok(ExportBundle {
            job_id: id,
            format,
            account,
            items,
        })
    }
}

async fn remove_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed export output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove export output"),
    }
}
