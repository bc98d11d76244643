//! Export job pipeline boundary.
//!
//! Jobs take a list of article links and a target format, resolve every link
//! against the local archive (never the external source), hand the resolved
//! bundle to the [`Renderer`] registered for the format and write the result
//! to the export directory. Rendering itself belongs to the renderers; this
//! module owns validation, job bookkeeping and background execution.

mod jobs;

pub use jobs::{ExportJobs, JobEvent, JobOutcome};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::storage::{AccountAggregate, Article, BlobSnapshot, DatabaseError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unsupported export format '{0}' (expected one of html, excel, json, txt, markdown, word)")]
    UnsupportedFormat(String),

    #[error("Invalid export request: {0}")]
    Validation(String),

    /// The job exists but belongs to a different user.
    #[error("Export job {0} belongs to another user")]
    Forbidden(JobId),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

// ============================================================================
// Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Html,
    Excel,
    Json,
    Txt,
    Markdown,
    Word,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 6] = [
        ExportFormat::Html,
        ExportFormat::Excel,
        ExportFormat::Json,
        ExportFormat::Txt,
        ExportFormat::Markdown,
        ExportFormat::Word,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Html => "html",
            ExportFormat::Excel => "excel",
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
            ExportFormat::Markdown => "markdown",
            ExportFormat::Word => "word",
        }
    }

    /// File extension of the rendered output.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Html => "html",
            ExportFormat::Excel => "xlsx",
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
            ExportFormat::Markdown => "md",
            ExportFormat::Word => "docx",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ExportError::UnsupportedFormat(s.to_string()))
    }
}

/// Identifier of a persisted export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Rendering boundary
// ============================================================================

/// One resolved article with its HTML snapshot, when one is archived.
#[derive(Debug, Clone)]
pub struct ExportItem {
    pub article: Article,
    pub html: Option<BlobSnapshot>,
}

/// Everything a renderer gets. Items follow the order of the requested links.
#[derive(Debug, Clone)]
pub struct ExportBundle {
    pub job_id: JobId,
    pub format: ExportFormat,
    pub account: Option<AccountAggregate>,
    pub items: Vec<ExportItem>,
}

/// Turns a resolved bundle into the bytes of one output file.
///
/// Called on a blocking thread; implementations may do CPU-heavy work.
pub trait Renderer: Send + Sync {
    fn render(&self, bundle: &ExportBundle) -> anyhow::Result<Vec<u8>>;
}

/// Built-in renderer for [`ExportFormat::Json`]: account metadata and the
/// stored article values, pretty-printed.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

#[derive(Serialize)]
struct JsonExport<'a> {
    job_id: JobId,
    account: Option<&'a AccountAggregate>,
    articles: Vec<&'a Article>,
}

impl Renderer for JsonRenderer {
    fn render(&self, bundle: &ExportBundle) -> anyhow::Result<Vec<u8>> {
        let doc = JsonExport {
            job_id: bundle.job_id,
            account: bundle.account.as_ref(),
            articles: bundle.items.iter().map(|i| &i.article).collect(),
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }
}
