mod accounts;
mod articles;
mod jobs;
mod maintenance;
mod schema;
mod side_channel;
mod snapshots;
mod types;

pub use jobs::{ExportJobRecord, JobDeletion, JobStatus};
pub use schema::{Database, DatabaseOptions};
pub use side_channel::{reply_key, REPLY_KEY_SEPARATOR};
pub use types::{
    AccountAggregate, AccountIdentity, AccountSync, Article, ArticleKey, BlobKind, BlobSnapshot,
    DatabaseError, RemapOutcome, StoreResult, StoreStats, WipeReport, PROVISIONAL_ACCOUNT_ID,
};
