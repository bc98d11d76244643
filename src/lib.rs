//! Local archive of account-scoped article feeds.
//!
//! The [`storage::Database`] handle owns every persistent store: account crawl
//! progress, articles (with cursor pagination and provisional identity
//! remapping), HTML/asset snapshots and comment side channels. The
//! [`export`] module runs export jobs against that archive.

pub mod config;
pub mod export;
pub mod storage;
pub mod util;
