//! Utility functions shared by the stores and the export pipeline.
//!
//! - **Link canonicalization**: article links drop share/visit parameters,
//!   snapshot and side-channel URLs only drop the fragment
//!
//! # Examples
//!
//! ```
//! use feedvault::util::{canonical_article_link, canonical_url};
//!
//! let link = canonical_article_link("https://example.com/s/abc?scene=1#rd").unwrap();
//! assert_eq!(link, "https://example.com/s/abc");
//!
//! let asset = canonical_url("https://cdn.example.com/a.js?version=3#x").unwrap();
//! assert_eq!(asset, "https://cdn.example.com/a.js?version=3");
//! ```

mod link;

pub use link::{canonical_article_link, canonical_url, LinkError};
