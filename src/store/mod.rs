//! Local authoritative index: content store, VFS index, bucket registry,
//! and the durable state layer underneath them.
//!
//! The [`ContentStore`](content::ContentStore) is the single mutation
//! entry point for pins; everything else here is derived from it or
//! persists it.

pub mod bucket;
pub mod content;
pub mod state;
pub mod vfs;

pub use bucket::{Bucket, BucketLayout, BucketRegistry};
pub use content::ContentStore;
pub use state::StateStore;
pub use vfs::{VfsEntry, VfsIndex};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("bucket '{0}' not found")]
    BucketNotFound(String),
    #[error("bucket '{0}' already exists")]
    BucketExists(String),
    #[error("bucket '{0}' is not empty")]
    BucketNotEmpty(String),
    #[error("no pin at {bucket}:{path}")]
    PathNotFound { bucket: String, path: String },
    #[error("pin {0} not found")]
    PinNotFound(String),
    #[error("state store error: {0}")]
    State(String),
    #[error("corrupt state record: {0}")]
    CorruptRecord(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::State(e.to_string())
    }
}
