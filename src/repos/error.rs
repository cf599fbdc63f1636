/*
 * Responsibility
 * - The meaning repos pass up: the store failed, or a record could not be read
 */
use thiserror::Error;

use crate::services::cache::CacheError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("store error: {0}")]
    Store(#[from] CacheError),

    #[error("malformed record at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

pub type RepoResult<T> = Result<T, RepoError>;
