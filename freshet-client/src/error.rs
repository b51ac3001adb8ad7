//! Error types for freshet clients.

use freshet_core::FreshetError;
use freshet_storage::LmdbCacheError;

use crate::config::ClientConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ClientConfigError),
    #[error(transparent)]
    Freshet(#[from] FreshetError),
    #[error("Cache store error: {0}")]
    Cache(#[from] LmdbCacheError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for client setup operations.
pub type ClientResult<T> = Result<T, ClientError>;
