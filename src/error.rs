#![forbid(unsafe_code)]

//! Error taxonomy shared by the store and the session gate. The resolver has
//! no entry here because an unrecognized URL is a normal result.

use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// A required field is missing or malformed.
    #[error("invalid episode data: {0}")]
    Validation(String),

    /// Title or season/number pair already used by another episode.
    #[error("duplicate episode: {0}")]
    Duplicate(String),

    #[error("episode not found: {0}")]
    NotFound(String),

    /// Writing to durable storage failed (quota, permissions, ...).
    #[error("storage write failed: {0}")]
    Persistence(String),

    /// Bad credentials or an expired/absent session.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed catalog data: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}
