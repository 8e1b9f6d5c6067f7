use policy_pipeline_core::paths::PathError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// An opaque token identifying one revision of a remote file. Updates and
/// deletes must present the current token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: String,
    pub version: Version,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("transient repository failure: {0}")]
    Transient(String),

    #[error("version conflict at {0}")]
    Conflict(String),

    #[error("repository is not usable: {0}")]
    Configuration(String),

    #[error("unexpected repository response: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// A path-addressed, version-controlled file store on a single branch.
///
/// Missing files and directories are reported as `StoreError::NotFound`.
#[async_trait::async_trait]
pub trait RemoteRepository: Send + Sync {
    async fn get(&self, path: &str) -> Result<RemoteFile, StoreError>;

    async fn create(&self, path: &str, content: &str, message: &str)
        -> Result<Version, StoreError>;

    async fn update(
        &self,
        path: &str,
        content: &str,
        version: &Version,
        message: &str,
    ) -> Result<Version, StoreError>;

    async fn delete(&self, path: &str, version: &Version, message: &str)
        -> Result<(), StoreError>;

    /// Lists the immediate children of a directory.
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, StoreError>;
}

/// Turns an expected "not found" into an empty result.
pub trait NotFoundExt<T> {
    fn found(self) -> Result<Option<T>, StoreError>;
}

// === impl StoreError ===

impl StoreError {
    /// Only transient failures are retried automatically. Everything else is
    /// surfaced to the caller as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Configuration(_) => "configuration",
            Self::Unexpected(_) => "unexpected",
            Self::Path(_) => "path",
        }
    }
}

impl<T> NotFoundExt<T> for Result<T, StoreError> {
    fn found(self) -> Result<Option<T>, StoreError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// === impl Version ===

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
