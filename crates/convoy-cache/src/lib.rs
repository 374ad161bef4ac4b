#![deny(clippy::all)]

//! The content-addressed cache for task outputs.
//!
//! A cache entry is a compressed archive of a task's declared outputs plus
//! its captured log, keyed by the task fingerprint. Entries live in a local
//! filesystem tier and, optionally, a remote HTTP tier. Reads try local
//! first; remote hits are written through to the local tier. Writes always
//! land locally and are uploaded in the background.

/// A write-behind wrapper that queues remote uploads on a worker pool.
mod async_cache;
/// The core archive creation and restoration logic.
pub mod cache_archive;
/// File system tier.
pub mod fs;
/// Remote HTTP tier.
pub mod http;
/// Two-tier read/write policy.
mod multiplexer;
/// Artifact signing and verification for the remote tier.
pub mod signature_authentication;
mod single_flight;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
pub use multiplexer::CacheMultiplexer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature_authentication::SignatureError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact verification failed: signed artifact is missing signature tag")]
    ArtifactTagMissing,
    #[error("invalid artifact verification tag")]
    InvalidTag,
    #[error("archive integrity check failed for {0}")]
    IntegrityCheckFailed(String),
    #[error("failed to contact remote cache: {0}")]
    ApiClientError(Box<convoy_api_client::Error>),
    #[error("signing artifact failed: {0}")]
    SignatureError(#[from] SignatureError),
    #[error("Invalid file path: {0}")]
    PathError(#[from] convoypath::PathError),
    #[error("links in the cache are cyclic")]
    CycleDetected,
    #[error("Invalid file path, link target does not exist: {0}")]
    LinkTargetDoesNotExist(String),
    #[error("Invalid tar, link target does not exist on header")]
    LinkTargetNotOnHeader,
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    // The `FileType` is deliberately not part of the message; it has no
    // stable display form.
    #[error("attempted to create unsupported file type")]
    CreateUnsupportedFileType,
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String),
    #[error("Invalid cache metadata file")]
    InvalidMetadata(serde_json::Error),
    #[error("Failed to write cache metadata file")]
    MetadataWriteFailure(serde_json::Error),
    #[error("Unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

impl From<convoy_api_client::Error> for CacheError {
    fn from(value: convoy_api_client::Error) -> Self {
        CacheError::ApiClientError(Box::new(value))
    }
}

#[derive(Debug, Clone, PartialEq, Copy)]
pub enum CacheSource {
    Local,
    Remote,
}

/// What a cache hit is worth: where it came from and how long the original
/// execution took.
#[derive(Debug, Clone, PartialEq, Copy)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CacheOpts {
    /// Cache directory, resolved against the repo root when relative.
    pub cache_dir: Utf8PathBuf,
    /// Skip uploads to the remote tier while still reading from it.
    pub remote_cache_read_only: bool,
    /// Upload to the remote tier but never read from it.
    pub remote_cache_write_only: bool,
    /// Disable the remote tier entirely.
    pub skip_remote: bool,
    /// Disable the filesystem tier; remote becomes the only storage.
    pub skip_filesystem: bool,
    /// Background upload worker count.
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheOpts {
    team_id: Option<String>,
    signature: bool,
}

impl RemoteCacheOpts {
    pub fn new(team_id: Option<String>, signature: bool) -> Self {
        Self { team_id, signature }
    }

    pub fn signature(&self) -> bool {
        self.signature
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }
}
