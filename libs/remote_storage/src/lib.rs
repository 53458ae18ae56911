//! A set of generic storage abstractions for the page server to use when backing up and restoring its state from the external storage.
//! No other modules from this tree are supposed to be used directly by the external code.
//!
//! [`RemoteStorage`] trait a CRUD-like generic abstraction to use for adapting external storages with a few implementations:
//!   * [`local_fs`] allows to use local file system as an external storage
//!   * [`s3_bucket`] uses AWS S3 bucket as an external storage
//!   * [`simulate_failures`] wraps another storage and injects failures, for tests
//!
#![deny(unsafe_code)]
#![deny(clippy::undocumented_unsafe_blocks)]

mod config;
mod error;
mod local_fs;
mod s3_bucket;
mod simulate_failures;

use std::{fmt::Debug, num::NonZeroUsize, sync::Arc};

use anyhow::Context;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use self::{
    config::{RemoteStorageConfig, RemoteStorageKind, S3Config},
    error::DownloadError,
    local_fs::LocalFs,
    s3_bucket::S3Bucket,
    simulate_failures::{RemoteOp, UnreliableWrapper},
};

/// Currently, sync happens with AWS S3, that has two limits on requests per second:
/// ~200 RPS for IAM services
/// <https://docs.aws.amazon.com/AmazonRDS/latest/AuroraUserGuide/UsingWithRDS.IAMDBAuth.html>
/// ~3500 PUT/COPY/POST/DELETE or 5500 GET/HEAD S3 requests
/// <https://aws.amazon.com/premiumsupport/knowledge-center/s3-request-limit-avoid-throttling/>
pub const DEFAULT_REMOTE_STORAGE_S3_CONCURRENCY_LIMIT: NonZeroUsize =
    match NonZeroUsize::new(100) {
        Some(limit) => limit,
        None => unreachable!(),
    };

const REMOTE_STORAGE_PREFIX_SEPARATOR: char = '/';

/// Path on the remote storage, relative to some inner prefix.
/// The prefix is an implementation detail, that allows representing local paths
/// as the remote ones, stripping the local storage prefix away.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePath(Utf8PathBuf);

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn join(&self, segment: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(segment))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }

    pub fn strip_prefix(&self, p: &RemotePath) -> Result<&Utf8Path, std::path::StripPrefixError> {
        self.0.strip_prefix(&p.0)
    }

    pub fn starts_with(&self, p: &RemotePath) -> bool {
        self.0.starts_with(&p.0)
    }
}

/// Storage (potentially remote) API to manage its state.
/// This storage tries to be unaware of any layered repository context,
/// providing basic CRUD operations for storage files.
///
/// Every operation is idempotent per path: putting the same content twice, or deleting a
/// missing object, succeeds.
#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync + 'static {
    /// Lists all objects under the given prefix, recursively.
    /// `None` lists the whole storage.
    async fn list(&self, prefix: Option<&RemotePath>) -> Result<Vec<RemotePath>, DownloadError>;

    /// Stores `data` under `to`, replacing any previous object.
    async fn put(&self, data: Bytes, to: &RemotePath) -> anyhow::Result<()>;

    /// Fetches the full content of the object, or [`DownloadError::NotFound`] if there is none.
    async fn get(&self, from: &RemotePath) -> Result<Bytes, DownloadError>;

    /// Deletes the object. Deleting a missing object is not an error.
    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()>;
}

/// Every storage, currently supported.
/// Serves as a simple way to pass around the [`RemoteStorage`] without dealing with generics.
#[derive(Clone)]
pub enum GenericRemoteStorage {
    LocalFs(LocalFs),
    AwsS3(Arc<S3Bucket>),
    Unreliable(Arc<UnreliableWrapper>),
}

impl GenericRemoteStorage {
    pub async fn list(&self, prefix: Option<&RemotePath>) -> Result<Vec<RemotePath>, DownloadError> {
        match self {
            Self::LocalFs(s) => s.list(prefix).await,
            Self::AwsS3(s) => s.list(prefix).await,
            Self::Unreliable(s) => s.list(prefix).await,
        }
    }

    pub async fn put(&self, data: Bytes, to: &RemotePath) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.put(data, to).await,
            Self::AwsS3(s) => s.put(data, to).await,
            Self::Unreliable(s) => s.put(data, to).await,
        }
    }

    pub async fn get(&self, from: &RemotePath) -> Result<Bytes, DownloadError> {
        match self {
            Self::LocalFs(s) => s.get(from).await,
            Self::AwsS3(s) => s.get(from).await,
            Self::Unreliable(s) => s.get(from).await,
        }
    }

    pub async fn delete(&self, path: &RemotePath) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.delete(path).await,
            Self::AwsS3(s) => s.delete(path).await,
            Self::Unreliable(s) => s.delete(path).await,
        }
    }
}

impl GenericRemoteStorage {
    pub fn from_config(storage_config: &RemoteStorageConfig) -> anyhow::Result<Self> {
        Ok(match &storage_config.storage {
            RemoteStorageKind::LocalFs { local_path } => {
                info!("Using fs root '{local_path}' as a remote storage");
                Self::LocalFs(LocalFs::new(local_path.clone(), storage_config.timeout)?)
            }
            RemoteStorageKind::AwsS3(s3_config) => {
                info!("Using s3 bucket '{}' in region '{}' as a remote storage, prefix in bucket: '{:?}', bucket endpoint: '{:?}'",
                      s3_config.bucket_name, s3_config.bucket_region, s3_config.prefix_in_bucket, s3_config.endpoint);
                Self::AwsS3(Arc::new(
                    S3Bucket::new(s3_config, storage_config.timeout)
                        .context("create s3 remote storage")?,
                ))
            }
        })
    }

    /// Wraps the storage so that each operation fails `attempts_to_fail` times before
    /// succeeding, and can be switched into a full outage.
    pub fn unreliable_wrapper(s: Self, attempts_to_fail: u64) -> Self {
        Self::Unreliable(Arc::new(UnreliableWrapper::new(s, attempts_to_fail)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_must_be_relative() {
        RemotePath::new(Utf8Path::new("/absolute/path")).unwrap_err();

        let path = RemotePath::from_string("tenants/abc/timelines/def").unwrap();
        assert_eq!(path.object_name(), Some("def"));
        assert_eq!(
            path.with_base(Utf8Path::new("/root")),
            Utf8PathBuf::from("/root/tenants/abc/timelines/def")
        );
    }

    #[test]
    fn remote_path_prefixes() {
        let prefix = RemotePath::from_string("tenants/abc").unwrap();
        let path = prefix.join("timelines").join("def");
        assert!(path.starts_with(&prefix));
        assert_eq!(
            path.strip_prefix(&prefix).unwrap(),
            Utf8Path::new("timelines/def")
        );

        let other = RemotePath::from_string("tenants/abcd").unwrap();
        assert!(!other.starts_with(&prefix));
    }
}
