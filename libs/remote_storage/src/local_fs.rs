//! Local filesystem acting as a remote storage.
//! Multiple pageservers can use the same "storage" of this kind by using different storage roots.
//!
//! This storage used in pageserver tests, but can also be used in cases when a certain persistent
//! volume is mounted to the local FS.

use std::{io::ErrorKind, time::Duration};

use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tracing::*;
use utils::crashsafe;

use crate::{DownloadError, RemotePath, RemoteStorage};

const LOCAL_FS_TEMP_FILE_SUFFIX: &str = "___temp";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
    timeout: Duration,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    /// Storage root will be created (if does not exist) and transformed into an absolute path (if passed as relative).
    pub fn new(mut storage_root: Utf8PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root).with_context(|| {
                format!("Failed to create all directories in the given root path {storage_root:?}")
            })?;
        }
        if !storage_root.is_absolute() {
            storage_root = storage_root.canonicalize_utf8().with_context(|| {
                format!("Failed to represent path {storage_root:?} as an absolute path")
            })?;
        }

        Ok(Self {
            storage_root,
            timeout,
        })
    }

    fn resolve_in_storage(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.storage_root)
    }

    fn to_remote_path(&self, local_path: &Utf8Path) -> anyhow::Result<RemotePath> {
        let relative = local_path
            .strip_prefix(&self.storage_root)
            .with_context(|| format!("path {local_path} is not under the storage root"))?;
        RemotePath::new(relative)
    }

    async fn list_recursive(&self, folder: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut files = Vec::new();
        let mut directory_queue = vec![folder.to_owned()];

        while let Some(cur_folder) = directory_queue.pop() {
            let mut entries = match fs::read_dir(&cur_folder).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("read directory {cur_folder}"))
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|pb| {
                    anyhow::anyhow!("non-utf8 path in local storage: {}", pb.display())
                })?;
                if file_type.is_symlink() {
                    debug!("{entry_path:?} is a symlink, skipping")
                } else if file_type.is_dir() {
                    directory_queue.push(entry_path)
                } else if !crashsafe::is_temporary_with_suffix(&entry_path, LOCAL_FS_TEMP_FILE_SUFFIX)
                {
                    files.push(entry_path)
                }
            }
        }

        Ok(files)
    }
}

#[async_trait::async_trait]
impl RemoteStorage for LocalFs {
    async fn list(&self, prefix: Option<&RemotePath>) -> Result<Vec<RemotePath>, DownloadError> {
        // a prefix names a directory, objects directly in the root would be listed by None
        let folder = match prefix {
            Some(prefix) => self.resolve_in_storage(prefix),
            None => self.storage_root.clone(),
        };

        let files = self
            .list_recursive(&folder)
            .await
            .map_err(DownloadError::Other)?;

        let mut listed = files
            .iter()
            .map(|path| self.to_remote_path(path))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(DownloadError::Other)?;
        listed.sort();
        Ok(listed)
    }

    async fn put(&self, data: Bytes, to: &RemotePath) -> anyhow::Result<()> {
        let target_file_path = self.resolve_in_storage(to);
        ensure!(
            target_file_path.file_name().is_some(),
            "cannot upload to a storage directory {to}"
        );
        let target_dir = match target_file_path.parent() {
            Some(parent_dir) => parent_dir,
            None => bail!("File path '{target_file_path}' has no parent directory"),
        };
        crashsafe::create_dir_all(target_dir)
            .await
            .with_context(|| format!("create directory {target_dir}"))?;

        crashsafe::overwrite(&target_file_path, LOCAL_FS_TEMP_FILE_SUFFIX, &data)
            .await
            .with_context(|| {
                format!("Failed to upload file (write temp) to the local storage at '{target_file_path}'")
            })?;

        Ok(())
    }

    async fn get(&self, from: &RemotePath) -> Result<Bytes, DownloadError> {
        let file_path = self.resolve_in_storage(from);
        match tokio::time::timeout(self.timeout, fs::read(&file_path)).await {
            Ok(Ok(data)) => Ok(Bytes::from(data)),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => Err(DownloadError::NotFound),
            Ok(Err(e)) => Err(DownloadError::Other(
                anyhow::Error::new(e).context(format!("read local storage file {file_path}")),
            )),
            Err(_elapsed) => Err(DownloadError::Timeout),
        }
    }

    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()> {
        let file_path = self.resolve_in_storage(path);
        match fs::remove_file(&file_path).await {
            Ok(()) => Ok(()),
            // The file doesn't exist. This shouldn't yield an error to mirror S3's behaviour.
            // See https://docs.aws.amazon.com/AmazonS3/latest/API/API_DeleteObject.html
            // > If there isn't a null version, Amazon S3 does not remove any objects but will still respond that the command was successful.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::anyhow!(e).context(format!("delete {file_path}"))),
        }
    }
}
