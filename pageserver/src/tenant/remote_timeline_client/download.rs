//! Helper functions to download files from remote storage with a RemoteStorage
//!
//! Nothing here retries: a failed download is reported to the caller, and the next read of
//! the same layer starts a fresh attempt.

use std::collections::HashSet;

use anyhow::Context;
use camino::Utf8Path;
use tracing::{debug, info};

use crate::tenant::storage_layer::{layer_file, LayerContent, LayerName, PersistentLayerDesc};
use crate::tenant::ErrorKind;
use remote_storage::{DownloadError, GenericRemoteStorage};
use utils::crashsafe;
use utils::id::{TenantId, TimelineId};

use super::index::{IndexPart, LayerFileMetadata};
use super::{remote_index_path, remote_layer_path, remote_timelines_path};

/// Suffix of the file a layer is downloaded into before it is renamed into place.
pub(crate) const TEMP_DOWNLOAD_EXTENSION: &str = "temp_download";

#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadLayerError {
    #[error(transparent)]
    Remote(#[from] DownloadError),
    #[error("layer file {name} failed validation: {source:#}")]
    Corrupt {
        name: LayerName,
        source: anyhow::Error,
    },
    #[error("failed to store downloaded layer file {name}: {source}")]
    Local {
        name: LayerName,
        source: std::io::Error,
    },
    #[error("timeline is shutting down")]
    Cancelled,
}

impl DownloadLayerError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            DownloadLayerError::Remote(e) => download_error_kind(e),
            DownloadLayerError::Corrupt { .. } => ErrorKind::Corrupt,
            DownloadLayerError::Local { .. } => ErrorKind::Other,
            DownloadLayerError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DownloadIndexError {
    #[error(transparent)]
    Remote(#[from] DownloadError),
    #[error("failed to parse index part of timeline {timeline_id}: {source}")]
    Corrupt {
        timeline_id: TimelineId,
        source: serde_json::Error,
    },
}

impl DownloadIndexError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            DownloadIndexError::Remote(e) => download_error_kind(e),
            DownloadIndexError::Corrupt { .. } => ErrorKind::Corrupt,
        }
    }
}

pub(crate) fn download_error_kind(e: &DownloadError) -> ErrorKind {
    match e {
        DownloadError::NotFound => ErrorKind::NotFound,
        DownloadError::Cancelled => ErrorKind::Cancelled,
        DownloadError::BadInput(_) | DownloadError::Timeout | DownloadError::Other(_) => {
            ErrorKind::RemoteUnavailable
        }
    }
}

///
/// Downloads a layer file, validates its size and checksum against `layer_metadata` and
/// stores it at `local_path`.
///
/// The file is written to a temporary file next to `local_path` first, fsynced, and renamed
/// into place, so a crash never leaves a partial layer file under the final name.
///
/// Returns the decoded content of the file.
pub(crate) async fn download_layer_file(
    storage: &GenericRemoteStorage,
    desc: &PersistentLayerDesc,
    layer_metadata: &LayerFileMetadata,
    local_path: &Utf8Path,
) -> Result<LayerContent, DownloadLayerError> {
    let name = desc.layer_name();
    let remote_path = remote_layer_path(&desc.tenant_id, &desc.timeline_id, &name);

    let bytes = storage.get(&remote_path).await?;
    debug!("downloaded {} bytes of {remote_path}", bytes.len());

    let content = layer_file::verify_and_decode(
        desc,
        &bytes,
        layer_metadata.file_size,
        layer_metadata.checksum,
    )
    .map_err(|source| DownloadLayerError::Corrupt {
        name: name.clone(),
        source,
    })?;

    crashsafe::overwrite(local_path, TEMP_DOWNLOAD_EXTENSION, &bytes)
        .await
        .map_err(|source| DownloadLayerError::Local { name, source })?;

    Ok(content)
}

/// List timelines of given tenant in remote storage
pub(crate) async fn list_remote_timelines(
    storage: &GenericRemoteStorage,
    tenant_id: TenantId,
) -> Result<HashSet<TimelineId>, DownloadError> {
    let remote_path = remote_timelines_path(&tenant_id);

    let objects = storage.list(Some(&remote_path)).await?;

    let mut timeline_ids = HashSet::new();
    for object in objects {
        let relative = object
            .strip_prefix(&remote_path)
            .with_context(|| format!("listed object {object} outside of {remote_path}"))
            .map_err(DownloadError::Other)?;
        let Some(first) = relative.components().next() else {
            continue;
        };
        let object_name = first.as_str();
        let timeline_id: TimelineId = object_name
            .parse()
            .with_context(|| format!("failed to parse object name into timeline id '{object_name}'"))
            .map_err(DownloadError::Other)?;
        timeline_ids.insert(timeline_id);
    }

    info!("found {} timelines in remote storage", timeline_ids.len());
    Ok(timeline_ids)
}

pub(crate) async fn download_index_part(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
) -> Result<IndexPart, DownloadIndexError> {
    let remote_path = remote_index_path(tenant_id, timeline_id);

    let index_part_bytes = storage.get(&remote_path).await?;

    IndexPart::from_json_bytes(&index_part_bytes).map_err(|source| DownloadIndexError::Corrupt {
        timeline_id: *timeline_id,
        source,
    })
}
