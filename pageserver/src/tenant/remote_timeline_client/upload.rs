//! Helper functions to upload files to remote storage with a RemoteStorage

use anyhow::{ensure, Context};
use bytes::Bytes;
use camino::Utf8Path;
use remote_storage::GenericRemoteStorage;
use tokio::fs;
use utils::id::{TenantId, TimelineId};

use super::index::{IndexPart, LayerFileMetadata};
use super::{remote_index_path, remote_layer_path};
use crate::tenant::storage_layer::LayerName;

/// Serializes and uploads the given index part data to the remote storage.
pub(crate) async fn upload_index_part(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    index_part: &IndexPart,
) -> anyhow::Result<()> {
    tracing::trace!("uploading new index part");

    let serialized = Bytes::from(index_part.to_json_bytes()?);

    let remote_path = remote_index_path(tenant_id, timeline_id);
    storage
        .put(serialized, &remote_path)
        .await
        .with_context(|| format!("upload index part for '{tenant_id} / {timeline_id}'"))
}

/// Uploads a local layer file, checking first that it is the file described by `metadata`.
pub(crate) async fn upload_timeline_layer(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    layer_name: &LayerName,
    local_path: &Utf8Path,
    metadata: &LayerFileMetadata,
) -> anyhow::Result<()> {
    let data = fs::read(local_path)
        .await
        .with_context(|| format!("read local layer file {local_path}"))?;

    ensure!(
        data.len() as u64 == metadata.file_size,
        "local layer file {local_path} has size {}, expected {}",
        data.len(),
        metadata.file_size
    );

    let remote_path = remote_layer_path(tenant_id, timeline_id, layer_name);
    tracing::trace!("uploading {local_path} to {remote_path}");

    storage
        .put(Bytes::from(data), &remote_path)
        .await
        .with_context(|| format!("upload layer from local path '{local_path}'"))
}

pub(crate) async fn delete_timeline_layer(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    layer_name: &LayerName,
) -> anyhow::Result<()> {
    let remote_path = remote_layer_path(tenant_id, timeline_id, layer_name);

    storage
        .delete(&remote_path)
        .await
        .with_context(|| format!("delete remote layer file {remote_path}"))
}
