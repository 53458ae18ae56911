//! This module manages synchronizing local FS with remote storage.
//!
//! # Overview
//!
//! * [`RemoteTimelineClient`] provides functions related to upload/download of a particular timeline.
//!
//! * Stand-alone function, [`list_remote_timelines`], to get list of timelines of a tenant.
//!
//! These functions use the low-level remote storage client, [`remote_storage::RemoteStorage`].
//!
//! # Remote Storage Structure & [`IndexPart`] Index File
//!
//! The "directory structure" in the remote storage mirrors the local directory structure, with paths
//! like `tenants/<tenant_id>/timelines/<timeline_id>/<layer filename>`.
//! Next to the layer files, every timeline has an "index file" aka [`IndexPart`], containing
//! the list of **all** remote layer files of the timeline together with their size and
//! checksum, and the timeline's `disk_consistent_lsn`.
//! If a file is not referenced from [`IndexPart`], it's not part of the remote storage state.
//!
//! # Consistency
//!
//! The index file must not be uploaded until all the layer files that are in its list have
//! been successfully uploaded, and a layer file must not be deleted before an index file that
//! no longer lists it has been uploaded. The callers in [`crate::tenant::timeline`] perform
//! the operations in that order, one timeline operation at a time.
//!
//! We rely on read-after write consistency in the remote storage, and on layer files being
//! immutable.
//!
//! # Downloads
//!
//! Downloads are performed immediately against the `RemoteStorage`. Deduplication of
//! concurrent downloads of the same layer happens a level up, in the timeline's download
//! coordinator.
//!
//! When we attach a tenant, we:
//! - list timelines that are present in remote storage, and for each:
//!   - download their remote [`IndexPart`]s
//!   - create `Timeline` struct with every listed layer `RemoteOnly`
//! - After the above is done for each timeline, open the tenant for business.
//!
//! Every operation is measured into the timeline's metrics, with `success` or `failure`.

pub(crate) mod download;
pub mod index;
pub(crate) mod upload;

use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use remote_storage::{GenericRemoteStorage, RemotePath};
use tracing::{debug, info};
use utils::id::{TenantId, TimelineId};
use utils::lsn::Lsn;

pub(crate) use download::{list_remote_timelines, DownloadIndexError, DownloadLayerError};
pub(crate) use index::{IndexPart, LayerFileMetadata};

use crate::metrics::{MeasureRemoteOp, RemoteOpFileKind, RemoteOpKind, TimelineMetrics};
use crate::tenant::storage_layer::{LayerContent, LayerName, PersistentLayerDesc};
use crate::tenant::{TENANTS_SEGMENT_NAME, TIMELINES_SEGMENT_NAME};

/// A client for accessing a timeline's data in remote storage.
pub(crate) struct RemoteTimelineClient {
    tenant_id: TenantId,
    timeline_id: TimelineId,

    storage: GenericRemoteStorage,

    metrics: Arc<TimelineMetrics>,

    /// The last [`IndexPart`] known to be in remote storage, `None` before the first upload
    /// of a new timeline.
    remote_index: Mutex<Option<IndexPart>>,
}

impl RemoteTimelineClient {
    pub(crate) fn new(
        storage: GenericRemoteStorage,
        tenant_id: TenantId,
        timeline_id: TimelineId,
        metrics: Arc<TimelineMetrics>,
    ) -> Self {
        RemoteTimelineClient {
            tenant_id,
            timeline_id,
            storage,
            metrics,
            remote_index: Mutex::new(None),
        }
    }

    /// Initialize from the index part downloaded on attach.
    pub(crate) fn init_from_index_part(&self, index_part: &IndexPart) {
        *self.remote_index.lock().unwrap() = Some(index_part.clone());
    }

    /// Highest LSN persisted in remote storage, as listed in the last uploaded index part.
    pub(crate) fn remote_consistent_lsn(&self) -> Option<Lsn> {
        self.remote_index
            .lock()
            .unwrap()
            .as_ref()
            .map(|index| index.disk_consistent_lsn)
    }

    /// Whether the last uploaded index part lists the layer.
    pub(crate) fn is_listed(&self, layer_name: &LayerName) -> bool {
        self.remote_index
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|index| index.layer_metadata.contains_key(layer_name))
    }

    //
    // Download operations.
    //

    pub(crate) async fn download_index_part(&self) -> Result<IndexPart, DownloadIndexError> {
        download::download_index_part(&self.storage, &self.tenant_id, &self.timeline_id)
            .measure_remote_op(
                RemoteOpFileKind::Index,
                RemoteOpKind::Download,
                Arc::clone(&self.metrics),
            )
            .await
    }

    /// Download the layer file into `local_path`, validating it against its metadata.
    ///
    /// Residency and metrics of the layer are the caller's business; the remote operation
    /// itself is recorded here, including failed validation.
    pub(crate) async fn download_layer_file(
        &self,
        desc: &PersistentLayerDesc,
        layer_metadata: &LayerFileMetadata,
        local_path: &Utf8Path,
    ) -> Result<LayerContent, DownloadLayerError> {
        download::download_layer_file(&self.storage, desc, layer_metadata, local_path)
            .measure_remote_op(
                RemoteOpFileKind::Layer,
                RemoteOpKind::Download,
                Arc::clone(&self.metrics),
            )
            .await
    }

    //
    // Upload operations.
    //

    pub(crate) async fn upload_layer_file(
        &self,
        layer_name: &LayerName,
        local_path: &Utf8Path,
        metadata: &LayerFileMetadata,
    ) -> anyhow::Result<()> {
        upload::upload_timeline_layer(
            &self.storage,
            &self.tenant_id,
            &self.timeline_id,
            layer_name,
            local_path,
            metadata,
        )
        .measure_remote_op(
            RemoteOpFileKind::Layer,
            RemoteOpKind::Upload,
            Arc::clone(&self.metrics),
        )
        .await?;
        debug!("uploaded layer file {layer_name}");
        Ok(())
    }

    /// Whether `index_part` is what remote storage has already.
    pub(crate) fn index_part_is_current(&self, index_part: &IndexPart) -> bool {
        self.remote_index.lock().unwrap().as_ref() == Some(index_part)
    }

    /// Uploads a new index part. Every layer it lists must have been uploaded before.
    pub(crate) async fn upload_index_part(&self, index_part: IndexPart) -> anyhow::Result<()> {
        upload::upload_index_part(
            &self.storage,
            &self.tenant_id,
            &self.timeline_id,
            &index_part,
        )
        .measure_remote_op(
            RemoteOpFileKind::Index,
            RemoteOpKind::Upload,
            Arc::clone(&self.metrics),
        )
        .await?;

        info!(
            "uploaded index part with {} layers at disk_consistent_lsn {}",
            index_part.layer_metadata.len(),
            index_part.disk_consistent_lsn
        );
        *self.remote_index.lock().unwrap() = Some(index_part);
        Ok(())
    }

    /// Deletes layer files that the last uploaded index part no longer lists.
    pub(crate) async fn delete_layer_files(&self, names: &[LayerName]) -> anyhow::Result<()> {
        for name in names {
            anyhow::ensure!(
                !self.is_listed(name),
                "refusing to delete {name}, it is still listed in the remote index part"
            );
            upload::delete_timeline_layer(&self.storage, &self.tenant_id, &self.timeline_id, name)
                .measure_remote_op(
                    RemoteOpFileKind::Layer,
                    RemoteOpKind::Delete,
                    Arc::clone(&self.metrics),
                )
                .await?;
        }
        Ok(())
    }
}

pub fn remote_timelines_path(tenant_id: &TenantId) -> RemotePath {
    let path = format!("{TENANTS_SEGMENT_NAME}/{tenant_id}/{TIMELINES_SEGMENT_NAME}");
    RemotePath::from_string(&path).expect("Failed to construct path")
}

pub fn remote_timeline_path(tenant_id: &TenantId, timeline_id: &TimelineId) -> RemotePath {
    remote_timelines_path(tenant_id).join(timeline_id.to_string())
}

/// Obtains the path of the given Layer in the remote
pub fn remote_layer_path(
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    layer_file_name: &LayerName,
) -> RemotePath {
    remote_timeline_path(tenant_id, timeline_id).join(layer_file_name.to_string())
}

pub fn remote_index_path(tenant_id: &TenantId, timeline_id: &TimelineId) -> RemotePath {
    remote_timeline_path(tenant_id, timeline_id).join(IndexPart::FILE_NAME)
}
