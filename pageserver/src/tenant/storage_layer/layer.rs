use camino::{Utf8Path, Utf8PathBuf};
use pageserver_api::key::Key;
use pageserver_api::models::HistoricLayerInfo;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use utils::lsn::Lsn;

use crate::metrics::TimelineMetrics;
use crate::tenant::remote_timeline_client::index::LayerFileMetadata;

use super::{
    LayerContent, LayerName, PersistentLayerDesc, ValueReconstructResult, ValueReconstructState,
};

/// A persistent layer: an immutable file covering a range of keys and LSNs, kept in remote
/// storage and possibly also on local disk.
///
/// A delta layer contains all modifications within a range of LSNs and keys. An image layer
/// is a snapshot of all the data in a key-range, at a single LSN.
///
/// ### State transitions
///
/// ```text
///  +------------+   mark_resident (download)   +--------------------------------+
///  | RemoteOnly |----------------------------->| Resident(Arc<LayerContent>)    |
///  |            |<-----------------------------|                                |
///  +------------+   evict (uploaded only)      +--------------------------------+
/// ```
///
/// Each transition updates the timeline's resident physical size by the layer's file size,
/// so the gauge follows residency exactly. A retired layer (removed from the layer map by
/// compaction or gc) leaves the gauge and never becomes resident again. Readers holding a
/// retired resident layer still read its content.
#[derive(Clone)]
pub(crate) struct Layer(Arc<LayerInner>);

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.desc.layer_name())
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) == Arc::as_ptr(&other.0)
    }
}

struct LayerInner {
    desc: PersistentLayerDesc,

    /// Full path to the file; might not exist and should not be trusted while `RemoteOnly`.
    path: Utf8PathBuf,

    metadata: LayerFileMetadata,

    residency: Mutex<Residency>,

    /// Listed in an uploaded index part. Only uploaded layers can be evicted.
    uploaded: AtomicBool,

    /// Removed from the layer map.
    retired: AtomicBool,

    metrics: Arc<TimelineMetrics>,
}

enum Residency {
    Resident(Arc<LayerContent>),
    RemoteOnly,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EvictionError {
    #[error("layer was not resident")]
    NotResident,
    /// Evicting a layer that is not in remote storage would lose its content.
    #[error("layer is not uploaded yet")]
    NotUploaded,
    #[error(transparent)]
    RemoveFile(#[from] std::io::Error),
}

impl Layer {
    /// Creates a layer value for a file we know to not be resident.
    pub(crate) fn for_evicted(
        timeline_path: &Utf8Path,
        metrics: Arc<TimelineMetrics>,
        desc: PersistentLayerDesc,
        metadata: LayerFileMetadata,
    ) -> Self {
        Layer(Arc::new(LayerInner {
            path: timeline_path.join(desc.layer_name().to_string()),
            desc,
            metadata,
            residency: Mutex::new(Residency::RemoteOnly),
            uploaded: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            metrics,
        }))
    }

    /// Creates a Layer value for a file we know to be resident in timeline directory, because
    /// it was just written by checkpoint or compaction. It is not uploaded yet.
    pub(crate) fn for_resident(
        timeline_path: &Utf8Path,
        metrics: Arc<TimelineMetrics>,
        desc: PersistentLayerDesc,
        metadata: LayerFileMetadata,
        content: Arc<LayerContent>,
    ) -> ResidentLayer {
        metrics.resident_physical_size_add(metadata.file_size);
        let layer = Layer(Arc::new(LayerInner {
            path: timeline_path.join(desc.layer_name().to_string()),
            desc,
            metadata,
            residency: Mutex::new(Residency::Resident(content.clone())),
            uploaded: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            metrics,
        }));
        ResidentLayer { layer, content }
    }

    pub(crate) fn layer_desc(&self) -> &PersistentLayerDesc {
        &self.0.desc
    }

    pub(crate) fn layer_name(&self) -> LayerName {
        self.0.desc.layer_name()
    }

    pub(crate) fn local_path(&self) -> &Utf8Path {
        &self.0.path
    }

    pub(crate) fn metadata(&self) -> LayerFileMetadata {
        self.0.metadata
    }

    pub(crate) fn is_resident(&self) -> bool {
        self.resident_content().is_some()
    }

    /// The content, if it is in memory. Still returns it after the layer was retired.
    pub(crate) fn resident_content(&self) -> Option<Arc<LayerContent>> {
        match &*self.0.residency.lock().unwrap() {
            Residency::Resident(content) => Some(content.clone()),
            Residency::RemoteOnly => None,
        }
    }

    pub(crate) fn keep_resident(&self) -> Option<ResidentLayer> {
        self.resident_content().map(|content| ResidentLayer {
            layer: self.clone(),
            content,
        })
    }

    pub(crate) fn is_uploaded(&self) -> bool {
        self.0.uploaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_uploaded(&self) {
        self.0.uploaded.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.0.retired.load(Ordering::Acquire)
    }

    /// Installs downloaded content. Returns false if the layer was already resident or has
    /// been retired in the meantime, in which case nothing changes.
    pub(crate) fn mark_resident(&self, content: Arc<LayerContent>) -> bool {
        let mut residency = self.0.residency.lock().unwrap();
        if self.is_retired() {
            return false;
        }
        match &*residency {
            Residency::Resident(_) => false,
            Residency::RemoteOnly => {
                *residency = Residency::Resident(content);
                self.0
                    .metrics
                    .resident_physical_size_add(self.0.metadata.file_size);
                true
            }
        }
    }

    /// Drops the local copy of an uploaded layer. The next read downloads it again.
    pub(crate) async fn evict(&self) -> Result<(), EvictionError> {
        {
            let residency = self.0.residency.lock().unwrap();
            if !matches!(&*residency, Residency::Resident(_)) || self.is_retired() {
                return Err(EvictionError::NotResident);
            }
            if !self.is_uploaded() {
                return Err(EvictionError::NotUploaded);
            }
        }

        // a resident layer is never downloaded, so nobody recreates the file meanwhile
        match tokio::fs::remove_file(&self.0.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut residency = self.0.residency.lock().unwrap();
        if !matches!(&*residency, Residency::Resident(_)) || self.is_retired() {
            return Err(EvictionError::NotResident);
        }
        *residency = Residency::RemoteOnly;
        self.0
            .metrics
            .resident_physical_size_sub(self.0.metadata.file_size);
        debug!(layer=%self, "evicted");
        Ok(())
    }

    /// Called once the layer was removed from the layer map. Removes the local file and the
    /// layer's share of the resident physical size.
    pub(crate) async fn retire(&self) {
        {
            let residency = self.0.residency.lock().unwrap();
            if self.0.retired.swap(true, Ordering::AcqRel) {
                return;
            }
            if matches!(&*residency, Residency::Resident(_)) {
                self.0
                    .metrics
                    .resident_physical_size_sub(self.0.metadata.file_size);
            }
        }

        match tokio::fs::remove_file(&self.0.path).await {
            Ok(()) => info!(layer=%self, "removed retired layer file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(layer=%self, "failed to remove retired layer file: {e}"),
        }
    }

    pub(crate) fn info(&self) -> HistoricLayerInfo {
        let desc = &self.0.desc;
        let layer_file_name = desc.layer_name().to_string();
        let remote = !self.is_resident();
        if desc.is_delta {
            HistoricLayerInfo::Delta {
                layer_file_name,
                layer_file_size: self.0.metadata.file_size,
                lsn_start: desc.lsn_range.start,
                lsn_end: desc.lsn_range.end,
                remote,
            }
        } else {
            HistoricLayerInfo::Image {
                layer_file_name,
                layer_file_size: self.0.metadata.file_size,
                lsn_start: desc.image_layer_lsn(),
                remote,
            }
        }
    }
}

/// Guard for forcing a layer be resident while it exists.
#[derive(Clone)]
pub(crate) struct ResidentLayer {
    layer: Layer,
    content: Arc<LayerContent>,
}

impl std::fmt::Display for ResidentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.layer)
    }
}

impl std::fmt::Debug for ResidentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.layer)
    }
}

impl ResidentLayer {
    /// Pairs freshly downloaded content with its layer, whether or not the content could be
    /// installed: a layer retired during its download is still readable through this.
    pub(crate) fn downloaded(layer: Layer, content: Arc<LayerContent>) -> Self {
        ResidentLayer { layer, content }
    }

    pub(crate) fn layer(&self) -> &Layer {
        &self.layer
    }

    pub(crate) fn content(&self) -> &LayerContent {
        &self.content
    }

    pub(crate) fn layer_desc(&self) -> &PersistentLayerDesc {
        self.layer.layer_desc()
    }

    pub(crate) fn metadata(&self) -> LayerFileMetadata {
        self.layer.metadata()
    }

    pub(crate) fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_state: &mut ValueReconstructState,
    ) -> ValueReconstructResult {
        self.content
            .get_value_reconstruct_data(key, lsn_range, reconstruct_state)
    }
}

impl AsRef<Layer> for ResidentLayer {
    fn as_ref(&self) -> &Layer {
        &self.layer
    }
}

/// Drop the eviction guard.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusMetrics;
    use bytes::Bytes;
    use utils::id::{TenantId, TimelineId};

    fn setup() -> (
        camino_tempfile::Utf8TempDir,
        Arc<PrometheusMetrics>,
        Arc<TimelineMetrics>,
        PersistentLayerDesc,
        Arc<LayerContent>,
    ) {
        let dir = camino_tempfile::tempdir().unwrap();
        let sink = Arc::new(PrometheusMetrics::new());
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let metrics = Arc::new(TimelineMetrics::new(tenant_id, timeline_id, sink.clone()));
        let content = Arc::new(LayerContent::new_image(
            Key::MIN..Key::new(0, 10),
            Lsn(0x10),
            vec![(Key::new(0, 1), Bytes::from_static(b"one"))],
        ));
        let desc = PersistentLayerDesc::new_img(
            tenant_id,
            timeline_id,
            Key::MIN..Key::new(0, 10),
            Lsn(0x10),
            100,
        );
        (dir, sink, metrics, desc, content)
    }

    #[tokio::test]
    async fn residency_drives_the_gauge() {
        let (dir, sink, metrics, desc, content) = setup();
        let (tenant_id, timeline_id) = (desc.tenant_id, desc.timeline_id);
        let layer = Layer::for_evicted(
            dir.path(),
            metrics.clone(),
            desc,
            LayerFileMetadata::new(100, 0),
        );
        assert!(!layer.is_resident());
        assert_eq!(metrics.resident_physical_size_get(), 0);

        assert!(layer.mark_resident(content.clone()));
        // a second download result does not count twice
        assert!(!layer.mark_resident(content.clone()));
        assert_eq!(metrics.resident_physical_size_get(), 100);
        assert_eq!(sink.resident_physical_size(&tenant_id, &timeline_id), Some(100));

        layer.evict().await.unwrap();
        assert!(!layer.is_resident());
        assert_eq!(metrics.resident_physical_size_get(), 0);
        assert!(matches!(
            layer.evict().await,
            Err(EvictionError::NotResident)
        ));

        assert!(layer.mark_resident(content));
        layer.retire().await;
        assert_eq!(metrics.resident_physical_size_get(), 0);
        // readers that still hold the layer keep reading
        assert!(layer.is_resident());
        assert!(layer.is_retired());
    }

    #[tokio::test]
    async fn fresh_layers_are_not_evictable_until_uploaded() {
        let (dir, _sink, metrics, desc, content) = setup();
        let resident = Layer::for_resident(
            dir.path(),
            metrics.clone(),
            desc,
            LayerFileMetadata::new(100, 0),
            content,
        );
        assert_eq!(metrics.resident_physical_size_get(), 100);

        let layer = resident.layer().clone();
        assert!(matches!(
            layer.evict().await,
            Err(EvictionError::NotUploaded)
        ));

        layer.mark_uploaded();
        layer.evict().await.unwrap();
        assert_eq!(metrics.resident_physical_size_get(), 0);

        // the guard still reads the content it was created with
        let mut state = ValueReconstructState::default();
        let res =
            resident.get_value_reconstruct_data(Key::new(0, 1), Lsn(0x10)..Lsn(0x11), &mut state);
        assert_eq!(res, ValueReconstructResult::Complete);
    }
}
