//! On-demand download of layer files.
//!
//! A read that needs a `RemoteOnly` layer goes through [`DownloadCoordinator::ensure_resident`].
//! Downloads are keyed by layer name: while one is in flight, every other caller asking for the
//! same layer waits for that download instead of starting another one.
//!
//! The download itself runs in a spawned task holding a guard of the timeline's gate, so a
//! caller that gives up waiting does not abort it, and detach waits for it to finish.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn, Instrument};
use utils::sync::gate::{Gate, GateGuard};

use crate::tenant::remote_timeline_client::{DownloadLayerError, RemoteTimelineClient};
use crate::tenant::storage_layer::{Layer, LayerContent, LayerName, ResidentLayer};

type DownloadResult = Result<Arc<LayerContent>, Arc<DownloadLayerError>>;

type InflightDownload = Shared<BoxFuture<'static, DownloadResult>>;

pub(crate) struct DownloadCoordinator {
    remote_client: Arc<RemoteTimelineClient>,

    /// Downloads in progress. An entry is removed by its own task, after the content was
    /// installed into the layer, so a caller that finds no entry under the lock also finds
    /// the layer resident if its download succeeded.
    inflight: Arc<Mutex<HashMap<LayerName, InflightDownload>>>,
}

impl DownloadCoordinator {
    pub(crate) fn new(remote_client: Arc<RemoteTimelineClient>) -> Self {
        DownloadCoordinator {
            remote_client,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the layer with its content in memory, downloading it first if needed.
    ///
    /// On failure the layer stays `RemoteOnly`, and the next call starts a new download.
    pub(crate) async fn ensure_resident(
        &self,
        layer: &Layer,
        gate: &Gate,
    ) -> Result<ResidentLayer, Arc<DownloadLayerError>> {
        if let Some(resident) = layer.keep_resident() {
            return Ok(resident);
        }

        let download = {
            let mut inflight = self.inflight.lock().unwrap();

            // the download may have finished since the check above
            if let Some(resident) = layer.keep_resident() {
                return Ok(resident);
            }

            match inflight.entry(layer.layer_name()) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(e) => {
                    let guard = gate
                        .enter()
                        .map_err(|_| Arc::new(DownloadLayerError::Cancelled))?;
                    let download = self.spawn_download(layer.clone(), guard);
                    e.insert(download.clone());
                    download
                }
            }
        };

        let content = download.await?;
        Ok(ResidentLayer::downloaded(layer.clone(), content))
    }

    /// Waits until no download of the layer is in flight. The outcome of the download does
    /// not matter.
    pub(crate) async fn wait_for_inflight(&self, layer: &Layer) {
        let download = self
            .inflight
            .lock()
            .unwrap()
            .get(&layer.layer_name())
            .cloned();
        if let Some(download) = download {
            let _ = download.await;
        }
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Must be called with the `inflight` lock held, so that the task cannot remove its entry
    /// before it was inserted.
    fn spawn_download(&self, layer: Layer, guard: GateGuard) -> InflightDownload {
        let remote_client = Arc::clone(&self.remote_client);
        let inflight = Arc::clone(&self.inflight);
        let span = tracing::info_span!("download_layer", layer = %layer);

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                info!("downloading layer file");

                let res = remote_client
                    .download_layer_file(layer.layer_desc(), &layer.metadata(), layer.local_path())
                    .await
                    .map(Arc::new);

                match &res {
                    Ok(content) => {
                        if layer.mark_resident(Arc::clone(content)) {
                            info!(size = layer.metadata().file_size, "download complete");
                        } else if layer.is_retired() {
                            info!("layer was retired while downloading, removing the file again");
                            if let Err(e) = tokio::fs::remove_file(layer.local_path()).await {
                                warn!("failed to remove downloaded file of retired layer: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("layer download failed: {e}"),
                }

                inflight.lock().unwrap().remove(&layer.layer_name());
                res.map_err(Arc::new)
            }
            .instrument(span),
        );

        async move {
            match task.await {
                Ok(res) => res,
                Err(join_error) => {
                    warn!("layer download task failed: {join_error}");
                    Err(Arc::new(DownloadLayerError::Cancelled))
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{
        PrometheusMetrics, RemoteOpFileKind, RemoteOpKind, RemoteOpStatus, TimelineMetrics,
    };
    use crate::tenant::remote_timeline_client::{remote_layer_path, LayerFileMetadata};
    use crate::tenant::storage_layer::{layer_file, PersistentLayerDesc};
    use crate::tenant::ErrorKind;
    use bytes::Bytes;
    use camino_tempfile::Utf8TempDir;
    use pageserver_api::key::Key;
    use remote_storage::{
        GenericRemoteStorage, RemoteOp, RemoteStorageConfig, RemoteStorageKind, UnreliableWrapper,
    };
    use std::time::Duration;
    use utils::id::{TenantId, TimelineId};
    use utils::lsn::Lsn;

    struct Setup {
        _dir: Utf8TempDir,
        sink: Arc<PrometheusMetrics>,
        unreliable: Arc<UnreliableWrapper>,
        coordinator: DownloadCoordinator,
        layer: Layer,
        gate: Gate,
        tenant_id: TenantId,
        timeline_id: TimelineId,
    }

    async fn setup() -> Setup {
        let dir = camino_tempfile::tempdir().unwrap();
        let timeline_path = dir.path().join("timeline");
        std::fs::create_dir_all(&timeline_path).unwrap();

        let local = GenericRemoteStorage::from_config(&RemoteStorageConfig {
            storage: RemoteStorageKind::LocalFs {
                local_path: dir.path().join("remote"),
            },
            timeout: RemoteStorageConfig::DEFAULT_TIMEOUT,
        })
        .unwrap();
        let storage = GenericRemoteStorage::unreliable_wrapper(local, 0);
        let GenericRemoteStorage::Unreliable(unreliable) = &storage else {
            unreachable!()
        };
        let unreliable = Arc::clone(unreliable);

        let sink = Arc::new(PrometheusMetrics::new());
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let metrics = Arc::new(TimelineMetrics::new(tenant_id, timeline_id, sink.clone()));
        let remote_client = Arc::new(RemoteTimelineClient::new(
            storage,
            tenant_id,
            timeline_id,
            metrics.clone(),
        ));

        let content = LayerContent::new_image(
            Key::new(1, 0)..Key::new(1, 1),
            Lsn(0x10),
            vec![(Key::new(1, 0), Bytes::from_static(b"page"))],
        );
        let bytes = content.encode();
        let desc = PersistentLayerDesc::new_img(
            tenant_id,
            timeline_id,
            content.key_range().clone(),
            Lsn(0x10),
            bytes.len() as u64,
        );
        let metadata = LayerFileMetadata::new(bytes.len() as u64, layer_file::checksum(&bytes));
        let layer = Layer::for_evicted(&timeline_path, metrics, desc, metadata);
        std::fs::write(layer.local_path(), &bytes).unwrap();
        remote_client
            .upload_layer_file(&layer.layer_name(), layer.local_path(), &metadata)
            .await
            .unwrap();
        std::fs::remove_file(layer.local_path()).unwrap();
        Setup {
            _dir: dir,
            sink,
            unreliable,
            coordinator: DownloadCoordinator::new(remote_client),
            layer,
            gate: Gate::default(),
            tenant_id,
            timeline_id,
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_download() {
        let s = setup().await;
        s.unreliable.set_get_delay(Some(Duration::from_millis(100)));

        let results = futures::future::join_all(
            (0..8).map(|_| s.coordinator.ensure_resident(&s.layer, &s.gate)),
        )
        .await;
        for res in results {
            let resident = res.unwrap();
            assert_eq!(resident.content().entries().len(), 1);
        }

        let remote_path = remote_layer_path(&s.tenant_id, &s.timeline_id, &s.layer.layer_name());
        assert_eq!(s.unreliable.calls(&RemoteOp::Get(remote_path)), 1);
        assert_eq!(s.sink.download_count(&s.tenant_id, &s.timeline_id), 1);
        assert_eq!(
            s.sink.resident_physical_size(&s.tenant_id, &s.timeline_id),
            Some(s.layer.metadata().file_size)
        );
        assert!(s.layer.is_resident());
        assert!(s.layer.local_path().exists());
        assert_eq!(s.coordinator.inflight_count(), 0);

        // resident now, no more remote calls
        s.coordinator.ensure_resident(&s.layer, &s.gate).await.unwrap();
        assert_eq!(s.unreliable.total_gets(), 1);
    }

    #[tokio::test]
    async fn failed_download_leaves_layer_remote() {
        let s = setup().await;
        s.unreliable.set_outage(true);

        let err = s
            .coordinator
            .ensure_resident(&s.layer, &s.gate)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
        assert!(!s.layer.is_resident());
        assert_eq!(s.coordinator.inflight_count(), 0);
        assert_eq!(
            s.sink.remote_operation_count(
                &s.tenant_id,
                &s.timeline_id,
                RemoteOpFileKind::Layer,
                RemoteOpKind::Download,
                RemoteOpStatus::Failure
            ),
            1
        );
        assert_eq!(s.sink.resident_physical_size(&s.tenant_id, &s.timeline_id), None);

        s.unreliable.set_outage(false);
        s.coordinator.ensure_resident(&s.layer, &s.gate).await.unwrap();
        assert!(s.layer.is_resident());
        assert_eq!(s.sink.download_count(&s.tenant_id, &s.timeline_id), 1);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_abort_download() {
        let s = setup().await;
        s.unreliable.set_get_delay(Some(Duration::from_millis(50)));

        let res = tokio::time::timeout(
            Duration::from_millis(1),
            s.coordinator.ensure_resident(&s.layer, &s.gate),
        )
        .await;
        assert!(res.is_err(), "download should still be running");

        s.coordinator.wait_for_inflight(&s.layer).await;
        assert!(s.layer.is_resident());
        assert_eq!(s.unreliable.total_gets(), 1);
    }

    #[tokio::test]
    async fn closed_gate_refuses_downloads() {
        let s = setup().await;
        s.gate.close().await;
        let err = s
            .coordinator
            .ensure_resident(&s.layer, &s.gate)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(s.unreliable.total_gets(), 0);
    }
}
