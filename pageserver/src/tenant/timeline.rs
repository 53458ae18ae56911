pub(crate) mod compaction;
pub(crate) mod download_coordinator;
pub(crate) mod layer_manager;

use std::ops::Deref;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context};
use bytes::Bytes;
use camino::Utf8PathBuf;
use pageserver_api::key::Key;
use pageserver_api::models::{LayerMapInfo, TimelineDetail, TimelineState};
use pageserver_api::value::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::crashsafe;
use utils::id::{TenantId, TimelineId};
use utils::lsn::{AtomicLsn, Lsn};
use utils::sync::gate::Gate;

use crate::config::PageServerConf;
use crate::metrics::TimelineMetrics;
use crate::tenant::config::{TenantConf, TenantConfOpt};
use crate::tenant::remote_timeline_client::{
    DownloadLayerError, IndexPart, LayerFileMetadata, RemoteTimelineClient,
};
use crate::tenant::storage_layer::{
    layer_file, InMemoryLayer, Layer, LayerContent, LayerName, PersistentLayerDesc,
    ResidentLayer, ValueReconstructResult, ValueReconstructState,
};
use crate::tenant::ErrorKind;
use crate::TEMP_FILE_SUFFIX;

use download_coordinator::DownloadCoordinator;
use layer_manager::{LayerManager, Shutdown};

/// An error happened in a get() operation.
#[derive(thiserror::Error, Debug)]
pub(crate) enum PageReconstructError {
    #[error(transparent)]
    Other(anyhow::Error),

    #[error("timeline shutting down")]
    Cancelled,

    #[error("timeline is not active, state: {0:?}")]
    NotActive(TimelineState),

    #[error("requested lsn {request_lsn} is beyond the last record lsn {last_record_lsn}")]
    FutureLsn {
        request_lsn: Lsn,
        last_record_lsn: Lsn,
    },

    #[error("could not find data for key {key} at LSN {lsn}")]
    MissingKey { key: Key, lsn: Lsn },

    #[error("download of a layer failed: {0}")]
    Download(Arc<DownloadLayerError>),
}

impl PageReconstructError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            PageReconstructError::Other(_) => ErrorKind::Other,
            PageReconstructError::Cancelled => ErrorKind::Cancelled,
            PageReconstructError::NotActive(_) | PageReconstructError::FutureLsn { .. } => {
                ErrorKind::InvalidState
            }
            PageReconstructError::MissingKey { .. } => ErrorKind::NotFound,
            PageReconstructError::Download(e) => e.kind(),
        }
    }
}

impl From<Shutdown> for PageReconstructError {
    fn from(_: Shutdown) -> Self {
        PageReconstructError::Cancelled
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum CheckpointError {
    #[error("timeline shutting down")]
    Cancelled,

    #[error("timeline is not active, state: {0:?}")]
    NotActive(TimelineState),

    /// The local layers are written, uploading them or the index part failed. The next
    /// checkpoint retries the upload.
    #[error("upload to remote storage failed: {0:#}")]
    Upload(anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CheckpointError {
    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            CheckpointError::Cancelled => ErrorKind::Cancelled,
            CheckpointError::NotActive(_) => ErrorKind::InvalidState,
            CheckpointError::Upload(_) => ErrorKind::RemoteUnavailable,
            CheckpointError::Other(_) => ErrorKind::Other,
        }
    }
}

impl From<Shutdown> for CheckpointError {
    fn from(_: Shutdown) -> Self {
        CheckpointError::Cancelled
    }
}

pub struct Timeline {
    conf: &'static PageServerConf,
    tenant_conf: Arc<std::sync::RwLock<TenantConfOpt>>,

    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,

    /// The layer map and the layer values holding each layer's residency.
    ///
    /// Readers take the read lock only to resolve which layers to visit, and release it
    /// before any layer is downloaded.
    pub(crate) layers: RwLock<LayerManager>,

    pub(crate) remote_client: Arc<RemoteTimelineClient>,
    download_coordinator: DownloadCoordinator,

    /// Everything up to this LSN was written and finished; reads are served up to it.
    last_record_lsn: AtomicLsn,
    /// Everything up to this LSN is in persistent layers.
    disk_consistent_lsn: AtomicLsn,

    pub(crate) metrics: Arc<TimelineMetrics>,

    /// Held by the [`TimelineWriter`]. Freezing the open layer takes it too, so that no write
    /// goes to a layer being frozen.
    write_lock: Mutex<()>,

    /// Serializes checkpoint, compaction and gc: all of them change the set of persistent
    /// layers and upload the index part.
    persistence_lock: Mutex<()>,

    state: watch::Sender<TimelineState>,

    /// Every read, write, checkpoint, compaction and download holds a guard. Shutdown closes
    /// the gate and waits for them.
    pub(crate) gate: Gate,

    /// Cancelled on shutdown, and when the timeline goes broken.
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("tenant_id", &self.tenant_id)
            .field("timeline_id", &self.timeline_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Timeline {
    pub(crate) fn new(
        conf: &'static PageServerConf,
        tenant_conf: Arc<std::sync::RwLock<TenantConfOpt>>,
        tenant_id: TenantId,
        timeline_id: TimelineId,
        remote_client: Arc<RemoteTimelineClient>,
        metrics: Arc<TimelineMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(TimelineState::Loading);
        Timeline {
            conf,
            tenant_conf,
            tenant_id,
            timeline_id,
            layers: RwLock::new(LayerManager::default()),
            download_coordinator: DownloadCoordinator::new(Arc::clone(&remote_client)),
            remote_client,
            last_record_lsn: AtomicLsn::new(0),
            disk_consistent_lsn: AtomicLsn::new(0),
            metrics,
            write_lock: Mutex::new(()),
            persistence_lock: Mutex::new(()),
            state,
            gate: Gate::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builds the layer map from a remote index part, with every listed layer remote only.
    /// Writes continue right after the index part's disk consistent LSN.
    pub(crate) async fn load_layer_map(&self, index_part: &IndexPart) -> anyhow::Result<()> {
        let disk_consistent_lsn = index_part.disk_consistent_lsn;
        let next_open_layer_at = disk_consistent_lsn
            .checked_add(1u64)
            .with_context(|| format!("disk consistent lsn {disk_consistent_lsn} out of range"))?;
        let timeline_path = self.timeline_path();

        let mut layers = Vec::with_capacity(index_part.layer_metadata.len());
        for (name, metadata) in &index_part.layer_metadata {
            if name.is_in_future(disk_consistent_lsn) {
                warn!("skipping layer {name} above disk consistent lsn {disk_consistent_lsn}");
                continue;
            }
            let desc = PersistentLayerDesc::from_layer_name(
                self.tenant_id,
                self.timeline_id,
                name,
                metadata.file_size,
            );
            layers.push(Layer::for_evicted(
                &timeline_path,
                Arc::clone(&self.metrics),
                desc,
                *metadata,
            ));
        }
        let num_layers = layers.len();

        {
            let mut guard = self.layers.write().await;
            guard
                .open_mut()?
                .initialize_remote_layers(layers, next_open_layer_at)
                .context("initialize layer map from index part")?;
        }

        self.disk_consistent_lsn.store(disk_consistent_lsn);
        self.last_record_lsn.store(disk_consistent_lsn);
        self.remote_client.init_from_index_part(index_part);

        info!(%disk_consistent_lsn, num_layers, "loaded layer map");
        Ok(())
    }

    pub(crate) fn timeline_path(&self) -> Utf8PathBuf {
        self.conf.timeline_path(&self.tenant_id, &self.timeline_id)
    }

    pub fn get_last_record_lsn(&self) -> Lsn {
        self.last_record_lsn.load()
    }

    pub fn get_disk_consistent_lsn(&self) -> Lsn {
        self.disk_consistent_lsn.load()
    }

    pub fn get_remote_consistent_lsn(&self) -> Option<Lsn> {
        self.remote_client.remote_consistent_lsn()
    }

    /// Sum of the sizes of this timeline's layer files on local disk.
    pub fn resident_physical_size(&self) -> u64 {
        self.metrics.resident_physical_size_get()
    }

    /// Look up the value of `key` as of `lsn`.
    ///
    /// Walks the in-memory layers, then the persistent layers the layer map resolves, newest
    /// first, downloading any layer that is not resident. The layer map is only read.
    pub(crate) async fn get(&self, key: Key, lsn: Lsn) -> Result<Bytes, PageReconstructError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| PageReconstructError::Cancelled)?;

        match self.current_state() {
            TimelineState::Active => {}
            TimelineState::Stopping => return Err(PageReconstructError::Cancelled),
            state => return Err(PageReconstructError::NotActive(state)),
        }

        let last_record_lsn = self.get_last_record_lsn();
        if lsn > last_record_lsn {
            return Err(PageReconstructError::FutureLsn {
                request_lsn: lsn,
                last_record_lsn,
            });
        }

        let (in_memory, historic) = {
            let guard = self.layers.read().await;
            let layer_map = guard.layer_map()?;

            // newest first; the persistent layers end where the oldest of these starts
            let in_memory: Vec<Arc<InMemoryLayer>> = layer_map
                .in_memory_layers()
                .filter(|l| l.get_lsn_range().start <= lsn)
                .cloned()
                .collect();
            let historic_lsn = match in_memory.last() {
                Some(oldest) => Lsn(oldest.get_lsn_range().start.0 - 1),
                None => lsn,
            };

            let mut historic = Vec::new();
            for res in layer_map.resolve(key, historic_lsn) {
                let layer = guard.get_from_desc(&res.layer).ok_or_else(|| {
                    PageReconstructError::Other(anyhow!(
                        "layer {} is in the layer map but not tracked",
                        res.layer.layer_name()
                    ))
                })?;
                historic.push((layer, res.lsn_floor));
            }
            (in_memory, historic)
        };

        let mut reconstruct_state = ValueReconstructState::default();
        let mut result = ValueReconstructResult::Continue;
        // nothing is stored at Lsn::MAX
        let mut cont_lsn = lsn.checked_add(1u64).unwrap_or(Lsn::MAX);

        for layer in &in_memory {
            let start_lsn = layer.get_lsn_range().start;
            result = layer
                .get_value_reconstruct_data(key, start_lsn..cont_lsn, &mut reconstruct_state)
                .await;
            cont_lsn = start_lsn;
            if result != ValueReconstructResult::Continue {
                break;
            }
        }

        if result == ValueReconstructResult::Continue {
            for (layer, lsn_floor) in historic {
                let resident = self
                    .download_coordinator
                    .ensure_resident(&layer, &self.gate)
                    .await
                    .map_err(PageReconstructError::Download)?;
                trace!(layer=%layer, %lsn_floor, %cont_lsn, "visiting layer");
                result = resident.get_value_reconstruct_data(
                    key,
                    lsn_floor..cont_lsn,
                    &mut reconstruct_state,
                );
                cont_lsn = lsn_floor;
                if result != ValueReconstructResult::Continue {
                    break;
                }
            }
        }

        if reconstruct_state.is_empty() {
            return Err(PageReconstructError::MissingKey { key, lsn });
        }
        reconstruct_state.materialize().ok_or_else(|| {
            PageReconstructError::Other(anyhow!(
                "no base image or initializing record for key {key} at {lsn}"
            ))
        })
    }

    pub(crate) async fn writer(&self) -> TimelineWriter<'_> {
        TimelineWriter {
            tl: self,
            _write_guard: self.write_lock.lock().await,
        }
    }

    /// Whether the open in-memory layer holds enough writes for the ingest path to call
    /// [`Self::checkpoint`].
    pub(crate) async fn should_checkpoint(&self) -> bool {
        let open_layer = {
            let guard = self.layers.read().await;
            match guard.layer_map() {
                Ok(layer_map) => layer_map.open_layer.clone(),
                Err(Shutdown) => return false,
            }
        };
        match open_layer {
            Some(layer) => layer.size().await >= self.get_checkpoint_distance(),
            None => false,
        }
    }

    /// Flushes all buffered writes to a new delta layer, uploads every layer not uploaded yet,
    /// and then the index part listing them.
    ///
    /// Returns the disk consistent LSN. If the upload fails, the layers stay local and out of
    /// the index part, and the next checkpoint uploads them.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub(crate) async fn checkpoint(&self) -> Result<Lsn, CheckpointError> {
        let _gate = self.gate.enter().map_err(|_| CheckpointError::Cancelled)?;
        let state = self.current_state();
        if state != TimelineState::Active {
            return Err(CheckpointError::NotActive(state));
        }

        let _persistence = self.persistence_lock.lock().await;

        self.freeze_open_layer().await?;
        loop {
            let frozen = {
                let guard = self.layers.read().await;
                guard.layer_map()?.frozen_layers.front().cloned()
            };
            let Some(frozen) = frozen else {
                break;
            };
            self.flush_frozen_layer(frozen).await?;
        }

        self.upload_layers_and_index()
            .await
            .map_err(CheckpointError::Upload)?;

        let disk_consistent_lsn = self.get_disk_consistent_lsn();
        info!(%disk_consistent_lsn, "checkpoint complete");
        Ok(disk_consistent_lsn)
    }

    /// Freezes the open layer up to the last finished write. Writes above it stay in the open
    /// layer until a later `finish_write` covers them.
    async fn freeze_open_layer(&self) -> Result<(), CheckpointError> {
        let _write_guard = self.write_lock.lock().await;
        let end_lsn = self
            .last_record_lsn
            .load()
            .checked_add(1u64)
            .unwrap_or(Lsn::MAX);

        let frozen = {
            let mut guard = self.layers.write().await;
            guard.open_mut()?.try_freeze_in_memory_layer(end_lsn).await
        };
        if let Some(frozen) = frozen {
            debug!("froze in-memory layer {frozen}");
        }
        Ok(())
    }

    /// Writes the oldest frozen layer out as a delta layer, replacing it in the layer map.
    async fn flush_frozen_layer(&self, frozen: Arc<InMemoryLayer>) -> Result<(), CheckpointError> {
        let end_lsn = frozen.get_lsn_range().end;

        let new_layer = match frozen.write_to_content().await {
            Some(content) => Some(self.write_layer_file(content).await?),
            None => None,
        };

        {
            let mut guard = self.layers.write().await;
            guard
                .open_mut()?
                .finish_flush_l0_layer(new_layer.as_ref(), &frozen)?;
        }

        self.disk_consistent_lsn.fetch_max(Lsn(end_lsn.0 - 1));
        if let Some(layer) = new_layer {
            info!(layer=%layer, "flushed in-memory layer to a delta layer");
        }
        Ok(())
    }

    /// Writes the layer file into the timeline directory. The returned layer is resident and
    /// not uploaded.
    pub(crate) async fn write_layer_file(
        &self,
        content: LayerContent,
    ) -> anyhow::Result<ResidentLayer> {
        let bytes = content.encode();
        let file_size = bytes.len() as u64;
        let desc = if content.is_delta() {
            PersistentLayerDesc::new_delta(
                self.tenant_id,
                self.timeline_id,
                content.key_range().clone(),
                content.lsn_range().clone(),
                file_size,
            )
        } else {
            PersistentLayerDesc::new_img(
                self.tenant_id,
                self.timeline_id,
                content.key_range().clone(),
                content.lsn_range().start,
                file_size,
            )
        };
        let metadata = LayerFileMetadata::new(file_size, layer_file::checksum(&bytes));

        let timeline_path = self.timeline_path();
        let path = timeline_path.join(desc.layer_name().to_string());
        crashsafe::overwrite(&path, TEMP_FILE_SUFFIX, &bytes)
            .await
            .with_context(|| format!("write layer file {path}"))?;

        Ok(Layer::for_resident(
            &timeline_path,
            Arc::clone(&self.metrics),
            desc,
            metadata,
            Arc::new(content),
        ))
    }

    /// Uploads the layers in the layer map that are not uploaded yet, oldest first, then the
    /// index part listing all uploaded layers.
    ///
    /// Stops at the first failed upload without touching the index part, so that the remote
    /// disk consistent LSN never runs ahead of the uploaded layers.
    pub(crate) async fn upload_layers_and_index(&self) -> anyhow::Result<()> {
        let mut layers: Vec<Layer> = {
            let guard = self.layers.read().await;
            guard.all_persistent_layers().cloned().collect()
        };
        layers.sort_by_key(|l| l.layer_desc().lsn_range.start);

        for layer in layers.iter().filter(|l| !l.is_uploaded()) {
            self.remote_client
                .upload_layer_file(&layer.layer_name(), layer.local_path(), &layer.metadata())
                .await?;
            layer.mark_uploaded();
        }

        let mut index_part = IndexPart::empty(self.get_disk_consistent_lsn());
        for layer in &layers {
            index_part
                .layer_metadata
                .insert(layer.layer_name(), layer.metadata());
        }
        if self.remote_client.index_part_is_current(&index_part) {
            return Ok(());
        }
        self.remote_client.upload_index_part(index_part).await
    }

    /// Drops the local copy of an uploaded layer. Returns `false` if the timeline has no such
    /// layer.
    pub(crate) async fn evict_layer(&self, layer_name: &LayerName) -> anyhow::Result<bool> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| anyhow!("timeline shutting down"))?;
        let Some(layer) = self.find_layer(layer_name).await else {
            return Ok(false);
        };
        layer.evict().await?;
        Ok(true)
    }

    /// Makes the layer resident. Returns `false` if the timeline has no such layer.
    pub(crate) async fn download_layer(
        &self,
        layer_name: &LayerName,
    ) -> Result<bool, PageReconstructError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| PageReconstructError::Cancelled)?;
        let Some(layer) = self.find_layer(layer_name).await else {
            return Ok(false);
        };
        self.download_coordinator
            .ensure_resident(&layer, &self.gate)
            .await
            .map_err(PageReconstructError::Download)?;
        Ok(true)
    }

    async fn find_layer(&self, layer_name: &LayerName) -> Option<Layer> {
        let guard = self.layers.read().await;
        let found = guard
            .all_persistent_layers()
            .find(|l| &l.layer_name() == layer_name)
            .cloned();
        found
    }

    pub(crate) async fn layer_map_info(&self) -> Result<LayerMapInfo, Shutdown> {
        let guard = self.layers.read().await;
        let layer_map = guard.layer_map()?;
        let mut in_memory_layers = Vec::with_capacity(layer_map.frozen_layers.len() + 1);
        if let Some(open_layer) = &layer_map.open_layer {
            in_memory_layers.push(open_layer.info());
        }
        for frozen_layer in &layer_map.frozen_layers {
            in_memory_layers.push(frozen_layer.info());
        }

        let mut historic_layers = Vec::new();
        for desc in layer_map.iter_historic_layers() {
            if let Some(layer) = guard.get_from_desc(&desc) {
                historic_layers.push(layer.info());
            }
        }

        Ok(LayerMapInfo {
            in_memory_layers,
            historic_layers,
        })
    }

    pub(crate) fn detail(&self) -> TimelineDetail {
        TimelineDetail {
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            current_physical_size: self.resident_physical_size(),
            last_record_lsn: self.get_last_record_lsn(),
            disk_consistent_lsn: self.get_disk_consistent_lsn(),
            remote_consistent_lsn: self.get_remote_consistent_lsn(),
            state: self.current_state(),
        }
    }

    pub(crate) fn activate(&self) {
        self.set_state(TimelineState::Active);
    }

    pub(crate) fn set_state(&self, new_state: TimelineState) {
        match (self.current_state(), new_state) {
            (equal_state_1, equal_state_2) if equal_state_1 == equal_state_2 => {
                info!("Ignoring new state, equal to the existing one: {equal_state_2:?}");
            }
            (st, TimelineState::Loading) => {
                error!("ignoring transition from {st:?} into Loading state");
            }
            (TimelineState::Broken { .. }, new_state) => {
                error!("Ignoring state update {new_state:?} for broken timeline");
            }
            (TimelineState::Stopping, TimelineState::Active) => {
                error!("Not activating a Stopping timeline");
            }
            (_, new_state) => {
                self.state.send_replace(new_state);
            }
        }
    }

    pub(crate) fn set_broken(&self, reason: String) {
        self.set_state(TimelineState::Broken { reason });
        self.cancel.cancel();
    }

    pub(crate) fn current_state(&self) -> TimelineState {
        self.state.borrow().clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.current_state() == TimelineState::Active
    }

    /// Stops the timeline: new operations are refused, running ones are waited for, and the
    /// in-memory layers are dropped. The timeline's metrics series are removed.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub(crate) async fn shutdown(&self) {
        self.set_state(TimelineState::Stopping);
        self.cancel.cancel();

        debug!("waiting for reads, downloads and checkpoints to finish");
        self.gate.close().await;

        self.layers.write().await.shutdown();
        self.metrics.shutdown();
        info!("timeline shut down");
    }

    fn get_tenant_conf(&self) -> TenantConf {
        let tenant_conf = self.tenant_conf.read().unwrap();
        tenant_conf.merge(self.conf.default_tenant_conf)
    }

    pub(crate) fn get_checkpoint_distance(&self) -> u64 {
        self.get_tenant_conf().checkpoint_distance
    }

    pub(crate) fn get_compaction_threshold(&self) -> usize {
        self.get_tenant_conf().compaction_threshold
    }

    pub(crate) fn get_image_creation_threshold(&self) -> usize {
        self.get_tenant_conf().image_creation_threshold
    }

    pub(crate) fn get_gc_horizon(&self) -> u64 {
        self.get_tenant_conf().gc_horizon
    }
}

/// Various functions to mutate the timeline.
///
/// Holding a writer excludes other writers and the freezing of the open layer.
pub(crate) struct TimelineWriter<'a> {
    tl: &'a Timeline,
    _write_guard: tokio::sync::MutexGuard<'a, ()>,
}

impl Deref for TimelineWriter<'_> {
    type Target = Timeline;

    fn deref(&self) -> &Self::Target {
        self.tl
    }
}

impl TimelineWriter<'_> {
    /// Put a new page version that can be constructed from a WAL record.
    ///
    /// The value is not readable until [`Self::finish_write`] was called with an LSN at or
    /// above `lsn`.
    pub(crate) async fn put(&self, key: Key, lsn: Lsn, value: &Value) -> anyhow::Result<()> {
        ensure!(
            self.tl.is_active(),
            "write to timeline in state {:?}",
            self.tl.current_state()
        );
        let last_record_lsn = self.tl.get_last_record_lsn();
        ensure!(
            lsn > last_record_lsn,
            "write at {lsn} not above the last record lsn {last_record_lsn}"
        );
        ensure!(lsn < Lsn::MAX, "write at {lsn}, the maximum lsn");

        let layer = {
            let mut guard = self.tl.layers.write().await;
            guard
                .open_mut()?
                .get_layer_for_write(lsn, self.tl.tenant_id, self.tl.timeline_id)?
        };
        layer.put_value(key, lsn, value).await?;
        Ok(())
    }

    /// Track the end of the latest digested WAL record.
    ///
    /// Call this after you have finished writing all the WAL up to 'new_lsn'.
    pub(crate) fn finish_write(&self, new_lsn: Lsn) {
        self.tl.last_record_lsn.fetch_max(new_lsn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{RemoteOpFileKind, RemoteOpKind, RemoteOpStatus};
    use crate::tenant::harness::TenantHarness;
    use pageserver_api::models::InMemoryLayerInfo;
    use pageserver_api::value::WalRecord;

    fn img(s: &'static str) -> Value {
        Value::Image(Bytes::from_static(s.as_bytes()))
    }

    async fn put_all(tl: &Timeline, lsn: Lsn, values: &[(Key, Value)]) -> anyhow::Result<()> {
        let writer = tl.writer().await;
        for (key, value) in values {
            writer.put(*key, lsn, value).await?;
        }
        writer.finish_write(lsn);
        Ok(())
    }

    #[tokio::test]
    async fn reads_before_and_after_checkpoint() -> anyhow::Result<()> {
        let harness = TenantHarness::create("reads_before_and_after_checkpoint")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        let key = Key::new(1, 0);
        put_all(&tl, Lsn(0x10), &[(key, img("a"))]).await?;
        put_all(
            &tl,
            Lsn(0x20),
            &[(key, Value::WalRecord(WalRecord::append("b")))],
        )
        .await?;

        assert_eq!(&tl.get(key, Lsn(0x10)).await?[..], b"a");
        assert_eq!(&tl.get(key, Lsn(0x1f)).await?[..], b"a");
        assert_eq!(&tl.get(key, Lsn(0x20)).await?[..], b"ab");

        let disk_consistent_lsn = tl.checkpoint().await?;
        assert_eq!(disk_consistent_lsn, Lsn(0x20));

        let info = tl.layer_map_info().await?;
        assert!(info.in_memory_layers.is_empty());
        assert_eq!(info.historic_layers.len(), 1);

        assert_eq!(&tl.get(key, Lsn(0x10)).await?[..], b"a");
        assert_eq!(&tl.get(key, Lsn(0x20)).await?[..], b"ab");

        // newer writes on top of the delta layer
        put_all(&tl, Lsn(0x30), &[(key, Value::WalRecord(WalRecord::init("c")))]).await?;
        assert_eq!(&tl.get(key, Lsn(0x30)).await?[..], b"c");
        assert_eq!(&tl.get(key, Lsn(0x2f)).await?[..], b"ab");

        let detail = tl.detail();
        assert_eq!(detail.last_record_lsn, Lsn(0x30));
        assert_eq!(detail.disk_consistent_lsn, Lsn(0x20));
        assert_eq!(detail.remote_consistent_lsn, Some(Lsn(0x20)));
        assert!(detail.current_physical_size > 0);
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_without_writes_is_noop() -> anyhow::Result<()> {
        let harness = TenantHarness::create("checkpoint_without_writes_is_noop")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        put_all(&tl, Lsn(0x10), &[(Key::new(1, 0), img("a"))]).await?;
        assert_eq!(tl.checkpoint().await?, Lsn(0x10));

        let puts_before = harness.unreliable.total_puts();
        assert_eq!(tl.checkpoint().await?, Lsn(0x10));
        assert_eq!(harness.unreliable.total_puts(), puts_before);
        assert_eq!(tl.layer_map_info().await?.historic_layers.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn read_errors_are_classified() -> anyhow::Result<()> {
        let harness = TenantHarness::create("read_errors_are_classified")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        put_all(&tl, Lsn(0x10), &[(Key::new(1, 0), img("a"))]).await?;

        let err = tl.get(Key::new(1, 0), Lsn(0x11)).await.unwrap_err();
        assert!(matches!(err, PageReconstructError::FutureLsn { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = tl.get(Key::new(2, 0), Lsn(0x10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // the key did not exist yet
        tl.checkpoint().await?;
        let err = tl.get(Key::new(1, 0), Lsn(0x0f)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn writes_below_last_record_lsn_are_rejected() -> anyhow::Result<()> {
        let harness = TenantHarness::create("writes_below_last_record_lsn_are_rejected")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        put_all(&tl, Lsn(0x20), &[(Key::new(1, 0), img("a"))]).await?;
        let writer = tl.writer().await;
        assert!(writer
            .put(Key::new(1, 0), Lsn(0x20), &img("b"))
            .await
            .is_err());
        assert!(writer
            .put(Key::new(1, 0), Lsn(0x10), &img("b"))
            .await
            .is_err());
        assert!(writer.put(Key::new(1, 0), Lsn::MAX, &img("b")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_leaves_unfinished_writes_open() -> anyhow::Result<()> {
        let harness = TenantHarness::create("checkpoint_leaves_unfinished_writes_open")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;
        let key = Key::new(1, 0);

        put_all(&tl, Lsn(0x10), &[(key, img("a"))]).await?;
        {
            let writer = tl.writer().await;
            writer.put(key, Lsn(0x20), &img("b")).await?;
        }

        assert_eq!(tl.checkpoint().await?, Lsn(0x10));
        assert_eq!(tl.get_last_record_lsn(), Lsn(0x10));
        let err = tl.get(key, Lsn(0x20)).await.unwrap_err();
        assert!(matches!(err, PageReconstructError::FutureLsn { .. }));

        let info = tl.layer_map_info().await?;
        assert_eq!(info.historic_layers.len(), 1);
        assert!(matches!(
            info.in_memory_layers[..],
            [InMemoryLayerInfo::Open {
                lsn_start: Lsn(0x11)
            }]
        ));
        let remote_index = tl.remote_client.download_index_part().await?;
        assert_eq!(remote_index.disk_consistent_lsn, Lsn(0x10));

        tl.writer().await.finish_write(Lsn(0x20));
        assert_eq!(&tl.get(key, Lsn(0x20)).await?[..], b"b");
        assert_eq!(tl.checkpoint().await?, Lsn(0x20));
        assert_eq!(tl.layer_map_info().await?.historic_layers.len(), 2);
        assert_eq!(&tl.get(key, Lsn(0x1f)).await?[..], b"a");
        Ok(())
    }

    #[tokio::test]
    async fn read_at_max_lsn() -> anyhow::Result<()> {
        let harness = TenantHarness::create("read_at_max_lsn")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;
        let key = Key::new(1, 0);

        put_all(&tl, Lsn(0x10), &[(key, img("a"))]).await?;
        tl.writer().await.finish_write(Lsn::MAX);

        assert_eq!(&tl.get(key, Lsn::MAX).await?[..], b"a");
        tl.checkpoint().await?;
        assert_eq!(&tl.get(key, Lsn::MAX).await?[..], b"a");
        Ok(())
    }

    #[tokio::test]
    async fn failed_upload_is_retried_by_next_checkpoint() -> anyhow::Result<()> {
        let harness = TenantHarness::create("failed_upload_is_retried_by_next_checkpoint")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        put_all(&tl, Lsn(0x10), &[(Key::new(1, 0), img("a"))]).await?;

        harness.unreliable.set_outage(true);
        let err = tl.checkpoint().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnavailable);
        harness.unreliable.set_outage(false);

        // the layer is flushed locally, but the remote index part does not list it
        assert_eq!(tl.get_disk_consistent_lsn(), Lsn(0x10));
        let remote_index = tl.remote_client.download_index_part().await?;
        assert!(remote_index.layer_metadata.is_empty());
        assert_eq!(remote_index.disk_consistent_lsn, Lsn(0));
        assert_eq!(
            harness.metrics.remote_operation_count(
                &tl.tenant_id,
                &tl.timeline_id,
                RemoteOpFileKind::Layer,
                RemoteOpKind::Upload,
                RemoteOpStatus::Failure
            ),
            1
        );

        // a flushed, not uploaded layer cannot be evicted
        let name = tl.layer_map_info().await?.historic_layers[0]
            .layer_file_name()
            .parse::<LayerName>().map_err(anyhow::Error::msg)?;
        assert!(tl.evict_layer(&name).await.is_err());

        assert_eq!(tl.checkpoint().await?, Lsn(0x10));
        let remote_index = tl.remote_client.download_index_part().await?;
        assert_eq!(remote_index.layer_metadata.len(), 1);
        assert!(remote_index.layer_metadata.contains_key(&name));
        assert_eq!(remote_index.disk_consistent_lsn, Lsn(0x10));
        assert_eq!(tl.get_remote_consistent_lsn(), Some(Lsn(0x10)));
        Ok(())
    }

    #[tokio::test]
    async fn evicted_layer_is_downloaded_on_read() -> anyhow::Result<()> {
        let harness = TenantHarness::create("evicted_layer_is_downloaded_on_read")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;

        put_all(&tl, Lsn(0x10), &[(Key::new(1, 0), img("a"))]).await?;
        tl.checkpoint().await?;

        let info = tl.layer_map_info().await?;
        let name = info.historic_layers[0].layer_file_name().parse::<LayerName>().map_err(anyhow::Error::msg)?;
        let size = tl.resident_physical_size();
        assert!(size > 0);

        assert!(tl.evict_layer(&name).await?);
        assert_eq!(tl.resident_physical_size(), 0);
        assert!(!tl.timeline_path().join(name.to_string()).exists());

        assert_eq!(&tl.get(Key::new(1, 0), Lsn(0x10)).await?[..], b"a");
        assert_eq!(tl.resident_physical_size(), size);
        assert_eq!(
            harness
                .metrics
                .download_count(&tl.tenant_id, &tl.timeline_id),
            1
        );

        // resident again, reading does not download
        assert_eq!(&tl.get(Key::new(1, 0), Lsn(0x10)).await?[..], b"a");
        assert!(tl.download_layer(&name).await?);
        assert_eq!(
            harness
                .metrics
                .download_count(&tl.tenant_id, &tl.timeline_id),
            1
        );
        assert_eq!(tl.resident_physical_size(), size);
        Ok(())
    }

    #[tokio::test]
    async fn shut_down_timeline_refuses_operations() -> anyhow::Result<()> {
        let harness = TenantHarness::create("shut_down_timeline_refuses_operations")?;
        let tenant = harness.load().await;
        let tl = tenant.create_timeline(TimelineId::generate()).await?;
        put_all(&tl, Lsn(0x10), &[(Key::new(1, 0), img("a"))]).await?;

        tl.shutdown().await;
        assert_eq!(tl.current_state(), TimelineState::Stopping);

        let err = tl.get(Key::new(1, 0), Lsn(0x10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let err = tl.checkpoint().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        Ok(())
    }
}
