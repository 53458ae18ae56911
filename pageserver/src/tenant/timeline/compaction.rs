//! Compaction and garbage collection of a timeline's persistent layers.
//!
//! Both change the layer map only through one atomic swap per step, and upload the new
//! layers and the index part before deleting anything from remote storage.

use std::ops::Range;
use std::time::Instant;

use pageserver_api::models::TimelineState;
use tracing::{debug, info, instrument, warn};
use utils::lsn::Lsn;

use super::layer_manager::Shutdown;
use super::{PageReconstructError, Timeline};
use crate::tenant::gc_result::GcResult;
use crate::tenant::storage_layer::{Layer, LayerContent, LayerName, ResidentLayer};
use crate::tenant::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CompactionError {
    #[error("The timeline or pageserver is shutting down")]
    ShuttingDown,
    #[error("timeline is not active, state: {0:?}")]
    NotActive(TimelineState),
    /// Reading the layers to compact, downloading them if needed, failed.
    #[error("failed to read layers: {0}")]
    Read(#[from] PageReconstructError),
    #[error("remote storage operation failed: {0:#}")]
    Remote(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompactionError {
    /// Errors that can be ignored, i.e., cancel and shutdown.
    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            Self::ShuttingDown | Self::Read(PageReconstructError::Cancelled)
        )
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        match self {
            CompactionError::ShuttingDown => ErrorKind::Cancelled,
            CompactionError::NotActive(_) => ErrorKind::InvalidState,
            CompactionError::Read(e) => e.kind(),
            CompactionError::Remote(_) => ErrorKind::RemoteUnavailable,
            CompactionError::Other(_) => ErrorKind::Other,
        }
    }
}

impl From<Shutdown> for CompactionError {
    fn from(_: Shutdown) -> Self {
        CompactionError::ShuttingDown
    }
}

fn union<T: Ord + Copy>(a: &Range<T>, b: &Range<T>) -> Range<T> {
    std::cmp::min(a.start, b.start)..std::cmp::max(a.end, b.end)
}

impl Timeline {
    /// Merges level 0 delta layers and creates image layers, as the thresholds in the tenant
    /// config call for.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub(crate) async fn compact(&self) -> Result<(), CompactionError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| CompactionError::ShuttingDown)?;
        let state = self.current_state();
        if state != TimelineState::Active {
            return Err(CompactionError::NotActive(state));
        }
        let _persistence = self.persistence_lock.lock().await;

        let retired = self.compact_level0().await?;
        if self.cancel.is_cancelled() {
            return Err(CompactionError::ShuttingDown);
        }
        let image_layer = self.create_image_layer().await?;

        if retired.is_empty() && image_layer.is_none() {
            debug!("nothing to compact");
            return Ok(());
        }

        self.upload_layers_and_index()
            .await
            .map_err(CompactionError::Remote)?;
        self.delete_remote_layers(&retired).await
    }

    /// Merges the delta layers above the newest image layer into one delta layer spanning
    /// all of them, once there are at least `compaction_threshold` of them.
    ///
    /// Returns the replaced layers, already removed from the layer map and local disk.
    async fn compact_level0(&self) -> Result<Vec<Layer>, CompactionError> {
        let threshold = std::cmp::max(self.get_compaction_threshold(), 2);

        let level0: Vec<Layer> = {
            let guard = self.layers.read().await;
            let layer_map = guard.layer_map()?;
            let newest_image = layer_map.newest_image_lsn();
            let mut deltas: Vec<Layer> = layer_map
                .iter_historic_layers()
                .filter(|desc| desc.is_delta())
                .filter(|desc| newest_image.map_or(true, |img| desc.lsn_range.start > img))
                .filter_map(|desc| guard.get_from_desc(&desc))
                .collect();
            deltas.sort_by_key(|l| l.layer_desc().lsn_range.start);
            deltas
        };

        if level0.len() < threshold {
            debug!(
                level0_deltas = level0.len(),
                threshold, "not enough level 0 deltas to compact"
            );
            return Ok(Vec::new());
        }

        let mut key_range = level0[0].layer_desc().key_range.clone();
        let mut lsn_range = level0[0].layer_desc().lsn_range.clone();
        let mut entries = Vec::new();
        for layer in &level0 {
            let resident = self
                .download_coordinator
                .ensure_resident(layer, &self.gate)
                .await
                .map_err(PageReconstructError::Download)?;
            key_range = union(&key_range, &resident.layer_desc().key_range);
            lsn_range = union(&lsn_range, &resident.layer_desc().lsn_range);
            entries.extend(resident.content().entries().iter().cloned());
        }

        let new_layer = self
            .write_layer_file(LayerContent::new_delta(key_range, lsn_range, entries))
            .await?;

        self.swap_layers(&level0, std::slice::from_ref(&new_layer))
            .await?;
        info!(
            new_layer=%new_layer,
            merged = level0.len(),
            "compacted level 0 delta layers"
        );
        Ok(level0)
    }

    /// Materializes every key at the disk consistent LSN into a new image layer, once the
    /// deltas stacked above the newest image layer reach `image_creation_threshold`.
    async fn create_image_layer(&self) -> Result<Option<ResidentLayer>, CompactionError> {
        let threshold = self.get_image_creation_threshold();
        let disk_consistent_lsn = self.get_disk_consistent_lsn();

        let (key_range, source_layers) = {
            let guard = self.layers.read().await;
            let layer_map = guard.layer_map()?;
            let Some(key_range) = layer_map.historic_key_range() else {
                return Ok(None);
            };
            let newest_image = layer_map.newest_image_lsn();
            if newest_image == Some(disk_consistent_lsn) {
                return Ok(None);
            }
            let above_image = newest_image.map_or(Lsn(0), |lsn| lsn + 1)..disk_consistent_lsn + 1;
            let deltas = layer_map.count_deltas(&key_range, &above_image);
            if deltas < threshold {
                debug!(deltas, threshold, "not enough deltas to create an image layer");
                return Ok(None);
            }

            // the newest image and everything above it holds every key that exists
            let source_layers: Vec<Layer> = layer_map
                .iter_historic_layers()
                .filter(|desc| desc.lsn_range.end > newest_image.unwrap_or(Lsn(0)))
                .filter_map(|desc| guard.get_from_desc(&desc))
                .collect();
            (key_range, source_layers)
        };

        let mut keys = std::collections::BTreeSet::new();
        for layer in &source_layers {
            let resident = self
                .download_coordinator
                .ensure_resident(layer, &self.gate)
                .await
                .map_err(PageReconstructError::Download)?;
            keys.extend(resident.content().keys());
        }

        let mut images = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(key, disk_consistent_lsn).await {
                Ok(img) => images.push((key, img)),
                // written only after the disk consistent LSN
                Err(PageReconstructError::MissingKey { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if images.is_empty() {
            return Ok(None);
        }

        let image_layer = self
            .write_layer_file(LayerContent::new_image(
                key_range,
                disk_consistent_lsn,
                images,
            ))
            .await?;
        self.swap_layers(&[], std::slice::from_ref(&image_layer))
            .await?;
        info!(image_layer=%image_layer, "created image layer");
        Ok(Some(image_layer))
    }

    /// Removes layers that no read at or above `disk_consistent_lsn - gc_horizon` needs: those
    /// ending at or below that cutoff whose whole key range is covered by a newer image layer.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub(crate) async fn gc(&self) -> Result<GcResult, CompactionError> {
        let _gate = self
            .gate
            .enter()
            .map_err(|_| CompactionError::ShuttingDown)?;
        let state = self.current_state();
        if state != TimelineState::Active {
            return Err(CompactionError::NotActive(state));
        }
        let _persistence = self.persistence_lock.lock().await;

        let now = Instant::now();
        let mut result = GcResult {
            timelines: 1,
            ..GcResult::default()
        };

        let horizon = self.get_gc_horizon();
        let Some(space_cutoff) = self.get_disk_consistent_lsn().checked_sub(horizon) else {
            info!("Nothing to GC: history is shorter than the gc horizon {horizon}");
            return Ok(result);
        };

        let layers_to_remove: Vec<Layer> = {
            let guard = self.layers.read().await;
            let layer_map = guard.layer_map()?;
            let mut layers_to_remove = Vec::new();
            for desc in layer_map.iter_historic_layers() {
                result.layers_total += 1;

                if desc.lsn_range.end > space_cutoff {
                    debug!(
                        "keeping {} because it's newer than space_cutoff {}",
                        desc.layer_name(),
                        space_cutoff
                    );
                    result.layers_needed_by_cutoff += 1;
                    continue;
                }

                // An image layer at the cutoff itself serves every read at or above it.
                if !layer_map
                    .image_layer_exists(&desc.key_range, &(desc.lsn_range.end..space_cutoff + 1))
                {
                    debug!("keeping {} because it is the latest layer", desc.layer_name());
                    result.layers_not_updated += 1;
                    continue;
                }

                info!("garbage collecting {}", desc.layer_name());
                if let Some(layer) = guard.get_from_desc(&desc) {
                    layers_to_remove.push(layer);
                }
            }
            layers_to_remove
        };

        if !layers_to_remove.is_empty() {
            self.swap_layers(&layers_to_remove, &[]).await?;
            result.layers_removed = layers_to_remove.len() as u64;
            result.bytes_removed = layers_to_remove
                .iter()
                .map(|layer| layer.layer_desc().file_size)
                .sum();

            self.upload_layers_and_index()
                .await
                .map_err(CompactionError::Remote)?;
            self.delete_remote_layers(&layers_to_remove).await?;
        }

        result.elapsed = now.elapsed();
        info!(
            removed = result.layers_removed,
            total = result.layers_total,
            "GC completed"
        );
        Ok(result)
    }

    /// Replaces `remove` by `insert` in the layer map, in one update, and removes the local
    /// files of the replaced layers.
    ///
    /// Downloads of the replaced layers still in flight are waited for first, so that none
    /// of them installs a file after it was removed.
    async fn swap_layers(
        &self,
        remove: &[Layer],
        insert: &[ResidentLayer],
    ) -> Result<(), CompactionError> {
        for layer in remove {
            self.download_coordinator.wait_for_inflight(layer).await;
        }

        {
            let mut guard = self.layers.write().await;
            let open = guard.open_mut()?;
            if remove.is_empty() {
                open.track_new_image_layers(insert)?;
            } else if insert.is_empty() {
                open.finish_gc_timeline(remove)?;
            } else {
                open.finish_compact_l0(remove, insert)?;
            }
        }

        for layer in remove {
            layer.retire().await;
        }
        Ok(())
    }

    /// Deletes the remote files of layers that the uploaded index part no longer lists.
    async fn delete_remote_layers(&self, layers: &[Layer]) -> Result<(), CompactionError> {
        let names: Vec<LayerName> = layers
            .iter()
            .filter(|l| l.is_uploaded())
            .map(|l| l.layer_name())
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.remote_client.delete_layer_files(&names).await {
            warn!("failed to delete replaced layers from remote storage: {e:#}");
            return Err(CompactionError::Remote(e));
        }
        Ok(())
    }
}
