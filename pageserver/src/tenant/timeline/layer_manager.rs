use anyhow::{bail, ensure, Context};
use std::{collections::HashMap, sync::Arc};
use tracing::trace;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::tenant::{
    layer_map::{BatchedUpdates, LayerMap},
    storage_layer::{InMemoryLayer, Layer, LayerName, PersistentLayerDesc, ResidentLayer},
};

/// Provides semantic APIs to manipulate the layer map.
pub(crate) enum LayerManager {
    /// Open as in not shutdown layer manager; we still have in-memory layers and we can manipulate
    /// the layers.
    Open(OpenLayerManager),
    /// Shutdown layer manager where there are no more in-memory layers and persistent layers are
    /// read-only.
    Closed { layers: HashMap<LayerName, Layer> },
}

impl Default for LayerManager {
    fn default() -> Self {
        LayerManager::Open(OpenLayerManager::default())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("layer manager has been shutdown")]
pub(crate) struct Shutdown;

impl LayerManager {
    /// Every layer descriptor in the layer map has a layer here; `None` only for descriptors
    /// that were obtained before a batch update removed them.
    pub(crate) fn get_from_desc(&self, desc: &PersistentLayerDesc) -> Option<Layer> {
        self.layers().get(&desc.layer_name()).cloned()
    }

    /// Get an immutable reference to the layer map.
    ///
    /// Modifications go through the semantic APIs of [`OpenLayerManager`].
    pub(crate) fn layer_map(&self) -> Result<&LayerMap, Shutdown> {
        match self {
            LayerManager::Open(OpenLayerManager { layer_map, .. }) => Ok(layer_map),
            LayerManager::Closed { .. } => Err(Shutdown),
        }
    }

    pub(crate) fn open_mut(&mut self) -> Result<&mut OpenLayerManager, Shutdown> {
        match self {
            LayerManager::Open(open) => Ok(open),
            LayerManager::Closed { .. } => Err(Shutdown),
        }
    }

    /// Drops the in-memory layers and makes the persistent layers read-only.
    ///
    /// Unflushed writes are lost, their data is only in the in-memory layers.
    pub(crate) fn shutdown(&mut self) {
        match self {
            LayerManager::Open(OpenLayerManager { layer_map, layers }) => {
                let open = layer_map.open_layer.take();
                let frozen = layer_map.frozen_layers.len();
                tracing::info!(open = open.is_some(), frozen, "dropped inmemory layers");
                let layers = std::mem::take(layers);
                *self = LayerManager::Closed { layers };
            }
            LayerManager::Closed { .. } => {
                tracing::debug!("ignoring multiple shutdowns on layer manager")
            }
        }
    }

    pub(crate) fn all_persistent_layers(&self) -> impl Iterator<Item = &'_ Layer> + '_ {
        self.layers().values()
    }

    fn layers(&self) -> &HashMap<LayerName, Layer> {
        match self {
            LayerManager::Open(OpenLayerManager { layers, .. }) => layers,
            LayerManager::Closed { layers } => layers,
        }
    }
}

#[derive(Default)]
pub(crate) struct OpenLayerManager {
    layer_map: LayerMap,
    /// Layer identity to the layer value holding its residency. Same set as the historic
    /// layers of `layer_map`.
    layers: HashMap<LayerName, Layer>,
}

impl std::fmt::Debug for OpenLayerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenLayerManager")
            .field("layer_count", &self.layers.len())
            .finish()
    }
}

impl OpenLayerManager {
    /// Called on attach. Initialize the layer manager with all layers listed in the remote
    /// index part, and the next open layer at `disk_consistent_lsn + 1`.
    pub(crate) fn initialize_remote_layers(
        &mut self,
        layers: Vec<Layer>,
        next_open_layer_at: Lsn,
    ) -> anyhow::Result<()> {
        self.apply(&layers, &[])?;
        self.layer_map.next_open_layer_at = Some(next_open_layer_at);
        Ok(())
    }

    /// Initialize when creating a new timeline.
    pub(crate) fn initialize_empty(&mut self, next_open_layer_at: Lsn) {
        self.layer_map.next_open_layer_at = Some(next_open_layer_at);
    }

    /// Open a new writable layer to append data if there is no open layer, otherwise return the
    /// current open layer.
    pub(crate) fn get_layer_for_write(
        &mut self,
        lsn: Lsn,
        tenant_id: TenantId,
        timeline_id: TimelineId,
    ) -> anyhow::Result<Arc<InMemoryLayer>> {
        // Do we have a layer open for writing already?
        let layer = if let Some(open_layer) = &self.layer_map.open_layer {
            if open_layer.get_lsn_range().start > lsn {
                bail!(
                    "unexpected open layer in the future: open layers starts at {}, write lsn {}",
                    open_layer.get_lsn_range().start,
                    lsn
                );
            }

            Arc::clone(open_layer)
        } else {
            // No writeable layer yet. Create one.
            let start_lsn = self
                .layer_map
                .next_open_layer_at
                .context("No next open layer found")?;
            ensure!(
                start_lsn <= lsn,
                "write at {lsn} below the next open layer start {start_lsn}"
            );

            trace!(
                "creating in-memory layer at {}/{} for record at {}",
                timeline_id,
                start_lsn,
                lsn
            );

            let layer = Arc::new(InMemoryLayer::create(tenant_id, timeline_id, start_lsn));

            self.layer_map.open_layer = Some(layer.clone());
            self.layer_map.next_open_layer_at = None;

            layer
        };

        Ok(layer)
    }

    /// Freezes the open layer at `end_lsn` (exclusive), moving it to the frozen layers.
    /// Versions at or above `end_lsn` stay writable, in a new open layer starting there.
    ///
    /// Returns the frozen layer, or `None` if there was no open layer or it starts at or
    /// above `end_lsn`.
    pub(crate) async fn try_freeze_in_memory_layer(
        &mut self,
        end_lsn: Lsn,
    ) -> Option<Arc<InMemoryLayer>> {
        if self.layer_map.open_layer.as_ref()?.get_lsn_range().start >= end_lsn {
            return None;
        }
        let open_layer = self.layer_map.open_layer.take()?;
        let unfinished = open_layer.freeze(end_lsn).await;

        // The layer is no longer open, update the layer map to reflect this.
        // We will replace it with an on-disk historic layer when it is flushed.
        self.layer_map.frozen_layers.push_back(open_layer.clone());
        match unfinished {
            Some(layer) => {
                self.layer_map.open_layer = Some(Arc::new(layer));
                self.layer_map.next_open_layer_at = None;
            }
            None => self.layer_map.next_open_layer_at = Some(end_lsn),
        }
        Some(open_layer)
    }

    /// Flush a frozen layer and add the written delta layer to the layer map, in one update.
    pub(crate) fn finish_flush_l0_layer(
        &mut self,
        delta_layer: Option<&ResidentLayer>,
        frozen_layer_for_check: &Arc<InMemoryLayer>,
    ) -> anyhow::Result<()> {
        let Some(inmem) = self.layer_map.frozen_layers.front() else {
            bail!("there must be a inmem layer to flush");
        };

        // Only one task may call this function at a time (for this timeline). If two tasks
        // tried to flush the same frozen layer, that would not work.
        ensure!(
            Arc::ptr_eq(inmem, frozen_layer_for_check),
            "flushed frozen layer {frozen_layer_for_check} is not the oldest one, {inmem}"
        );

        let new_layers: Vec<Layer> = delta_layer.iter().map(|l| l.layer().clone()).collect();
        self.apply(&new_layers, &[])?;
        self.layer_map.frozen_layers.pop_front();
        Ok(())
    }

    /// Called when compaction is completed: the new layers replace the old ones at once.
    pub(crate) fn finish_compact_l0(
        &mut self,
        compact_from: &[Layer],
        compact_to: &[ResidentLayer],
    ) -> anyhow::Result<()> {
        let new_layers: Vec<Layer> = compact_to.iter().map(|l| l.layer().clone()).collect();
        self.apply(&new_layers, compact_from)
    }

    /// Add image layers to the layer map.
    pub(crate) fn track_new_image_layers(
        &mut self,
        image_layers: &[ResidentLayer],
    ) -> anyhow::Result<()> {
        self.finish_compact_l0(&[], image_layers)
    }

    /// Called when garbage collect has selected the layers to be removed.
    pub(crate) fn finish_gc_timeline(&mut self, gc_layers: &[Layer]) -> anyhow::Result<()> {
        self.apply(&[], gc_layers)
    }

    /// Validates the whole change first, so that a rejected change leaves the layer map as
    /// it was.
    fn apply(&mut self, insert: &[Layer], remove: &[Layer]) -> anyhow::Result<()> {
        for layer in remove {
            let name = layer.layer_name();
            match self.layers.get(&name) {
                Some(present) if present == layer => {}
                Some(_) => bail!("layer {name} to remove is a different instance"),
                None => bail!("removing layer {name} that is not present in the layer map"),
            }
        }
        for layer in insert {
            let name = layer.layer_name();
            ensure!(
                !self.layers.contains_key(&name) || remove.iter().any(|l| l.layer_name() == name),
                "layer {name} is already present in the layer map"
            );
        }

        let mut updates = self.layer_map.batch_update();
        for layer in remove {
            Self::delete_historic_layer(layer, &mut updates, &mut self.layers)?;
        }
        for layer in insert {
            Self::insert_historic_layer(layer.clone(), &mut updates, &mut self.layers)?;
        }
        updates.flush();
        Ok(())
    }

    /// Helper function to insert a layer into the layer map and the identity table.
    fn insert_historic_layer(
        layer: Layer,
        updates: &mut BatchedUpdates<'_>,
        mapping: &mut HashMap<LayerName, Layer>,
    ) -> anyhow::Result<()> {
        updates.insert_historic(layer.layer_desc().clone())?;
        mapping.insert(layer.layer_name(), layer);
        Ok(())
    }

    /// Removes the layer from the layer map and the identity table. Local files are removed
    /// by [`Layer::retire`], once the caller released the layer map.
    fn delete_historic_layer(
        layer: &Layer,
        updates: &mut BatchedUpdates<'_>,
        mapping: &mut HashMap<LayerName, Layer>,
    ) -> anyhow::Result<()> {
        updates.remove_historic(layer.layer_desc())?;
        mapping.remove(&layer.layer_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{PrometheusMetrics, TimelineMetrics};
    use crate::tenant::remote_timeline_client::LayerFileMetadata;
    use pageserver_api::key::Key;

    fn layer(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        lsn_range: std::ops::Range<Lsn>,
    ) -> Layer {
        let metrics = Arc::new(TimelineMetrics::new(
            tenant_id,
            timeline_id,
            Arc::new(PrometheusMetrics::new()),
        ));
        let desc = PersistentLayerDesc::new_delta(
            tenant_id,
            timeline_id,
            Key::new(1, 0)..Key::new(1, 10),
            lsn_range,
            100,
        );
        Layer::for_evicted(
            camino::Utf8Path::new("/nonexistent"),
            metrics,
            desc,
            LayerFileMetadata::new(100, 0),
        )
    }

    #[test]
    fn rejected_change_leaves_map_untouched() {
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let a = layer(tenant_id, timeline_id, Lsn(0x10)..Lsn(0x20));
        let b = layer(tenant_id, timeline_id, Lsn(0x20)..Lsn(0x30));
        let c = layer(tenant_id, timeline_id, Lsn(0x30)..Lsn(0x40));

        let mut mgr = LayerManager::default();
        mgr.open_mut()
            .unwrap()
            .initialize_remote_layers(vec![a.clone(), b.clone()], Lsn(0x30))
            .unwrap();

        // c is new but a duplicate of b is not
        let dup_b = layer(tenant_id, timeline_id, Lsn(0x20)..Lsn(0x30));
        mgr.open_mut()
            .unwrap()
            .apply(&[c.clone(), dup_b], &[])
            .unwrap_err();
        assert_eq!(mgr.all_persistent_layers().count(), 2);
        assert_eq!(mgr.layer_map().unwrap().iter_historic_layers().count(), 2);

        // removing an unknown layer
        mgr.open_mut()
            .unwrap()
            .finish_gc_timeline(&[a.clone(), c.clone()])
            .unwrap_err();
        assert_eq!(mgr.all_persistent_layers().count(), 2);

        mgr.open_mut().unwrap().finish_gc_timeline(&[a.clone()]).unwrap();
        assert!(mgr.get_from_desc(a.layer_desc()).is_none());
        assert_eq!(mgr.get_from_desc(b.layer_desc()), Some(b));
        let size: u64 = mgr
            .all_persistent_layers()
            .map(|l| l.metadata().file_size)
            .sum();
        assert_eq!(size, 100);
    }

    #[tokio::test]
    async fn freeze_moves_open_layer() -> anyhow::Result<()> {
        let tenant_id = TenantId::generate();
        let timeline_id = TimelineId::generate();
        let mut mgr = LayerManager::default();
        let open = mgr.open_mut()?;
        open.initialize_empty(Lsn(1));

        open.get_layer_for_write(Lsn(0), tenant_id, timeline_id)
            .unwrap_err();
        let inmem = open.get_layer_for_write(Lsn(5), tenant_id, timeline_id)?;
        assert!(Arc::ptr_eq(
            &inmem,
            &open.get_layer_for_write(Lsn(6), tenant_id, timeline_id)?
        ));

        let frozen = open.try_freeze_in_memory_layer(Lsn(7)).await.unwrap();
        assert!(Arc::ptr_eq(&frozen, &inmem));
        assert!(open.try_freeze_in_memory_layer(Lsn(8)).await.is_none());
        assert_eq!(open.layer_map.next_open_layer_at, Some(Lsn(7)));

        // an open layer starting at the freeze point has nothing to freeze
        open.get_layer_for_write(Lsn(9), tenant_id, timeline_id)?;
        assert!(open.try_freeze_in_memory_layer(Lsn(7)).await.is_none());
        assert!(open.layer_map.open_layer.is_some());
        assert_eq!(open.layer_map.frozen_layers.len(), 1);

        open.finish_flush_l0_layer(None, &frozen)?;
        assert!(open.layer_map.frozen_layers.is_empty());

        mgr.shutdown();
        assert!(mgr.open_mut().is_err());
        Ok(())
    }
}
