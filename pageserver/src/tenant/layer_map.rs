//!
//! The layer map tracks what layers exist in a timeline.
//!
//! When a timeline is attached, the layer map is populated from the layers listed in the
//! timeline's remote index part, none of them resident. New WAL goes to an InMemoryLayer,
//! which a checkpoint freezes and writes out as a delta layer.
//!
//! Design overview:
//!
//! The `search` method of the layer map is on the read critical path, so we've
//! built an efficient data structure for fast reads, stored in `LayerMap::historic`.
//!
//! This data structure relies on a persistent/immutable binary search tree. A persistent
//! BST allows you to modify the tree in such a way that each modification creates a new
//! "version" of the tree, while all previous versions stay accessible.
//!
//! Our persistent BST maintains a map of which layer file "covers" each key. It has only
//! one dimension, the key. See `layer_coverage.rs`. We use the persistent/immutable property
//! to handle the LSN dimension.
//!
//! To build the layer map, we insert each layer to the persistent BST in LSN.start order,
//! starting from the oldest one. After each insertion, we grab a reference to that "version"
//! of the tree, and store it in another tree, a BtreeMap keyed by the LSN. See
//! `historic_layer_coverage.rs`.
//!
//! To search for a particular key-LSN pair, you first look up the right "version" in the
//! BTreeMap. Then you search that version of the BST with the key.
//!
//! Removing a layer, or inserting one below the newest LSN, rebuilds the versions from the
//! lowest changed LSN on. Updates go through [`BatchedUpdates`], so a whole batch costs one
//! rebuild and no reader ever sees half of it.
//!

pub(crate) mod historic_layer_coverage;
mod layer_coverage;

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use anyhow::ensure;
use historic_layer_coverage::{BufferedHistoricLayerCoverage, HistoricLayerCoverage};
use pageserver_api::key::Key;
use utils::lsn::Lsn;

use crate::tenant::storage_layer::{InMemoryLayer, PersistentLayerDesc};

///
/// LayerMap tracks what layers exist on a timeline.
///
#[derive(Default)]
pub struct LayerMap {
    //
    // 'open_layer' holds the current InMemoryLayer that is accepting new
    // records. If it is None, 'next_open_layer_at' will be set instead, indicating
    // where the start LSN of the next InMemoryLayer that is to be created.
    //
    pub open_layer: Option<Arc<InMemoryLayer>>,
    pub next_open_layer_at: Option<Lsn>,

    ///
    /// Frozen layers, if any. Frozen layers are in-memory layers that
    /// are no longer added to, but haven't been written out to disk
    /// yet. They contain WAL older than the current 'open_layer' or
    /// 'next_open_layer_at', but newer than any historic layer.
    /// The frozen layers are in order from oldest to newest, so that
    /// the newest one is in the 'back' of the VecDeque, and the oldest
    /// in the 'front'.
    ///
    pub frozen_layers: VecDeque<Arc<InMemoryLayer>>,

    /// Index of the historic layers optimized for search
    historic: BufferedHistoricLayerCoverage<Arc<PersistentLayerDesc>>,
}

/// The primary update API for the layer map.
///
/// Batching historic layer insertions and removals is good for
/// performance and this struct helps us do that correctly.
#[must_use]
pub struct BatchedUpdates<'a> {
    // While we hold this exclusive reference to the layer map the type checker
    // will prevent us from accidentally reading any unflushed updates.
    layer_map: &'a mut LayerMap,
}

/// Provide ability to batch more updates while hiding the read
/// API so we don't accidentally read without flushing.
impl BatchedUpdates<'_> {
    ///
    /// Insert an on-disk layer.
    ///
    /// Fails if a layer with the same identity is already present.
    ///
    pub fn insert_historic(&mut self, layer_desc: PersistentLayerDesc) -> anyhow::Result<()> {
        let layer_key = layer_desc.key();
        ensure!(
            !self.layer_map.historic.contains(&layer_key),
            "layer {} is already in the layer map",
            layer_desc.layer_name()
        );
        ensure!(
            !layer_desc.key_range.is_empty() && !layer_desc.lsn_range.is_empty(),
            "layer {} covers an empty range",
            layer_desc.layer_name()
        );
        self.layer_map
            .historic
            .insert(layer_key, Arc::new(layer_desc));
        Ok(())
    }

    ///
    /// Remove an on-disk layer from the map.
    ///
    pub fn remove_historic(&mut self, layer_desc: &PersistentLayerDesc) -> anyhow::Result<()> {
        let layer_key = layer_desc.key();
        ensure!(
            self.layer_map.historic.contains(&layer_key),
            "layer {} is not in the layer map",
            layer_desc.layer_name()
        );
        self.layer_map.historic.remove(layer_key);
        Ok(())
    }

    // We will flush on drop anyway, but this method makes it
    // more explicit that there is some work being done.
    /// Apply all updates
    pub fn flush(self) {
        // Flush happens on drop
    }
}

// Ideally the flush() method should be called explicitly for more
// controlled execution. But if we forget we'd rather flush on drop
// than panic later or read without flushing.
impl Drop for BatchedUpdates<'_> {
    fn drop(&mut self) {
        self.layer_map.flush_updates();
    }
}

/// Return value of LayerMap::search
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SearchResult {
    pub layer: Arc<PersistentLayerDesc>,
    pub lsn_floor: Lsn,
}

impl LayerMap {
    ///
    /// Find the latest layer (by lsn.end) that covers the given
    /// 'key', with lsn.start < 'end_lsn'.
    ///
    /// The caller of this function is the page reconstruction
    /// algorithm looking for the next relevant delta layer, or
    /// the terminal image layer. The caller will pass the lsn_floor
    /// value as end_lsn in the next call to search.
    ///
    /// If there's an image layer exactly below the given end_lsn,
    /// search should return that layer regardless if there are
    /// overlapping deltas.
    ///
    /// If the latest layer is a delta and there is an overlapping
    /// image with it below, the lsn_floor returned should be right
    /// above that image so we don't skip it in the search. Otherwise
    /// the lsn_floor returned should be the bottom of the delta layer
    /// because we should make as much progress down the lsn axis
    /// as possible. It's fine if this way we skip some overlapping
    /// deltas, because the delta we returned would contain the same
    /// wal content.
    ///
    pub fn search(&self, key: Key, end_lsn: Lsn) -> Option<SearchResult> {
        let end_lsn_inclusive = end_lsn.checked_sub(1u64)?;
        let version = self.historic().get_version(end_lsn_inclusive)?;
        let latest_delta = version.delta_coverage.query(key);
        let latest_image = version.image_coverage.query(key);

        match (latest_delta, latest_image) {
            (None, None) => None,
            (None, Some(image)) => {
                let lsn_floor = image.get_lsn_range().start;
                Some(SearchResult {
                    layer: image,
                    lsn_floor,
                })
            }
            (Some(delta), None) => {
                let lsn_floor = delta.get_lsn_range().start;
                Some(SearchResult {
                    layer: delta,
                    lsn_floor,
                })
            }
            (Some(delta), Some(image)) => {
                let img_lsn = image.get_lsn_range().start;
                let image_is_newer = image.get_lsn_range().end >= delta.get_lsn_range().end;
                let image_exact_match = img_lsn + 1 == end_lsn;
                if image_is_newer || image_exact_match {
                    Some(SearchResult {
                        layer: image,
                        lsn_floor: img_lsn,
                    })
                } else {
                    let lsn_floor =
                        std::cmp::max(delta.get_lsn_range().start, image.get_lsn_range().start + 1);
                    Some(SearchResult {
                        layer: delta,
                        lsn_floor,
                    })
                }
            }
        }
    }

    /// All layers a read of `key` as of `lsn` may have to visit, newest first: each step of
    /// [`Self::search`] down to the first image layer. Reading stops earlier once a layer
    /// holds a version that does not need older ones.
    pub fn resolve(&self, key: Key, lsn: Lsn) -> Vec<SearchResult> {
        let mut results = Vec::new();
        // nothing is stored at Lsn::MAX
        let mut end_lsn = lsn.checked_add(1u64).unwrap_or(Lsn::MAX);
        while let Some(result) = self.search(key, end_lsn) {
            let is_image = !result.layer.is_delta();
            end_lsn = result.lsn_floor;
            results.push(result);
            if is_image || end_lsn == Lsn(0) {
                break;
            }
        }
        results
    }

    /// Start a batch of updates, applied when the batch is dropped
    pub fn batch_update(&mut self) -> BatchedUpdates<'_> {
        BatchedUpdates { layer_map: self }
    }

    /// Helper function for BatchedUpdates::drop.
    fn flush_updates(&mut self) {
        self.historic.rebuild();
    }

    fn historic(&self) -> &HistoricLayerCoverage<Arc<PersistentLayerDesc>> {
        // BatchedUpdates holds the only &mut and flushes on drop
        self.historic
            .get()
            .expect("layer map updates are flushed before any read")
    }

    /// Is there a newer image layer for given key- and LSN-range? Or a set
    /// of image layers within the specified lsn range that cover the entire
    /// specified key range?
    ///
    /// This is used for garbage collection, to determine if an old layer can
    /// be deleted.
    pub fn image_layer_exists(&self, key: &Range<Key>, lsn: &Range<Lsn>) -> bool {
        if key.is_empty() {
            // Vacuously true. There's a newer image for all 0 of the keys in the range.
            return true;
        }
        let Some(end_lsn_inclusive) = lsn.end.checked_sub(1u64) else {
            return false;
        };
        let version = match self.historic().get_version(end_lsn_inclusive) {
            Some(v) => v,
            None => return false,
        };

        version
            .image_coverage
            .segments(key.clone())
            .all(|(_, layer)| match layer {
                Some(layer) => layer.get_lsn_range().start >= lsn.start,
                None => false,
            })
    }

    pub fn iter_historic_layers(&self) -> impl '_ + Iterator<Item = Arc<PersistentLayerDesc>> {
        self.historic.iter()
    }

    /// Count the height of the tallest stack of deltas in this 2d region.
    ///
    /// This number is used to compute the largest number of deltas that
    /// we'll need to visit for any page reconstruction in this region.
    /// We use this heuristic to decide whether to create an image layer.
    pub fn count_deltas(&self, key: &Range<Key>, lsn: &Range<Lsn>) -> usize {
        // We get the delta coverage of the region, and for each part of the coverage
        // we recurse right underneath the delta. The recursion depth is limited by
        // the largest result this function could return.
        if lsn.is_empty() || key.is_empty() {
            return 0;
        }
        let Some(end_lsn_inclusive) = lsn.end.checked_sub(1u64) else {
            return 0;
        };
        let version = match self.historic().get_version(end_lsn_inclusive) {
            Some(v) => v,
            None => return 0,
        };

        let segments: Vec<_> = version.delta_coverage.segments(key.clone()).collect();
        let mut max_stacked_deltas = 0;
        for (i, (segment_start, delta)) in segments.iter().enumerate() {
            let Some(delta) = delta else {
                continue;
            };
            if delta.get_lsn_range().end <= lsn.start {
                continue;
            }
            let segment_end = segments.get(i + 1).map(|(k, _)| *k).unwrap_or(key.end);
            let kr = *segment_start..segment_end;
            let lr = lsn.start..delta.get_lsn_range().start;
            if !kr.is_empty() {
                let underneath = self.count_deltas(&kr, &lr);
                max_stacked_deltas = std::cmp::max(max_stacked_deltas, 1 + underneath);
            }
        }

        max_stacked_deltas
    }

    /// The newest image layer LSN, if any image layer exists.
    pub fn newest_image_lsn(&self) -> Option<Lsn> {
        self.iter_historic_layers()
            .filter(|l| !l.is_delta())
            .map(|l| l.image_layer_lsn())
            .max()
    }

    /// Union of the key ranges of all historic layers.
    pub fn historic_key_range(&self) -> Option<Range<Key>> {
        self.iter_historic_layers().fold(None, |acc, l| {
            let kr = l.get_key_range();
            Some(match acc {
                None => kr,
                Some(acc) => {
                    std::cmp::min(acc.start, kr.start)..std::cmp::max(acc.end, kr.end)
                }
            })
        })
    }

    /// In-memory layers newest first, the open one before the frozen ones.
    pub fn in_memory_layers(&self) -> impl Iterator<Item = &Arc<InMemoryLayer>> {
        self.open_layer
            .iter()
            .chain(self.frozen_layers.iter().rev())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::id::{TenantId, TimelineId};

    struct Ids(TenantId, TimelineId);

    impl Ids {
        fn new() -> Self {
            Ids(TenantId::generate(), TimelineId::generate())
        }

        fn delta(&self, key: Range<u32>, lsn: Range<u64>) -> PersistentLayerDesc {
            PersistentLayerDesc::new_delta(
                self.0,
                self.1,
                Key::new(0, key.start)..Key::new(0, key.end),
                Lsn(lsn.start)..Lsn(lsn.end),
                100,
            )
        }

        fn image(&self, key: Range<u32>, lsn: u64) -> PersistentLayerDesc {
            PersistentLayerDesc::new_img(
                self.0,
                self.1,
                Key::new(0, key.start)..Key::new(0, key.end),
                Lsn(lsn),
                100,
            )
        }
    }

    fn k(blknum: u32) -> Key {
        Key::new(0, blknum)
    }

    fn names(results: &[SearchResult]) -> Vec<(String, Lsn)> {
        results
            .iter()
            .map(|r| (r.layer.layer_name().to_string(), r.lsn_floor))
            .collect()
    }

    #[test]
    fn resolve_walks_down_to_the_image() -> anyhow::Result<()> {
        let ids = Ids::new();
        let image = ids.image(0..100, 0x10);
        let d1 = ids.delta(0..100, 0x11..0x20);
        let d2 = ids.delta(10..20, 0x20..0x30);

        let mut map = LayerMap::default();
        let mut updates = map.batch_update();
        updates.insert_historic(d2.clone())?;
        updates.insert_historic(image.clone())?;
        updates.insert_historic(d1.clone())?;
        updates.flush();

        let resolved = map.resolve(k(15), Lsn(0x2f));
        assert_eq!(
            names(&resolved),
            vec![
                (d2.layer_name().to_string(), Lsn(0x20)),
                (d1.layer_name().to_string(), Lsn(0x11)),
                (image.layer_name().to_string(), Lsn(0x10)),
            ]
        );

        // outside of d2's keys
        let resolved = map.resolve(k(50), Lsn(0x2f));
        assert_eq!(resolved.len(), 2);

        // reading at the image LSN needs nothing else
        let resolved = map.resolve(k(50), Lsn(0x10));
        assert_eq!(names(&resolved), vec![(image.layer_name().to_string(), Lsn(0x10))]);

        // reading at the end of time sees the newest layers
        assert_eq!(
            names(&map.resolve(k(15), Lsn::MAX)),
            names(&map.resolve(k(15), Lsn(0x2f)))
        );

        // nothing below the first layer
        assert!(map.resolve(k(50), Lsn(0x5)).is_empty());
        assert!(map.resolve(k(500), Lsn(0x2f)).is_empty());
        Ok(())
    }

    #[test]
    fn delta_above_image_floors_at_image() -> anyhow::Result<()> {
        let ids = Ids::new();
        // a delta overlapping an image in the lsn dimension
        let delta = ids.delta(0..10, 0x10..0x30);
        let image = ids.image(0..10, 0x20);

        let mut map = LayerMap::default();
        let mut updates = map.batch_update();
        updates.insert_historic(delta.clone())?;
        updates.insert_historic(image.clone())?;
        updates.flush();

        let result = map.search(k(1), Lsn(0x30)).unwrap();
        assert!(result.layer.is_delta());
        assert_eq!(result.lsn_floor, Lsn(0x21));

        let result = map.search(k(1), Lsn(0x21)).unwrap();
        assert!(!result.layer.is_delta());
        Ok(())
    }

    #[test]
    fn duplicate_and_missing_layers_are_rejected() -> anyhow::Result<()> {
        let ids = Ids::new();
        let layer = ids.delta(0..10, 0x10..0x20);

        let mut map = LayerMap::default();
        let mut updates = map.batch_update();
        updates.insert_historic(layer.clone())?;
        updates.insert_historic(layer.clone()).unwrap_err();
        updates.flush();
        assert_eq!(map.iter_historic_layers().count(), 1);

        let mut updates = map.batch_update();
        updates.insert_historic(layer.clone()).unwrap_err();
        updates.remove_historic(&layer)?;
        updates.remove_historic(&layer).unwrap_err();
        updates.flush();
        assert_eq!(map.iter_historic_layers().count(), 0);
        Ok(())
    }

    #[test]
    fn batch_replaces_atomically() -> anyhow::Result<()> {
        let ids = Ids::new();
        let l0a = ids.delta(0..10, 0x10..0x20);
        let l0b = ids.delta(0..10, 0x20..0x30);
        let merged = ids.delta(0..10, 0x10..0x30);

        let mut map = LayerMap::default();
        let mut updates = map.batch_update();
        updates.insert_historic(l0a.clone())?;
        updates.insert_historic(l0b.clone())?;
        updates.flush();

        {
            let mut updates = map.batch_update();
            updates.remove_historic(&l0a)?;
            updates.remove_historic(&l0b)?;
            updates.insert_historic(merged.clone())?;
            // flushed on drop
        }

        let resolved = map.resolve(k(3), Lsn(0x2f));
        assert_eq!(
            names(&resolved),
            vec![(merged.layer_name().to_string(), Lsn(0x10))]
        );
        Ok(())
    }

    #[test]
    fn image_layer_exists_for_gc() -> anyhow::Result<()> {
        let ids = Ids::new();
        let mut map = LayerMap::default();
        let mut updates = map.batch_update();
        updates.insert_historic(ids.delta(0..20, 0x10..0x20))?;
        updates.insert_historic(ids.image(0..10, 0x30))?;
        updates.insert_historic(ids.image(10..20, 0x40))?;
        updates.flush();

        assert!(map.image_layer_exists(&(k(0)..k(20)), &(Lsn(0x20)..Lsn(0x41))));
        // the second image is too new for this cutoff
        assert!(!map.image_layer_exists(&(k(0)..k(20)), &(Lsn(0x20)..Lsn(0x31))));
        assert!(map.image_layer_exists(&(k(0)..k(10)), &(Lsn(0x20)..Lsn(0x31))));
        // keys nobody covers
        assert!(!map.image_layer_exists(&(k(0)..k(30)), &(Lsn(0x20)..Lsn(0x41))));
        assert!(map.image_layer_exists(&(k(5)..k(5)), &(Lsn(0x20)..Lsn(0x41))));
        Ok(())
    }

    #[test]
    fn count_deltas_counts_the_tallest_stack() -> anyhow::Result<()> {
        let ids = Ids::new();
        let mut map = LayerMap::default();
        let mut updates = map.batch_update();
        updates.insert_historic(ids.image(0..100, 0x10))?;
        updates.insert_historic(ids.delta(0..100, 0x11..0x20))?;
        updates.insert_historic(ids.delta(0..50, 0x20..0x30))?;
        updates.insert_historic(ids.delta(40..50, 0x30..0x40))?;
        updates.flush();

        let everything = k(0)..k(100);
        assert_eq!(map.count_deltas(&everything, &(Lsn(0x11)..Lsn(0x40))), 3);
        assert_eq!(map.count_deltas(&(k(60)..k(100)), &(Lsn(0x11)..Lsn(0x40))), 1);
        assert_eq!(map.count_deltas(&everything, &(Lsn(0x20)..Lsn(0x40))), 2);
        assert_eq!(map.newest_image_lsn(), Some(Lsn(0x10)));
        assert_eq!(map.historic_key_range(), Some(everything));
        Ok(())
    }
}
