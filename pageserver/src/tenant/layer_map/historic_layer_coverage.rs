use std::collections::BTreeMap;
use std::ops::Range;

use pageserver_api::key::Key;
use tracing::debug;
use utils::lsn::Lsn;

use super::layer_coverage::LayerCoverageTuple;

/// Layers in this module are identified and indexed by this data.
///
/// A layer holds everything within its ranges, so two layers of the same kind with the same
/// ranges have the same content: these three values identify a layer.
///
/// Ordered by `lsn.start` first, which is the order [`HistoricLayerCoverage`] needs.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct LayerKey {
    pub key: Range<Key>,
    pub lsn: Range<Lsn>,
    pub is_image: bool,
}

impl PartialOrd for LayerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LayerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.lsn
            .start
            .cmp(&other.lsn.start)
            .then(self.lsn.end.cmp(&other.lsn.end))
            .then(self.key.start.cmp(&other.key.start))
            .then(self.key.end.cmp(&other.key.end))
            .then(self.is_image.cmp(&other.is_image))
    }
}

/// Layer coverage as it looked at every LSN where a layer starts.
///
/// Queries are cheap, but layers can only be appended in `lsn.start` order. Anything else
/// goes through [`BufferedHistoricLayerCoverage`].
#[derive(Debug)]
pub struct HistoricLayerCoverage<Value> {
    /// The latest state
    head: LayerCoverageTuple<Value>,

    /// State right after the layers starting at each LSN were added
    historic: BTreeMap<Lsn, LayerCoverageTuple<Value>>,
}

impl<T: Clone> Default for HistoricLayerCoverage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Value: Clone> HistoricLayerCoverage<Value> {
    pub fn new() -> Self {
        Self {
            head: LayerCoverageTuple::default(),
            historic: BTreeMap::default(),
        }
    }

    /// Add a layer
    ///
    /// Panics if new layer has older lsn.start than an existing layer.
    pub fn insert(&mut self, layer_key: LayerKey, value: Value) {
        if let Some((last_lsn, _)) = self.historic.iter().next_back() {
            assert!(
                layer_key.lsn.start >= *last_lsn,
                "unexpected retroactive insert of {layer_key:?}"
            );
        }

        let target = if layer_key.is_image {
            &mut self.head.image_coverage
        } else {
            &mut self.head.delta_coverage
        };
        target.insert(layer_key.key, layer_key.lsn.end, value);

        // O(1) clone
        self.historic.insert(layer_key.lsn.start, self.head.clone());
    }

    /// Coverage of all layers starting at or below `lsn`.
    pub fn get_version(&self, lsn: Lsn) -> Option<&LayerCoverageTuple<Value>> {
        self.historic
            .range(..=lsn)
            .next_back()
            .map(|(_, version)| version)
    }

    /// Forget all versions starting at `begin` or later.
    pub fn trim(&mut self, begin: Lsn) {
        self.historic.split_off(&begin);
        self.head = self
            .historic
            .values()
            .next_back()
            .map(|v| v.clone())
            .unwrap_or_default();
    }
}

/// [`HistoricLayerCoverage`] that accepts insertions and removals at any LSN, by replaying
/// every layer from the lowest changed `lsn.start` on.
///
/// Changes are buffered until [`Self::rebuild`], so that a batch of them costs one replay
/// and readers never see a half-applied batch.
pub struct BufferedHistoricLayerCoverage<Value> {
    historic_coverage: HistoricLayerCoverage<Value>,

    /// `None` is a pending removal.
    buffer: BTreeMap<LayerKey, Option<Value>>,

    /// All current layers, only used for replays.
    layers: BTreeMap<LayerKey, Value>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for BufferedHistoricLayerCoverage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedHistoricLayerCoverage")
            .field("buffer", &self.buffer)
            .field("layers", &self.layers)
            .finish()
    }
}

impl<T: Clone> Default for BufferedHistoricLayerCoverage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Value: Clone> BufferedHistoricLayerCoverage<Value> {
    pub fn new() -> Self {
        Self {
            historic_coverage: HistoricLayerCoverage::<Value>::new(),
            buffer: BTreeMap::new(),
            layers: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, layer_key: LayerKey, value: Value) {
        self.buffer.insert(layer_key, Some(value));
    }

    pub fn remove(&mut self, layer_key: LayerKey) {
        self.buffer.insert(layer_key, None);
    }

    /// Is the layer present, taking buffered changes into account.
    pub fn contains(&self, layer_key: &LayerKey) -> bool {
        match self.buffer.get(layer_key) {
            Some(pending) => pending.is_some(),
            None => self.layers.contains_key(layer_key),
        }
    }

    pub fn rebuild(&mut self) {
        let rebuild_since = match self.buffer.keys().next() {
            Some(LayerKey { lsn, .. }) => lsn.start,
            None => return,
        };

        let num_updates = self.buffer.len();
        for (layer_key, layer) in std::mem::take(&mut self.buffer) {
            match layer {
                Some(l) => {
                    self.layers.insert(layer_key, l);
                }
                None => {
                    self.layers.remove(&layer_key);
                }
            }
        }

        let mut num_inserted = 0;
        self.historic_coverage.trim(rebuild_since);
        let replay_from = LayerKey {
            key: Key::MIN..Key::MIN,
            lsn: rebuild_since..Lsn(0),
            is_image: false,
        };
        for (layer_key, layer) in self.layers.range(replay_from..) {
            self.historic_coverage
                .insert(layer_key.clone(), layer.clone());
            num_inserted += 1;
        }

        debug!(
            "Rebuilt layer map. Did {} insertions to process a batch of {} updates.",
            num_inserted, num_updates,
        )
    }

    /// Iterate all the layers
    ///
    /// Panics if there are buffered changes.
    pub fn iter(&self) -> impl '_ + Iterator<Item = Value> {
        assert!(self.buffer.is_empty(), "rebuild required");
        self.layers.values().cloned()
    }

    /// Return a reference to a queryable map, assuming all updates
    /// have already been processed using self.rebuild()
    pub fn get(&self) -> anyhow::Result<&HistoricLayerCoverage<Value>> {
        if !self.buffer.is_empty() {
            anyhow::bail!("rebuild required")
        }

        Ok(&self.historic_coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(key: Range<u32>, lsn: Range<u64>, is_image: bool) -> LayerKey {
        LayerKey {
            key: Key::new(0, key.start)..Key::new(0, key.end),
            lsn: Lsn(lsn.start)..Lsn(lsn.end),
            is_image,
        }
    }

    fn k(blknum: u32) -> Key {
        Key::new(0, blknum)
    }

    #[test]
    fn versions_follow_lsn_start() {
        let mut map = HistoricLayerCoverage::<&str>::new();
        map.insert(layer(0..5, 100..101, true), "Layer 1");
        map.insert(layer(3..9, 110..111, true), "Layer 2");
        map.insert(layer(5..6, 120..121, true), "Layer 3");

        assert!(map.get_version(Lsn(99)).is_none());

        let version = map.get_version(Lsn(105)).unwrap();
        assert_eq!(version.image_coverage.query(k(4)), Some("Layer 1"));

        let version = map.get_version(Lsn(115)).unwrap();
        assert_eq!(version.image_coverage.query(k(4)), Some("Layer 2"));
        assert_eq!(version.image_coverage.query(k(8)), Some("Layer 2"));
        assert_eq!(version.image_coverage.query(k(11)), None);

        let version = map.get_version(Lsn(125)).unwrap();
        assert_eq!(version.image_coverage.query(k(4)), Some("Layer 2"));
        assert_eq!(version.image_coverage.query(k(5)), Some("Layer 3"));
        assert_eq!(version.image_coverage.query(k(7)), Some("Layer 2"));
    }

    #[test]
    #[should_panic(expected = "unexpected retroactive insert")]
    fn retroactive_insert_panics() {
        let mut map = HistoricLayerCoverage::<&str>::new();
        map.insert(layer(0..5, 100..101, true), "new");
        map.insert(layer(0..5, 50..51, true), "old");
    }

    #[test]
    fn buffered_out_of_order_and_remove() {
        let mut map = BufferedHistoricLayerCoverage::new();

        map.insert(layer(0..5, 100..101, true), "Image 1");
        map.insert(layer(3..9, 110..111, true), "Image 2");
        map.insert(layer(4..6, 120..121, true), "Image 3");
        map.insert(layer(8..9, 120..121, true), "Image 4");

        // a delta layer out of order
        map.insert(layer(2..5, 105..106, false), "Delta 1");

        map.get().unwrap_err();
        map.rebuild();

        {
            let map = map.get().expect("rebuilt");

            let version = map.get_version(Lsn(102)).unwrap();
            assert_eq!(version.image_coverage.query(k(4)), Some("Image 1"));

            let version = map.get_version(Lsn(107)).unwrap();
            assert_eq!(version.image_coverage.query(k(4)), Some("Image 1"));
            assert_eq!(version.delta_coverage.query(k(4)), Some("Delta 1"));

            let version = map.get_version(Lsn(125)).unwrap();
            assert_eq!(version.image_coverage.query(k(4)), Some("Image 3"));
        }

        map.remove(layer(4..6, 120..121, true));
        assert!(!map.contains(&layer(4..6, 120..121, true)));
        map.rebuild();

        let map = map.get().expect("rebuilt");
        let version = map.get_version(Lsn(125)).unwrap();
        assert_eq!(version.image_coverage.query(k(4)), Some("Image 2"));
        assert_eq!(version.image_coverage.query(k(8)), Some("Image 4"));
    }

    #[test]
    fn removing_everything_leaves_no_versions() {
        let mut map = BufferedHistoricLayerCoverage::new();
        map.insert(layer(0..5, 100..101, true), "Image 1");
        map.rebuild();
        map.remove(layer(0..5, 100..101, true));
        map.rebuild();

        assert!(map.get().unwrap().get_version(Lsn(102)).is_none());
        assert_eq!(map.iter().count(), 0);
    }
}
