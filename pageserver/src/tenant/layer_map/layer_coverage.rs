use std::ops::Range;

use im::OrdMap;
use pageserver_api::key::Key;
use utils::lsn::Lsn;

/// Which layer is on top at every key, as a sweep over the key space.
///
/// A node at key `k` says: from `k` up to the next node, the layer with the highest
/// `lsn.end` is this one (or nothing). Layers must be inserted in non-decreasing
/// `lsn.start` order, which is what [`super::historic_layer_coverage`] guarantees.
///
/// The map is persistent, so a clone is O(1) and shares structure with the original.
/// That is what makes keeping one coverage per LSN affordable.
#[derive(Debug)]
pub struct LayerCoverage<Value> {
    nodes: OrdMap<Key, Option<(Lsn, Value)>>,
}

impl<T: Clone> Default for LayerCoverage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Value: Clone> LayerCoverage<Value> {
    pub fn new() -> Self {
        Self {
            nodes: OrdMap::default(),
        }
    }

    /// Splits the coverage at `key` without changing what covers any key.
    fn split_at(&mut self, key: Key) {
        let covering = self
            .nodes
            .range(..=key)
            .next_back()
            .and_then(|(_, node)| node.clone());
        self.nodes.insert(key, covering);
    }

    /// Insert a layer covering `key` whose data ends at `lsn_end`.
    ///
    /// Complexity: O(log N) per coverage change inside `key`. Only pathological grids of
    /// crossing layers make that O(N).
    pub fn insert(&mut self, key: Range<Key>, lsn_end: Lsn, value: Value) {
        // pin the coverage right outside of the range before touching anything inside
        self.split_at(key.start);
        self.split_at(key.end);

        let mut to_update = Vec::new();
        let mut to_remove = Vec::new();
        let mut prev_raised = false;
        for (k, node) in self.nodes.range(key) {
            let raise = match node {
                None => true,
                Some((end, _)) => *end < lsn_end,
            };
            if raise {
                // consecutive raised segments merge into the first one
                if prev_raised {
                    to_remove.push(*k);
                } else {
                    to_update.push(*k);
                }
            }
            prev_raised = raise;
        }
        for k in to_update {
            self.nodes.insert(k, Some((lsn_end, value.clone())));
        }
        for k in to_remove {
            self.nodes.remove(&k);
        }
    }

    /// The layer on top at `key`.
    ///
    /// Complexity: O(log N)
    pub fn query(&self, key: Key) -> Option<Value> {
        self.nodes
            .range(..=key)
            .next_back()?
            .1
            .as_ref()
            .map(|(_, v)| v.clone())
    }

    /// Coverage changes strictly inside `key`. Combine with [`Self::query`] at `key.start`
    /// to know what covers the beginning of the range.
    ///
    /// Complexity: O(log N + result_size)
    pub fn range(&self, key: Range<Key>) -> impl '_ + Iterator<Item = (Key, Option<Value>)> {
        self.nodes
            .range(key)
            .map(|(k, v)| (*k, v.as_ref().map(|(_, value)| value.clone())))
    }

    /// Every segment of `key`, as `(segment start, covering value)`, starting at `key.start`.
    pub fn segments(&self, key: Range<Key>) -> impl '_ + Iterator<Item = (Key, Option<Value>)> {
        let first = (key.start, self.query(key.start));
        let rest = self
            .nodes
            .range(key.clone())
            .filter(move |(k, _)| **k != key.start)
            .map(|(k, v)| (*k, v.as_ref().map(|(_, value)| value.clone())));
        std::iter::once(first).chain(rest)
    }

    /// O(1) clone
    pub fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
        }
    }
}

/// Image and delta coverage at a specific LSN.
#[derive(Debug)]
pub struct LayerCoverageTuple<Value> {
    pub image_coverage: LayerCoverage<Value>,
    pub delta_coverage: LayerCoverage<Value>,
}

impl<T: Clone> Default for LayerCoverageTuple<T> {
    fn default() -> Self {
        Self {
            image_coverage: LayerCoverage::default(),
            delta_coverage: LayerCoverage::default(),
        }
    }
}

impl<Value: Clone> LayerCoverageTuple<Value> {
    pub fn clone(&self) -> Self {
        Self {
            image_coverage: self.image_coverage.clone(),
            delta_coverage: self.delta_coverage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(blknum: u32) -> Key {
        Key::new(0, blknum)
    }

    #[test]
    fn taller_layer_wins() {
        let mut coverage = LayerCoverage::<&str>::new();
        coverage.insert(k(0)..k(10), Lsn(5), "low");
        coverage.insert(k(3)..k(6), Lsn(8), "high");

        assert_eq!(coverage.query(k(0)), Some("low"));
        assert_eq!(coverage.query(k(3)), Some("high"));
        assert_eq!(coverage.query(k(5)), Some("high"));
        assert_eq!(coverage.query(k(6)), Some("low"));
        assert_eq!(coverage.query(k(10)), None);

        // a layer ending earlier does not hide the taller one
        coverage.insert(k(0)..k(10), Lsn(4), "short");
        assert_eq!(coverage.query(k(4)), Some("high"));
        assert_eq!(coverage.query(k(8)), Some("low"));
    }

    #[test]
    fn clones_are_independent() {
        let mut coverage = LayerCoverage::<&str>::new();
        coverage.insert(k(0)..k(4), Lsn(1), "a");
        let snapshot = coverage.clone();
        coverage.insert(k(0)..k(4), Lsn(2), "b");

        assert_eq!(snapshot.query(k(1)), Some("a"));
        assert_eq!(coverage.query(k(1)), Some("b"));
    }

    #[test]
    fn segments_start_at_range_start() {
        let mut coverage = LayerCoverage::<&str>::new();
        coverage.insert(k(0)..k(4), Lsn(1), "a");
        coverage.insert(k(4)..k(8), Lsn(1), "b");

        let segments: Vec<_> = coverage.segments(k(2)..k(6)).collect();
        assert_eq!(segments, vec![(k(2), Some("a")), (k(4), Some("b"))]);

        let segments: Vec<_> = coverage.segments(k(4)..k(10)).collect();
        assert_eq!(segments, vec![(k(4), Some("b")), (k(8), None)]);
    }
}
