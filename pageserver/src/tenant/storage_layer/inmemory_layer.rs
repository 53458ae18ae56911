//! An in-memory layer stores recently received key-value pairs.
//!
//! Values stay in memory until the layer is frozen and written out as a delta layer by a
//! checkpoint.
//!
use crate::tenant::storage_layer::{LayerContent, ValueReconstructResult, ValueReconstructState};
use anyhow::{ensure, Result};
use pageserver_api::key::Key;
use pageserver_api::models::InMemoryLayerInfo;
use pageserver_api::value::Value;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tracing::*;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

pub struct InMemoryLayer {
    tenant_id: TenantId,
    timeline_id: TimelineId,

    /// This layer contains all the changes from 'start_lsn'. The
    /// start is inclusive.
    start_lsn: Lsn,

    /// Frozen layers have an exclusive end LSN.
    /// Writes are only allowed when this is `None`.
    end_lsn: OnceLock<Lsn>,

    /// The above fields never change, except for `end_lsn`, which is only set once.
    /// All other changing parts are in `inner`, and protected by a lock.
    inner: RwLock<InMemoryLayerInner>,
}

impl std::fmt::Debug for InMemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLayer")
            .field("start_lsn", &self.start_lsn)
            .field("end_lsn", &self.end_lsn)
            .finish()
    }
}

#[derive(Default)]
struct InMemoryLayerInner {
    /// All versions of all pages in the layer, indexed by key and LSN.
    index: BTreeMap<Key, BTreeMap<Lsn, Value>>,

    /// Sum of [`Value::size`] of everything in `index`.
    size: u64,
}

impl InMemoryLayer {
    pub(crate) fn info(&self) -> InMemoryLayerInfo {
        let lsn_start = self.start_lsn;

        if let Some(&lsn_end) = self.end_lsn.get() {
            InMemoryLayerInfo::Frozen { lsn_start, lsn_end }
        } else {
            InMemoryLayerInfo::Open { lsn_start }
        }
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.end_lsn.get().is_some()
    }

    pub(crate) fn end_lsn_or_max(&self) -> Lsn {
        self.end_lsn.get().copied().unwrap_or(Lsn::MAX)
    }

    pub(crate) fn get_lsn_range(&self) -> Range<Lsn> {
        self.start_lsn..self.end_lsn_or_max()
    }

    /// Look up given value in the layer.
    pub(crate) async fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_state: &mut ValueReconstructState,
    ) -> ValueReconstructResult {
        let inner = self.inner.read().await;

        let Some(versions) = inner.index.get(&key) else {
            return ValueReconstructResult::Continue;
        };

        // Scan the page versions backwards, starting from the end of the range.
        reconstruct_state.collect(versions.range(lsn_range).rev().map(|(lsn, v)| (*lsn, v)))
    }

    /// Bytes of values buffered so far.
    pub async fn size(&self) -> u64 {
        self.inner.read().await.size
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.index.is_empty()
    }

    /// Create a new, empty, in-memory layer
    pub fn create(tenant_id: TenantId, timeline_id: TimelineId, start_lsn: Lsn) -> InMemoryLayer {
        trace!("initializing new empty InMemoryLayer for writing on timeline {timeline_id} at {start_lsn}");

        InMemoryLayer {
            tenant_id,
            timeline_id,
            start_lsn,
            end_lsn: OnceLock::new(),
            inner: RwLock::new(InMemoryLayerInner::default()),
        }
    }

    // Write operations

    /// Adds the page version to the in-memory tree
    pub(crate) async fn put_value(&self, key: Key, lsn: Lsn, val: &Value) -> Result<()> {
        let mut inner = self.inner.write().await;
        ensure!(
            !self.is_frozen(),
            "write to frozen in-memory layer {self} at {lsn}"
        );
        ensure!(
            lsn >= self.start_lsn,
            "write at {lsn} below the start of in-memory layer {self}"
        );
        trace!("put_value key {} at {}/{}", key, self.timeline_id, lsn);

        inner.size += val.size() as u64;
        let old = inner.index.entry(key).or_default().insert(lsn, val.clone());
        if let Some(old) = old {
            // We already had an entry for this LSN. That's odd..
            warn!("Key {} at {} already exists", key, lsn);
            inner.size -= old.size() as u64;
        }

        Ok(())
    }

    /// Make the layer non-writeable. Only call once.
    /// `end_lsn` is exclusive.
    ///
    /// Versions at or above `end_lsn` are moved out, into the returned open layer starting
    /// at `end_lsn`. `None` if there were none.
    pub async fn freeze(&self, end_lsn: Lsn) -> Option<InMemoryLayer> {
        // under the write lock, so that no put_value is halfway through
        let mut inner = self.inner.write().await;

        assert!(self.start_lsn < end_lsn);
        self.end_lsn.set(end_lsn).expect("end_lsn set only once");

        let mut above = InMemoryLayerInner::default();
        inner.index.retain(|key, versions| {
            let later = versions.split_off(&end_lsn);
            if !later.is_empty() {
                above.size += later.values().map(|v| v.size() as u64).sum::<u64>();
                above.index.insert(*key, later);
            }
            !versions.is_empty()
        });
        if above.index.is_empty() {
            return None;
        }
        inner.size -= above.size;

        Some(InMemoryLayer {
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            start_lsn: end_lsn,
            end_lsn: OnceLock::new(),
            inner: RwLock::new(above),
        })
    }

    /// Content of the delta layer that replaces this frozen layer, spanning exactly the
    /// buffered keys. `None` if nothing was written.
    pub(crate) async fn write_to_content(&self) -> Option<LayerContent> {
        let inner = self.inner.read().await;
        let end_lsn = *self.end_lsn.get().expect("write_to_content on an open layer");

        let first_key = *inner.index.keys().next()?;
        let last_key = *inner.index.keys().next_back()?;

        let entries = inner
            .index
            .iter()
            .flat_map(|(key, versions)| {
                versions
                    .iter()
                    .map(move |(lsn, value)| (*key, *lsn, value.clone()))
            })
            .collect();

        debug!(
            tenant_id = %self.tenant_id,
            timeline_id = %self.timeline_id,
            "writing {} bytes of in-memory layer {} to a delta layer",
            inner.size,
            self
        );

        Some(LayerContent::new_delta(
            first_key..last_key.next(),
            self.start_lsn..end_lsn,
            entries,
        ))
    }
}

impl std::fmt::Display for InMemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end_lsn = self.end_lsn_or_max();
        write!(f, "inmem-{:016X}-{:016X}", self.start_lsn.0, end_lsn.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pageserver_api::value::WalRecord;

    #[tokio::test]
    async fn frozen_layer_becomes_delta_content() -> anyhow::Result<()> {
        let layer = InMemoryLayer::create(TenantId::generate(), TimelineId::generate(), Lsn(0x10));
        let k1 = Key::new(1, 5);
        let k2 = Key::new(1, 9);
        layer
            .put_value(k1, Lsn(0x10), &Value::Image(Bytes::from_static(b"a")))
            .await?;
        layer
            .put_value(k1, Lsn(0x18), &Value::WalRecord(WalRecord::append("b")))
            .await?;
        layer
            .put_value(k2, Lsn(0x20), &Value::Image(Bytes::from_static(b"z")))
            .await?;
        assert_eq!(layer.size().await, 1 + 2 + 1);

        let mut state = ValueReconstructState::default();
        let res = layer
            .get_value_reconstruct_data(k1, Lsn(0x10)..Lsn(0x19), &mut state)
            .await;
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(&state.materialize().unwrap()[..], b"ab");

        assert!(layer.freeze(Lsn(0x21)).await.is_none());
        assert!(matches!(layer.info(), InMemoryLayerInfo::Frozen { .. }));
        layer
            .put_value(k2, Lsn(0x22), &Value::Image(Bytes::from_static(b"late")))
            .await
            .unwrap_err();

        let content = layer.write_to_content().await.unwrap();
        assert_eq!(content.key_range(), &(k1..k2.next()));
        assert_eq!(content.lsn_range(), &(Lsn(0x10)..Lsn(0x21)));
        assert_eq!(content.entries().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn freeze_moves_later_versions_to_new_layer() -> anyhow::Result<()> {
        let layer = InMemoryLayer::create(TenantId::generate(), TimelineId::generate(), Lsn(0x10));
        let key = Key::new(1, 1);
        for (lsn, v) in [(0x10, "a"), (0x20, "bb"), (0x30, "ccc")] {
            layer
                .put_value(key, Lsn(lsn), &Value::Image(Bytes::from_static(v.as_bytes())))
                .await?;
        }
        layer
            .put_value(Key::new(1, 2), Lsn(0x30), &Value::Image(Bytes::from_static(b"d")))
            .await?;

        let next = layer.freeze(Lsn(0x21)).await.unwrap();
        assert_eq!(layer.size().await, 1 + 2);
        assert_eq!(next.size().await, 3 + 1);
        assert_eq!(next.get_lsn_range(), Lsn(0x21)..Lsn::MAX);
        assert!(!next.is_frozen());

        let content = layer.write_to_content().await.unwrap();
        assert_eq!(content.key_range(), &(key..key.next()));
        assert_eq!(content.entries().len(), 2);

        let mut state = ValueReconstructState::default();
        let res = next
            .get_value_reconstruct_data(key, Lsn(0x21)..Lsn(0x31), &mut state)
            .await;
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(&state.materialize().unwrap()[..], b"ccc");

        next.put_value(key, Lsn(0x40), &Value::Image(Bytes::from_static(b"e")))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_layer_has_no_content() {
        let layer = InMemoryLayer::create(TenantId::generate(), TimelineId::generate(), Lsn(1));
        assert!(layer.freeze(Lsn(2)).await.is_none());
        assert!(layer.write_to_content().await.is_none());
    }
}
