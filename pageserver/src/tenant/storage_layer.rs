//! Common traits and structs for layers

pub mod inmemory_layer;
pub(crate) mod layer;
mod layer_desc;
pub(crate) mod layer_file;
mod layer_name;

use bytes::{Bytes, BytesMut};
use pageserver_api::value::{Value, WalRecord};
use std::ops::Range;

use utils::lsn::Lsn;

pub use inmemory_layer::InMemoryLayer;
pub(crate) use layer::{Layer, ResidentLayer};
pub use layer_desc::PersistentLayerDesc;
pub use layer_file::LayerContent;
pub use layer_name::{DeltaLayerName, ImageLayerName, LayerName};

/// Struct used to communicate across calls to 'get_value_reconstruct_data'.
///
/// When get_value_reconstruct_data returns Complete, 'img' is set to an image
/// of the page, or the oldest WAL record in 'records' is a will_init-type
/// record that initializes the page without requiring a previous image.
///
/// If 'get_value_reconstruct_data' returns Continue, some 'records' may have
/// been collected, but there are more records outside the current layer. Pass
/// the same ValueReconstructState struct in the next 'get_value_reconstruct_data'
/// call, to collect more records.
///
#[derive(Debug, Default)]
pub struct ValueReconstructState {
    /// Newest first.
    pub records: Vec<(Lsn, WalRecord)>,
    pub img: Option<(Lsn, Bytes)>,
}

/// Return value from get_value_reconstruct_data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueReconstructResult {
    /// Got all the data needed to reconstruct the requested page
    Complete,
    /// This layer didn't contain all the required data, the caller should look up
    /// the predecessor layer and collect more data from there.
    Continue,
    /// An image layer that does not hold the key: the key did not exist at that LSN.
    Missing,
}

impl ValueReconstructState {
    /// Takes the versions of one key, newest first, until one of them does not need
    /// older versions to be applied.
    pub(crate) fn collect<'a>(
        &mut self,
        versions: impl Iterator<Item = (Lsn, &'a Value)>,
    ) -> ValueReconstructResult {
        for (lsn, value) in versions {
            match value {
                Value::Image(img) => {
                    self.img = Some((lsn, img.clone()));
                    return ValueReconstructResult::Complete;
                }
                Value::WalRecord(rec) => {
                    self.records.push((lsn, rec.clone()));
                    if rec.will_init {
                        return ValueReconstructResult::Complete;
                    }
                }
            }
        }
        ValueReconstructResult::Continue
    }

    pub fn is_empty(&self) -> bool {
        self.img.is_none() && self.records.is_empty()
    }

    /// Applies the collected records on top of the base image. `None` when the collection
    /// has neither an image nor an initializing record to start from.
    pub fn materialize(self) -> Option<Bytes> {
        let ValueReconstructState { records, img } = self;
        let has_base = img.is_some() || records.last().is_some_and(|(_, rec)| rec.will_init);
        if !has_base {
            return None;
        }

        if records.is_empty() {
            return img.map(|(_, img)| img);
        }

        let mut page = BytesMut::new();
        if let Some((_, img)) = &img {
            page.extend_from_slice(img);
        }
        for (_, rec) in records.iter().rev() {
            if rec.will_init {
                page.clear();
            }
            page.extend_from_slice(&rec.append);
        }
        Some(page.freeze())
    }
}

/// Formats ranges of [`std::fmt::Display`] values in [`std::fmt::Debug`] output.
pub(crate) struct RangeDisplayDebug<'a, T: std::fmt::Display>(pub &'a Range<T>);

impl<T: std::fmt::Display> std::fmt::Debug for RangeDisplayDebug<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.0.start, self.0.end)
    }
}
