//! This module defines the value type used by the storage engine.
//!
//! A [`Value`] represents either a completely new value for one Key ([`Value::Image`]),
//! or a "delta" of how to get from previous version of the value to the new one
//! ([`Value::WalRecord`]).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Value {
    /// An Image value contains a full copy of the value
    Image(Bytes),
    /// A WalRecord value contains a record that needs to be applied on top of the
    /// previous version of the value, unless it initializes the page on its own.
    WalRecord(WalRecord),
}

/// A change to a page.
///
/// Applying a record appends its payload to the page. A record with `will_init` set
/// starts from an empty page, so older versions are not needed to apply it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalRecord {
    pub will_init: bool,
    pub append: Bytes,
}

impl WalRecord {
    pub fn append(append: impl Into<Bytes>) -> Self {
        WalRecord {
            will_init: false,
            append: append.into(),
        }
    }

    pub fn init(append: impl Into<Bytes>) -> Self {
        WalRecord {
            will_init: true,
            append: append.into(),
        }
    }
}

impl Value {
    #[inline(always)]
    pub fn is_image(&self) -> bool {
        matches!(self, Value::Image(_))
    }

    #[inline(always)]
    pub fn will_init(&self) -> bool {
        match self {
            Value::Image(_) => true,
            Value::WalRecord(rec) => rec.will_init,
        }
    }

    /// Rough in-memory footprint, used for checkpoint distance accounting.
    pub fn size(&self) -> usize {
        match self {
            Value::Image(img) => img.len(),
            Value::WalRecord(rec) => rec.append.len() + 1,
        }
    }
}
