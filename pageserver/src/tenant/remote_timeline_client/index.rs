//! In-memory index to track the tenant files on the remote storage.
//!
//! Able to restore itself from the storage index parts, that are located in every timeline's
//! remote directory and contain all data about the remote files of the timeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;

use crate::tenant::storage_layer::LayerName;

/// Metadata gathered for each of the layer files, checked on download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFileMetadata {
    pub file_size: u64,
    /// crc32c of the whole layer file.
    pub checksum: u32,
}

impl LayerFileMetadata {
    pub fn new(file_size: u64, checksum: u32) -> Self {
        LayerFileMetadata {
            file_size,
            checksum,
        }
    }
}

/// In-memory representation of an `index_part.json` file
///
/// Contains the data about all files in the timeline, present remotely and its metadata.
///
/// Only layer files whose upload finished are ever listed here. Unknown fields are ignored,
/// so an older pageserver can read the index part of a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPart {
    /// Debugging aid describing the version of this type.
    #[serde(default)]
    pub version: usize,

    /// Per layer file name metadata, which can be present for a present or missing layer file.
    pub layer_metadata: HashMap<LayerName, LayerFileMetadata>,

    /// Highest LSN covered by the listed layers.
    pub disk_consistent_lsn: Lsn,
}

impl IndexPart {
    /// When adding or modifying any parts of `IndexPart`, increment the version so that it can be
    /// used to understand later versions.
    ///
    /// 1: initial version
    const LATEST_VERSION: usize = 1;

    pub const FILE_NAME: &'static str = "index_part.json";

    pub fn empty(disk_consistent_lsn: Lsn) -> Self {
        IndexPart {
            version: Self::LATEST_VERSION,
            layer_metadata: HashMap::new(),
            disk_consistent_lsn,
        }
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_v1() -> anyhow::Result<()> {
        let example = r#"{
            "version": 1,
            "layer_metadata": {
                "0000000100000000-0000000100000064__0000000000000010-0000000000000020": { "file_size": 4096, "checksum": 305419896 },
                "0000000000000000-0000000100000064__0000000000000020": { "file_size": 1024, "checksum": 0 }
            },
            "disk_consistent_lsn": "0/20"
        }"#;

        let expected = IndexPart {
            version: 1,
            layer_metadata: HashMap::from([
                (
                    LayerName::from_str(
                        "0000000100000000-0000000100000064__0000000000000010-0000000000000020",
                    )
                    .map_err(anyhow::Error::msg)?,
                    LayerFileMetadata::new(4096, 0x12345678),
                ),
                (
                    LayerName::from_str("0000000000000000-0000000100000064__0000000000000020")
                        .map_err(anyhow::Error::msg)?,
                    LayerFileMetadata::new(1024, 0),
                ),
            ]),
            disk_consistent_lsn: Lsn(0x20),
        };

        let part = IndexPart::from_json_bytes(example.as_bytes())?;
        assert_eq!(part, expected);

        let back = IndexPart::from_json_bytes(&part.to_json_bytes()?)?;
        assert_eq!(back, part);
        Ok(())
    }

    #[test]
    fn unknown_fields_are_ignored() -> anyhow::Result<()> {
        let example = r#"{
            "version": 7,
            "layer_metadata": {},
            "disk_consistent_lsn": "0/0",
            "some_future_field": [1, 2, 3]
        }"#;
        let part = IndexPart::from_json_bytes(example.as_bytes())?;
        assert_eq!(part.version, 7);
        assert!(part.layer_metadata.is_empty());
        Ok(())
    }

    #[test]
    fn garbage_is_rejected() {
        IndexPart::from_json_bytes(b"{ not json").unwrap_err();
        // a layer name that is not one
        IndexPart::from_json_bytes(
            br#"{ "layer_metadata": { "foo": { "file_size": 1, "checksum": 1 } }, "disk_consistent_lsn": "0/0" }"#,
        )
        .unwrap_err();
    }
}
