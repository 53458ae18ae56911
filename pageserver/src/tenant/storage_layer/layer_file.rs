//! On-disk format of the layer files.
//!
//! A layer file is the same bytes locally and in remote storage. It consists of a fixed
//! size summary followed by all the entries of the layer, sorted by key and then LSN:
//!
//! ```text
//!    summary: magic u16, format_version u16,
//!             key_start u64, key_end u64, lsn_start u64, lsn_end u64, entry count u32
//!    entry:   key u64, lsn u64, tag u8, payload length u32, payload
//! ```
//!
//! All integers are big-endian. The tag tells what the payload is: a page image, a WAL
//! record that applies on top of the previous version, or one that initializes the page.
//!
//! The summary repeats what the file name says. A file whose summary does not match the
//! name it was requested by is treated as corrupt.
use std::ops::Range;

use anyhow::{bail, ensure, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pageserver_api::key::Key;
use pageserver_api::value::{Value, WalRecord};
use utils::lsn::Lsn;

use crate::{DELTA_FILE_MAGIC, IMAGE_FILE_MAGIC, STORAGE_FORMAT_VERSION};

use super::{PersistentLayerDesc, ValueReconstructResult, ValueReconstructState};

const SUMMARY_SIZE: usize = 2 + 2 + 8 * 4 + 4;
const ENTRY_HEADER_SIZE: usize = 8 + 8 + 1 + 4;

const TAG_IMAGE: u8 = 0;
const TAG_RECORD: u8 = 1;
const TAG_INIT_RECORD: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Summary {
    magic: u16,
    format_version: u16,
    key_range: Range<Key>,
    lsn_range: Range<Lsn>,
    count: u32,
}

impl Summary {
    fn ser_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.magic);
        buf.put_u16(self.format_version);
        buf.put_u64(self.key_range.start.to_u64());
        buf.put_u64(self.key_range.end.to_u64());
        buf.put_u64(self.lsn_range.start.0);
        buf.put_u64(self.lsn_range.end.0);
        buf.put_u32(self.count);
    }

    fn des_prefix(buf: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(
            buf.remaining() >= SUMMARY_SIZE,
            "file too short for a summary: {} bytes",
            buf.remaining()
        );
        Ok(Summary {
            magic: buf.get_u16(),
            format_version: buf.get_u16(),
            key_range: Key::from_u64(buf.get_u64())..Key::from_u64(buf.get_u64()),
            lsn_range: Lsn(buf.get_u64())..Lsn(buf.get_u64()),
            count: buf.get_u32(),
        })
    }
}

/// The decoded content of one persistent layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerContent {
    key_range: Range<Key>,
    lsn_range: Range<Lsn>,
    is_delta: bool,
    /// Sorted by key, then LSN. An image layer holds exactly one image per key.
    entries: Vec<(Key, Lsn, Value)>,
}

impl LayerContent {
    /// Content of a delta layer. Entries are sorted here, they may come in any order.
    pub fn new_delta(
        key_range: Range<Key>,
        lsn_range: Range<Lsn>,
        mut entries: Vec<(Key, Lsn, Value)>,
    ) -> Self {
        entries.sort_by_key(|(key, lsn, _)| (*key, *lsn));
        debug_assert!(entries
            .iter()
            .all(|(key, lsn, _)| key_range.contains(key) && lsn_range.contains(lsn)));
        LayerContent {
            key_range,
            lsn_range,
            is_delta: true,
            entries,
        }
    }

    /// Content of an image layer at `lsn`, from one image per key.
    pub fn new_image(key_range: Range<Key>, lsn: Lsn, images: Vec<(Key, Bytes)>) -> Self {
        let mut entries: Vec<_> = images
            .into_iter()
            .map(|(key, img)| (key, lsn, Value::Image(img)))
            .collect();
        entries.sort_by_key(|(key, _, _)| *key);
        debug_assert!(entries.iter().all(|(key, _, _)| key_range.contains(key)));
        LayerContent {
            key_range,
            lsn_range: PersistentLayerDesc::image_layer_lsn_range(lsn),
            is_delta: false,
            entries,
        }
    }

    pub fn key_range(&self) -> &Range<Key> {
        &self.key_range
    }

    pub fn lsn_range(&self) -> &Range<Lsn> {
        &self.lsn_range
    }

    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    pub fn entries(&self) -> &[(Key, Lsn, Value)] {
        &self.entries
    }

    pub fn encode(&self) -> Bytes {
        let payload_len: usize = self
            .entries
            .iter()
            .map(|(_, _, value)| ENTRY_HEADER_SIZE + payload(value).len())
            .sum();
        let mut buf = BytesMut::with_capacity(SUMMARY_SIZE + payload_len);

        Summary {
            magic: if self.is_delta {
                DELTA_FILE_MAGIC
            } else {
                IMAGE_FILE_MAGIC
            },
            format_version: STORAGE_FORMAT_VERSION,
            key_range: self.key_range.clone(),
            lsn_range: self.lsn_range.clone(),
            count: self.entries.len() as u32,
        }
        .ser_into(&mut buf);

        for (key, lsn, value) in &self.entries {
            let (tag, bytes) = match value {
                Value::Image(img) => (TAG_IMAGE, img),
                Value::WalRecord(rec) if rec.will_init => (TAG_INIT_RECORD, &rec.append),
                Value::WalRecord(rec) => (TAG_RECORD, &rec.append),
            };
            buf.put_u64(key.to_u64());
            buf.put_u64(lsn.0);
            buf.put_u8(tag);
            buf.put_u32(bytes.len() as u32);
            buf.put_slice(bytes);
        }
        buf.freeze()
    }

    /// Parses a layer file and checks that it is the layer `desc` describes.
    pub fn decode(desc: &PersistentLayerDesc, file: &Bytes) -> anyhow::Result<Self> {
        let mut buf: &[u8] = file;
        let summary = Summary::des_prefix(&mut buf)?;

        let expected_magic = if desc.is_delta {
            DELTA_FILE_MAGIC
        } else {
            IMAGE_FILE_MAGIC
        };
        ensure!(
            summary.magic == expected_magic,
            "unexpected magic {:#x}, expected {:#x}",
            summary.magic,
            expected_magic
        );
        ensure!(
            summary.format_version == STORAGE_FORMAT_VERSION,
            "unsupported format version {}",
            summary.format_version
        );
        if summary.key_range != desc.key_range || summary.lsn_range != desc.lsn_range {
            bail!(
                "summary covers {}..{} at {}..{}, expected {}",
                summary.key_range.start,
                summary.key_range.end,
                summary.lsn_range.start,
                summary.lsn_range.end,
                desc.layer_name()
            );
        }

        let mut entries = Vec::with_capacity(summary.count as usize);
        for idx in 0..summary.count {
            ensure!(
                buf.remaining() >= ENTRY_HEADER_SIZE,
                "entry {idx} header is truncated"
            );
            let key = Key::from_u64(buf.get_u64());
            let lsn = Lsn(buf.get_u64());
            let tag = buf.get_u8();
            let len = buf.get_u32() as usize;
            ensure!(buf.remaining() >= len, "entry {idx} payload is truncated");
            let offset = file.len() - buf.remaining();
            let bytes = file.slice(offset..offset + len);
            buf.advance(len);

            let value = match tag {
                TAG_IMAGE => Value::Image(bytes),
                TAG_RECORD => Value::WalRecord(WalRecord::append(bytes)),
                TAG_INIT_RECORD => Value::WalRecord(WalRecord::init(bytes)),
                _ => bail!("entry {idx} has unknown tag {tag}"),
            };

            ensure!(
                summary.key_range.contains(&key) && summary.lsn_range.contains(&lsn),
                "entry {idx} at {key}@{lsn} is outside of the layer"
            );
            ensure!(
                desc.is_delta || value.is_image(),
                "image layer holds a WAL record for {key}@{lsn}"
            );
            if let Some((prev_key, prev_lsn, _)) = entries.last() {
                ensure!(
                    (*prev_key, *prev_lsn) < (key, lsn),
                    "entry {idx} at {key}@{lsn} is out of order"
                );
            }
            entries.push((key, lsn, value));
        }
        ensure!(
            !buf.has_remaining(),
            "{} trailing bytes after the last entry",
            buf.remaining()
        );

        Ok(LayerContent {
            key_range: summary.key_range,
            lsn_range: summary.lsn_range,
            is_delta: desc.is_delta,
            entries,
        })
    }

    /// Collects the versions of `key` within `lsn_range` into `reconstruct_state`.
    ///
    /// An image layer is a full copy of the key range: a key that it does not hold did not
    /// exist at the image LSN, which the result reports as [`ValueReconstructResult::Missing`].
    pub fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        reconstruct_state: &mut ValueReconstructState,
    ) -> ValueReconstructResult {
        let start = self
            .entries
            .partition_point(|(k, lsn, _)| (*k, *lsn) < (key, lsn_range.start));
        let end = self
            .entries
            .partition_point(|(k, lsn, _)| (*k, *lsn) < (key, lsn_range.end));

        let versions = self.entries[start..end]
            .iter()
            .rev()
            .map(|(_, lsn, value)| (*lsn, value));
        match reconstruct_state.collect(versions) {
            ValueReconstructResult::Continue if !self.is_delta => ValueReconstructResult::Missing,
            res => res,
        }
    }

    /// Distinct keys of the layer, in order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        let mut prev = None;
        self.entries.iter().filter_map(move |(key, _, _)| {
            if prev == Some(*key) {
                None
            } else {
                prev = Some(*key);
                Some(*key)
            }
        })
    }
}

fn payload(value: &Value) -> &Bytes {
    match value {
        Value::Image(img) => img,
        Value::WalRecord(rec) => &rec.append,
    }
}

/// Checksum of a whole layer file, as recorded in the index part.
pub fn checksum(file: &[u8]) -> u32 {
    crc32c::crc32c(file)
}

/// Decodes a downloaded or locally found layer file, verifying it against its expected
/// size and checksum first.
pub fn verify_and_decode(
    desc: &PersistentLayerDesc,
    file: &Bytes,
    expected_size: u64,
    expected_checksum: u32,
) -> anyhow::Result<LayerContent> {
    ensure!(
        file.len() as u64 == expected_size,
        "size mismatch: {} bytes, expected {}",
        file.len(),
        expected_size
    );
    let actual = checksum(file);
    ensure!(
        actual == expected_checksum,
        "checksum mismatch: {actual:08x}, expected {expected_checksum:08x}"
    );
    LayerContent::decode(desc, file).context("decode layer file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::id::{TenantId, TimelineId};

    fn k(blknum: u32) -> Key {
        Key::new(1, blknum)
    }

    fn delta_content() -> LayerContent {
        LayerContent::new_delta(
            k(0)..k(10),
            Lsn(0x10)..Lsn(0x40),
            vec![
                (k(2), Lsn(0x30), Value::WalRecord(WalRecord::append("c"))),
                (k(1), Lsn(0x10), Value::WalRecord(WalRecord::init("a"))),
                (k(2), Lsn(0x10), Value::Image(Bytes::from_static(b"base"))),
                (k(1), Lsn(0x20), Value::WalRecord(WalRecord::append("b"))),
            ],
        )
    }

    fn desc_of(content: &LayerContent, file_size: u64) -> PersistentLayerDesc {
        PersistentLayerDesc::new_delta(
            TenantId::generate(),
            TimelineId::generate(),
            content.key_range().clone(),
            content.lsn_range().clone(),
            file_size,
        )
    }

    #[test]
    fn decode_matches_encoded() {
        let content = delta_content();
        let file = content.encode();
        let desc = desc_of(&content, file.len() as u64);

        let decoded = verify_and_decode(&desc, &file, file.len() as u64, checksum(&file)).unwrap();
        assert_eq!(decoded, content);
        assert_eq!(decoded.keys().collect::<Vec<_>>(), vec![k(1), k(2)]);
    }

    #[test]
    fn detects_corruption() {
        let content = delta_content();
        let file = content.encode();
        let desc = desc_of(&content, file.len() as u64);
        let good_checksum = checksum(&file);

        let mut flipped = BytesMut::from(&file[..]);
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        let flipped = flipped.freeze();
        let err = verify_and_decode(&desc, &flipped, file.len() as u64, good_checksum).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err:#}");

        let truncated = file.slice(..file.len() - 1);
        verify_and_decode(&desc, &truncated, file.len() as u64, good_checksum).unwrap_err();
        LayerContent::decode(&desc, &truncated).unwrap_err();

        // a file that is intact but is not the layer that was asked for
        let mut other = desc.clone();
        other.lsn_range = Lsn(0x10)..Lsn(0x50);
        LayerContent::decode(&other, &file).unwrap_err();
    }

    #[test]
    fn reconstruct_data_respects_lsn_range() {
        let content = delta_content();

        let mut state = ValueReconstructState::default();
        let res = content.get_value_reconstruct_data(k(1), Lsn(0x10)..Lsn(0x40), &mut state);
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(&state.materialize().unwrap()[..], b"ab");

        // only the first version is visible below 0x20
        let mut state = ValueReconstructState::default();
        content.get_value_reconstruct_data(k(1), Lsn(0x10)..Lsn(0x20), &mut state);
        assert_eq!(&state.materialize().unwrap()[..], b"a");

        // above the base image, the record needs an older layer
        let mut state = ValueReconstructState::default();
        let res = content.get_value_reconstruct_data(k(2), Lsn(0x20)..Lsn(0x40), &mut state);
        assert_eq!(res, ValueReconstructResult::Continue);
        assert_eq!(state.records.len(), 1);
    }

    #[test]
    fn image_layer_reports_missing_keys() {
        let content = LayerContent::new_image(
            k(0)..k(10),
            Lsn(0x50),
            vec![(k(3), Bytes::from_static(b"three"))],
        );

        let mut state = ValueReconstructState::default();
        let res = content.get_value_reconstruct_data(k(3), Lsn(0x50)..Lsn(0x51), &mut state);
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(&state.materialize().unwrap()[..], b"three");

        let mut state = ValueReconstructState::default();
        let res = content.get_value_reconstruct_data(k(4), Lsn(0x50)..Lsn(0x51), &mut state);
        assert_eq!(res, ValueReconstructResult::Missing);
    }
}
