use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Key used in the timeline key-value store.
///
/// A key names one page: the relation it belongs to and the block within it. Keys are
/// ordered by relation first, then block, so all pages of a relation are contiguous.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Key {
    pub rel: u32,
    pub blknum: u32,
}

pub const KEY_SIZE: usize = 8;

impl Key {
    pub const MIN: Key = Key { rel: 0, blknum: 0 };

    pub const MAX: Key = Key {
        rel: u32::MAX,
        blknum: u32::MAX,
    };

    pub const fn new(rel: u32, blknum: u32) -> Self {
        Key { rel, blknum }
    }

    pub const fn to_u64(&self) -> u64 {
        ((self.rel as u64) << 32) | self.blknum as u64
    }

    pub const fn from_u64(x: u64) -> Self {
        Key {
            rel: (x >> 32) as u32,
            blknum: x as u32,
        }
    }

    pub fn next(&self) -> Key {
        self.add(1)
    }

    /// Saturates at [`Key::MAX`].
    pub fn add(&self, x: u32) -> Key {
        Key::from_u64(self.to_u64().saturating_add(x as u64))
    }

    pub fn from_slice(b: &[u8]) -> Self {
        let mut buf = [0u8; KEY_SIZE];
        buf.copy_from_slice(&b[..KEY_SIZE]);
        Key::from_u64(u64::from_be_bytes(buf))
    }

    pub fn write_to_byte_slice(&self, buf: &mut [u8]) {
        buf[..KEY_SIZE].copy_from_slice(&self.to_u64().to_be_bytes());
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 16 {
            bail!("parse error, expected 16 hex digits, got {}", s.len());
        }
        Ok(Key::from_u64(u64::from_str_radix(s, 16)?))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}", self.rel, self.blknum)
    }
}

/// Number of keys in the range, saturating for ranges wider than `u64`.
pub fn key_range_size(key_range: &Range<Key>) -> u64 {
    key_range
        .end
        .to_u64()
        .saturating_sub(key_range.start.to_u64())
}

/// Do the two half-open key ranges intersect.
pub fn ranges_overlap(a: &Range<Key>, b: &Range<Key>) -> bool {
    a.start < b.end && b.start < a.end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_from_hex_roundtrip() {
        let key = Key::new(0x1663, 0xabcdef);
        let s = key.to_string();
        assert_eq!(s, "0000166300ABCDEF");
        assert_eq!(Key::from_hex(&s).unwrap(), key);

        Key::from_hex("0001").unwrap_err();
        Key::from_hex("zz00166300ABCDEF").unwrap_err();
    }

    #[test]
    fn key_order_is_rel_then_block() {
        let a = Key::new(1, u32::MAX);
        let b = Key::new(2, 0);
        assert!(a < b);
        assert_eq!(a.next(), b);
        assert_eq!(Key::MAX.next(), Key::MAX);
        assert!(a.to_u64() < b.to_u64());
    }

    #[test]
    fn byte_slice_roundtrip() {
        let key = Key::new(7, 42);
        let mut buf = [0u8; KEY_SIZE];
        key.write_to_byte_slice(&mut buf);
        assert_eq!(Key::from_slice(&buf), key);
    }

    #[test]
    fn range_helpers() {
        let r = Key::new(1, 10)..Key::new(1, 20);
        assert_eq!(key_range_size(&r), 10);
        assert!(ranges_overlap(&r, &(Key::new(1, 19)..Key::new(2, 0))));
        assert!(!ranges_overlap(&r, &(Key::new(1, 20)..Key::new(2, 0))));
    }
}
