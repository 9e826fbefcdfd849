//! In-memory image of one B+ tree node.
//!
//! A page serializes as the plain concatenation of its slots, each slot
//! being three big-endian 64-bit words followed by the raw key bytes:
//!
//! ```text
//! +---------+--------+--------+-----------+
//! | key len | offset | config | key bytes |
//! |   8 B   |  8 B   |  8 B   |  key len  |
//! +---------+--------+--------+-----------+
//! ```
//!
//! In a leaf slot `offset`/`config` locate the stored value (file offset and
//! stored size). In an internal slot they locate a child page: `config`
//! carries the child's stored size shifted left by one, with the low bit set
//! iff the child is a leaf. Slot 0 of an internal page is the leftmost
//! sentinel: its pointer addresses the subtree below every other key, and
//! its own key bytes are never compared.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::compare::Compare;
use crate::error::Result;
use crate::writer::{Mode, Writer};
use crate::Error;

/// Fixed per-slot overhead: key length, offset, and config words.
pub const SLOT_HEADER: u64 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    Leaf,
    Internal,
}

/// One key/pointer/config triplet inside a page.
#[derive(Clone, Debug)]
pub struct Slot {
    pub key: Vec<u8>,
    pub offset: u64,
    pub config: u64,
}

impl Slot {
    pub fn new(key: Vec<u8>, offset: u64, config: u64) -> Self {
        Slot {
            key,
            offset,
            config,
        }
    }

    /// Exact number of bytes this slot occupies in a serialized page.
    pub fn disk_size(&self) -> u64 {
        SLOT_HEADER + self.key.len() as u64
    }
}

/// Where an in-page scan stopped.
#[derive(Clone, Copy, Debug)]
pub struct Search {
    /// First index whose key compares >= the probe, or the slot count if
    /// the scan ran off the end.
    pub index: usize,
    pub exact: bool,
}

impl Search {
    /// The child to descend into from an internal page. Equal keys descend
    /// into the equal child; greater keys back up one slot.
    pub fn child_index(&self) -> usize {
        if self.exact {
            self.index
        } else {
            self.index - 1
        }
    }
}

#[derive(Clone, Debug)]
pub struct Page {
    kind: PageKind,
    slots: Vec<Slot>,
    /// Exact serialized size of this page, maintained on every slot change.
    byte_size: u64,
    /// File coordinates, populated once the page has been written.
    offset: u64,
    config: u64,
}

impl Default for Page {
    fn default() -> Self {
        Page::leaf()
    }
}

impl Page {
    /// A fresh, empty leaf.
    pub fn leaf() -> Page {
        Page {
            kind: PageKind::Leaf,
            slots: Vec::new(),
            byte_size: 0,
            offset: 0,
            config: 0,
        }
    }

    /// A fresh internal page holding only the leftmost sentinel slot.
    pub fn internal() -> Page {
        let sentinel = Slot::new(Vec::new(), 0, 0);
        let byte_size = sentinel.disk_size();
        Page {
            kind: PageKind::Internal,
            slots: vec![sentinel],
            byte_size,
            offset: 0,
            config: 0,
        }
    }

    /// A page assembled from existing slots (the split path).
    pub fn from_slots(kind: PageKind, slots: Vec<Slot>) -> Page {
        let byte_size = slots.iter().map(Slot::disk_size).sum();
        Page {
            kind,
            slots,
            byte_size,
            offset: 0,
            config: 0,
        }
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == PageKind::Leaf
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn config(&self) -> u64 {
        self.config
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Repoints slot `index` at new file coordinates, after a child or value
    /// has been rewritten.
    pub fn set_location(&mut self, index: usize, offset: u64, config: u64) {
        self.slots[index].offset = offset;
        self.slots[index].config = config;
    }

    pub fn insert_slot(&mut self, index: usize, slot: Slot) {
        self.byte_size += slot.disk_size();
        self.slots.insert(index, slot);
    }

    pub fn remove_slot(&mut self, index: usize) -> Slot {
        let slot = self.slots.remove(index);
        self.byte_size -= slot.disk_size();
        slot
    }

    /// Splits a full page in two around `mid`. Returns the halves and the
    /// middle key (the first key of the right half, duplicated for the
    /// parent).
    pub fn split(mut self, mid: usize) -> (Page, Page, Vec<u8>) {
        let right_slots = self.slots.split_off(mid);
        let middle_key = right_slots[0].key.clone();
        let left = Page::from_slots(self.kind, std::mem::take(&mut self.slots));
        let right = Page::from_slots(self.kind, right_slots);
        (left, right, middle_key)
    }

    /// Scans for the first slot whose key compares >= `key`. The leftmost
    /// sentinel of an internal page is skipped: it is ordered first
    /// unconditionally.
    pub fn search(&self, comparator: &dyn Compare, key: &[u8]) -> Search {
        let start = match self.kind {
            PageKind::Leaf => 0,
            PageKind::Internal => 1,
        };

        for (i, slot) in self.slots.iter().enumerate().skip(start) {
            match comparator.compare(&slot.key, key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Search {
                    index: i,
                    exact: true,
                },
                std::cmp::Ordering::Greater => {
                    return Search {
                        index: i,
                        exact: false,
                    }
                }
            }
        }

        Search {
            index: self.slots.len(),
            exact: false,
        }
    }

    /// Reads and decodes the page stored at `(offset, config)`.
    pub fn load(writer: &Writer, offset: u64, config: u64) -> Result<Page> {
        let stored_size = config >> 1;
        let kind = if config & 1 == 1 {
            PageKind::Leaf
        } else {
            PageKind::Internal
        };

        let buf = writer.read(Mode::Compressed, offset, stored_size)?;
        let mut page = Page::from_bytes(kind, &buf)?;
        page.offset = offset;
        page.config = config;
        Ok(page)
    }

    /// Serializes and appends this page, updating its file coordinates.
    pub fn save(&mut self, writer: &mut Writer) -> Result<()> {
        let buf = self.to_bytes();
        let (offset, stored) = writer.write(Mode::Compressed, &buf)?;
        self.offset = offset;
        self.config = (stored << 1) | (self.is_leaf() as u64);
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size as usize);
        for slot in &self.slots {
            buf.write_u64::<BigEndian>(slot.key.len() as u64).unwrap();
            buf.write_u64::<BigEndian>(slot.offset).unwrap();
            buf.write_u64::<BigEndian>(slot.config).unwrap();
            buf.extend_from_slice(&slot.key);
        }
        debug_assert_eq!(buf.len() as u64, self.byte_size);
        buf
    }

    fn from_bytes(kind: PageKind, buf: &[u8]) -> Result<Page> {
        let mut slots = Vec::new();
        let mut cursor = Cursor::new(buf);

        let total = buf.len() as u64;
        while cursor.position() < total {
            if total - cursor.position() < SLOT_HEADER {
                return Err(Error::InvalidData(format!(
                    "page image truncated inside a slot header at byte {}",
                    cursor.position()
                )));
            }
            let key_len = cursor.read_u64::<BigEndian>()?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let config = cursor.read_u64::<BigEndian>()?;

            let start = cursor.position();
            if total - start < key_len {
                return Err(Error::InvalidData(format!(
                    "page image truncated inside key bytes at byte {start}"
                )));
            }
            let key = buf[start as usize..(start + key_len) as usize].to_vec();
            cursor.set_position(start + key_len);

            slots.push(Slot::new(key, offset, config));
        }

        Ok(Page::from_slots(kind, slots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Snappy;
    use crate::compare::Lexicographic;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn leaf_with<const N: usize>(keys: [&[u8]; N]) -> Page {
        let slots = keys
            .iter()
            .map(|k| Slot::new(k.to_vec(), 0, 0))
            .collect();
        Page::from_slots(PageKind::Leaf, slots)
    }

    #[test]
    fn test_byte_size_tracks_slot_changes() {
        let mut page = Page::leaf();
        assert_eq!(page.byte_size(), 0);

        page.insert_slot(0, Slot::new(b"abc".to_vec(), 0, 0));
        assert_eq!(page.byte_size(), SLOT_HEADER + 3);

        page.insert_slot(1, Slot::new(b"xy".to_vec(), 0, 0));
        assert_eq!(page.byte_size(), 2 * SLOT_HEADER + 5);

        page.remove_slot(0);
        assert_eq!(page.byte_size(), SLOT_HEADER + 2);
    }

    #[test]
    fn test_leaf_search() {
        let page = leaf_with([b"b", b"d", b"f"]);
        let cmp = Lexicographic;

        let hit = page.search(&cmp, b"d");
        assert_eq!((hit.index, hit.exact), (1, true));

        let before = page.search(&cmp, b"a");
        assert_eq!((before.index, before.exact), (0, false));

        let between = page.search(&cmp, b"e");
        assert_eq!((between.index, between.exact), (2, false));

        let after = page.search(&cmp, b"z");
        assert_eq!((after.index, after.exact), (3, false));
    }

    #[test]
    fn test_internal_search_skips_sentinel_and_descends_right_on_equal() {
        // Sentinel, then separators "d" and "m".
        let slots = vec![
            Slot::new(Vec::new(), 0, 0),
            Slot::new(b"d".to_vec(), 0, 0),
            Slot::new(b"m".to_vec(), 0, 0),
        ];
        let page = Page::from_slots(PageKind::Internal, slots);
        let cmp = Lexicographic;

        // Anything below the first separator lands in the sentinel subtree,
        // even the empty key.
        assert_eq!(page.search(&cmp, b"a").child_index(), 0);
        assert_eq!(page.search(&cmp, b"").child_index(), 0);

        // Equal keys descend into the equal child.
        assert_eq!(page.search(&cmp, b"d").child_index(), 1);

        // Between separators, and past the end.
        assert_eq!(page.search(&cmp, b"g").child_index(), 1);
        assert_eq!(page.search(&cmp, b"z").child_index(), 2);
    }

    #[test]
    fn test_split_halves_and_middle_key() {
        let page = leaf_with([b"a", b"b", b"c", b"d"]);
        let (left, right, middle) = page.split(2);

        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 2);
        assert_eq!(middle, b"c");
        assert_eq!(right.slot(0).key, b"c");
        assert_eq!(left.byte_size(), 2 * SLOT_HEADER + 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let mut writer =
            Writer::create(&dir.path().join("db"), Arc::new(Snappy)).expect("writer");

        let mut page = leaf_with([b"alpha", b"beta"]);
        page.set_location(0, 100, 7);
        page.set_location(1, 200, 9);
        page.save(&mut writer).expect("save");
        assert_eq!(page.config() & 1, 1, "leaf bit must be set");

        let loaded = Page::load(&writer, page.offset(), page.config()).expect("load");
        assert_eq!(loaded.kind(), PageKind::Leaf);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.slot(0).key, b"alpha");
        assert_eq!(loaded.slot(0).offset, 100);
        assert_eq!(loaded.slot(1).config, 9);
        assert_eq!(loaded.byte_size(), page.byte_size());
    }

    #[test]
    fn test_from_bytes_rejects_truncated_image() {
        let page = leaf_with([b"key"]);
        let buf = page.to_bytes();

        // Cut into the key bytes.
        assert!(matches!(
            Page::from_bytes(PageKind::Leaf, &buf[..buf.len() - 1]),
            Err(Error::InvalidData(_))
        ));
        // Cut into the slot header.
        assert!(matches!(
            Page::from_bytes(PageKind::Leaf, &buf[..SLOT_HEADER as usize - 4]),
            Err(Error::InvalidData(_))
        ));
    }
}
