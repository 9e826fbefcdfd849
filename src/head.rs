//! The head record: the durability boundary of the tree.
//!
//! A head is a fixed-size, uncompressed record appended after every mutation
//! that moves the root. The newest valid head wins at open; anything after
//! it (pages from a torn mutation) is unreachable garbage. Layout, all
//! fields big-endian:
//!
//! ```text
//! +-------+---------+-----------+-------------+-------------+
//! | magic | version | page_size | root offset | root config |
//! |  8 B  |   8 B   |    8 B    |     8 B     |     8 B     |
//! +-------+---------+-----------+-------------+-------------+
//! ```
//!
//! `HEAD_SIZE` is a multiple of the writer's padding unit, so heads tile the
//! file and the backward tail scan lands on record boundaries.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::config::MIN_PAGE_SIZE;
use crate::error::Result;
use crate::Error;

pub const HEAD_SIZE: usize = 40;
const MAGIC: &[u8; 8] = b"BIRCH\0DB";
const VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Head {
    pub page_size: u64,
    pub root_offset: u64,
    pub root_config: u64,
}

impl Head {
    /// Cheap check used by the tail scan: does this buffer start like a
    /// current-version head record?
    pub fn probe(buf: &[u8]) -> bool {
        buf.len() >= 16
            && &buf[0..8] == MAGIC
            && u64::from_be_bytes(buf[8..16].try_into().unwrap()) == VERSION
    }

    pub fn encode(&self) -> [u8; HEAD_SIZE] {
        let mut buf = [0u8; HEAD_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        (&mut buf[8..16]).write_u64::<BigEndian>(VERSION).unwrap();
        (&mut buf[16..24])
            .write_u64::<BigEndian>(self.page_size)
            .unwrap();
        (&mut buf[24..32])
            .write_u64::<BigEndian>(self.root_offset)
            .unwrap();
        (&mut buf[32..40])
            .write_u64::<BigEndian>(self.root_config)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEAD_SIZE {
            return Err(Error::InvalidData(format!(
                "head record truncated: {} of {} bytes",
                buf.len(),
                HEAD_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::InvalidData("bad head magic".to_string()));
        }

        let version = cursor.read_u64::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::InvalidData(format!(
                "unsupported file version: {version}"
            )));
        }

        let page_size = cursor.read_u64::<BigEndian>()?;
        if page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidData(format!(
                "persisted page_size {page_size} is below the minimum of {MIN_PAGE_SIZE}"
            )));
        }

        let root_offset = cursor.read_u64::<BigEndian>()?;
        let root_config = cursor.read_u64::<BigEndian>()?;

        Ok(Head {
            page_size,
            root_offset,
            root_config,
        })
    }
}
