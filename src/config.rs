use std::sync::Arc;

use crate::codec::{Codec, Snappy};
use crate::compare::{Compare, Lexicographic};
use crate::error::Result;
use crate::Error;

/// The smallest usable fanout: a split at `page_size / 2` needs at least two
/// slots on each side.
pub const MIN_PAGE_SIZE: u64 = 4;

const DEFAULT_PAGE_SIZE: u64 = 64;

/// Open-time options for a tree.
#[derive(Clone)]
pub struct Options {
    /// Fanout: the maximum number of slots per page; a page reaching this
    /// count splits (default: 64, minimum: 4).
    ///
    /// Applies to newly created files only. Reopening an existing file
    /// adopts the fanout recorded in its head record.
    pub page_size: u64,

    /// Compression codec applied to page images and value blobs
    /// (default: Snappy).
    pub codec: Arc<dyn Codec>,

    /// Total ordering over keys (default: byte-lexicographic).
    pub comparator: Arc<dyn Compare>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            codec: Arc::new(Snappy),
            comparator: Arc::new(Lexicographic),
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "page_size {} is below the minimum of {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        Ok(())
    }
}
