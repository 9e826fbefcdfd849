//! Ordered range traversal.
//!
//! Pages carry no sibling pointers, so the cursor iterates one leaf at a
//! time and, when a leaf is exhausted, re-descends from the root with the
//! last-yielded key as the probe to land on the next one. Each advance
//! releases the previous leaf; the cursor never holds more than one.

use std::cmp::Ordering;

use crate::error::Result;
use crate::page::Page;
use crate::tree::Tree;

/// A cursor over all live keys `k` with `start <= k <= end`, in comparator
/// order. Created by [`Tree::range`].
pub struct Range<'t> {
    tree: &'t Tree,
    end: Vec<u8>,
    /// Current leaf and the index of the next slot to yield.
    leaf: Option<(Page, usize)>,
    /// Last yielded key, the probe for the next leaf-to-leaf advance.
    last: Option<Vec<u8>>,
    done: bool,
}

impl<'t> Range<'t> {
    pub(crate) fn new(tree: &'t Tree, start: &[u8], end: &[u8]) -> Result<Range<'t>> {
        let leaf = tree.seek(start, true)?;
        Ok(Range {
            tree,
            end: end.to_vec(),
            leaf,
            last: None,
            done: false,
        })
    }
}

impl Iterator for Range<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let (leaf, index) = match &mut self.leaf {
                Some(position) => position,
                None => {
                    self.done = true;
                    return None;
                }
            };

            if *index < leaf.len() {
                let slot = leaf.slot(*index);
                if self.tree.comparator().compare(&slot.key, &self.end) == Ordering::Greater {
                    self.done = true;
                    return None;
                }

                let key = slot.key.clone();
                let value = match self.tree.read_value(slot) {
                    Ok(value) => value,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };

                *index += 1;
                self.last = Some(key.clone());
                return Some(Ok((key, value)));
            }

            // Leaf exhausted: advance past the last yielded key. A leaf with
            // no last key is the empty root, so the scan is over.
            let probe = match &self.last {
                Some(key) => key.clone(),
                None => {
                    self.done = true;
                    return None;
                }
            };
            match self.tree.seek(&probe, false) {
                Ok(Some(position)) => self.leaf = Some(position),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
