//! Root-of-tree operations.
//!
//! The tree is a writer plus a pinned root page and configuration. Every
//! mutation rewrites the root-to-leaf path it touched (copy-on-write: new
//! page images are appended, old ones become garbage) and then commits a
//! fresh head record pointing at the new root. Reads descend from the
//! pinned root, loading each page from the file as they go; no page cache
//! is kept.
//!
//! The split and collapse signals of the insert/remove recursions are
//! expressed as dedicated outcome enums, consumed either by the parent
//! frame or, for the root, by the `set`/`remove` wrappers here. They never
//! reach callers.

use std::cmp::Ordering;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::Codec;
use crate::compare::Compare;
use crate::config::Options;
use crate::error::Result;
use crate::head::{Head, HEAD_SIZE};
use crate::page::{Page, Slot};
use crate::range::Range;
use crate::writer::{Mode, Writer};
use crate::Error;

/// Per-key size cap. Page images have no fixed byte capacity in this
/// format, so the cap is a format-level constant; `set` rejects larger keys
/// before writing anything.
pub const MAX_KEY_LEN: usize = 1 << 20;

/// What an insert recursion tells its caller.
enum InsertOutcome {
    /// The subtree absorbed the slot and saved itself.
    Done,
    /// The page is full and unsaved; the caller must split it.
    Split,
}

/// What a remove recursion tells its caller.
enum RemoveOutcome {
    /// The subtree removed the key and saved itself.
    Done,
    /// The page has no slots left and is unsaved; the caller must drop it.
    Empty,
}

/// An open B+ tree store backed by a single append-only file.
pub struct Tree {
    path: PathBuf,
    /// `None` once the tree is closed: compaction releases the writer
    /// before swapping files, and keeps it released if the finalize fails,
    /// so a dead descriptor can never absorb further writes.
    writer: Option<Writer>,
    comparator: Arc<dyn Compare>,
    page_size: u64,
    root: Page,
}

impl Tree {
    /// Opens (or creates) the store at `path`.
    ///
    /// Recovery scans backward from the file tail for the newest valid head
    /// record; anything appended after it is discarded garbage. A file
    /// without a recoverable head starts as a fresh empty tree.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Tree> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let (writer, head, root) =
            Self::bootstrap(&path, Arc::clone(&options.codec), options.page_size)?;
        Ok(Tree {
            path,
            writer: Some(writer),
            comparator: Arc::clone(&options.comparator),
            page_size: head.page_size,
            root,
        })
    }

    fn bootstrap(
        path: &Path,
        codec: Arc<dyn Codec>,
        fresh_page_size: u64,
    ) -> Result<(Writer, Head, Page)> {
        let mut writer = Writer::create(path, codec)?;

        match writer.find_tail(HEAD_SIZE as u64, Head::probe)? {
            Some((head_offset, data)) => {
                let head = Head::decode(&data)?;
                let root = Page::load(&writer, head.root_offset, head.root_config)?;
                tracing::info!(
                    path = %path.display(),
                    head_offset,
                    root_offset = head.root_offset,
                    "opened tree from durable head"
                );
                Ok((writer, head, root))
            }
            None => {
                if writer.filesize() > 0 {
                    tracing::warn!(
                        path = %path.display(),
                        filesize = writer.filesize(),
                        "no recoverable head in non-empty file, starting fresh"
                    );
                } else {
                    tracing::info!(path = %path.display(), "creating fresh tree");
                }

                let mut root = Page::leaf();
                root.save(&mut writer)?;
                let head = Head {
                    page_size: fresh_page_size,
                    root_offset: root.offset(),
                    root_config: root.config(),
                };
                writer.write(Mode::Raw, &head.encode())?;
                writer.sync()?;
                Ok((writer, head, root))
            }
        }
    }

    /// Flushes and releases the backing file. Dropping the tree releases it
    /// too; `close` additionally surfaces flush errors.
    pub fn close(mut self) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.sync(),
            None => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks up `key`, returning its value or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_in(&self.root, key)
    }

    fn get_in(&self, page: &Page, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let found = page.search(self.comparator.as_ref(), key);
        if page.is_leaf() {
            if !found.exact {
                return Ok(None);
            }
            let value = self.read_value(page.slot(found.index))?;
            return Ok(Some(value));
        }
        let child = self.load_child(page, found.child_index())?;
        self.get_in(&child, key)
    }

    /// Inserts `key` → `value`, replacing any existing value. Durable once
    /// this returns.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(Error::KeyTooLarge(key.len()));
        }

        let (offset, stored) = self.writer_mut()?.write(Mode::Compressed, value)?;
        let slot = Slot::new(key.to_vec(), offset, stored);

        let mut root = mem::take(&mut self.root);
        match self.insert_in(&mut root, slot) {
            Ok(InsertOutcome::Done) => {
                self.root = root;
            }
            Ok(InsertOutcome::Split) => {
                tracing::debug!(slots = root.len(), "root is full, promoting a new root");
                let mut promoted = Page::internal();
                let result = self
                    .split_child(&mut promoted, 0, root.clone())
                    .and_then(|()| promoted.save(self.writer_mut()?));
                match result {
                    Ok(()) => self.root = promoted,
                    Err(e) => {
                        self.root = root;
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.root = root;
                return Err(e);
            }
        }

        self.commit_head()
    }

    fn insert_in(&mut self, page: &mut Page, slot: Slot) -> Result<InsertOutcome> {
        let found = page.search(self.comparator.as_ref(), &slot.key);

        if page.is_leaf() {
            if found.exact {
                // The replaced value stays in the file as garbage until
                // compaction.
                page.remove_slot(found.index);
            }
            page.insert_slot(found.index, slot);
        } else {
            let index = found.child_index();
            let mut child = self.load_child(page, index)?;
            match self.insert_in(&mut child, slot)? {
                InsertOutcome::Split => self.split_child(page, index, child)?,
                InsertOutcome::Done => page.set_location(index, child.offset(), child.config()),
            }
        }

        if page.len() as u64 == self.page_size {
            return Ok(InsertOutcome::Split);
        }
        page.save(self.writer_mut()?)?;
        Ok(InsertOutcome::Done)
    }

    /// Splits a full `child` and wires both halves into `parent` at `index`:
    /// the middle key lands at `index + 1` pointing at the right half, the
    /// existing slot is repointed at the left half.
    fn split_child(&mut self, parent: &mut Page, index: usize, child: Page) -> Result<()> {
        let mid = (self.page_size / 2) as usize;
        let (mut left, mut right, middle_key) = child.split(mid);

        left.save(self.writer_mut()?)?;
        right.save(self.writer_mut()?)?;

        parent.insert_slot(
            index + 1,
            Slot::new(middle_key, right.offset(), right.config()),
        );
        parent.set_location(index, left.offset(), left.config());
        Ok(())
    }

    /// Removes `key`. Fails with `NotFound` (and writes nothing) if absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let mut root = mem::take(&mut self.root);
        match self.remove_in(&mut root, key, true) {
            Ok(RemoveOutcome::Done) => {
                self.root = root;
            }
            Ok(RemoveOutcome::Empty) => {
                tracing::debug!("root drained, collapsing to an empty leaf");
                let mut fresh = Page::leaf();
                match self.writer_mut().and_then(|writer| fresh.save(writer)) {
                    Ok(()) => self.root = fresh,
                    Err(e) => {
                        self.root = root;
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.root = root;
                return Err(e);
            }
        }

        self.commit_head()
    }

    fn remove_in(&mut self, page: &mut Page, key: &[u8], is_root: bool) -> Result<RemoveOutcome> {
        let found = page.search(self.comparator.as_ref(), key);

        if page.is_leaf() {
            if !found.exact {
                return Err(Error::NotFound);
            }
            page.remove_slot(found.index);
            if page.len() == 0 {
                return Ok(RemoveOutcome::Empty);
            }
        } else {
            let index = found.child_index();
            let mut child = self.load_child(page, index)?;
            match self.remove_in(&mut child, key, false)? {
                RemoveOutcome::Empty => {
                    page.remove_slot(index);
                    if page.len() == 0 {
                        return Ok(RemoveOutcome::Empty);
                    }
                    if page.len() == 1 && !is_root {
                        // A single remaining slot: lift the child into this
                        // position, shortening the path by one level.
                        let sole = page.remove_slot(0);
                        *page = Page::load(self.writer()?, sole.offset, sole.config)?;
                    }
                }
                RemoveOutcome::Done => page.set_location(index, child.offset(), child.config()),
            }
        }

        page.save(self.writer_mut()?)?;
        Ok(RemoveOutcome::Done)
    }

    /// Ordered scan over all live keys `k` with `start <= k <= end` under
    /// the tree's comparator.
    pub fn range(&self, start: &[u8], end: &[u8]) -> Result<Range<'_>> {
        Range::new(self, start, end)
    }

    /// Rewrites the reachable tree into a scratch file, renames it over the
    /// source, and reopens. Reclaims all garbage left behind by mutations.
    ///
    /// The source writer is closed before the swap. If the finalize fails
    /// after that point the tree stays closed — every further operation
    /// returns [`Error::Closed`] — instead of writing through a descriptor
    /// the rename has already unlinked; a fresh `open` of the path sees
    /// whichever file the failure left in place.
    pub fn compact(&mut self) -> Result<()> {
        let source = self.writer()?.path().to_path_buf();
        let scratch = scratch_path(&source);
        if scratch.exists() {
            return Err(Error::CompactExists(scratch.display().to_string()));
        }

        let before = self.writer()?.filesize();
        let codec = self.writer()?.codec();
        tracing::info!(path = %source.display(), filesize = before, "starting compaction");

        let mut target = Writer::create(&scratch, Arc::clone(&codec))?;
        if let Err(e) = self.copy_into(&mut target) {
            drop(target);
            let _ = std::fs::remove_file(&scratch);
            return Err(e);
        }
        drop(target);

        // Close the source writer before the swap. No descriptor survives
        // pointing at the inode the rename replaces.
        self.writer = None;

        if let Err(e) = std::fs::rename(&scratch, &source) {
            let _ = std::fs::remove_file(&scratch);
            // The source file is untouched; take it back so the tree stays
            // usable.
            match Writer::create(&source, Arc::clone(&codec)) {
                Ok(writer) => self.writer = Some(writer),
                Err(reopen) => {
                    tracing::error!(
                        error = %reopen,
                        "failed to reopen source after aborted rename, tree is closed"
                    );
                }
            }
            return Err(Error::File(format!(
                "rename {} over {}: {}",
                scratch.display(),
                source.display(),
                e
            )));
        }

        match Self::bootstrap(&source, codec, self.page_size) {
            Ok((writer, head, root)) => {
                let after = writer.filesize();
                self.writer = Some(writer);
                self.page_size = head.page_size;
                self.root = root;
                tracing::info!(before, after, "compaction finished");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to reopen compacted file, tree is closed"
                );
                Err(e)
            }
        }
    }

    fn copy_into(&self, target: &mut Writer) -> Result<()> {
        // Reserve a head-sized slot at the front of the scratch; zeroes
        // never probe as a valid head.
        target.write(Mode::Raw, &[0u8; HEAD_SIZE])?;

        let mut root = self.root.clone();
        self.copy_page(target, &mut root)?;

        let head = Head {
            page_size: self.page_size,
            root_offset: root.offset(),
            root_config: root.config(),
        };
        target.write(Mode::Raw, &head.encode())?;
        target.sync()
    }

    fn copy_page(&self, target: &mut Writer, page: &mut Page) -> Result<()> {
        for index in 0..page.len() {
            if page.is_leaf() {
                let slot = page.slot(index);
                let value = self.writer()?.read(Mode::Compressed, slot.offset, slot.config)?;
                let (offset, stored) = target.write(Mode::Compressed, &value)?;
                page.set_location(index, offset, stored);
            } else {
                let mut child = self.load_child(page, index)?;
                self.copy_page(target, &mut child)?;
                page.set_location(index, child.offset(), child.config());
            }
        }
        page.save(target)
    }

    /// Appends a head record for the current root and flushes. This is the
    /// durability boundary: a crash before this point leaves the prior head
    /// in force.
    fn commit_head(&mut self) -> Result<()> {
        let head = Head {
            page_size: self.page_size,
            root_offset: self.root.offset(),
            root_config: self.root.config(),
        };
        let writer = self.writer_mut()?;
        writer.write(Mode::Raw, &head.encode())?;
        writer.sync()
    }

    fn writer(&self) -> Result<&Writer> {
        self.writer.as_ref().ok_or(Error::Closed)
    }

    fn writer_mut(&mut self) -> Result<&mut Writer> {
        self.writer.as_mut().ok_or(Error::Closed)
    }

    fn load_child(&self, page: &Page, index: usize) -> Result<Page> {
        let slot = page.slot(index);
        Page::load(self.writer()?, slot.offset, slot.config)
    }

    pub(crate) fn comparator(&self) -> &dyn Compare {
        self.comparator.as_ref()
    }

    pub(crate) fn read_value(&self, slot: &Slot) -> Result<Vec<u8>> {
        self.writer()?.read(Mode::Compressed, slot.offset, slot.config)
    }

    /// Finds the leaf holding the smallest key `> key` (or `>= key` when
    /// `inclusive`), returning it with the matching slot index. Descends
    /// from the root and walks rightward across candidate children, so it
    /// doubles as the cursor's leaf-to-leaf advance.
    pub(crate) fn seek(&self, key: &[u8], inclusive: bool) -> Result<Option<(Page, usize)>> {
        self.seek_in(&self.root, key, inclusive)
    }

    fn seek_in(&self, page: &Page, key: &[u8], inclusive: bool) -> Result<Option<(Page, usize)>> {
        if page.is_leaf() {
            for index in 0..page.len() {
                let ord = self.comparator.compare(&page.slot(index).key, key);
                if ord == Ordering::Greater || (inclusive && ord == Ordering::Equal) {
                    return Ok(Some((page.clone(), index)));
                }
            }
            return Ok(None);
        }

        let mut index = page.search(self.comparator.as_ref(), key).child_index();
        while index < page.len() {
            let child = self.load_child(page, index)?;
            if let Some(hit) = self.seek_in(&child, key, inclusive)? {
                return Ok(Some(hit));
            }
            index += 1;
        }
        Ok(None)
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &Page {
        &self.root
    }
}

fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".compact");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Passthrough;
    use tempfile::TempDir;

    fn open_tree(dir: &TempDir, page_size: u64) -> Tree {
        let options = Options {
            page_size,
            ..Options::default()
        };
        Tree::open(dir.path().join("db"), options).expect("open tree")
    }

    #[test]
    fn test_set_get_smoke() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 64);

        tree.set(b"hello", b"world").expect("set");
        assert_eq!(tree.get(b"hello").expect("get"), Some(b"world".to_vec()));
        assert_eq!(tree.get(b"missing").expect("get"), None);
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 64);

        tree.set(b"k", b"v1").expect("set");
        tree.set(b"k", b"v2").expect("set");
        assert_eq!(tree.get(b"k").expect("get"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 64);

        tree.set(b"a", b"1").expect("set");
        tree.set(b"b", b"2").expect("set");
        tree.remove(b"a").expect("remove");

        assert_eq!(tree.get(b"a").expect("get"), None);
        assert_eq!(tree.get(b"b").expect("get"), Some(b"2".to_vec()));
        assert_eq!(tree.remove(b"a"), Err(Error::NotFound));
    }

    #[test]
    fn test_remove_absent_key_writes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 64);
        tree.set(b"a", b"1").expect("set");

        let before = std::fs::metadata(tree.path()).expect("stat").len();
        assert_eq!(tree.remove(b"zzz"), Err(Error::NotFound));
        let after = std::fs::metadata(tree.path()).expect("stat").len();
        assert_eq!(before, after, "a failed remove must not append");
    }

    #[test]
    fn test_split_grows_tree() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 4);

        for i in 1..=8u32 {
            let key = format!("{i:02}");
            tree.set(key.as_bytes(), key.as_bytes()).expect("set");
        }

        assert!(!tree.root().is_leaf(), "eight keys at fanout 4 must split");
        for i in 1..=8u32 {
            let key = format!("{i:02}");
            assert_eq!(
                tree.get(key.as_bytes()).expect("get"),
                Some(key.clone().into_bytes()),
                "key {key}"
            );
        }
    }

    #[test]
    fn test_remove_collapses_to_empty_leaf() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 4);

        for i in 1..=8u32 {
            let key = format!("{i:02}");
            tree.set(key.as_bytes(), b"x").expect("set");
        }
        for i in 1..=8u32 {
            let key = format!("{i:02}");
            tree.remove(key.as_bytes()).expect("remove");
        }

        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().len(), 0);
        for i in 1..=8u32 {
            let key = format!("{i:02}");
            assert_eq!(tree.get(key.as_bytes()).expect("get"), None);
        }
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("db");

        let mut tree = Tree::open(&path, Options::default()).expect("open");
        tree.set(b"persist", b"me").expect("set");
        tree.close().expect("close");

        let mut tree = Tree::open(&path, Options::default()).expect("reopen");
        assert_eq!(tree.get(b"persist").expect("get"), Some(b"me".to_vec()));

        tree.set(b"more", b"data").expect("set after reopen");
        assert_eq!(tree.get(b"more").expect("get"), Some(b"data".to_vec()));
    }

    #[test]
    fn test_persisted_fanout_wins_on_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("db");

        let options = Options {
            page_size: 4,
            ..Options::default()
        };
        Tree::open(&path, options).expect("open").close().expect("close");

        // Reopen asking for a much larger fanout: the file's fanout of 4
        // must still drive splitting.
        let options = Options {
            page_size: 64,
            ..Options::default()
        };
        let mut tree = Tree::open(&path, options).expect("reopen");
        for i in 1..=8u32 {
            let key = format!("{i:02}");
            tree.set(key.as_bytes(), b"x").expect("set");
        }
        assert!(!tree.root().is_leaf(), "splits must follow the persisted fanout");
    }

    #[test]
    fn test_reverse_comparator() {
        struct Reverse;
        impl Compare for Reverse {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
        }

        let dir = TempDir::new().expect("tempdir");
        let options = Options {
            page_size: 4,
            comparator: Arc::new(Reverse),
            ..Options::default()
        };
        let mut tree = Tree::open(dir.path().join("db"), options).expect("open");

        for key in [b"a", b"b", b"c", b"d", b"e"] {
            tree.set(key, key).expect("set");
        }

        // Under the reversed order "e" is the smallest key.
        let keys: Vec<Vec<u8>> = tree
            .range(b"e", b"a")
            .expect("range")
            .map(|kv| kv.expect("entry").0)
            .collect();
        assert_eq!(keys, vec![b"e", b"d", b"c", b"b", b"a"]);
    }

    #[test]
    fn test_passthrough_codec() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("db");
        let options = Options {
            codec: Arc::new(Passthrough),
            ..Options::default()
        };

        let mut tree = Tree::open(&path, options.clone()).expect("open");
        tree.set(b"raw", b"stored uncompressed").expect("set");
        tree.close().expect("close");

        let tree = Tree::open(&path, options).expect("reopen");
        assert_eq!(
            tree.get(b"raw").expect("get"),
            Some(b"stored uncompressed".to_vec())
        );
    }

    #[test]
    fn test_oversized_key_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 64);

        let key = vec![7u8; MAX_KEY_LEN + 1];
        assert_eq!(tree.set(&key, b"v"), Err(Error::KeyTooLarge(key.len())));
    }

    #[test]
    fn test_empty_key_and_empty_value() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open_tree(&dir, 4);

        tree.set(b"", b"empty key").expect("set empty key");
        tree.set(b"k", b"").expect("set empty value");

        assert_eq!(tree.get(b"").expect("get"), Some(b"empty key".to_vec()));
        assert_eq!(tree.get(b"k").expect("get"), Some(Vec::new()));

        // The empty key must survive splitting into internal pages.
        for i in 1..=8u32 {
            let key = format!("{i:02}");
            tree.set(key.as_bytes(), b"x").expect("set");
        }
        assert_eq!(tree.get(b"").expect("get"), Some(b"empty key".to_vec()));
    }

    #[test]
    fn test_range_on_empty_tree() {
        let dir = TempDir::new().expect("tempdir");
        let tree = open_tree(&dir, 4);
        assert_eq!(tree.range(b"a", b"z").expect("range").count(), 0);
    }
}
