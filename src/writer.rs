//! Append-only file I/O for the tree.
//!
//! Every record in the backing file is written through this module, and
//! nothing is ever overwritten in place. The file is a sequence of padded
//! records:
//!
//! ```text
//! +--------------------+
//! | page / value blob  |  compressed, variable size
//! +--------------------+
//! | zero padding       |  to the next 8-byte boundary
//! +--------------------+
//! | head record        |  uncompressed, fixed size (40 bytes)
//! +--------------------+
//! | ...                |
//! ```
//!
//! Padding keeps every record start on an 8-byte boundary, and — because the
//! head record's size is itself a multiple of the padding unit — lets
//! recovery step backward from the file tail in head-sized strides until a
//! record probes as a valid head.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::Result;
use crate::flock;
use crate::Error;

/// Alignment unit between successive records. Format constant: changing it
/// breaks backward tail scanning on existing files.
pub const PADDING: u64 = 8;

/// Whether a payload passes through the codec on its way to or from disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Raw,
    Compressed,
}

/// An exclusive, append-only handle on the backing file.
pub struct Writer {
    file: File,
    path: PathBuf,
    filesize: u64,
    codec: Arc<dyn Codec>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("path", &self.path)
            .field("filesize", &self.filesize)
            .finish()
    }
}

impl Writer {
    /// Opens `path` for appending, creating it if absent, and takes the
    /// exclusive advisory lock that enforces the single-writer contract.
    pub fn create(path: &Path, codec: Arc<dyn Codec>) -> Result<Writer> {
        let file = File::options()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::File(format!("open {}: {}", path.display(), e)))?;

        flock::try_lock_exclusive(&file).map_err(|e| {
            if flock::is_contended(&e) {
                Error::Locked(path.display().to_string())
            } else {
                Error::File(format!("lock {}: {}", path.display(), e))
            }
        })?;

        let filesize = file
            .metadata()
            .map_err(|e| Error::File(format!("stat {}: {}", path.display(), e)))?
            .len();

        Ok(Writer {
            file,
            path: path.to_path_buf(),
            filesize,
            codec,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    pub fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec)
    }

    /// Reads exactly `size` bytes at `offset`. In `Compressed` mode the raw
    /// bytes are run through the codec and the decoded payload is returned.
    pub fn read(&self, mode: Mode, offset: u64, size: u64) -> Result<Vec<u8>> {
        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > self.filesize) {
            return Err(Error::OutOfBounds(format!(
                "{} bytes at offset {} in a {}-byte file",
                size, offset, self.filesize
            )));
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut raw = vec![0u8; size as usize];
        read_exact_at(&self.file, &mut raw, offset)?;

        match mode {
            Mode::Raw => Ok(raw),
            Mode::Compressed => {
                let len = self.codec.decompressed_len(&raw)?;
                let mut decoded = vec![0u8; len];
                let n = self.codec.decompress(&raw, &mut decoded)?;
                decoded.truncate(n);
                Ok(decoded)
            }
        }
    }

    /// Appends `data` after padding the file to the next alignment boundary.
    /// Returns the payload's offset and its stored (post-codec) size.
    pub fn write(&mut self, mode: Mode, data: &[u8]) -> Result<(u64, u64)> {
        self.pad()?;

        let offset = self.filesize;
        let stored = match mode {
            Mode::Raw => {
                self.file.write_all(data)?;
                data.len() as u64
            }
            Mode::Compressed => {
                let mut scratch = vec![0u8; self.codec.max_compressed_len(data.len())];
                let n = self.codec.compress(data, &mut scratch)?;
                self.file.write_all(&scratch[..n])?;
                n as u64
            }
        };

        self.filesize += stored;
        Ok((offset, stored))
    }

    /// Scans backward from the file tail in `size`-byte strides, reading each
    /// stride raw and handing it to `probe`. Returns the first matching
    /// record (offset and contents), or `None` once the scan passes offset
    /// zero. Each stride reads into a fresh buffer.
    pub fn find_tail(
        &mut self,
        size: u64,
        mut probe: impl FnMut(&[u8]) -> bool,
    ) -> Result<Option<(u64, Vec<u8>)>> {
        self.pad()?;

        let mut offset = self.filesize;
        while offset >= size {
            let data = self.read(Mode::Raw, offset - size, size)?;
            if probe(&data) {
                return Ok(Some((offset - size, data)));
            }
            offset -= size;
        }
        Ok(None)
    }

    /// Flushes file contents and metadata to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::File(format!("sync {}: {}", self.path.display(), e)))
    }

    /// Zero-fills up to the next `PADDING` boundary.
    fn pad(&mut self) -> Result<()> {
        const ZEROS: [u8; PADDING as usize] = [0; PADDING as usize];

        let rem = self.filesize % PADDING;
        if rem != 0 {
            let fill = PADDING - rem;
            self.file.write_all(&ZEROS[..fill as usize])?;
            self.filesize += fill;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
