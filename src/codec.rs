use crate::error::Result;
use crate::Error;

/// The compression codec applied to page images and value blobs.
///
/// `compress` and `decompress` write into caller-provided buffers and return
/// the number of bytes produced. `max_compressed_len` sizes the scratch
/// buffer for `compress`; `decompressed_len` recovers the output size from a
/// compressed payload before `decompress` runs. Codec failures abort the
/// containing operation.
pub trait Codec: Send + Sync {
    fn max_compressed_len(&self, len: usize) -> usize;
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
    fn decompressed_len(&self, src: &[u8]) -> Result<usize>;
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

/// Snappy framing-free (raw) compression. The default codec.
pub struct Snappy;

impl Codec for Snappy {
    fn max_compressed_len(&self, len: usize) -> usize {
        snap::raw::max_compress_len(len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        snap::raw::Encoder::new()
            .compress(src, dst)
            .map_err(|e| Error::Compress(e.to_string()))
    }

    fn decompressed_len(&self, src: &[u8]) -> Result<usize> {
        snap::raw::decompress_len(src).map_err(|e| Error::Decompress(e.to_string()))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        snap::raw::Decoder::new()
            .decompress(src, dst)
            .map_err(|e| Error::Decompress(e.to_string()))
    }
}

/// Identity codec: stores payloads uncompressed.
pub struct Passthrough;

impl Codec for Passthrough {
    fn max_compressed_len(&self, len: usize) -> usize {
        len
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            return Err(Error::Compress("destination buffer too small".to_string()));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn decompressed_len(&self, src: &[u8]) -> Result<usize> {
        Ok(src.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if dst.len() < src.len() {
            return Err(Error::Decompress(
                "destination buffer too small".to_string(),
            ));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}
