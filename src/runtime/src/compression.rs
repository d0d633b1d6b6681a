//! Layer blob decompression.
//!
//! Layers arrive either gzip-compressed or as plain tar. The format is
//! detected from the stream's magic bytes rather than a media type so local
//! tarballs and registry blobs go through the same path.

use std::io::{BufRead, BufReader, Read};

use flate2::read::GzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether the given header bytes start a gzip stream.
pub fn is_gzip(header: &[u8]) -> bool {
    header.len() >= GZIP_MAGIC.len() && header[..GZIP_MAGIC.len()] == GZIP_MAGIC
}

/// Wrap a blob reader so it yields the uncompressed tar stream.
pub fn decompressed<R: Read + Send + 'static>(reader: R) -> std::io::Result<Box<dyn Read + Send>> {
    let mut buffered = BufReader::new(reader);
    let gzip = is_gzip(buffered.fill_buf()?);
    if gzip {
        Ok(Box::new(GzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}
