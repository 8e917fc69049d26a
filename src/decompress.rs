//! Streaming decompression of compressed sibling artifacts.
//!
//! The core treats decompression as an external collaborator with a single
//! contract: "decompress file at path to a temporary readable file
//! descriptor, positioned at offset 0, with a known length". This module
//! provides that contract concretely, built on the `zstd` crate.

use std::fs::File;
use std::io;
use std::path::Path;

use tempfile::tempfile;

/// An external collaborator that turns a compressed file on disk into a
/// plain, seekable, readable handle.
pub trait Decompressor {
    /// Decompresses `path` into an anonymous temporary file and returns the
    /// handle (positioned at offset 0) along with the uncompressed length.
    fn decompress(&self, path: &Path) -> io::Result<(File, u64)>;
}

/// Decompresses zstd-compressed artifacts, the codec used by the coprocessor
/// image-build tooling this server was written to serve.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdDecompressor;

impl Decompressor for ZstdDecompressor {
    fn decompress(&self, path: &Path) -> io::Result<(File, u64)> {
        let compressed = File::open(path)?;
        let mut decoder = zstd::stream::Decoder::new(compressed)?;
        let mut out = tempfile()?;
        let len = io::copy(&mut decoder, &mut out)?;
        seek_to_start(&mut out)?;
        Ok((out, len))
    }
}

fn seek_to_start(f: &mut File) -> io::Result<()> {
    use std::io::Seek;
    f.seek(io::SeekFrom::Start(0))?;
    Ok(())
}
