//! One module per recognized format. Detect predicates and output naming are
//! the contractual surface; the decode internals are collaborators.

pub mod cramfs;
pub mod epk1;
pub mod epk2;
pub mod gzip;
pub mod hisense;
pub mod jffs2;
pub mod kernel;
pub mod lz4;
pub mod lzhs;
pub mod lzo;
pub mod mtk;
pub mod nfsb;
pub mod partinfo;
pub mod squashfs;
pub mod symfile;
pub mod tsfile;

use std::fs;
use std::path::Path;

use crate::error::{ExtractError, Result};

/// Write one derived artifact, mapping I/O failure to a decoder failure on
/// the destination path.
pub(crate) fn write_output(decoder: &'static str, path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| ExtractError::decoder(decoder, path, e))
}

/// Read a little-endian u32 at `off`, if in bounds.
#[inline]
pub(crate) fn u32_le(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a big-endian u32 at `off`, if in bounds.
#[inline]
pub(crate) fn u32_be(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a little-endian u16 at `off`, if in bounds.
#[inline]
pub(crate) fn u16_le(data: &[u8], off: usize) -> Option<u16> {
    data.get(off..off + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}
