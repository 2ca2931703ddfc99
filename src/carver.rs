//! Structural record carver.
//!
//! Recovers embedded LZHS records from a region that carries no directory of
//! them. A record on disk is a pair of headers followed by the compressed
//! payload: the first header's `checksum` byte holds the record's sequence
//! index and its `compressed_size` covers the second header plus payload;
//! the second header describes the payload itself. The scan walks the region
//! at header stride and accepts a position only when both headers pass the
//! structural test and the sizes chain, because the magic test alone is not
//! selective enough over a multi-megabyte region.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::formats::lzhs::{self, HEADER_SIZE, LzhsHeader};
use crate::formats::write_output;
use crate::naming;

/// First-stage image at the start of the region; fixed size, never carved.
pub const FIRST_STAGE_SIZE: usize = 0x10_0000;

/// Characteristic alignment of a secondary bootloader image.
pub const LOADER_ALIGN: u64 = 0xA0000;

/// Characteristic alignment of a boot-configuration (u-boot) image.
pub const UBOOT_ALIGN: u64 = 0x8_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landmark {
    Loader,
    Uboot,
    Generic,
}

impl Landmark {
    fn classify(offset: u64) -> Self {
        if offset % LOADER_ALIGN == 0 {
            Landmark::Loader
        } else if offset % UBOOT_ALIGN == 0 {
            Landmark::Uboot
        } else {
            Landmark::Generic
        }
    }
}

/// One validated record. `offset` points at the second header; the record
/// spans `HEADER_SIZE + compressed_size` bytes from there.
#[derive(Debug, Clone, Copy)]
pub struct CarvedRecord {
    pub offset: u64,
    /// Sequence index recovered from the first header's checksum byte.
    pub index: u32,
    pub compressed_size: u32,
    pub landmark: Landmark,
}

pub struct RecordCarver<'a> {
    data: &'a [u8],
}

impl<'a> RecordCarver<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Walk the region past the first-stage image and report every position
    /// that passes the two-header chain rule. A chain that stops validating
    /// is simply skipped; scanning continues to the end of the region.
    pub fn scan(&self) -> Vec<CarvedRecord> {
        let mut records = Vec::new();

        let mut i = FIRST_STAGE_SIZE + HEADER_SIZE;
        while i + HEADER_SIZE <= self.data.len() {
            let offset = i as u64;

            let Some(first) =
                LzhsHeader::parse(&self.data[i - HEADER_SIZE..]).filter(LzhsHeader::is_plausible)
            else {
                i += HEADER_SIZE;
                continue;
            };

            // The first header of a record stores the sequence index in its
            // checksum byte and the span of what follows in compressed_size.
            let index = u32::from(first.checksum);
            let expected = first.compressed_size;

            let Some(second) =
                LzhsHeader::parse(&self.data[i..]).filter(LzhsHeader::is_plausible)
            else {
                i += HEADER_SIZE;
                continue;
            };

            if expected != second.compressed_size + HEADER_SIZE as u32 {
                debug!(offset, "magic matched but sizes do not chain, skipping");
                i += HEADER_SIZE;
                continue;
            }

            let landmark = Landmark::classify(offset);
            match landmark {
                Landmark::Loader => info!(offset, "possible mtk loader"),
                Landmark::Uboot => info!(offset, "possible mtk uboot"),
                Landmark::Generic => info!(offset, "possible lzhs record"),
            }

            records.push(CarvedRecord {
                offset,
                index,
                compressed_size: second.compressed_size,
                landmark,
            });

            i += HEADER_SIZE;
        }

        records
    }

    /// Scan and materialize every record under `dest_dir`.
    ///
    /// The first-stage image is always written as record index 0, whether or
    /// not any chained record validates. Each validated record is written
    /// verbatim (`.lzhs`) and then decoded (`.unlzhs`); a record whose
    /// payload fails to decode is reported and skipped without disturbing
    /// its siblings.
    pub fn extract_all(&self, source: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut produced = Vec::new();

        let first_stage = &self.data[..FIRST_STAGE_SIZE.min(self.data.len())];
        let prefix_path = naming::carved_record(dest_dir, source, 0, "unlzhs");
        write_output("carver", &prefix_path, first_stage)?;
        produced.push(prefix_path);

        for record in self.scan() {
            let start = record.offset as usize;
            let end = (start + HEADER_SIZE + record.compressed_size as usize)
                .min(self.data.len());
            let raw = &self.data[start..end];

            let raw_path = naming::carved_record(dest_dir, source, record.index, "lzhs");
            write_output("carver", &raw_path, raw)?;
            produced.push(raw_path);

            let header = match LzhsHeader::parse(raw) {
                Some(h) => h,
                None => continue,
            };
            let payload = &raw[HEADER_SIZE.min(raw.len())..];
            let decoded_path = naming::carved_record(dest_dir, source, record.index, "unlzhs");
            match lzhs::decode(payload, header.uncompressed_size as usize) {
                Ok(decoded) => {
                    write_output("carver", &decoded_path, &decoded)?;
                    produced.push(decoded_path);
                }
                Err(e) => {
                    // Sibling records stay valid; only this payload is lost.
                    warn!(
                        index = record.index,
                        offset = record.offset,
                        error = %e,
                        "carved record failed to decode"
                    );
                }
            }
        }

        Ok(produced)
    }
}
