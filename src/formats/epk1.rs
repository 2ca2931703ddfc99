//! EPK v1 packages: an unsigned record table in front of named PAK chunks.
//! Early models wrote the table little-endian, some later ones big-endian;
//! both carry the same `epak` magic.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_be, u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: &[u8; 4] = b"epak";
const MAX_PAKS: u32 = 32;
const PAK_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

struct PakRec {
    offset: u32,
    size: u32,
}

struct Epk1Layout {
    endian: Endian,
    recs: Vec<PakRec>,
}

fn read_u32(data: &[u8], off: usize, endian: Endian) -> Option<u32> {
    match endian {
        Endian::Little => u32_le(data, off),
        Endian::Big => u32_be(data, off),
    }
}

fn layout_for(data: &[u8], endian: Endian) -> Option<Epk1Layout> {
    let file_size = read_u32(data, 4, endian)?;
    let pak_count = read_u32(data, 8, endian)?;
    if pak_count == 0 || pak_count > MAX_PAKS {
        return None;
    }
    if (file_size as usize) > data.len() {
        return None;
    }

    let mut recs = Vec::with_capacity(pak_count as usize);
    for i in 0..pak_count as usize {
        let at = 12 + i * 8;
        let offset = read_u32(data, at, endian)?;
        let size = read_u32(data, at + 4, endian)?;
        let end = (offset as usize).checked_add(size as usize)?;
        if size == 0 || end > data.len() {
            return None;
        }
        recs.push(PakRec { offset, size });
    }
    Some(Epk1Layout { endian, recs })
}

fn layout(data: &[u8]) -> Option<Epk1Layout> {
    if data.get(..4)? != MAGIC {
        return None;
    }
    layout_for(data, Endian::Little).or_else(|| layout_for(data, Endian::Big))
}

/// Name stored in a PAK chunk header, or a positional fallback.
fn pak_name(data: &[u8], rec: &PakRec, index: usize) -> String {
    let at = rec.offset as usize;
    let raw = &data[at..at + 4.min(rec.size as usize)];
    let printable: Vec<u8> = raw
        .iter()
        .copied()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .collect();
    if printable.len() >= 2 {
        String::from_utf8_lossy(&printable).into_owned()
    } else {
        format!("pak{index}")
    }
}

pub struct Epk1Decoder;

impl Decoder for Epk1Decoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Epk1
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        layout(artifact.bytes()).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();
        let layout = layout(data)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "bad epk1 header"))?;

        info!(
            paks = layout.recs.len(),
            endian = ?layout.endian,
            "unpacking epk1 package"
        );

        let mut produced: Vec<PathBuf> = Vec::new();
        for (i, rec) in layout.recs.iter().enumerate() {
            let chunk_name = pak_name(data, rec, i);
            let at = rec.offset as usize;
            let end = at + rec.size as usize;

            // chunk = 4-byte name, version, payload size, then payload
            let payload = match read_u32(data, at + 8, layout.endian) {
                Some(psize)
                    if PAK_HEADER_SIZE + psize as usize <= rec.size as usize =>
                {
                    &data[at + PAK_HEADER_SIZE..at + PAK_HEADER_SIZE + psize as usize]
                }
                _ => {
                    warn!(pak = %chunk_name, "pak header unparseable, keeping raw chunk");
                    &data[at..end]
                }
            };

            let path = dest.path().join(format!("{chunk_name}.pak"));
            write_output(name, &path, payload)?;
            produced.push(path);
        }

        let recurse = produced.clone();
        Ok(Extraction::fan_out(produced, recurse))
    }
}
