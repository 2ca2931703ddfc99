//! Hisense DTV upgrade packages: a vendor tag near the start, then a table
//! of named partition images.

use std::path::PathBuf;

use memchr::memmem;
use tracing::info;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const VENDOR_TAG: &[u8] = b"Hisense";
const TAG_WINDOW: usize = 0x100;
const ENTRY_SIZE: usize = 24;
const MAX_PARTS: u32 = 32;

struct Partition {
    name: String,
    offset: u32,
    size: u32,
}

fn parse(data: &[u8]) -> Option<Vec<Partition>> {
    let window = data.get(..TAG_WINDOW.min(data.len()))?;
    let tag_at = memmem::find(window, VENDOR_TAG)?;

    // table follows the tag, padded to the next 16-byte boundary
    let table_at = (tag_at + VENDOR_TAG.len()).next_multiple_of(16);
    let count = u32_le(data, table_at)?;
    if count == 0 || count > MAX_PARTS {
        return None;
    }

    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = table_at + 4 + i * ENTRY_SIZE;
        let raw_name = data.get(at..at + 16)?;
        let name: Vec<u8> = raw_name.iter().copied().take_while(|&b| b != 0).collect();
        if name.is_empty()
            || name == b".."
            || name.contains(&b'/')
            || !name.iter().all(|b| b.is_ascii_graphic())
        {
            return None;
        }
        let offset = u32_le(data, at + 16)?;
        let size = u32_le(data, at + 20)?;
        let end = (offset as usize).checked_add(size as usize)?;
        if size == 0 || end > data.len() {
            return None;
        }
        parts.push(Partition {
            name: String::from_utf8_lossy(&name).into_owned(),
            offset,
            size,
        });
    }
    Some(parts)
}

pub struct HisenseDecoder;

impl Decoder for HisenseDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Hisense
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        parse(artifact.bytes()).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();
        let parts = parse(data)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "bad partition table"))?;

        info!(partitions = parts.len(), "unpacking hisense package");

        let mut produced: Vec<PathBuf> = Vec::new();
        for part in &parts {
            let at = part.offset as usize;
            let payload = &data[at..at + part.size as usize];
            let path = dest.path().join(&part.name);
            write_output(name, &path, payload)?;
            produced.push(path);
        }

        let recurse = produced.clone();
        Ok(Extraction::fan_out(produced, recurse))
    }
}
