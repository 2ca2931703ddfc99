//! Partition-info paks, dumped as a readable text table.

use std::fmt::Write as _;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: u32 = 0x2009_0716;
const ENTRY_SIZE: usize = 32;
const MAX_PARTS: u32 = 64;

struct PartEntry {
    name: String,
    start: u32,
    size: u32,
    flags: u32,
}

fn parse(data: &[u8]) -> Option<Vec<PartEntry>> {
    if u32_le(data, 0)? != MAGIC {
        return None;
    }
    let nparts = u32_le(data, 8)?;
    if nparts == 0 || nparts > MAX_PARTS {
        return None;
    }

    let mut entries = Vec::with_capacity(nparts as usize);
    for i in 0..nparts as usize {
        let at = 12 + i * ENTRY_SIZE;
        let raw_name = data.get(at..at + 16)?;
        let name: Vec<u8> = raw_name.iter().copied().take_while(|&b| b != 0).collect();
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        entries.push(PartEntry {
            name: String::from_utf8_lossy(&name).into_owned(),
            start: u32_le(data, at + 16)?,
            size: u32_le(data, at + 20)?,
            flags: u32_le(data, at + 24)?,
        });
    }
    Some(entries)
}

pub struct PartinfoDecoder;

impl Decoder for PartinfoDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Partinfo
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
        let entries = parse(artifact.bytes())
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "bad partition table"))?;

        let mut text = String::new();
        let _ = writeln!(text, "{:<16} {:>12} {:>12} {:>10}", "name", "start", "size", "flags");
        for e in &entries {
            let _ = writeln!(
                text,
                "{:<16} {:>12} {:>12} {:>#10x}",
                e.name, e.start, e.size, e.flags
            );
        }

        let path = dest.path().to_path_buf();
        write_output(name, &path, text.as_bytes())?;
        Ok(Extraction::terminal(vec![path]))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn build_partinfo(parts: &[(&str, u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // device id
        out.extend_from_slice(&(parts.len() as u32).to_le_bytes());
        for &(name, start, size) in parts {
            let mut field = [0u8; 16];
            field[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&field);
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // flags
            out.extend_from_slice(&0u32.to_le_bytes()); // pad
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_partinfo;
    use super::*;

    #[test]
    fn parses_table() {
        let raw = build_partinfo(&[("boot", 0, 2048), ("rootfs", 2048, 65536)]);
        let entries = parse(&raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "rootfs");
        assert_eq!(entries[1].start, 2048);
    }

    #[test]
    fn rejects_garbage_names() {
        let mut raw = build_partinfo(&[("boot", 0, 2048)]);
        raw[12] = 0x01; // non-printable name byte
        assert!(parse(&raw).is_none());
    }
}
