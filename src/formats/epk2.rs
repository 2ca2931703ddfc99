//! EPK v2/v3 packages: a signature block in front of the package header,
//! then signed PAK chunks. Signature verification needs vendor keys and is
//! not attempted; the structural split is enough to keep unwrapping.

use std::path::PathBuf;

use tracing::info;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const SIGNATURE_SIZE: usize = 0x80;
const MAX_PAKS: u32 = 64;

struct PakEntry {
    name: String,
    size: u32,
}

struct Epk2Layout {
    ota_id: String,
    entries: Vec<PakEntry>,
    /// Offset of the first signed pak chunk.
    paks_at: usize,
}

fn parse(data: &[u8], fourcc: &[u8; 4]) -> Option<Epk2Layout> {
    if data.get(SIGNATURE_SIZE..SIGNATURE_SIZE + 4)? != fourcc {
        return None;
    }
    let head = SIGNATURE_SIZE + 4;
    let _file_version = u32_le(data, head)?;
    let ota_raw = data.get(head + 4..head + 36)?;
    let ota_id = String::from_utf8_lossy(
        &ota_raw
            .iter()
            .copied()
            .take_while(|&b| b != 0)
            .collect::<Vec<u8>>(),
    )
    .into_owned();

    let pak_count = u32_le(data, head + 36)?;
    if pak_count == 0 || pak_count > MAX_PAKS {
        return None;
    }

    let mut entries = Vec::with_capacity(pak_count as usize);
    let mut at = head + 40;
    let mut total: usize = 0;
    for i in 0..pak_count {
        let raw_name = data.get(at..at + 4)?;
        let printable: Vec<u8> = raw_name
            .iter()
            .copied()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .collect();
        let name = if printable.len() >= 2 {
            String::from_utf8_lossy(&printable).into_owned()
        } else {
            format!("pak{i}")
        };
        let size = u32_le(data, at + 4)?;
        if size == 0 {
            return None;
        }
        total = total.checked_add(SIGNATURE_SIZE + size as usize)?;
        entries.push(PakEntry { name, size });
        at += 8;
    }

    // every pak is preceded by its own signature block
    if at.checked_add(total)? > data.len() {
        return None;
    }

    Some(Epk2Layout {
        ota_id,
        entries,
        paks_at: at,
    })
}

/// Shared decoder for both signed package generations; only the fourcc and
/// the reported kind differ.
pub struct EpkSignedDecoder {
    fourcc: &'static [u8; 4],
    kind: DecoderKind,
}

impl EpkSignedDecoder {
    pub fn epk2() -> Self {
        Self {
            fourcc: b"EPK2",
            kind: DecoderKind::Epk2,
        }
    }

    pub fn epk3() -> Self {
        Self {
            fourcc: b"EPK3",
            kind: DecoderKind::Epk3,
        }
    }
}

impl Decoder for EpkSignedDecoder {
    fn kind(&self) -> DecoderKind {
        self.kind
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        parse(artifact.bytes(), self.fourcc).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind.name();
        let data = artifact.bytes();
        let layout = parse(data, self.fourcc)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "bad package header"))?;

        info!(
            ota_id = %layout.ota_id,
            paks = layout.entries.len(),
            "unpacking signed package"
        );

        let mut produced: Vec<PathBuf> = Vec::new();
        let mut at = layout.paks_at;
        for entry in &layout.entries {
            at += SIGNATURE_SIZE; // skip the pak signature
            let payload = data
                .get(at..at + entry.size as usize)
                .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "truncated pak"))?;
            at += entry.size as usize;

            let path = dest.path().join(format!("{}.pak", entry.name));
            write_output(name, &path, payload)?;
            produced.push(path);
        }

        let recurse = produced.clone();
        Ok(Extraction::fan_out(produced, recurse))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::build_epk;
    use super::*;

    #[test]
    fn parses_epk2_header() {
        let epk = build_epk(b"EPK2", "GP4REVB", &[("kern", b"k"), ("root", b"r")]);
        let layout = parse(&epk, b"EPK2").unwrap();
        assert_eq!(layout.ota_id, "GP4REVB");
        assert_eq!(layout.entries.len(), 2);
        assert!(parse(&epk, b"EPK3").is_none());
    }

    #[test]
    fn rejects_truncated_package() {
        let mut epk = build_epk(b"EPK2", "X", &[("kern", b"kernel")]);
        epk.truncate(epk.len() - 4);
        assert!(parse(&epk, b"EPK2").is_none());
    }
}
