//! LZ4 legacy frames, the variant vendor build scripts emit.

use thiserror::Error;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const LEGACY_MAGIC: u32 = 0x184C_2102;
const LEGACY_BLOCK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Lz4Error {
    #[error("truncated sequence at input byte {0}")]
    Truncated(usize),
    #[error("match offset {offset} exceeds output at byte {at}")]
    BadOffset { offset: usize, at: usize },
    #[error("block output exceeds {0} bytes")]
    Oversized(usize),
}

/// Decompress one raw LZ4 block.
pub fn decompress_block(src: &[u8], max_out: usize) -> std::result::Result<Vec<u8>, Lz4Error> {
    let mut out = Vec::new();
    let mut i = 0usize;

    let read_byte = |i: &mut usize| -> std::result::Result<u8, Lz4Error> {
        let b = *src.get(*i).ok_or(Lz4Error::Truncated(*i))?;
        *i += 1;
        Ok(b)
    };

    loop {
        let token = read_byte(&mut i)?;

        let mut lit_len = usize::from(token >> 4);
        if lit_len == 15 {
            loop {
                let b = read_byte(&mut i)?;
                lit_len += usize::from(b);
                if b != 255 {
                    break;
                }
            }
        }

        let lits = src
            .get(i..i + lit_len)
            .ok_or(Lz4Error::Truncated(i))?;
        out.extend_from_slice(lits);
        i += lit_len;
        if out.len() > max_out {
            return Err(Lz4Error::Oversized(max_out));
        }

        // The final sequence ends after its literals.
        if i == src.len() {
            return Ok(out);
        }

        let lo = usize::from(read_byte(&mut i)?);
        let hi = usize::from(read_byte(&mut i)?);
        let offset = lo | (hi << 8);
        if offset == 0 || offset > out.len() {
            return Err(Lz4Error::BadOffset {
                offset,
                at: out.len(),
            });
        }

        let mut match_len = usize::from(token & 0x0F);
        if match_len == 15 {
            loop {
                let b = read_byte(&mut i)?;
                match_len += usize::from(b);
                if b != 255 {
                    break;
                }
            }
        }
        match_len += 4;

        if out.len() + match_len > max_out {
            return Err(Lz4Error::Oversized(max_out));
        }
        for _ in 0..match_len {
            let b = out[out.len() - offset];
            out.push(b);
        }
    }
}

pub struct Lz4Decoder;

impl Decoder for Lz4Decoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Lz4
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        u32_le(artifact.bytes(), 0) == Some(LEGACY_MAGIC)
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();
        let mut out = Vec::new();
        let mut off = 4usize;

        while off + 4 <= data.len() {
            let word = u32_le(data, off).unwrap_or(0);
            // Concatenated frames restart with the magic word.
            if word == LEGACY_MAGIC {
                off += 4;
                continue;
            }
            let block_len = word as usize;
            off += 4;
            if block_len == 0 || off + block_len > data.len() {
                break;
            }
            let block = decompress_block(&data[off..off + block_len], LEGACY_BLOCK_SIZE)
                .map_err(|e| ExtractError::decoder(name, artifact.path(), e))?;
            out.extend_from_slice(&block);
            off += block_len;
        }

        if out.is_empty() {
            return Err(ExtractError::decoder(
                name,
                artifact.path(),
                "no decodable blocks",
            ));
        }

        let path = dest.path().to_path_buf();
        write_output(name, &path, &out)?;
        Ok(Extraction::unwrap_to(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // token-only literal run, no match (final sequence)
    fn literal_block(data: &[u8]) -> Vec<u8> {
        assert!(data.len() < 15);
        let mut b = vec![(data.len() as u8) << 4];
        b.extend_from_slice(data);
        b
    }

    #[test]
    fn decodes_literal_block() {
        let block = literal_block(b"epk data");
        assert_eq!(decompress_block(&block, 1024).unwrap(), b"epk data");
    }

    #[test]
    fn decodes_match_sequence() {
        // 4 literals "abab", a match of offset 2 / length 4, then an empty
        // final sequence
        let block = vec![0x40, b'a', b'b', b'a', b'b', 0x02, 0x00, 0x00];
        assert_eq!(decompress_block(&block, 64).unwrap(), b"abababab");
    }

    #[test]
    fn rejects_bad_offset() {
        // 1 literal then match with offset 9 into 1 byte of output
        let block = vec![0x10, b'x', 0x09, 0x00];
        assert!(matches!(
            decompress_block(&block, 64),
            Err(Lz4Error::BadOffset { .. })
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let block = vec![0xF0]; // promises 15+ literals, provides none
        assert!(matches!(
            decompress_block(&block, 64),
            Err(Lz4Error::Truncated(_))
        ));
    }
}
