//! lzop containers and the LZO1X decompressor.

use thiserror::Error;
use tracing::warn;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::write_output;
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: &[u8; 9] = &[0x89, 0x4C, 0x5A, 0x4F, 0x00, 0x0D, 0x0A, 0x1A, 0x0A];

const F_ADLER32_D: u32 = 0x0000_0001;
const F_ADLER32_C: u32 = 0x0000_0002;
const F_CRC32_D: u32 = 0x0000_0100;
const F_CRC32_C: u32 = 0x0000_0200;
const F_H_FILTER: u32 = 0x0000_0800;
const F_H_CRC32: u32 = 0x0000_1000;

#[derive(Debug, Error)]
pub enum LzoError {
    #[error("truncated stream at input byte {0}")]
    Truncated(usize),
    #[error("lookbehind overrun: distance {dist} at output byte {at}")]
    Lookbehind { dist: usize, at: usize },
    #[error("output exceeds declared size {0}")]
    Oversized(usize),
    #[error("block checksum mismatch")]
    Checksum,
}

pub(crate) fn adler32(data: &[u8]) -> u32 {
    let mut a = 1u32;
    let mut b = 0u32;
    for &x in data {
        a = (a + u32::from(x)) % 65521;
        b = (b + a) % 65521;
    }
    (b << 16) | a
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> std::result::Result<usize, LzoError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(LzoError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(usize::from(b))
    }

    fn le16(&mut self) -> std::result::Result<usize, LzoError> {
        let lo = self.byte()?;
        let hi = self.byte()?;
        Ok(lo | (hi << 8))
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], LzoError> {
        let s = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(LzoError::Truncated(self.pos))?;
        self.pos += n;
        Ok(s)
    }

    /// Run-length extension: zero bytes add 255 each, the terminator adds
    /// itself.
    fn extend_len(&mut self, mut len: usize, bias: usize) -> std::result::Result<usize, LzoError> {
        if len != 0 {
            return Ok(len);
        }
        len = bias;
        loop {
            let b = self.byte()?;
            if b == 0 {
                len += 255;
            } else {
                return Ok(len + b);
            }
        }
    }
}

/// Decompress one LZO1X stream to exactly `expected` bytes.
pub fn lzo1x_decompress(src: &[u8], expected: usize) -> std::result::Result<Vec<u8>, LzoError> {
    let mut c = Cursor::new(src);
    let mut out: Vec<u8> = Vec::with_capacity(expected);
    // number of literals the previous instruction carried (0..=3, or 4 for
    // a long run); opcodes below 16 decode differently per state
    let mut state = 0usize;

    let copy_literals =
        |c: &mut Cursor<'_>, out: &mut Vec<u8>, n: usize| -> std::result::Result<(), LzoError> {
            let lits = c.take(n)?;
            out.extend_from_slice(lits);
            if out.len() > expected {
                return Err(LzoError::Oversized(expected));
            }
            Ok(())
        };

    let copy_match =
        |out: &mut Vec<u8>, len: usize, dist: usize| -> std::result::Result<(), LzoError> {
            if dist == 0 || dist > out.len() {
                return Err(LzoError::Lookbehind {
                    dist,
                    at: out.len(),
                });
            }
            if out.len() + len > expected {
                return Err(LzoError::Oversized(expected));
            }
            for _ in 0..len {
                let b = out[out.len() - dist];
                out.push(b);
            }
            Ok(())
        };

    // leading literal run
    let first = *src.first().ok_or(LzoError::Truncated(0))? as usize;
    if first > 17 {
        c.pos = 1;
        let n = first - 17;
        copy_literals(&mut c, &mut out, n)?;
        state = if n < 4 { n } else { 4 };
    }

    loop {
        let t = c.byte()?;

        if t < 16 {
            match state {
                0 => {
                    let len = c.extend_len(t, 15)? + 3;
                    copy_literals(&mut c, &mut out, len)?;
                    state = 4;
                    continue;
                }
                1..=3 => {
                    let h = c.byte()?;
                    let dist = (h << 2) + (t >> 2) + 1;
                    copy_match(&mut out, 2, dist)?;
                }
                _ => {
                    let h = c.byte()?;
                    let dist = (h << 2) + (t >> 2) + 2049;
                    copy_match(&mut out, 3, dist)?;
                }
            }
            state = t & 3;
            copy_literals(&mut c, &mut out, state)?;
        } else if t < 32 {
            let len = c.extend_len(t & 7, 7)? + 2;
            let ds = c.le16()?;
            let dist = 16384 + ((t & 8) << 11) + (ds >> 2);
            if dist == 16384 {
                // end-of-stream marker
                if out.len() != expected {
                    return Err(LzoError::Truncated(c.pos));
                }
                return Ok(out);
            }
            copy_match(&mut out, len, dist)?;
            state = ds & 3;
            copy_literals(&mut c, &mut out, state)?;
        } else if t < 64 {
            let len = c.extend_len(t & 31, 31)? + 2;
            let ds = c.le16()?;
            let dist = (ds >> 2) + 1;
            copy_match(&mut out, len, dist)?;
            state = ds & 3;
            copy_literals(&mut c, &mut out, state)?;
        } else {
            let len = if t < 128 {
                3 + ((t >> 5) & 1)
            } else {
                5 + ((t >> 5) & 3)
            };
            let h = c.byte()?;
            let dist = (h << 3) + ((t >> 2) & 7) + 1;
            copy_match(&mut out, len, dist)?;
            state = t & 3;
            copy_literals(&mut c, &mut out, state)?;
        }
    }
}

struct LzopHeader {
    flags: u32,
    /// Offset of the first block record.
    blocks_at: usize,
}

fn parse_header(data: &[u8]) -> Option<LzopHeader> {
    if !data.starts_with(MAGIC) {
        return None;
    }
    let mut pos = MAGIC.len();

    let be16 = |p: &mut usize| -> Option<u16> {
        let v = u16::from_be_bytes(data.get(*p..*p + 2)?.try_into().ok()?);
        *p += 2;
        Some(v)
    };

    let version = be16(&mut pos)?;
    let _lib_version = be16(&mut pos)?;
    if version < 0x0900 {
        return None;
    }
    if version >= 0x0940 {
        let _version_needed = be16(&mut pos)?;
    }

    let method = *data.get(pos)?;
    pos += 1;
    if !(1..=3).contains(&method) {
        return None;
    }
    if version >= 0x0940 {
        pos += 1; // level
    }

    let flags = u32::from_be_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
    pos += 4;
    if flags & F_H_FILTER != 0 {
        pos += 4;
    }
    pos += 4; // mode
    pos += 4; // mtime low
    if version >= 0x0940 {
        pos += 4; // mtime high
    }

    let name_len = usize::from(*data.get(pos)?);
    pos += 1;
    let checked_start = MAGIC.len();
    let checked_end = pos + name_len;
    pos = checked_end;

    let stored = u32::from_be_bytes(data.get(pos..pos + 4)?.try_into().ok()?);
    pos += 4;

    let checked = data.get(checked_start..checked_end)?;
    let computed = if flags & F_H_CRC32 != 0 {
        crc32fast::hash(checked)
    } else {
        adler32(checked)
    };
    if computed != stored {
        return None;
    }

    Some(LzopHeader {
        flags,
        blocks_at: pos,
    })
}

pub struct LzoDecoder;

impl Decoder for LzoDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Lzo
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        parse_header(artifact.bytes()).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();
        let header = parse_header(data)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "bad lzop header"))?;

        let be32 = |p: usize| -> Option<u32> {
            data.get(p..p + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        };

        let mut out = Vec::new();
        let mut pos = header.blocks_at;
        loop {
            let Some(dst_len) = be32(pos) else { break };
            pos += 4;
            if dst_len == 0 {
                break;
            }
            let src_len = be32(pos)
                .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "truncated block"))?
                as usize;
            pos += 4;

            let mut d_chk = None;
            if header.flags & (F_ADLER32_D | F_CRC32_D) != 0 {
                d_chk = be32(pos);
                pos += 4;
            }
            if header.flags & (F_ADLER32_C | F_CRC32_C) != 0 && src_len < dst_len as usize {
                pos += 4; // compressed-data checksum, not verified
            }

            let block = data.get(pos..pos + src_len).ok_or_else(|| {
                ExtractError::decoder(name, artifact.path(), "truncated block data")
            })?;
            pos += src_len;

            let decoded = if src_len == dst_len as usize {
                block.to_vec()
            } else {
                lzo1x_decompress(block, dst_len as usize)
                    .map_err(|e| ExtractError::decoder(name, artifact.path(), e))?
            };

            if let Some(stored) = d_chk {
                let computed = if header.flags & F_CRC32_D != 0 {
                    crc32fast::hash(&decoded)
                } else {
                    adler32(&decoded)
                };
                if computed != stored {
                    warn!(
                        source = %artifact.path().display(),
                        "lzop block checksum mismatch"
                    );
                }
            }

            out.extend_from_slice(&decoded);
        }

        if out.is_empty() {
            return Err(ExtractError::decoder(name, artifact.path(), "no blocks"));
        }

        let path = dest.path().to_path_buf();
        write_output(name, &path, &out)?;
        Ok(Extraction::unwrap_to(path))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::build_lzop_stored;
    use super::*;

    #[test]
    fn decompresses_literal_run() {
        // 21 - 17 = 4 literals, then the end marker 11 00 00
        let mut src = vec![21, b'p', b'a', b'k', b'0'];
        src.extend_from_slice(&[0x11, 0x00, 0x00]);
        assert_eq!(lzo1x_decompress(&src, 4).unwrap(), b"pak0");
    }

    #[test]
    fn decompresses_m2_match() {
        // "abcd" then an M2 match: t=0x60 -> len 4, dist 1 -> "dddd"
        let mut src = vec![21, b'a', b'b', b'c', b'd'];
        src.extend_from_slice(&[0x60, 0x00]);
        src.extend_from_slice(&[0x11, 0x00, 0x00]);
        assert_eq!(lzo1x_decompress(&src, 8).unwrap(), b"abcddddd");
    }

    #[test]
    fn rejects_lookbehind_overrun() {
        // one literal, then an M1 match whose distance reaches past it
        let src = vec![18, b'x', 0x00, 0x04, 0x11, 0x00, 0x00];
        assert!(matches!(
            lzo1x_decompress(&src, 16),
            Err(LzoError::Lookbehind { .. })
        ));
    }

    #[test]
    fn header_checksum_gates_detection() {
        let mut container = build_lzop_stored(b"payload");
        assert!(parse_header(&container).is_some());
        // flip a header byte; adler no longer matches
        container[12] ^= 0xFF;
        assert!(parse_header(&container).is_none());
    }
}
