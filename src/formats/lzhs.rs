//! MTK LZHS blocks: LZSS matches entropy-coded with a fixed Huffman code.
//!
//! Every block starts with a 16-byte header. The `checksum` byte is
//! dual-purpose: it holds the byte-sum of the decoded payload for a single
//! block, but the first header of a chained file reuses it as the sequence
//! index of the record that follows. Chain validation in the carver depends
//! on that reuse, so it stays a single field here.

use std::sync::LazyLock;

use thiserror::Error;
use tracing::warn;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

pub const HEADER_SIZE: usize = 16;

/// Decoded payloads larger than this are treated as implausible headers.
const MAX_UNCOMPRESSED: u32 = 0x0400_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzhsHeader {
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    pub checksum: u8,
    spare: [u8; 7],
}

impl LzhsHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let mut spare = [0u8; 7];
        spare.copy_from_slice(&data[9..16]);
        Some(Self {
            uncompressed_size: u32_le(data, 0)?,
            compressed_size: u32_le(data, 4)?,
            checksum: data[8],
            spare,
        })
    }

    /// The structural magic test. Not selective enough on its own over a
    /// multi-megabyte region; the carver layers the chained-size rule on top.
    pub fn is_plausible(&self) -> bool {
        self.compressed_size != 0
            && self.uncompressed_size != 0
            && self.compressed_size <= self.uncompressed_size
            && self.uncompressed_size <= MAX_UNCOMPRESSED
            && self.spare.iter().all(|&b| b == 0)
    }

    /// Header plus payload length.
    pub fn span(&self) -> u64 {
        HEADER_SIZE as u64 + u64::from(self.compressed_size)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out[4..8].copy_from_slice(&self.compressed_size.to_le_bytes());
        out[8] = self.checksum;
        out
    }

    pub fn new(uncompressed_size: u32, compressed_size: u32, checksum: u8) -> Self {
        Self {
            uncompressed_size,
            compressed_size,
            checksum,
            spare: [0u8; 7],
        }
    }
}

#[derive(Debug, Error)]
pub enum LzhsCodecError {
    #[error("bitstream truncated at output byte {0}")]
    Truncated(usize),
    #[error("invalid huffman code")]
    BadCode,
    #[error("match distance {dist} exceeds window at output byte {at}")]
    BadDistance { dist: usize, at: usize },
}

/// Byte-sum checksum stored in the block header.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

const WINDOW: usize = 4096;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 18;
const LEN_BASE: u16 = 256;
const EOS: u16 = 272;
const NUM_SYMBOLS: usize = 273;
const MIN_CODE_LEN: u8 = 7;
const MAX_CODE_LEN: u8 = 9;

fn code_length(sym: usize) -> u8 {
    match sym {
        0..=143 => 8,
        144..=255 => 9,
        256..=271 => 7,
        _ => 8,
    }
}

struct HuffmanTable {
    /// Symbols in canonical order.
    symbols: Vec<u16>,
    /// First canonical code of each length.
    first_code: [u32; MAX_CODE_LEN as usize + 1],
    /// Index into `symbols` of the first code of each length.
    first_index: [usize; MAX_CODE_LEN as usize + 1],
    /// Number of codes of each length.
    count: [usize; MAX_CODE_LEN as usize + 1],
    /// (code, length) per symbol, for the encoder.
    encode: Vec<(u32, u8)>,
}

static TABLE: LazyLock<HuffmanTable> = LazyLock::new(|| {
    let mut count = [0usize; MAX_CODE_LEN as usize + 1];
    for sym in 0..NUM_SYMBOLS {
        count[code_length(sym) as usize] += 1;
    }

    let mut first_code = [0u32; MAX_CODE_LEN as usize + 1];
    let mut first_index = [0usize; MAX_CODE_LEN as usize + 1];
    let mut code = 0u32;
    let mut index = 0usize;
    for len in MIN_CODE_LEN..=MAX_CODE_LEN {
        let l = len as usize;
        first_code[l] = code;
        first_index[l] = index;
        code = (code + count[l] as u32) << 1;
        index += count[l];
    }

    let mut symbols = vec![0u16; NUM_SYMBOLS];
    let mut encode = vec![(0u32, 0u8); NUM_SYMBOLS];
    let mut next = [0usize; MAX_CODE_LEN as usize + 1];
    for sym in 0..NUM_SYMBOLS {
        let l = code_length(sym) as usize;
        let slot = first_index[l] + next[l];
        symbols[slot] = sym as u16;
        encode[sym] = (first_code[l] + next[l] as u32, l as u8);
        next[l] += 1;
    }

    HuffmanTable {
        symbols,
        first_code,
        first_index,
        count,
        encode,
    }
});

struct BitReader<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte: 0,
            bit: 0,
        }
    }

    #[inline]
    fn read_bit(&mut self) -> Option<u32> {
        let b = *self.data.get(self.byte)?;
        let v = (b >> (7 - self.bit)) & 1;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.byte += 1;
        }
        Some(u32::from(v))
    }

    fn read_bits(&mut self, n: u8) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Some(v)
    }
}

struct BitWriter {
    out: Vec<u8>,
    cur: u8,
    nbits: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            cur: 0,
            nbits: 0,
        }
    }

    fn put_bits(&mut self, value: u32, n: u8) {
        for i in (0..n).rev() {
            self.cur = (self.cur << 1) | ((value >> i) & 1) as u8;
            self.nbits += 1;
            if self.nbits == 8 {
                self.out.push(self.cur);
                self.cur = 0;
                self.nbits = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.nbits > 0 {
            self.cur <<= 8 - self.nbits;
            self.out.push(self.cur);
        }
        self.out
    }
}

fn read_symbol(r: &mut BitReader<'_>) -> std::result::Result<u16, LzhsCodecError> {
    let t = &*TABLE;
    let mut code = 0u32;
    for len in 1..=MAX_CODE_LEN {
        code = (code << 1)
            | r.read_bit()
                .ok_or(LzhsCodecError::Truncated(0))?;
        if len < MIN_CODE_LEN {
            continue;
        }
        let l = len as usize;
        let offset = code.wrapping_sub(t.first_code[l]);
        if (offset as usize) < t.count[l] {
            return Ok(t.symbols[t.first_index[l] + offset as usize]);
        }
    }
    Err(LzhsCodecError::BadCode)
}

/// Decode one LZHS payload to exactly `expected_len` bytes.
pub fn decode(payload: &[u8], expected_len: usize) -> std::result::Result<Vec<u8>, LzhsCodecError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut r = BitReader::new(payload);

    while out.len() < expected_len {
        let sym = read_symbol(&mut r)?;
        if sym == EOS {
            break;
        }
        if sym < LEN_BASE {
            out.push(sym as u8);
            continue;
        }
        let len = MIN_MATCH + usize::from(sym - LEN_BASE);
        let dist = r
            .read_bits(12)
            .ok_or(LzhsCodecError::Truncated(out.len()))? as usize
            + 1;
        if dist > out.len() {
            return Err(LzhsCodecError::BadDistance {
                dist,
                at: out.len(),
            });
        }
        for _ in 0..len.min(expected_len - out.len()) {
            let b = out[out.len() - dist];
            out.push(b);
        }
    }

    if out.len() < expected_len {
        return Err(LzhsCodecError::Truncated(out.len()));
    }
    Ok(out)
}

/// Encode `data` as one LZHS payload (header not included).
pub fn encode(data: &[u8]) -> Vec<u8> {
    let t = &*TABLE;
    let mut w = BitWriter::new();
    let mut pos = 0usize;

    let put_symbol = |w: &mut BitWriter, sym: u16| {
        let (code, len) = t.encode[sym as usize];
        w.put_bits(code, len);
    };

    while pos < data.len() {
        let window_start = pos.saturating_sub(WINDOW);
        let mut best_len = 0usize;
        let mut best_dist = 0usize;
        let limit = (data.len() - pos).min(MAX_MATCH);
        if limit >= MIN_MATCH {
            for start in window_start..pos {
                let mut l = 0usize;
                while l < limit && data[start + l] == data[pos + l] {
                    l += 1;
                }
                if l >= MIN_MATCH && l > best_len {
                    best_len = l;
                    best_dist = pos - start;
                    if l == limit {
                        break;
                    }
                }
            }
        }

        if best_len >= MIN_MATCH {
            put_symbol(&mut w, LEN_BASE + (best_len - MIN_MATCH) as u16);
            w.put_bits((best_dist - 1) as u32, 12);
            pos += best_len;
        } else {
            put_symbol(&mut w, u16::from(data[pos]));
            pos += 1;
        }
    }

    put_symbol(&mut w, EOS);
    w.finish()
}

/// Build a complete block (header + payload) for `data`.
pub fn encode_block(data: &[u8]) -> Vec<u8> {
    let payload = encode(data);
    let header = LzhsHeader::new(data.len() as u32, payload.len() as u32, checksum(data));
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Decode a standalone block file into its destination, verifying the
/// header checksum. Used both by the registry decoder and by the carver for
/// each record it recovers.
pub fn decode_block_file(
    decoder: &'static str,
    block: &[u8],
    dest: &std::path::Path,
) -> Result<Vec<u8>> {
    let header = LzhsHeader::parse(block)
        .filter(LzhsHeader::is_plausible)
        .ok_or_else(|| ExtractError::decoder(decoder, dest, "not an LZHS block"))?;

    let end = (header.span() as usize).min(block.len());
    let payload = &block[HEADER_SIZE..end];
    let out = decode(payload, header.uncompressed_size as usize)
        .map_err(|e| ExtractError::decoder(decoder, dest, e))?;

    let sum = checksum(&out);
    if sum != header.checksum {
        // Chained records reuse the checksum byte as a sequence index, so a
        // mismatch here is reported but never fatal.
        warn!(
            expected = header.checksum,
            actual = sum,
            dest = %dest.display(),
            "lzhs checksum mismatch"
        );
    }

    write_output(decoder, dest, &out)?;
    Ok(out)
}

/// Standalone LZHS block file.
pub struct LzhsDecoder;

impl Decoder for LzhsDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Lzhs
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        let Some(header) = LzhsHeader::parse(artifact.bytes()) else {
            return false;
        };
        header.is_plausible() && header.span() <= artifact.len()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let path = dest.path().to_path_buf();
        decode_block_file(self.kind().name(), artifact.bytes(), &path)?;
        Ok(Extraction::terminal(vec![path]))
    }
}

/// ext4 image stored as a back-to-back run of LZHS segments. Two plausible
/// headers in sequence distinguish it from a standalone block, which the
/// registry probes much later.
pub struct Ext4LzhsDecoder;

impl Ext4LzhsDecoder {
    fn segments(data: &[u8]) -> Vec<(usize, LzhsHeader)> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off + HEADER_SIZE <= data.len() {
            let Some(header) = LzhsHeader::parse(&data[off..]).filter(LzhsHeader::is_plausible)
            else {
                break;
            };
            if off as u64 + header.span() > data.len() as u64 {
                break;
            }
            out.push((off, header));
            off += header.span() as usize;
        }
        out
    }
}

impl Decoder for Ext4LzhsDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Ext4Lzhs
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        let data = artifact.bytes();
        let Some(first) = LzhsHeader::parse(data).filter(LzhsHeader::is_plausible) else {
            return false;
        };
        let next = first.span() as usize;
        LzhsHeader::parse(data.get(next..).unwrap_or(&[]))
            .filter(LzhsHeader::is_plausible)
            .is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let path = dest.path().to_path_buf();
        let data = artifact.bytes();

        let mut image = Vec::new();
        for (off, header) in Self::segments(data) {
            let payload = &data[off + HEADER_SIZE..off + header.span() as usize];
            let part = decode(payload, header.uncompressed_size as usize)
                .map_err(|e| ExtractError::decoder(name, artifact.path(), e))?;
            image.extend_from_slice(&part);
        }

        if image.is_empty() {
            return Err(ExtractError::decoder(
                name,
                artifact.path(),
                "no decodable segments",
            ));
        }

        write_output(name, &path, &image)?;
        Ok(Extraction::terminal(vec![path]))
    }
}
