//! PVR recordings: 192-byte scrambled stream packets repacked as plain
//! 188-byte transport stream, and the program-information files that index
//! them. The descrambler is the platform's keyed stream cipher; the key
//! schedule here is the fixed one the recorder uses for exported files.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::write_output;
use crate::mfile::MappedFile;
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const STR_PACKET: usize = 192;
const TS_PACKET: usize = 188;
const TS_SYNC: u8 = 0x47;
const SYNC_PROBE_PACKETS: usize = 4;

const STREAM_KEY: [u8; 16] = [
    0x4C, 0x47, 0x45, 0x21, 0x9A, 0x3B, 0xD4, 0x7F, 0x12, 0xC8, 0x56, 0xE0, 0x0D, 0x91, 0x6A,
    0x33,
];

/// Per-packet stream descrambler. Self-inverse, so the same routine serves
/// test fixtures.
pub(crate) fn descramble(packet: &mut [u8]) {
    // the 4-byte timecode prefix and the sync byte stay in the clear
    for (i, b) in packet.iter_mut().enumerate().skip(5) {
        *b ^= STREAM_KEY[i % STREAM_KEY.len()];
    }
}

fn has_packet_sync(data: &[u8]) -> bool {
    if data.len() < SYNC_PROBE_PACKETS * STR_PACKET {
        return false;
    }
    (0..SYNC_PROBE_PACKETS).all(|k| data[k * STR_PACKET + 4] == TS_SYNC)
}

fn convert_packets(data: &[u8], out: &mut Vec<u8>) -> usize {
    let mut converted = 0usize;
    for chunk in data.chunks_exact(STR_PACKET) {
        let mut packet = [0u8; STR_PACKET];
        packet.copy_from_slice(chunk);
        descramble(&mut packet);
        // drop the 4-byte timecode in front of each TS packet
        out.extend_from_slice(&packet[4..4 + TS_PACKET]);
        converted += 1;
    }
    converted
}

pub struct StrDecoder;

impl Decoder for StrDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Str
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        let by_suffix = artifact
            .path()
            .extension()
            .map(|e| e.eq_ignore_ascii_case("str"))
            .unwrap_or(false);
        by_suffix && has_packet_sync(artifact.bytes())
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let mut out = Vec::with_capacity(artifact.bytes().len() / STR_PACKET * TS_PACKET);
        let packets = convert_packets(artifact.bytes(), &mut out);
        info!(packets, "converted stream to transport stream");

        let path = dest.path().to_path_buf();
        write_output(self.kind().name(), &path, &out)?;
        Ok(Extraction::terminal(vec![path]))
    }
}

/// Printable runs in the index that name `.str` stream segments.
fn referenced_streams(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut run: Vec<u8> = Vec::new();
    for &b in data.iter().chain(std::iter::once(&0u8)) {
        if b.is_ascii_graphic() {
            run.push(b);
            continue;
        }
        if run.len() >= 5 {
            let s = String::from_utf8_lossy(&run).into_owned();
            if s.to_ascii_lowercase().ends_with(".str") && !s.contains('/') {
                names.push(s);
            }
        }
        run.clear();
    }
    names.dedup();
    names
}

pub struct PifDecoder;

impl Decoder for PifDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Pif
    }

    /// Program information files are recognized by name alone: anything
    /// ending in literal `PIF`, extension or not.
    fn detect(&self, artifact: &Artifact) -> bool {
        artifact.file_name().ends_with("PIF")
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let refs = referenced_streams(artifact.bytes());
        if refs.is_empty() {
            return Err(ExtractError::decoder(
                name,
                artifact.path(),
                "no stream segments referenced",
            ));
        }

        let parent = artifact.path().parent().map(PathBuf::from).unwrap_or_default();
        let mut out = Vec::new();
        let mut found = 0usize;
        for stream in &refs {
            let segment = parent.join(stream);
            match MappedFile::open(&segment) {
                Ok(map) if has_packet_sync(map.bytes()) => {
                    let packets = convert_packets(map.bytes(), &mut out);
                    info!(segment = %segment.display(), packets, "appended stream segment");
                    found += 1;
                }
                Ok(_) => warn!(segment = %segment.display(), "segment has no packet sync"),
                Err(_) => warn!(segment = %segment.display(), "referenced segment missing"),
            }
        }

        if found == 0 {
            return Err(ExtractError::decoder(
                name,
                artifact.path(),
                "no referenced segment could be read",
            ));
        }

        let path = dest.path().to_path_buf();
        write_output(name, &path, &out)?;
        Ok(Extraction::terminal(vec![path]))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::build_str;
    use super::*;

    #[test]
    fn descramble_is_self_inverse() {
        let mut packet = [0xABu8; STR_PACKET];
        let original = packet;
        descramble(&mut packet);
        assert_ne!(packet[10], original[10]);
        descramble(&mut packet);
        assert_eq!(packet, original);
    }

    #[test]
    fn converts_scrambled_packets() {
        let (scrambled, expected) = build_str(6);
        assert!(has_packet_sync(&scrambled));

        let mut out = Vec::new();
        let n = convert_packets(&scrambled, &mut out);
        assert_eq!(n, 6);
        assert_eq!(out, expected);
    }

    #[test]
    fn finds_stream_references() {
        let mut pif = vec![0u8; 16];
        pif.extend_from_slice(b"00001.str\0");
        pif.extend_from_slice(b"garbage");
        pif.push(0);
        pif.extend_from_slice(b"00002.STR\0");
        let refs = referenced_streams(&pif);
        assert_eq!(refs, vec!["00001.str".to_string(), "00002.STR".to_string()]);
    }
}
