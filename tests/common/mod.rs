//! Synthetic firmware images for integration tests.
#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::ZlibEncoder;

use epkx::formats::lzhs;

pub const SIGNATURE_SIZE: usize = 0x80;
pub const FIRST_STAGE_SIZE: usize = 0x10_0000;

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// EPK2/EPK3 package: signature block, header, then signed pak chunks.
pub fn build_epk(fourcc: &[u8; 4], ota_id: &str, paks: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = vec![0u8; SIGNATURE_SIZE];
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&2u32.to_le_bytes());
    let mut ota = [0u8; 32];
    ota[..ota_id.len()].copy_from_slice(ota_id.as_bytes());
    out.extend_from_slice(&ota);
    out.extend_from_slice(&(paks.len() as u32).to_le_bytes());
    for &(name, payload) in paks {
        assert_eq!(name.len(), 4);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }
    for &(_, payload) in paks {
        out.extend_from_slice(&[0u8; SIGNATURE_SIZE]);
        out.extend_from_slice(payload);
    }
    out
}

/// Minimal valid u-boot legacy image wrapping `payload`.
pub fn build_uimage(payload: &[u8]) -> Vec<u8> {
    let mut header = [0u8; 64];
    header[0..4].copy_from_slice(&0x2705_1956u32.to_be_bytes());
    header[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[24..28].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
    header[32..38].copy_from_slice(b"kernel");

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[0..4]);
    hasher.update(&[0, 0, 0, 0]);
    hasher.update(&header[8..64]);
    let hcrc = hasher.finalize();
    header[4..8].copy_from_slice(&hcrc.to_be_bytes());

    let mut image = header.to_vec();
    image.extend_from_slice(payload);
    image
}

fn put_inode_le(out: &mut Vec<u8>, mode: u16, size: u32, namelen: usize, offset: usize) {
    out.extend_from_slice(&mode.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(size & 0x00FF_FFFF).to_le_bytes());
    let word3 = ((namelen / 4) as u32 & 0x3F) | (((offset / 4) as u32) << 6);
    out.extend_from_slice(&word3.to_le_bytes());
}

/// Little-endian cramfs holding a single `/file.txt` with `content`.
pub fn build_cramfs_le(content: &[u8]) -> Vec<u8> {
    let name = b"file.txt";
    let child_at = 76usize;
    let ptrs_at = child_at + 12 + name.len();
    let data_at = ptrs_at + 4;

    let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
    zlib.write_all(content).unwrap();
    let compressed = zlib.finish().unwrap();

    let mut out = Vec::new();
    out.extend_from_slice(&0x28CD_3D45u32.to_le_bytes());
    out.extend_from_slice(&((data_at + compressed.len()) as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(b"Compressed ROMFS");
    out.extend_from_slice(&[0u8; 16]); // fsid
    out.extend_from_slice(b"rootfs\0\0\0\0\0\0\0\0\0\0");
    put_inode_le(&mut out, 0x4000 | 0o755, (12 + name.len()) as u32, 0, child_at);
    assert_eq!(out.len(), 76);

    put_inode_le(&mut out, 0x8000 | 0o644, content.len() as u32, name.len(), ptrs_at);
    out.extend_from_slice(name);
    out.extend_from_slice(&((data_at + compressed.len()) as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    out
}

/// MTK boot partition: tag + first-stage image, then chained LZHS records.
/// Each entry is (sequence index, payload); `corrupt` indices keep a valid
/// chain but carry an undecodable payload.
pub fn build_mtk_boot(records: &[(u8, &[u8])], corrupt: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; FIRST_STAGE_SIZE];
    out[0x20..0x27].copy_from_slice(b"MTK/DTV");

    for &(index, payload) in records {
        let inner = if corrupt.contains(&index) {
            // plausible inner header, garbage payload
            let mut block = lzhs::LzhsHeader::new(4096, 64, 0).to_bytes().to_vec();
            block.extend_from_slice(&[0xAA; 64]);
            block
        } else {
            lzhs::encode_block(payload)
        };
        let inner_header = lzhs::LzhsHeader::parse(&inner).unwrap();

        // first header: checksum byte is the sequence index, compressed size
        // spans the inner header plus its payload
        let first = lzhs::LzhsHeader::new(
            inner_header.uncompressed_size,
            inner_header.compressed_size + lzhs::HEADER_SIZE as u32,
            index,
        );
        out.extend_from_slice(&first.to_bytes());
        out.extend_from_slice(&inner);
        // pad records to the scan stride
        while out.len() % lzhs::HEADER_SIZE != 0 {
            out.push(0);
        }
    }
    out
}
