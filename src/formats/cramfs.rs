//! CRAMFS images. Big-endian images are endian-swapped and re-enter
//! classification; little-endian images unpack to a directory tree.
//!
//! The registry probes big-endian strictly before little-endian. An image can
//! satisfy both predicates at once (superblocks are accepted at offset 0 and
//! 512), so the order is load-bearing.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use tracing::debug;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::write_output;
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: u32 = 0x28CD_3D45;
const SIGNATURE: &[u8; 16] = b"Compressed ROMFS";
const SB_SIZE: usize = 76;
const ROOT_INODE_OFF: usize = 64;
const INODE_SIZE: usize = 12;
const BLOCK_SIZE: usize = 4096;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;
const S_IFLNK: u16 = 0xA000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, data: &[u8], off: usize) -> Option<u16> {
        let b: [u8; 2] = data.get(off..off + 2)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    fn u32(self, data: &[u8], off: usize) -> Option<u32> {
        let b: [u8; 4] = data.get(off..off + 4)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }
}

/// Locate a superblock of the requested endianness at offset 0 or 512.
pub(crate) fn find_superblock(data: &[u8], endian: Endian) -> Option<usize> {
    for base in [0usize, 512] {
        if endian.u32(data, base) == Some(MAGIC)
            && data.get(base + 16..base + 32).map(|s| s == SIGNATURE) == Some(true)
        {
            return Some(base);
        }
    }
    None
}

/// One parsed inode. `namelen` and `offset` are byte values (the on-disk
/// fields count 4-byte units).
#[derive(Debug, Clone, Copy)]
struct Inode {
    mode: u16,
    uid: u16,
    size: u32,
    gid: u8,
    namelen: usize,
    offset: usize,
}

fn parse_inode(data: &[u8], at: usize, endian: Endian) -> Option<Inode> {
    let mode = endian.u16(data, at)?;
    let uid = endian.u16(data, at + 2)?;
    let word2 = endian.u32(data, at + 4)?;
    let word3 = endian.u32(data, at + 8)?;

    // LE packs size in the low 24 bits and namelen in the low 6; BE packs
    // them at the top of each word.
    let (size, gid, namelen, offset) = match endian {
        Endian::Little => (
            word2 & 0x00FF_FFFF,
            (word2 >> 24) as u8,
            (word3 & 0x3F) as usize,
            (word3 >> 6) as usize,
        ),
        Endian::Big => (
            word2 >> 8,
            (word2 & 0xFF) as u8,
            (word3 >> 26) as usize,
            (word3 & 0x03FF_FFFF) as usize,
        ),
    };

    Some(Inode {
        mode,
        uid,
        size,
        gid,
        namelen: namelen * 4,
        offset: offset * 4,
    })
}

fn write_inode_le(out: &mut [u8], at: usize, inode: &Inode) {
    out[at..at + 2].copy_from_slice(&inode.mode.to_le_bytes());
    out[at + 2..at + 4].copy_from_slice(&inode.uid.to_le_bytes());
    let word2 = (inode.size & 0x00FF_FFFF) | (u32::from(inode.gid) << 24);
    out[at + 4..at + 8].copy_from_slice(&word2.to_le_bytes());
    let word3 = ((inode.namelen / 4) as u32 & 0x3F) | (((inode.offset / 4) as u32) << 6);
    out[at + 8..at + 12].copy_from_slice(&word3.to_le_bytes());
}

fn swap32(out: &mut [u8], at: usize) {
    if at + 4 <= out.len() {
        out[at..at + 4].reverse();
    }
}

/// Rewrite a big-endian image as little-endian: superblock words, every
/// reachable inode, and the block-pointer arrays of regular files and
/// symlinks. Name bytes and compressed data are endian-free.
fn swap_image(data: &[u8], base: usize) -> Option<Vec<u8>> {
    let mut out = data.to_vec();

    for field in [0usize, 4, 8, 12, 32, 36, 40, 44] {
        swap32(&mut out, base + field);
    }

    let mut stack = vec![base + ROOT_INODE_OFF];
    while let Some(at) = stack.pop() {
        let inode = parse_inode(data, at, Endian::Big)?;
        if at + INODE_SIZE > out.len() {
            return None;
        }
        write_inode_le(&mut out, at, &inode);

        match inode.mode & S_IFMT {
            S_IFDIR => {
                if inode.size == 0 {
                    continue;
                }
                let mut child = inode.offset;
                let end = inode.offset.checked_add(inode.size as usize)?;
                if end > data.len() {
                    return None;
                }
                while child + INODE_SIZE <= end {
                    let ci = parse_inode(data, child, Endian::Big)?;
                    stack.push(child);
                    child += INODE_SIZE + ci.namelen;
                }
            }
            S_IFREG | S_IFLNK => {
                let nblocks = (inode.size as usize).div_ceil(BLOCK_SIZE);
                for i in 0..nblocks {
                    swap32(&mut out, inode.offset + 4 * i);
                }
            }
            _ => {}
        }
    }

    Some(out)
}

fn inflate(block: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(block).read_to_end(&mut out)?;
    Ok(out)
}

/// Reassemble one file's bytes from its block-pointer array.
fn read_file_data(data: &[u8], inode: &Inode) -> Option<Vec<u8>> {
    let size = inode.size as usize;
    if size == 0 {
        return Some(Vec::new());
    }

    let nblocks = size.div_ceil(BLOCK_SIZE);
    let mut out = Vec::with_capacity(size);
    let mut cur = inode.offset.checked_add(4 * nblocks)?;

    for i in 0..nblocks {
        let end = Endian::Little.u32(data, inode.offset + 4 * i)? as usize;
        if end < cur || end > data.len() {
            return None;
        }
        let block = &data[cur..end];
        if block.is_empty() {
            // hole: a full block of zeros
            let remaining = size - out.len();
            out.resize(out.len() + BLOCK_SIZE.min(remaining), 0);
        } else {
            out.extend_from_slice(&inflate(block).ok()?);
        }
        cur = end;
    }

    out.truncate(size);
    Some(out)
}

fn safe_name(raw: &[u8]) -> Option<String> {
    let trimmed: Vec<u8> = raw.iter().copied().take_while(|&b| b != 0).collect();
    if trimmed.is_empty() {
        return None;
    }
    let name = String::from_utf8_lossy(&trimmed).into_owned();
    if name == "." || name == ".." || name.contains('/') {
        return None;
    }
    Some(name)
}

fn unpack(data: &[u8], base: usize, dest: &Path) -> std::result::Result<(), String> {
    fs::create_dir_all(dest).map_err(|e| e.to_string())?;

    let mut stack: Vec<(usize, PathBuf)> = vec![(base + ROOT_INODE_OFF, dest.to_path_buf())];
    while let Some((at, path)) = stack.pop() {
        let inode = parse_inode(data, at, Endian::Little)
            .ok_or_else(|| format!("inode out of bounds at {at:#x}"))?;

        match inode.mode & S_IFMT {
            S_IFDIR => {
                fs::create_dir_all(&path).map_err(|e| e.to_string())?;
                if inode.size == 0 {
                    continue;
                }
                let end = inode
                    .offset
                    .checked_add(inode.size as usize)
                    .filter(|&e| e <= data.len())
                    .ok_or_else(|| format!("directory data out of bounds at {at:#x}"))?;
                let mut child = inode.offset;
                while child + INODE_SIZE <= end {
                    let ci = parse_inode(data, child, Endian::Little)
                        .ok_or_else(|| format!("inode out of bounds at {child:#x}"))?;
                    let raw_name = data
                        .get(child + INODE_SIZE..child + INODE_SIZE + ci.namelen)
                        .ok_or_else(|| format!("name out of bounds at {child:#x}"))?;
                    if let Some(name) = safe_name(raw_name) {
                        stack.push((child, path.join(name)));
                    }
                    child += INODE_SIZE + ci.namelen;
                }
            }
            S_IFREG => {
                let content = read_file_data(data, &inode)
                    .ok_or_else(|| format!("file data out of bounds at {at:#x}"))?;
                fs::write(&path, content).map_err(|e| e.to_string())?;
            }
            S_IFLNK => {
                let target = read_file_data(data, &inode)
                    .ok_or_else(|| format!("symlink data out of bounds at {at:#x}"))?;
                let target = String::from_utf8_lossy(&target).into_owned();
                #[cfg(unix)]
                {
                    let _ = fs::remove_file(&path);
                    std::os::unix::fs::symlink(&target, &path).map_err(|e| e.to_string())?;
                }
                #[cfg(not(unix))]
                fs::write(&path, target).map_err(|e| e.to_string())?;
            }
            other => {
                debug!(mode = other, path = %path.display(), "skipping special inode");
            }
        }
    }

    Ok(())
}

/// Big-endian image: endian swap, then let classification unpack the result.
pub struct CramfsSwapDecoder;

impl Decoder for CramfsSwapDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::CramfsBe
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        find_superblock(artifact.bytes(), Endian::Big).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();
        let base = find_superblock(data, Endian::Big)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "superblock vanished"))?;

        let swapped = swap_image(data, base)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "malformed inode tree"))?;

        let path = dest.path().to_path_buf();
        write_output(name, &path, &swapped)?;
        Ok(Extraction::unwrap_to(path))
    }
}

/// Little-endian image: unpack the tree into a directory.
pub struct CramfsUnpackDecoder;

impl Decoder for CramfsUnpackDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::CramfsLe
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        find_superblock(artifact.bytes(), Endian::Little).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();
        let base = find_superblock(data, Endian::Little)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "superblock vanished"))?;

        let dir = dest.path().to_path_buf();
        unpack(data, base, &dir).map_err(|e| ExtractError::decoder(name, artifact.path(), e))?;

        if let Some(files) = Endian::Little.u32(data, base + 44) {
            debug!(files, dir = %dir.display(), "cramfs unpacked");
        }
        Ok(Extraction::terminal(vec![dir]))
    }
}
