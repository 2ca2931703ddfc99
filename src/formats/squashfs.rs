//! SquashFS v4 images (zlib data), unpacked to a directory tree.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u16_le, u32_le};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: u32 = 0x7371_7368; // "hsqs"
const COMP_ZLIB: u16 = 1;
const NO_FRAGMENT: u32 = 0xFFFF_FFFF;
const META_BLOCK: usize = 8192;

const T_DIR: u16 = 1;
const T_FILE: u16 = 2;
const T_SYMLINK: u16 = 3;
const T_EXT_DIR: u16 = 8;

type SqResult<T> = std::result::Result<T, String>;

fn u64_le(data: &[u8], off: usize) -> Option<u64> {
    let b: [u8; 8] = data.get(off..off + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(b))
}

#[derive(Debug, Clone, Copy)]
struct Superblock {
    block_size: u32,
    frag_count: u32,
    compressor: u16,
    root_inode: u64,
    bytes_used: u64,
    id_table: u64,
    xattr_table: u64,
    inode_table: u64,
    dir_table: u64,
    frag_table: u64,
    export_table: u64,
}

impl Superblock {
    fn parse(data: &[u8]) -> Option<Self> {
        if u32_le(data, 0)? != MAGIC || u16_le(data, 28)? != 4 {
            return None;
        }
        Some(Self {
            block_size: u32_le(data, 12)?,
            frag_count: u32_le(data, 16)?,
            compressor: u16_le(data, 20)?,
            root_inode: u64_le(data, 32)?,
            bytes_used: u64_le(data, 40)?,
            id_table: u64_le(data, 48)?,
            xattr_table: u64_le(data, 56)?,
            inode_table: u64_le(data, 64)?,
            dir_table: u64_le(data, 72)?,
            frag_table: u64_le(data, 80)?,
            export_table: u64_le(data, 88)?,
        })
    }

    /// First table offset after `start`; regions are laid out back to back.
    fn region_end(&self, start: u64) -> u64 {
        [
            self.frag_table,
            self.export_table,
            self.id_table,
            self.xattr_table,
            self.bytes_used,
        ]
        .into_iter()
        .filter(|&t| t != u64::MAX && t > start)
        .min()
        .unwrap_or(self.bytes_used)
    }
}

fn inflate(block: &[u8]) -> SqResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(block)
        .read_to_end(&mut out)
        .map_err(|e| format!("zlib: {e}"))?;
    Ok(out)
}

/// A metadata region decompressed into one buffer, with a map from each
/// on-disk block's relative offset to its uncompressed position. Inode
/// references address blocks by that relative offset.
struct MetaRegion {
    data: Vec<u8>,
    blocks: HashMap<u64, usize>,
}

impl MetaRegion {
    fn read(data: &[u8], start: u64, end: u64) -> SqResult<Self> {
        let mut out = Vec::new();
        let mut blocks = HashMap::new();
        let mut off = start;

        while off + 2 <= end {
            let header = u16_le(data, off as usize).ok_or("metadata header out of bounds")?;
            let len = usize::from(header & 0x7FFF);
            let stored = header & 0x8000 != 0;
            let body = data
                .get(off as usize + 2..off as usize + 2 + len)
                .ok_or("metadata block out of bounds")?;

            blocks.insert(off - start, out.len());
            if stored {
                out.extend_from_slice(body);
            } else {
                let inflated = inflate(body)?;
                if inflated.len() > META_BLOCK {
                    return Err("metadata block too large".into());
                }
                out.extend_from_slice(&inflated);
            }
            off += 2 + len as u64;
        }

        Ok(Self { data: out, blocks })
    }

    /// Resolve a (block, offset) metadata reference to a buffer position.
    fn resolve(&self, block: u64, offset: usize) -> SqResult<usize> {
        let base = self
            .blocks
            .get(&block)
            .ok_or_else(|| format!("dangling metadata reference to block {block:#x}"))?;
        Ok(base + offset)
    }
}

#[derive(Debug)]
enum InodeBody {
    Dir {
        start_block: u32,
        offset: u16,
        /// Listing size plus the 3 virtual bytes of "." and "..".
        file_size: u32,
    },
    File {
        blocks_start: u64,
        frag_index: u32,
        frag_offset: u32,
        file_size: u64,
        block_sizes: Vec<u32>,
    },
    Symlink {
        target: Vec<u8>,
    },
    Other(u16),
}

fn parse_inode(meta: &MetaRegion, pos: usize, block_size: u32) -> SqResult<InodeBody> {
    let d = &meta.data;
    let itype = u16_le(d, pos).ok_or("inode header out of bounds")?;
    let body = pos + 16;

    match itype {
        T_DIR => Ok(InodeBody::Dir {
            start_block: u32_le(d, body).ok_or("dir inode truncated")?,
            file_size: u32::from(u16_le(d, body + 8).ok_or("dir inode truncated")?),
            offset: u16_le(d, body + 10).ok_or("dir inode truncated")?,
        }),
        T_EXT_DIR => Ok(InodeBody::Dir {
            file_size: u32_le(d, body + 4).ok_or("ext dir inode truncated")?,
            start_block: u32_le(d, body + 8).ok_or("ext dir inode truncated")?,
            offset: u16_le(d, body + 18).ok_or("ext dir inode truncated")?,
        }),
        T_FILE => {
            let blocks_start = u64::from(u32_le(d, body).ok_or("file inode truncated")?);
            let frag_index = u32_le(d, body + 4).ok_or("file inode truncated")?;
            let frag_offset = u32_le(d, body + 8).ok_or("file inode truncated")?;
            let file_size = u64::from(u32_le(d, body + 12).ok_or("file inode truncated")?);

            let full_blocks = (file_size / u64::from(block_size)) as usize;
            let n = if frag_index == NO_FRAGMENT {
                (file_size as usize).div_ceil(block_size as usize)
            } else {
                full_blocks
            };
            let mut block_sizes = Vec::with_capacity(n);
            for i in 0..n {
                block_sizes
                    .push(u32_le(d, body + 16 + 4 * i).ok_or("block size list truncated")?);
            }
            Ok(InodeBody::File {
                blocks_start,
                frag_index,
                frag_offset,
                file_size,
                block_sizes,
            })
        }
        T_SYMLINK => {
            let target_size = u32_le(d, body + 4).ok_or("symlink inode truncated")? as usize;
            let target = d
                .get(body + 8..body + 8 + target_size)
                .ok_or("symlink target truncated")?
                .to_vec();
            Ok(InodeBody::Symlink { target })
        }
        other => Ok(InodeBody::Other(other)),
    }
}

#[derive(Debug)]
struct DirEntry {
    name: String,
    block: u64,
    offset: u16,
}

fn parse_directory(meta: &MetaRegion, pos: usize, listing_size: u32) -> SqResult<Vec<DirEntry>> {
    let d = &meta.data;
    let mut entries = Vec::new();
    if listing_size < 3 {
        return Ok(entries);
    }
    let mut cur = pos;
    let end = pos + listing_size as usize - 3;

    while cur + 12 <= end {
        let count = u32_le(d, cur).ok_or("directory header truncated")?;
        let start = u64::from(u32_le(d, cur + 4).ok_or("directory header truncated")?);
        cur += 12;

        for _ in 0..=count {
            let offset = u16_le(d, cur).ok_or("directory entry truncated")?;
            let name_size = u16_le(d, cur + 6).ok_or("directory entry truncated")? as usize;
            let name_bytes = d
                .get(cur + 8..cur + 8 + name_size + 1)
                .ok_or("directory name truncated")?;
            cur += 8 + name_size + 1;

            let name = String::from_utf8_lossy(name_bytes).into_owned();
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                continue;
            }
            entries.push(DirEntry {
                name,
                block: start,
                offset,
            });
        }
    }

    Ok(entries)
}

struct FragmentEntry {
    start: u64,
    size: u32,
}

fn read_fragment_table(data: &[u8], sb: &Superblock) -> SqResult<Vec<FragmentEntry>> {
    if sb.frag_count == 0 || sb.frag_table == u64::MAX {
        return Ok(Vec::new());
    }

    let n_blocks = (sb.frag_count as usize).div_ceil(512);
    let mut raw = Vec::new();
    for i in 0..n_blocks {
        let ptr = u64_le(data, sb.frag_table as usize + 8 * i)
            .ok_or("fragment table pointer out of bounds")?;
        let header =
            u16_le(data, ptr as usize).ok_or("fragment metadata header out of bounds")?;
        let len = usize::from(header & 0x7FFF);
        let body = data
            .get(ptr as usize + 2..ptr as usize + 2 + len)
            .ok_or("fragment metadata out of bounds")?;
        if header & 0x8000 != 0 {
            raw.extend_from_slice(body);
        } else {
            raw.extend_from_slice(&inflate(body)?);
        }
    }

    let mut entries = Vec::with_capacity(sb.frag_count as usize);
    for i in 0..sb.frag_count as usize {
        entries.push(FragmentEntry {
            start: u64_le(&raw, 16 * i).ok_or("fragment entry truncated")?,
            size: u32_le(&raw, 16 * i + 8).ok_or("fragment entry truncated")?,
        });
    }
    Ok(entries)
}

/// Read one data block given its size word (bit 24 set means stored).
fn read_data_block(data: &[u8], at: u64, size_word: u32, block_size: u32) -> SqResult<Vec<u8>> {
    let stored = size_word & (1 << 24) != 0;
    let len = (size_word & 0x00FF_FFFF) as usize;
    if len == 0 {
        return Ok(vec![0u8; block_size as usize]);
    }
    let body = data
        .get(at as usize..at as usize + len)
        .ok_or("data block out of bounds")?;
    if stored {
        Ok(body.to_vec())
    } else {
        inflate(body)
    }
}

struct Unpacker<'a> {
    data: &'a [u8],
    sb: Superblock,
    inodes: MetaRegion,
    dirs: MetaRegion,
    fragments: Vec<FragmentEntry>,
}

impl<'a> Unpacker<'a> {
    fn new(data: &'a [u8]) -> SqResult<Self> {
        let sb = Superblock::parse(data).ok_or("not a squashfs v4 image")?;
        if sb.compressor != COMP_ZLIB {
            return Err(format!("unsupported compressor id {}", sb.compressor));
        }
        let inodes = MetaRegion::read(data, sb.inode_table, sb.dir_table)?;
        let dirs = MetaRegion::read(data, sb.dir_table, sb.region_end(sb.dir_table))?;
        let fragments = read_fragment_table(data, &sb)?;
        Ok(Self {
            data,
            sb,
            inodes,
            dirs,
            fragments,
        })
    }

    fn file_bytes(
        &self,
        blocks_start: u64,
        block_sizes: &[u32],
        frag_index: u32,
        frag_offset: u32,
        file_size: u64,
    ) -> SqResult<Vec<u8>> {
        let mut out = Vec::with_capacity(file_size as usize);
        let mut at = blocks_start;

        for &word in block_sizes {
            let block = read_data_block(self.data, at, word, self.sb.block_size)?;
            out.extend_from_slice(&block);
            at += u64::from(word & 0x00FF_FFFF);
        }

        if frag_index != NO_FRAGMENT {
            let entry = self
                .fragments
                .get(frag_index as usize)
                .ok_or("fragment index out of range")?;
            let frag = read_data_block(self.data, entry.start, entry.size, self.sb.block_size)?;
            let tail = file_size as usize - out.len();
            let lo = frag_offset as usize;
            let piece = frag
                .get(lo..lo + tail)
                .ok_or("fragment slice out of range")?;
            out.extend_from_slice(piece);
        }

        out.truncate(file_size as usize);
        Ok(out)
    }

    fn unpack(&self, dest: &Path) -> SqResult<()> {
        fs::create_dir_all(dest).map_err(|e| e.to_string())?;

        let root_block = self.sb.root_inode >> 16;
        let root_offset = (self.sb.root_inode & 0xFFFF) as usize;
        let mut stack: Vec<(u64, usize, PathBuf)> =
            vec![(root_block, root_offset, dest.to_path_buf())];

        while let Some((block, offset, path)) = stack.pop() {
            let pos = self.inodes.resolve(block, offset)?;
            match parse_inode(&self.inodes, pos, self.sb.block_size)? {
                InodeBody::Dir {
                    start_block,
                    offset,
                    file_size,
                } => {
                    fs::create_dir_all(&path).map_err(|e| e.to_string())?;
                    let dir_pos = self.dirs.resolve(u64::from(start_block), offset as usize)?;
                    for entry in parse_directory(&self.dirs, dir_pos, file_size)? {
                        stack.push((entry.block, entry.offset as usize, path.join(entry.name)));
                    }
                }
                InodeBody::File {
                    blocks_start,
                    frag_index,
                    frag_offset,
                    file_size,
                    block_sizes,
                } => {
                    let bytes = self.file_bytes(
                        blocks_start,
                        &block_sizes,
                        frag_index,
                        frag_offset,
                        file_size,
                    )?;
                    fs::write(&path, bytes).map_err(|e| e.to_string())?;
                }
                InodeBody::Symlink { target } => {
                    let target = String::from_utf8_lossy(&target).into_owned();
                    #[cfg(unix)]
                    {
                        let _ = fs::remove_file(&path);
                        std::os::unix::fs::symlink(&target, &path).map_err(|e| e.to_string())?;
                    }
                    #[cfg(not(unix))]
                    fs::write(&path, target).map_err(|e| e.to_string())?;
                }
                InodeBody::Other(t) => {
                    debug!(inode_type = t, path = %path.display(), "skipping special inode");
                }
            }
        }

        Ok(())
    }
}

pub struct SquashfsDecoder;

impl Decoder for SquashfsDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Squashfs
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        Superblock::parse(artifact.bytes()).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let dir = dest.path().to_path_buf();

        let unpacker = Unpacker::new(artifact.bytes())
            .map_err(|e| ExtractError::decoder(name, artifact.path(), e))?;
        if unpacker.sb.frag_count > 0 && unpacker.fragments.is_empty() {
            warn!(source = %artifact.path().display(), "fragment table missing");
        }
        unpacker
            .unpack(&dir)
            .map_err(|e| ExtractError::decoder(name, artifact.path(), e))?;

        Ok(Extraction::terminal(vec![dir]))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Minimal one-file image (`/<name>` holding `content`) with stored
    /// (uncompressed) blocks throughout.
    pub(crate) fn build_image(name: &str, content: &[u8]) -> Vec<u8> {
        let data_at = 96u64;

        // inode metadata: file inode at 0, root dir inode at 36
        let mut inode_meta = Vec::new();
        // file inode header
        inode_meta.extend_from_slice(&T_FILE.to_le_bytes());
        inode_meta.extend_from_slice(&0o644u16.to_le_bytes());
        inode_meta.extend_from_slice(&0u16.to_le_bytes()); // uid idx
        inode_meta.extend_from_slice(&0u16.to_le_bytes()); // gid idx
        inode_meta.extend_from_slice(&0u32.to_le_bytes()); // mtime
        inode_meta.extend_from_slice(&2u32.to_le_bytes()); // inode number
        // file body
        inode_meta.extend_from_slice(&(data_at as u32).to_le_bytes());
        inode_meta.extend_from_slice(&NO_FRAGMENT.to_le_bytes());
        inode_meta.extend_from_slice(&0u32.to_le_bytes()); // frag offset
        inode_meta.extend_from_slice(&(content.len() as u32).to_le_bytes());
        inode_meta.extend_from_slice(&((content.len() as u32) | (1 << 24)).to_le_bytes());
        let root_offset = inode_meta.len() as u64;

        // root dir inode
        let listing_len = 12 + 8 + name.len();
        inode_meta.extend_from_slice(&T_DIR.to_le_bytes());
        inode_meta.extend_from_slice(&0o755u16.to_le_bytes());
        inode_meta.extend_from_slice(&0u16.to_le_bytes());
        inode_meta.extend_from_slice(&0u16.to_le_bytes());
        inode_meta.extend_from_slice(&0u32.to_le_bytes());
        inode_meta.extend_from_slice(&1u32.to_le_bytes());
        inode_meta.extend_from_slice(&0u32.to_le_bytes()); // start_block
        inode_meta.extend_from_slice(&1u32.to_le_bytes()); // nlink
        inode_meta.extend_from_slice(&((listing_len + 3) as u16).to_le_bytes());
        inode_meta.extend_from_slice(&0u16.to_le_bytes()); // block offset
        inode_meta.extend_from_slice(&0u32.to_le_bytes()); // parent

        // directory metadata: one header + one entry pointing at the file
        let mut dir_meta = Vec::new();
        dir_meta.extend_from_slice(&0u32.to_le_bytes()); // count - 1
        dir_meta.extend_from_slice(&0u32.to_le_bytes()); // inode block start
        dir_meta.extend_from_slice(&1u32.to_le_bytes()); // base inode number
        dir_meta.extend_from_slice(&0u16.to_le_bytes()); // offset of file inode
        dir_meta.extend_from_slice(&1i16.to_le_bytes()); // inode number delta
        dir_meta.extend_from_slice(&T_FILE.to_le_bytes());
        dir_meta.extend_from_slice(&((name.len() - 1) as u16).to_le_bytes());
        dir_meta.extend_from_slice(name.as_bytes());
        assert_eq!(dir_meta.len(), listing_len);

        let inode_table = data_at + content.len() as u64;
        let dir_table = inode_table + 2 + inode_meta.len() as u64;
        let id_table = dir_table + 2 + dir_meta.len() as u64;
        let bytes_used = id_table + 8;

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes()); // inode count
        out.extend_from_slice(&0u32.to_le_bytes()); // mod time
        out.extend_from_slice(&131072u32.to_le_bytes()); // block size
        out.extend_from_slice(&0u32.to_le_bytes()); // frag count
        out.extend_from_slice(&COMP_ZLIB.to_le_bytes());
        out.extend_from_slice(&17u16.to_le_bytes()); // block log
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&1u16.to_le_bytes()); // id count
        out.extend_from_slice(&4u16.to_le_bytes()); // version major
        out.extend_from_slice(&0u16.to_le_bytes()); // version minor
        out.extend_from_slice(&((0u64 << 16) | root_offset).to_le_bytes());
        out.extend_from_slice(&bytes_used.to_le_bytes());
        out.extend_from_slice(&id_table.to_le_bytes());
        out.extend_from_slice(&u64::MAX.to_le_bytes()); // xattr table
        out.extend_from_slice(&inode_table.to_le_bytes());
        out.extend_from_slice(&dir_table.to_le_bytes());
        out.extend_from_slice(&u64::MAX.to_le_bytes()); // frag table
        out.extend_from_slice(&u64::MAX.to_le_bytes()); // export table
        assert_eq!(out.len(), 96);

        out.extend_from_slice(content);
        out.extend_from_slice(&(0x8000u16 | inode_meta.len() as u16).to_le_bytes());
        out.extend_from_slice(&inode_meta);
        out.extend_from_slice(&(0x8000u16 | dir_meta.len() as u16).to_le_bytes());
        out.extend_from_slice(&dir_meta);
        out.extend_from_slice(&[0u8; 8]); // id table payload (unused)
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_image;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_superblock() {
        let image = build_image("app.bin", b"squashed bytes");
        let sb = Superblock::parse(&image).unwrap();
        assert_eq!(sb.compressor, COMP_ZLIB);
        assert_eq!(sb.block_size, 131072);
    }

    #[test]
    fn unpacks_single_file_tree() {
        let content = b"squashfs file content";
        let image = build_image("app.bin", content);
        let dir = tempdir().unwrap();

        let unpacker = Unpacker::new(&image).unwrap();
        unpacker.unpack(dir.path()).unwrap();

        let got = std::fs::read(dir.path().join("app.bin")).unwrap();
        assert_eq!(got, content);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut image = build_image("x", b"y");
        image[28] = 3; // version major
        assert!(Superblock::parse(&image).is_none());
    }
}
