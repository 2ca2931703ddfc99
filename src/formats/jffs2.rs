//! JFFS2 images: scan the node log, keep the newest version of everything,
//! rebuild the directory tree.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;

use flate2::read::ZlibDecoder;
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u16_le, u32_le};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: u16 = 0x1985;
const NODE_DIRENT: u16 = 0xE001;
const NODE_INODE: u16 = 0xE002;
const NODE_CLEANMARKER: u16 = 0x2003;
const ROOT_INO: u32 = 1;

const COMPR_NONE: u8 = 0x00;
const COMPR_ZERO: u8 = 0x01;
const COMPR_RTIME: u8 = 0x02;
const COMPR_ZLIB: u8 = 0x06;

const DT_DIR: u8 = 4;
const DT_REG: u8 = 8;
const DT_LNK: u8 = 10;

/// JFFS2 stores crc32 with a zero seed and no final inversion; undo the
/// standard pre/post conditioning crc32fast applies.
fn jffs2_crc(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new_with_initial(0xFFFF_FFFF);
    h.update(data);
    h.finalize() ^ 0xFFFF_FFFF
}

#[derive(Debug, Clone)]
struct DirentNode {
    pino: u32,
    version: u32,
    ino: u32,
    dtype: u8,
    name: String,
}

#[derive(Debug, Clone)]
struct DataFrag {
    version: u32,
    offset: u32,
    isize: u32,
    data: Vec<u8>,
}

fn rtime_decompress(src: &[u8], expected: usize) -> Option<Vec<u8>> {
    let mut positions = [0usize; 256];
    let mut out = Vec::with_capacity(expected);
    let mut i = 0usize;

    while out.len() < expected {
        let value = *src.get(i)?;
        let repeat = *src.get(i + 1)? as usize;
        i += 2;
        out.push(value);
        let mut backoff = positions[value as usize];
        positions[value as usize] = out.len() - 1;
        if repeat > 0 {
            for _ in 0..repeat {
                if backoff >= out.len() {
                    return None;
                }
                let b = out[backoff];
                out.push(b);
                backoff += 1;
            }
        }
    }
    Some(out)
}

fn decompress_frag(compr: u8, data: &[u8], dsize: usize) -> Option<Vec<u8>> {
    match compr {
        COMPR_NONE => Some(data.to_vec()),
        COMPR_ZERO => Some(vec![0u8; dsize]),
        COMPR_ZLIB => {
            let mut out = Vec::with_capacity(dsize);
            ZlibDecoder::new(data).read_to_end(&mut out).ok()?;
            Some(out)
        }
        COMPR_RTIME => rtime_decompress(data, dsize),
        other => {
            warn!(compr = other, "unsupported jffs2 compression, dropping fragment");
            None
        }
    }
}

/// Header of the node at `off`, if its magic and header crc hold.
fn node_at(data: &[u8], off: usize) -> Option<(u16, usize)> {
    if u16_le(data, off)? != MAGIC {
        return None;
    }
    let nodetype = u16_le(data, off + 2)?;
    let totlen = u32_le(data, off + 4)? as usize;
    let hdr_crc = u32_le(data, off + 8)?;
    if totlen < 12 || off + totlen > data.len() {
        return None;
    }
    if jffs2_crc(&data[off..off + 8]) != hdr_crc {
        return None;
    }
    Some((nodetype, totlen))
}

fn parse_inode_node(data: &[u8], off: usize) -> Option<(u32, DataFrag)> {
    let ino = u32_le(data, off + 12)?;
    let version = u32_le(data, off + 16)?;
    let isize = u32_le(data, off + 28)?;
    let foffset = u32_le(data, off + 44)?;
    let csize = u32_le(data, off + 48)? as usize;
    let dsize = u32_le(data, off + 52)? as usize;
    let compr = *data.get(off + 56)?;
    let payload = data.get(off + 68..off + 68 + csize)?;
    let bytes = decompress_frag(compr, payload, dsize)?;
    Some((
        ino,
        DataFrag {
            version,
            offset: foffset,
            isize,
            data: bytes,
        },
    ))
}

struct Scanned {
    dirents: Vec<DirentNode>,
    frags: HashMap<u32, Vec<DataFrag>>,
}

fn scan(data: &[u8]) -> Scanned {
    let mut dirents = Vec::new();
    let mut frags: HashMap<u32, Vec<DataFrag>> = HashMap::new();

    let mut off = 0usize;
    while off + 12 <= data.len() {
        let Some((nodetype, totlen)) = node_at(data, off) else {
            off += 4;
            continue;
        };

        match nodetype {
            NODE_DIRENT => {
                let parse = || -> Option<DirentNode> {
                    let pino = u32_le(data, off + 12)?;
                    let version = u32_le(data, off + 16)?;
                    let ino = u32_le(data, off + 20)?;
                    let nsize = *data.get(off + 28)? as usize;
                    let dtype = *data.get(off + 29)?;
                    let name_crc = u32_le(data, off + 36)?;
                    let name = data.get(off + 40..off + 40 + nsize)?;
                    if jffs2_crc(name) != name_crc {
                        return None;
                    }
                    let name = String::from_utf8_lossy(name).into_owned();
                    if name.is_empty() || name.contains('/') || name == ".." {
                        return None;
                    }
                    Some(DirentNode {
                        pino,
                        version,
                        ino,
                        dtype,
                        name,
                    })
                };
                if let Some(d) = parse() {
                    dirents.push(d);
                }
            }
            NODE_INODE => {
                if let Some((ino, frag)) = parse_inode_node(data, off) {
                    frags.entry(ino).or_default().push(frag);
                }
            }
            NODE_CLEANMARKER => {}
            other => {
                debug!(nodetype = other, off, "skipping unknown node type");
            }
        }

        // nodes are padded to 4-byte alignment
        off += totlen.next_multiple_of(4).max(4);
    }

    Scanned { dirents, frags }
}

/// Latest dirent wins per (parent, name); an entry pointing at inode 0
/// records a deletion.
fn live_children(dirents: &[DirentNode]) -> HashMap<u32, Vec<DirentNode>> {
    let mut best: HashMap<(u32, String), DirentNode> = HashMap::new();
    for d in dirents {
        let key = (d.pino, d.name.clone());
        match best.get(&key) {
            Some(prev) if prev.version >= d.version => {}
            _ => {
                best.insert(key, d.clone());
            }
        }
    }

    let mut children: HashMap<u32, Vec<DirentNode>> = HashMap::new();
    for d in best.into_values() {
        if d.ino != 0 {
            children.entry(d.pino).or_default().push(d);
        }
    }
    children
}

/// Replay an inode's data fragments in version order.
fn assemble(frags: &mut Vec<DataFrag>) -> Vec<u8> {
    frags.sort_by_key(|f| f.version);
    let final_size = frags.last().map(|f| f.isize as usize).unwrap_or(0);

    let mut out = Vec::new();
    for f in frags.iter() {
        let end = f.offset as usize + f.data.len();
        if end > out.len() {
            out.resize(end, 0);
        }
        out[f.offset as usize..end].copy_from_slice(&f.data);
    }
    out.truncate(final_size);
    out.resize(final_size, 0);
    out
}

pub struct Jffs2Decoder;

impl Decoder for Jffs2Decoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Jffs2
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        match node_at(artifact.bytes(), 0) {
            Some((nodetype, _)) => {
                matches!(nodetype, NODE_DIRENT | NODE_INODE | NODE_CLEANMARKER)
            }
            None => false,
        }
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let dir = dest.path().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| ExtractError::decoder(name, dir.clone(), e))?;

        let mut scanned = scan(artifact.bytes());
        let children = live_children(&scanned.dirents);

        let mut stack: Vec<(u32, PathBuf)> = vec![(ROOT_INO, dir.clone())];
        while let Some((ino, path)) = stack.pop() {
            let Some(entries) = children.get(&ino) else {
                continue;
            };
            for entry in entries {
                let child_path = path.join(&entry.name);
                match entry.dtype {
                    DT_DIR => {
                        fs::create_dir_all(&child_path)
                            .map_err(|e| ExtractError::decoder(name, child_path.clone(), e))?;
                        stack.push((entry.ino, child_path));
                    }
                    DT_REG => {
                        let content = scanned
                            .frags
                            .get_mut(&entry.ino)
                            .map(assemble)
                            .unwrap_or_default();
                        fs::write(&child_path, content)
                            .map_err(|e| ExtractError::decoder(name, child_path.clone(), e))?;
                    }
                    DT_LNK => {
                        let target = scanned
                            .frags
                            .get_mut(&entry.ino)
                            .map(assemble)
                            .unwrap_or_default();
                        let target = String::from_utf8_lossy(&target).into_owned();
                        #[cfg(unix)]
                        {
                            let _ = fs::remove_file(&child_path);
                            std::os::unix::fs::symlink(&target, &child_path).map_err(|e| {
                                ExtractError::decoder(name, child_path.clone(), e)
                            })?;
                        }
                        #[cfg(not(unix))]
                        fs::write(&child_path, target)
                            .map_err(|e| ExtractError::decoder(name, child_path.clone(), e))?;
                    }
                    other => {
                        debug!(dtype = other, path = %child_path.display(), "skipping node");
                    }
                }
            }
        }

        Ok(Extraction::terminal(vec![dir]))
    }
}
