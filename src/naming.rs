//! Deterministic derivation of output paths.
//!
//! The table here is authoritative: given the same (decoder kind, source
//! path, destination directory) triple it always yields the same plan. The
//! only indexed series comes from the record carver, which appends the
//! sequence index recovered from the record chain itself.

use std::path::{Path, PathBuf};

use crate::registry::DecoderKind;

/// Where one extraction step writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Single output file.
    File(PathBuf),
    /// Directory target; recursively removed before population.
    Dir(PathBuf),
    /// Destination root; the decoder derives the final name(s) itself
    /// (container splits, gzip's embedded name, carved record series).
    Root(PathBuf),
}

impl Destination {
    pub fn path(&self) -> &Path {
        match self {
            Destination::File(p) | Destination::Dir(p) | Destination::Root(p) => p,
        }
    }
}

fn file_name(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn base_name(source: &Path) -> String {
    source
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn plan(kind: DecoderKind, source: &Path, dest_dir: &Path) -> Destination {
    let name = file_name(source);
    match kind {
        DecoderKind::Epk1
        | DecoderKind::Epk2
        | DecoderKind::Epk3
        | DecoderKind::Hisense
        | DecoderKind::Gzip
        | DecoderKind::MtkBoot
        | DecoderKind::Tzfw => Destination::Root(dest_dir.to_path_buf()),

        DecoderKind::Ext4Lzhs => Destination::File(dest_dir.join(format!("{name}.ext4"))),
        DecoderKind::Lz4 => Destination::File(dest_dir.join(format!("{name}.unlz4"))),

        // A logo pak that happens to carry an LZO stream unpacks to a bitmap,
        // not to the generic suffix.
        DecoderKind::Lzo if name == "logo.pak" => {
            Destination::File(dest_dir.join("logo.pak.bmp"))
        }
        DecoderKind::Lzo => Destination::File(dest_dir.join(format!("{name}.unlzo"))),

        DecoderKind::Nfsb => Destination::File(dest_dir.join(format!("{name}.unnfsb"))),
        DecoderKind::Squashfs => Destination::Dir(dest_dir.join(format!("{name}.unsquashfs"))),
        DecoderKind::CramfsBe => Destination::File(dest_dir.join(format!("{name}.cramswap"))),
        DecoderKind::CramfsLe => Destination::Dir(dest_dir.join(format!("{name}.uncramfs"))),
        DecoderKind::Kernel => Destination::File(dest_dir.join(format!("{name}.unpaked"))),
        DecoderKind::Partinfo => {
            Destination::File(dest_dir.join(format!("{}.txt", base_name(source))))
        }
        DecoderKind::Jffs2 => Destination::Dir(dest_dir.join(format!("{name}.unjffs2"))),
        DecoderKind::Str | DecoderKind::Pif => {
            Destination::File(dest_dir.join(format!("{name}.ts")))
        }
        DecoderKind::Sym => Destination::File(dest_dir.join(format!("{name}.idc"))),
        DecoderKind::Lzhs => Destination::File(dest_dir.join(format!("{name}.unlzhs"))),
    }
}

/// Fixed name of the MTK first-stage bootloader dump.
pub fn mtk_first_stage(dest_dir: &Path) -> PathBuf {
    dest_dir.join("mtk_1bl.bin")
}

/// Name of one carved record: `{N}_file{k:03}.{ext}` under the destination
/// root, where `k` is the sequence index recovered from the record chain.
pub fn carved_record(dest_dir: &Path, source: &Path, index: u32, ext: &str) -> PathBuf {
    dest_dir.join(format!("{}_file{:03}.{}", file_name(source), index, ext))
}
