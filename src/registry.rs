//! Ordered chain of format detectors.
//!
//! Registration order is part of the format contract, not an accident:
//! big-endian CRAMFS is probed strictly before little-endian, the generic
//! compressor magics run before container checks that may share leading
//! bytes, and the weak structural LZHS probe runs close to last. `classify`
//! returns the first decoder whose predicate accepts the artifact; no match
//! is a normal outcome.

use std::path::PathBuf;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::Result;
use crate::formats;
use crate::naming::Destination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Epk1,
    Epk2,
    Epk3,
    Hisense,
    Ext4Lzhs,
    Lz4,
    Lzo,
    Nfsb,
    Squashfs,
    Gzip,
    MtkBoot,
    CramfsBe,
    CramfsLe,
    Kernel,
    Partinfo,
    Jffs2,
    Str,
    Pif,
    Sym,
    Lzhs,
    Tzfw,
}

/// What the engine does with a decoder's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// No recursion; the branch ends with this step.
    Terminal,
    /// Exactly one derived artifact, fed straight back into classification.
    Transparent,
    /// Multiple independent derived artifacts; sibling failures stay local.
    FanOut,
}

impl DecoderKind {
    pub fn name(self) -> &'static str {
        match self {
            DecoderKind::Epk1 => "epk1",
            DecoderKind::Epk2 => "epk2",
            DecoderKind::Epk3 => "epk3",
            DecoderKind::Hisense => "hisense",
            DecoderKind::Ext4Lzhs => "ext4-lzhs",
            DecoderKind::Lz4 => "lz4",
            DecoderKind::Lzo => "lzo",
            DecoderKind::Nfsb => "nfsb",
            DecoderKind::Squashfs => "squashfs",
            DecoderKind::Gzip => "gzip",
            DecoderKind::MtkBoot => "mtk-boot",
            DecoderKind::CramfsBe => "cramfs-be",
            DecoderKind::CramfsLe => "cramfs-le",
            DecoderKind::Kernel => "uimage",
            DecoderKind::Partinfo => "partinfo",
            DecoderKind::Jffs2 => "jffs2",
            DecoderKind::Str => "str",
            DecoderKind::Pif => "pif",
            DecoderKind::Sym => "sym",
            DecoderKind::Lzhs => "lzhs",
            DecoderKind::Tzfw => "tzfw",
        }
    }

    pub fn category(self) -> Category {
        match self {
            DecoderKind::Epk1
            | DecoderKind::Epk2
            | DecoderKind::Epk3
            | DecoderKind::Hisense
            | DecoderKind::MtkBoot => Category::FanOut,

            DecoderKind::Lz4
            | DecoderKind::Lzo
            | DecoderKind::Nfsb
            | DecoderKind::Gzip
            | DecoderKind::CramfsBe
            | DecoderKind::Kernel => Category::Transparent,

            DecoderKind::Ext4Lzhs
            | DecoderKind::Squashfs
            | DecoderKind::CramfsLe
            | DecoderKind::Partinfo
            | DecoderKind::Jffs2
            | DecoderKind::Str
            | DecoderKind::Pif
            | DecoderKind::Sym
            | DecoderKind::Lzhs
            | DecoderKind::Tzfw => Category::Terminal,
        }
    }
}

impl std::fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outputs of one extraction step.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Every file or directory this step wrote.
    pub produced: Vec<PathBuf>,
    /// Subset that re-enters classification. Only consulted for fan-out
    /// decoders; transparent decoders recurse on their single output and
    /// terminal decoders never recurse.
    pub recurse: Vec<PathBuf>,
}

impl Extraction {
    pub fn terminal(produced: Vec<PathBuf>) -> Self {
        Self {
            produced,
            recurse: Vec::new(),
        }
    }

    pub fn unwrap_to(path: PathBuf) -> Self {
        Self {
            produced: vec![path.clone()],
            recurse: vec![path],
        }
    }

    pub fn fan_out(produced: Vec<PathBuf>, recurse: Vec<PathBuf>) -> Self {
        Self { produced, recurse }
    }
}

pub trait Decoder {
    fn kind(&self) -> DecoderKind;

    /// Cheap structural predicate over the mapped bytes (and, for a few
    /// formats, the file name). Must not write anything.
    fn detect(&self, artifact: &Artifact) -> bool;

    /// Perform the byte-level transformation into `dest`.
    fn extract(&self, artifact: &Artifact, dest: &Destination, ctx: &Context)
    -> Result<Extraction>;
}

pub struct FormatRegistry {
    decoders: Vec<Box<dyn Decoder>>,
}

impl FormatRegistry {
    /// The full detector chain in its contractual order.
    pub fn standard() -> Self {
        Self {
            decoders: vec![
                Box::new(formats::epk1::Epk1Decoder),
                Box::new(formats::epk2::EpkSignedDecoder::epk2()),
                Box::new(formats::epk2::EpkSignedDecoder::epk3()),
                Box::new(formats::hisense::HisenseDecoder),
                Box::new(formats::lzhs::Ext4LzhsDecoder),
                Box::new(formats::lz4::Lz4Decoder),
                Box::new(formats::lzo::LzoDecoder),
                Box::new(formats::nfsb::NfsbDecoder),
                Box::new(formats::squashfs::SquashfsDecoder),
                Box::new(formats::gzip::GzipDecoder),
                Box::new(formats::mtk::MtkBootDecoder),
                Box::new(formats::cramfs::CramfsSwapDecoder),
                Box::new(formats::cramfs::CramfsUnpackDecoder),
                Box::new(formats::kernel::KernelDecoder),
                Box::new(formats::partinfo::PartinfoDecoder),
                Box::new(formats::jffs2::Jffs2Decoder),
                Box::new(formats::tsfile::StrDecoder),
                Box::new(formats::tsfile::PifDecoder),
                Box::new(formats::symfile::SymDecoder),
                Box::new(formats::lzhs::LzhsDecoder),
                Box::new(formats::mtk::TzfwDecoder),
            ],
        }
    }

    /// Registry over an explicit decoder list, for tests that need a reduced
    /// or reordered chain.
    pub fn from_decoders(decoders: Vec<Box<dyn Decoder>>) -> Self {
        Self { decoders }
    }

    pub fn classify(&self, artifact: &Artifact) -> Option<&dyn Decoder> {
        self.decoders
            .iter()
            .map(|d| d.as_ref())
            .find(|d| d.detect(artifact))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}
