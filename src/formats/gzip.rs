//! Gzip streams, inflated with the name stored in the stream header.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::write_output;
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: &[u8; 3] = &[0x1F, 0x8B, 0x08];

/// Output name for a stream: the name embedded in the gzip header when
/// present, otherwise the source name with its gzip suffix stripped.
fn output_name(embedded: Option<&[u8]>, source: &Path) -> String {
    if let Some(raw) = embedded {
        let name = String::from_utf8_lossy(raw);
        // keep only the final path component of whatever the packer stored
        if let Some(base) = Path::new(name.as_ref())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
        {
            if !base.is_empty() {
                return base;
            }
        }
    }

    let source_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for suffix in [".gz", ".gzip", ".tgz"] {
        if let Some(stripped) = source_name.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }
    format!("{source_name}.out")
}

pub struct GzipDecoder;

impl Decoder for GzipDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Gzip
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        artifact.bytes().starts_with(MAGIC)
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let mut decoder = GzDecoder::new(artifact.bytes());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ExtractError::decoder(name, artifact.path(), e))?;

        let embedded = decoder.header().and_then(|h| h.filename());
        let file_name = output_name(embedded, artifact.path());
        let path: PathBuf = dest.path().join(file_name);

        write_output(name, &path, &out)?;
        Ok(Extraction::unwrap_to(path))
    }
}
