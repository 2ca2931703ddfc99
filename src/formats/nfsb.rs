//! NFSB wrapper: a 0x1000-byte header in front of a filesystem image.

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::Result;
use crate::formats::write_output;
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: &[u8; 4] = b"NFSB";
const HEADER_SIZE: usize = 0x1000;

pub struct NfsbDecoder;

impl Decoder for NfsbDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Nfsb
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        let data = artifact.bytes();
        data.len() > HEADER_SIZE && &data[..4] == MAGIC
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let path = dest.path().to_path_buf();
        write_output(self.kind().name(), &path, &artifact.bytes()[HEADER_SIZE..])?;
        Ok(Extraction::unwrap_to(path))
    }
}
