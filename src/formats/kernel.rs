//! u-boot legacy boot images (kernel uImage).

use tracing::warn;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::Result;
use crate::formats::{u32_be, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: u32 = 0x2705_1956;
const HEADER_SIZE: usize = 64;

fn header_crc_ok(data: &[u8]) -> bool {
    let Some(stored) = u32_be(data, 4) else {
        return false;
    };
    // hcrc is computed over the header with its own field zeroed
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[0..4]);
    hasher.update(&[0, 0, 0, 0]);
    hasher.update(&data[8..HEADER_SIZE]);
    hasher.finalize() == stored
}

pub struct KernelDecoder;

impl Decoder for KernelDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Kernel
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        let data = artifact.bytes();
        data.len() > HEADER_SIZE && u32_be(data, 0) == Some(MAGIC) && header_crc_ok(data)
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let data = artifact.bytes();
        let size = u32_be(data, 12).unwrap_or(0) as usize;
        let end = (HEADER_SIZE + size).min(data.len());
        let payload = &data[HEADER_SIZE..end];

        let stored_dcrc = u32_be(data, 24).unwrap_or(0);
        if crc32fast::hash(payload) != stored_dcrc {
            warn!(
                source = %artifact.path().display(),
                "uimage payload crc mismatch, extracting anyway"
            );
        }

        let path = dest.path().to_path_buf();
        write_output(self.kind().name(), &path, payload)?;
        Ok(Extraction::unwrap_to(path))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a minimal valid uImage wrapping `payload`.
    pub(crate) fn build_uimage(payload: &[u8]) -> Vec<u8> {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        header[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        header[24..28].copy_from_slice(&crc32fast::hash(payload).to_be_bytes());
        header[32..38].copy_from_slice(b"kernel");

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[0..4]);
        hasher.update(&[0, 0, 0, 0]);
        hasher.update(&header[8..HEADER_SIZE]);
        let hcrc = hasher.finalize();
        header[4..8].copy_from_slice(&hcrc.to_be_bytes());

        let mut image = header.to_vec();
        image.extend_from_slice(payload);
        image
    }
}
