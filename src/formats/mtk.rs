//! MediaTek boot partitions and the TrustZone firmware blob.

use memchr::memmem;
use tracing::info;

use crate::artifact::Artifact;
use crate::carver::{FIRST_STAGE_SIZE, RecordCarver};
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u16_le, u32_le, write_output};
use crate::naming::{self, Destination};
use crate::registry::{Decoder, DecoderKind, Extraction};

const BOOT_TAG: &[u8] = b"MTK/DTV";
const TAG_WINDOW: usize = 0x100;

/// Size of the first-stage bootloader dumped as `mtk_1bl.bin`.
const FIRST_BL_SIZE: usize = 0x1_0000;

/// A boot partition: dump the 1BL, then carve the embedded LZHS records out
/// of the rest of the partition. Carved records are decoded in place, not
/// re-queued.
pub struct MtkBootDecoder;

impl Decoder for MtkBootDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::MtkBoot
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        let data = artifact.bytes();
        data.len() > FIRST_STAGE_SIZE
            && memmem::find(&data[..TAG_WINDOW.min(data.len())], BOOT_TAG).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let data = artifact.bytes();

        let bl_path = naming::mtk_first_stage(dest.path());
        info!(dest = %bl_path.display(), "extracting mtk 1bl");
        write_output(self.kind().name(), &bl_path, &data[..FIRST_BL_SIZE.min(data.len())])?;

        info!("carving embedded lzhs records");
        let carver = RecordCarver::new(data);
        let mut produced = carver.extract_all(artifact.path(), dest.path())?;
        produced.insert(0, bl_path);

        Ok(Extraction::fan_out(produced, Vec::new()))
    }
}

const ELF_MAGIC: &[u8; 4] = &[0x7F, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;

/// TrustZone firmware: an ELF named `tzfw.pak`, split into its loadable
/// segments.
pub struct TzfwDecoder;

impl Decoder for TzfwDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Tzfw
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        artifact.file_name() == "tzfw.pak" && artifact.bytes().starts_with(ELF_MAGIC)
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let data = artifact.bytes();

        // 32-bit little-endian ELF, which is what the platform ships
        if data.get(4) != Some(&1) || data.get(5) != Some(&1) {
            return Err(ExtractError::decoder(
                name,
                artifact.path(),
                "unsupported ELF class or byte order",
            ));
        }

        let phoff = u32_le(data, 0x1C)
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "truncated ELF header"))?
            as usize;
        let phentsize = u16_le(data, 0x2A).unwrap_or(32) as usize;
        let phnum = u16_le(data, 0x2C).unwrap_or(0) as usize;

        let mut produced = Vec::new();
        for i in 0..phnum {
            let at = phoff + i * phentsize;
            let (Some(p_type), Some(p_offset), Some(p_vaddr), Some(p_filesz)) = (
                u32_le(data, at),
                u32_le(data, at + 4),
                u32_le(data, at + 8),
                u32_le(data, at + 16),
            ) else {
                return Err(ExtractError::decoder(
                    name,
                    artifact.path(),
                    "truncated program header table",
                ));
            };
            if p_type != PT_LOAD || p_filesz == 0 {
                continue;
            }
            let segment = data
                .get(p_offset as usize..p_offset as usize + p_filesz as usize)
                .ok_or_else(|| {
                    ExtractError::decoder(name, artifact.path(), "segment out of bounds")
                })?;

            let path = dest.path().join(format!("tz_{p_vaddr:08x}.bin"));
            write_output(name, &path, segment)?;
            produced.push(path);
        }

        if produced.is_empty() {
            return Err(ExtractError::decoder(
                name,
                artifact.path(),
                "no loadable segments",
            ));
        }

        Ok(Extraction::terminal(produced))
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_elf;
    use super::*;
    use crate::naming::Destination;
    use tempfile::tempdir;

    #[test]
    fn tzfw_splits_loadable_segments() {
        let payload = b"secure world code";
        let elf = build_elf(payload);

        let dir = tempdir().unwrap();
        let path = dir.path().join("tzfw.pak");
        std::fs::write(&path, &elf).unwrap();

        let artifact = Artifact::open(&path).unwrap();
        let decoder = TzfwDecoder;
        assert!(decoder.detect(&artifact));

        let dest = Destination::Root(dir.path().to_path_buf());
        let ctx = Context::new(dir.path());
        let extraction = decoder.extract(&artifact, &dest, &ctx).unwrap();

        assert_eq!(extraction.produced.len(), 1);
        let got = std::fs::read(dir.path().join("tz_10000000.bin")).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn boot_detection_needs_tag_and_size() {
        let dir = tempdir().unwrap();

        let mut image = vec![0u8; FIRST_STAGE_SIZE + 64];
        image[0x20..0x27].copy_from_slice(BOOT_TAG);
        let path = dir.path().join("boot.pak");
        std::fs::write(&path, &image).unwrap();
        assert!(MtkBootDecoder.detect(&Artifact::open(&path).unwrap()));

        // tag outside the probe window
        let mut late = vec![0u8; FIRST_STAGE_SIZE + 0x400];
        late[0x200..0x207].copy_from_slice(BOOT_TAG);
        let path = dir.path().join("late.pak");
        std::fs::write(&path, &late).unwrap();
        assert!(!MtkBootDecoder.detect(&Artifact::open(&path).unwrap()));
    }
}
