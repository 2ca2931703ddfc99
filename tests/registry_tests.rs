mod common;

use epkx::{Artifact, DecoderKind, FormatRegistry};
use tempfile::tempdir;

fn classify_bytes(bytes: &[u8], name: &str) -> Option<DecoderKind> {
    let dir = tempdir().unwrap();
    let path = common::write_file(dir.path(), name, bytes);
    let artifact = Artifact::open(&path).unwrap();
    FormatRegistry::standard()
        .classify(&artifact)
        .map(|d| d.kind())
}

#[test]
fn unknown_bytes_classify_as_nothing() {
    assert_eq!(classify_bytes(b"plain text, no magic anywhere", "note.txt"), None);
    assert_eq!(classify_bytes(&[], "empty.bin"), None);
}

#[test]
fn classifies_common_formats() {
    assert_eq!(
        classify_bytes(&common::build_uimage(b"vmlinux"), "kernel.img"),
        Some(DecoderKind::Kernel)
    );
    assert_eq!(
        classify_bytes(&common::build_cramfs_le(b"rootfs"), "rootfs.img"),
        Some(DecoderKind::CramfsLe)
    );
    assert_eq!(
        classify_bytes(
            &common::build_epk(b"EPK2", "OTA", &[("kern", b"k")]),
            "fw.epk"
        ),
        Some(DecoderKind::Epk2)
    );
    assert_eq!(
        classify_bytes(
            &common::build_epk(b"EPK3", "OTA", &[("kern", b"k")]),
            "fw.epk"
        ),
        Some(DecoderKind::Epk3)
    );

    let mut gz = vec![0x1F, 0x8B, 0x08];
    gz.extend_from_slice(&[0; 16]);
    assert_eq!(classify_bytes(&gz, "blob.gz"), Some(DecoderKind::Gzip));
}

/// An adversarial image carrying a big-endian superblock at offset 0 and a
/// little-endian one at offset 512 satisfies both CRAMFS predicates; the
/// registry must pick big-endian, every time.
#[test]
fn cramfs_big_endian_wins_over_little_endian() {
    let le = common::build_cramfs_le(b"x");

    let mut both = Vec::new();
    both.extend_from_slice(&0x28CD_3D45u32.to_be_bytes());
    both.extend_from_slice(&[0u8; 12]);
    both.extend_from_slice(b"Compressed ROMFS");
    both.resize(512, 0);
    both.extend_from_slice(&le);

    assert_eq!(
        classify_bytes(&both, "dual.cramfs"),
        Some(DecoderKind::CramfsBe)
    );
}

#[test]
fn chained_lzhs_is_ext4_a_single_block_is_not() {
    use epkx::formats::lzhs;

    let seg1 = lzhs::encode_block(&[3u8; 2048]);
    let seg2 = lzhs::encode_block(&[9u8; 2048]);

    let mut chained = seg1.clone();
    chained.extend_from_slice(&seg2);
    assert_eq!(
        classify_bytes(&chained, "emmc.bin"),
        Some(DecoderKind::Ext4Lzhs)
    );

    assert_eq!(classify_bytes(&seg1, "block.bin"), Some(DecoderKind::Lzhs));
}

#[test]
fn pif_suffix_is_matched_by_name_alone() {
    // content does not matter for classification, only the name tail
    assert_eq!(
        classify_bytes(b"\0\0\000001.str\0", "REC00001.PIF"),
        Some(DecoderKind::Pif)
    );
    assert_eq!(classify_bytes(b"\0\0\000001.str\0", "REC00001.pif"), None);
}

#[test]
fn tzfw_requires_both_name_and_elf_magic() {
    let elf_start = [0x7F, b'E', b'L', b'F', 1, 1, 1, 0];
    assert_eq!(classify_bytes(&elf_start, "tzfw.pak"), Some(DecoderKind::Tzfw));
    assert_eq!(classify_bytes(&elf_start, "other.pak"), None);
}
