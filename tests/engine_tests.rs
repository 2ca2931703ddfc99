mod common;

use std::fs;

use epkx::{Context, ExtractionEngine, Outcome};
use tempfile::tempdir;

fn adler32(data: &[u8]) -> u32 {
    let mut a = 1u32;
    let mut b = 0u32;
    for &x in data {
        a = (a + u32::from(x)) % 65521;
        b = (b + a) % 65521;
    }
    (b << 16) | a
}

/// lzop container with one stored block.
fn build_lzop_stored(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x89, 0x4C, 0x5A, 0x4F, 0x00, 0x0D, 0x0A, 0x1A, 0x0A];
    let header_start = out.len();
    out.extend_from_slice(&0x1030u16.to_be_bytes());
    out.extend_from_slice(&0x2080u16.to_be_bytes());
    out.extend_from_slice(&0x0940u16.to_be_bytes());
    out.push(1);
    out.push(5);
    out.extend_from_slice(&0u32.to_be_bytes()); // flags
    out.extend_from_slice(&0o100644u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(0);
    let chk = adler32(&out[header_start..]);
    out.extend_from_slice(&chk.to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

#[test]
fn unmatched_input_reports_unsupported() {
    let input_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let input = common::write_file(input_dir.path(), "mystery.bin", b"nothing recognizable");

    let engine = ExtractionEngine::new();
    let outcome = engine
        .process(&input, &Context::new(out_dir.path()))
        .unwrap();
    assert_eq!(outcome, Outcome::Unsupported);
    assert!(fs::read_dir(out_dir.path()).unwrap().next().is_none());
}

/// firmware.epk2 fans out to a kernel pak and a cramfs pak; the kernel is
/// unwrapped once and its payload is a leaf, the cramfs unpacks to a
/// directory and is never revisited.
#[test]
fn epk2_end_to_end_scenario() {
    let kernel_payload = b"kernel payload, not a recognized format";
    let rootfs_content = b"rootfs file content";

    let kernel_img = common::build_uimage(kernel_payload);
    let rootfs_img = common::build_cramfs_le(rootfs_content);
    let epk = common::build_epk(
        b"EPK2",
        "GP4REVB",
        &[("kern", &kernel_img), ("root", &rootfs_img)],
    );

    let input_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let input = common::write_file(input_dir.path(), "firmware.epk2", &epk);

    // a stale directory target must be cleared before unpacking
    let stale_dir = out_dir.path().join("root.pak.uncramfs");
    fs::create_dir_all(&stale_dir).unwrap();
    fs::write(stale_dir.join("stale.txt"), b"old").unwrap();

    let engine = ExtractionEngine::new();
    let outcome = engine
        .process(&input, &Context::new(out_dir.path()))
        .unwrap();
    assert_eq!(outcome, Outcome::Success);

    assert_eq!(fs::read(out_dir.path().join("kern.pak")).unwrap(), kernel_img);
    assert_eq!(fs::read(out_dir.path().join("root.pak")).unwrap(), rootfs_img);
    assert_eq!(
        fs::read(out_dir.path().join("kern.pak.unpaked")).unwrap(),
        kernel_payload
    );
    assert_eq!(
        fs::read(out_dir.path().join("root.pak.uncramfs/file.txt")).unwrap(),
        rootfs_content
    );
    assert!(!stale_dir.join("stale.txt").exists());

    // exactly the four expected artifacts: two paks, one unwrapped kernel,
    // one unpacked filesystem directory
    assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 4);

    // derived artifacts land in the context's destination, not next to the
    // input
    assert_eq!(fs::read_dir(input_dir.path()).unwrap().count(), 1);
}

#[test]
fn gzip_unwraps_into_embedded_name_and_recurses() {
    use flate2::{Compression, GzBuilder};
    use std::io::Write;

    let rootfs_content = b"nested filesystem bytes";
    let cramfs = common::build_cramfs_le(rootfs_content);

    let mut builder = GzBuilder::new()
        .filename("rootfs.cramfs")
        .write(Vec::new(), Compression::default());
    builder.write_all(&cramfs).unwrap();
    let gz = builder.finish().unwrap();

    let input_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let input = common::write_file(input_dir.path(), "image.gz", &gz);

    let engine = ExtractionEngine::new();
    let outcome = engine
        .process(&input, &Context::new(out_dir.path()))
        .unwrap();
    assert_eq!(outcome, Outcome::Success);

    assert_eq!(fs::read(out_dir.path().join("rootfs.cramfs")).unwrap(), cramfs);
    assert_eq!(
        fs::read(out_dir.path().join("rootfs.cramfs.uncramfs/file.txt")).unwrap(),
        rootfs_content
    );
}

#[test]
fn logo_pak_gets_bitmap_name() {
    let bmp = b"BM fake bitmap bytes";
    let lzop = build_lzop_stored(bmp);

    let input_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let input = common::write_file(input_dir.path(), "logo.pak", &lzop);

    let engine = ExtractionEngine::new();
    engine
        .process(&input, &Context::new(out_dir.path()))
        .unwrap();

    assert_eq!(fs::read(out_dir.path().join("logo.pak.bmp")).unwrap(), bmp);
    assert!(!out_dir.path().join("logo.pak.unlzo").exists());
}

#[test]
fn other_lzo_paks_get_generic_suffix() {
    let payload = b"generic lzo payload";
    let lzop = build_lzop_stored(payload);

    let input_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let input = common::write_file(input_dir.path(), "modem.pak", &lzop);

    let engine = ExtractionEngine::new();
    engine
        .process(&input, &Context::new(out_dir.path()))
        .unwrap();

    assert_eq!(
        fs::read(out_dir.path().join("modem.pak.unlzo")).unwrap(),
        payload
    );
}

/// MTK boot fan-out: a carved record that fails to decode loses only its
/// own decoded artifact; the 1BL and sibling records are still produced and
/// the run reports success.
#[test]
fn mtk_fan_out_isolates_failing_record() {
    let good = vec![0x42u8; 4096];
    let image = common::build_mtk_boot(&[(1, &good), (2, &good)], &[2]);

    let input_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let input = common::write_file(input_dir.path(), "boot.pak", &image);

    let engine = ExtractionEngine::new();
    let outcome = engine
        .process(&input, &Context::new(out_dir.path()))
        .unwrap();
    assert_eq!(outcome, Outcome::Success);

    assert_eq!(
        fs::read(out_dir.path().join("mtk_1bl.bin")).unwrap(),
        &image[..0x1_0000]
    );
    assert_eq!(
        fs::read(out_dir.path().join("boot.pak_file001.unlzhs")).unwrap(),
        good
    );
    assert!(out_dir.path().join("boot.pak_file002.lzhs").exists());
    assert!(!out_dir.path().join("boot.pak_file002.unlzhs").exists());
}
