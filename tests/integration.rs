//! End-to-end scenarios from spec.md §8, exercised through the crate's
//! public API rather than any one module's internals.

use std::fs;
use std::io::{self, Write};

use tarstream::header::{EntryHeader, EntryType};
use tarstream::pack::Builder;
use tarstream::{decode_all, encode_all, extract::ExtractConfig, extract::Extractor, Archive, DecodeOptions, TarError};

fn entry(name: &str, size: u64, mode: u32, uid: u64, gid: u64, uname: &str, gname: &str, mtime: f64) -> EntryHeader {
    let mut h = EntryHeader::new_file(name, size);
    h.mode = Some(mode);
    h.uid = uid;
    h.gid = gid;
    h.uname = Some(uname.to_string());
    h.gname = Some(gname.to_string());
    h.mtime = Some(mtime);
    h
}

#[test]
fn single_file_round_trip() {
    let header = entry("hello.txt", 12, 0o644, 501, 20, "maf", "staff", 1387580181.0);
    let bytes = encode_all(vec![(header.clone(), b"hello world\n".as_slice())]).unwrap();

    let decoded = decode_all(&bytes, DecodeOptions::default()).unwrap();
    assert_eq!(decoded.len(), 1);
    let (got, data) = &decoded[0];
    assert_eq!(got.name, "hello.txt");
    assert_eq!(got.size, 12);
    assert_eq!(got.mode, Some(0o644));
    assert_eq!(got.uid, 501);
    assert_eq!(got.gid, 20);
    assert_eq!(got.uname.as_deref(), Some("maf"));
    assert_eq!(got.gname.as_deref(), Some("staff"));
    assert_eq!(got.mtime, Some(1387580181.0));
    assert_eq!(data, b"hello world\n");
}

#[test]
fn multi_file() {
    let bytes = encode_all(vec![
        (EntryHeader::new_file("file-1.txt", 12), b"i am file-1\n".as_slice()),
        (EntryHeader::new_file("file-2.txt", 12), b"i am file-2\n".as_slice()),
    ])
    .unwrap();

    let decoded = decode_all(&bytes, DecodeOptions::default()).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].0.name, "file-1.txt");
    assert_eq!(decoded[0].1, b"i am file-1\n");
    assert_eq!(decoded[1].0.name, "file-2.txt");
    assert_eq!(decoded[1].1, b"i am file-2\n");
}

#[test]
fn ustar_prefix_split() {
    let mut name = "a".repeat(119);
    name.push('/');
    name.push_str(&"b".repeat(8));
    assert_eq!(name.len(), 128);
    assert_eq!(name.as_bytes()[119], b'/');

    let bytes = encode_all(vec![(EntryHeader::new_file(name.clone(), 1), b"x".as_slice())]).unwrap();

    // Raw block 0: name field holds the suffix, prefix field holds the rest.
    let block0 = &bytes[0..512];
    let raw_name = std::str::from_utf8(&block0[0..100]).unwrap().trim_end_matches('\0');
    let raw_prefix = std::str::from_utf8(&block0[345..500]).unwrap().trim_end_matches('\0');
    assert_eq!(raw_name, "b".repeat(8));
    assert_eq!(raw_prefix, "a".repeat(119));

    let decoded = decode_all(&bytes, DecodeOptions::default()).unwrap();
    assert_eq!(decoded[0].0.name, name);
}

#[test]
fn pax_long_path() {
    let name = "x".repeat(200);
    let bytes = encode_all(vec![(EntryHeader::new_file(name.clone(), 1), b"y".as_slice())]).unwrap();

    // Raw byte 0 of block 0 is the typeflag of the PAX preamble.
    assert_eq!(bytes[156], b'x');

    let decoded = decode_all(&bytes, DecodeOptions::default()).unwrap();
    assert_eq!(decoded[0].0.name, name);
    assert_eq!(decoded[0].0.pax.get("path").unwrap(), &name);
}

fn build_raw_archive(entries: Vec<(EntryHeader, &[u8])>) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (header, body) in entries {
        let mut sink = builder.add_entry(header).unwrap();
        sink.write_all(body).unwrap();
        sink.finish().unwrap();
    }
    builder.finalize().unwrap()
}

#[test]
fn path_traversal_attack_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out");
    fs::create_dir(&dest).unwrap();

    let bytes = build_raw_archive(vec![(EntryHeader::new_file("../evil.txt", 1), b"x".as_slice())]);

    let mut archive = Archive::new(io::Cursor::new(bytes));
    let entries = archive.entries().unwrap();
    let mut extractor = Extractor::new(ExtractConfig::new(dest.clone()));
    let err = extractor.extract_all(entries).unwrap_err();
    assert!(matches!(err, TarError::BoundsViolation { .. }));

    assert!(!dir.path().join("evil.txt").exists());
}

#[test]
fn hardlink_through_symlink_attack_is_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out");
    fs::create_dir(&dest).unwrap();
    let outside = dir.path().join("outside");
    fs::create_dir(&outside).unwrap();
    fs::write(outside.join("secret.txt"), b"do not leak").unwrap();

    let bytes = build_raw_archive(vec![
        (EntryHeader::new_symlink("escape", "../outside"), b"".as_slice()),
        (EntryHeader::new_hardlink("pwned", "escape/secret.txt"), b"".as_slice()),
        (EntryHeader::new_file("pwned", 11), b"compromised".as_slice()),
    ]);

    let mut archive = Archive::new(io::Cursor::new(bytes));
    let entries = archive.entries().unwrap();
    let mut extractor = Extractor::new(ExtractConfig::new(dest.clone()));
    let result = extractor.extract_all(entries);
    assert!(result.is_err());

    assert!(!dest.join("pwned").exists());
    let secret = fs::read_to_string(outside.join("secret.txt")).unwrap();
    assert_eq!(secret, "do not leak");
}

#[test]
fn strip_beyond_every_entry_yields_empty_output() {
    let bytes = encode_all(vec![
        (EntryHeader::new_file("a/b.txt", 1), b"x".as_slice()),
        (EntryHeader::new_file("c.txt", 1), b"y".as_slice()),
    ])
    .unwrap();

    let mut archive = Archive::new(io::Cursor::new(bytes));
    let entries = archive.entries().unwrap();
    let transform = tarstream::transform_options(
        entries,
        tarstream::TransformOptions::new().with_strip(10),
    );
    let out: Vec<_> = transform.collect();
    assert!(out.is_empty());
}

#[test]
fn extraction_round_trips_a_small_tree() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out");

    let bytes = encode_all(vec![
        (EntryHeader::new_directory("sub"), b"".as_slice()),
        (EntryHeader::new_file("sub/a.txt", 5), b"alpha".as_slice()),
        (EntryHeader::new_file("top.txt", 4), b"beta".as_slice()),
    ])
    .unwrap();

    let mut archive = Archive::new(io::Cursor::new(bytes));
    let entries = archive.entries().unwrap();
    tarstream::extract_to_dir(entries, ExtractConfig::new(dest.clone())).unwrap();

    assert!(dest.join("sub").is_dir());
    assert_eq!(fs::read(dest.join("sub/a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(dest.join("top.txt")).unwrap(), b"beta");
}

#[test]
fn entry_type_round_trips_through_decode() {
    let bytes = encode_all(vec![(EntryHeader::new_directory("d"), b"".as_slice())]).unwrap();
    let decoded = decode_all(&bytes, DecodeOptions::default()).unwrap();
    assert_eq!(decoded[0].0.entry_type, EntryType::Directory);
}
