use std::fs;
use std::io::Cursor;

use super::*;

const FOO_SHA256: &str = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

#[test]
fn sha256_of_known_input() {
    assert_eq!(sha256_hex(b"foo"), FOO_SHA256);
}

#[test]
fn digest_match_ignores_hex_case_and_whitespace() {
    assert!(digest_matches(&sha256_hex(b"foo"), &FOO_SHA256.to_ascii_uppercase()));
    assert!(digest_matches(&format!(" {FOO_SHA256}\n"), FOO_SHA256));
    assert!(!digest_matches(&sha256_hex(b"bar"), FOO_SHA256));
}

#[test]
fn reader_and_file_digests_agree() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let path = dir.path().join("payload.bin");
    let payload = vec![7_u8; 100 * 1024];
    fs::write(&path, &payload).expect("must write payload");

    let from_reader = sha256_reader_hex(Cursor::new(&payload)).expect("must hash reader");
    let from_file = sha256_file_hex(&path).expect("must hash file");
    assert_eq!(from_reader, from_file);
    assert_eq!(from_file, sha256_hex(&payload));
    assert_eq!(
        sha256_reader_hex(Cursor::new(b"foo")).expect("must hash reader"),
        FOO_SHA256
    );
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    assert!(sha256_file_hex(&dir.path().join("absent")).is_err());
}
