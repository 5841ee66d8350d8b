mod checksum;

pub use checksum::{digest_matches, sha256_file_hex, sha256_hex, sha256_reader_hex};

#[cfg(test)]
mod tests;
