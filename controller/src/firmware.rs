use core::fmt::Write as _;

use sha2::{Digest, Sha256};

/// Largest firmware image either build accepts.
pub const MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

/// Header carrying the expected image digest on upload.
pub const SHA256_HEADER: &str = "x-sha256";

/// Streaming digest over an uploaded image.
#[derive(Default)]
pub struct ImageDigest {
    hasher: Sha256,
    len: u64,
}

impl ImageDigest {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len = self.len.saturating_add(chunk.len() as u64);
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn finalize_hex(self) -> String {
        let digest = self.hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(&mut hex, "{byte:02x}");
        }
        hex
    }
}

/// Normalises an expected digest supplied by the uploader.
pub fn parse_expected_sha256(value: &str) -> Result<String, &'static str> {
    let value = value.trim();
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("sha256 must be 64 hex characters");
    }
    Ok(value.to_ascii_lowercase())
}

/// Checks a finished image against the optional expected digest and returns
/// the actual one.
pub fn verify_image(digest: ImageDigest, expected: Option<&str>) -> Result<String, String> {
    if digest.len() == 0 {
        return Err("firmware image is empty".to_string());
    }

    let actual = digest.finalize_hex();
    match expected {
        Some(expected) if expected != actual => Err(format!(
            "sha256 mismatch (expected {expected}, got {actual})"
        )),
        _ => Ok(actual),
    }
}
