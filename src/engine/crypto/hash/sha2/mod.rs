use std::fmt;

use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

use crate::engine::error::*;

/// A SHA-256 digest, used to fingerprint reliable-broadcast messages.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    /// Hashes `bytes` with SHA-256.
    pub fn from_data(bytes: &[u8]) -> Self {
        let digest = digest::digest(&SHA256, bytes);
        Self::from_bytes_unchecked(digest.as_ref())
    }

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped_msg(
                ErrorKind::Crypto,
                "digest too short",
            );
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }

    /// Renders the digest as a lowercase hex string, the stable form
    /// used as half of a message fingerprint.
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(Self::LENGTH * 2);
        for byte in &self.0 {
            write!(out, "{:02x}", byte).unwrap();
        }
        out
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::Digest;

    #[test]
    fn same_input_same_digest() {
        let a = Digest::from_data(b"hello");
        let b = Digest::from_data(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_input_different_digest() {
        let a = Digest::from_data(b"hello");
        let b = Digest::from_data(b"bye");
        assert_ne!(a, b);
    }
}
