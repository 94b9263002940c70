//! RSA keypair management and the chunked RSA encryption scheme used
//! by the encrypted transport's handshake frames.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::engine::error::*;

/// Default RSA modulus size used when generating a fresh keypair.
pub const DEFAULT_KEY_BITS: usize = 2048;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Per-call overhead of the OAEP-SHA256 padding scheme used for every
/// RSA-wrapped chunk: two hash digests plus two bytes, per RFC 8017.
///
/// The source protocol names a fixed `modulus_bytes - 45` portion size
/// (45 bytes of overhead) without naming a padding scheme. 45 bytes is
/// not enough room for OAEP with a 256-bit hash — `2 * 32 + 2 = 66`
/// bytes are needed before the remaining space can hold plaintext — so
/// chunking to `modulus_bytes - 45` would make `encrypt` fail outright
/// on any chunk near the portion-size boundary. This implementation
/// uses the actual OAEP-SHA256 overhead instead of the source's
/// figure; see `SPEC_FULL.md` §4 for the reconciliation. Encrypt and
/// decrypt agree on this constant, so the chunk boundary is an
/// internal implementation detail, not part of the wire contract: nodes
/// using this crate interoperate regardless of which overhead a peer
/// computed its chunks with, since `decrypt_chunked` walks the
/// length-prefixed chunks the sender actually wrote.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Generates a fresh RSA keypair and writes it to two PEM files:
/// `private_path` gets the PKCS8-encoded private key, `public_path`
/// gets the SPKI-encoded public key.
pub fn generate_keypair_files(
    bits: usize,
    private_path: &Path,
    public_path: &Path,
) -> Result<()> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .wrapped(ErrorKind::Crypto)?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .wrapped(ErrorKind::Crypto)?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .wrapped(ErrorKind::Crypto)?;

    fs::write(private_path, private_pem.as_bytes())?;
    fs::write(public_path, public_pem.as_bytes())?;
    Ok(())
}

/// Reads a PKCS8 PEM-encoded RSA private key from `path`.
pub fn read_private_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem).wrapped(ErrorKind::Crypto)
}

/// Reads a SPKI PEM-encoded RSA public key from `path`.
pub fn read_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let pem = fs::read_to_string(path)?;
    RsaPublicKey::from_public_key_pem(&pem).wrapped(ErrorKind::Crypto)
}

/// Maximum plaintext size, in bytes, that fits in a single RSA-OAEP
/// portion for a key of this modulus size, accounting for the overhead
/// of the OAEP-SHA256 padding this implementation uses.
fn portion_size(public_key: &RsaPublicKey) -> usize {
    use rsa::traits::PublicKeyParts;
    public_key.size() - OAEP_OVERHEAD
}

/// Encrypts a single portion of plaintext, no larger than
/// `portion_size(public_key)` bytes.
pub fn encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut rng = OsRng;
    public_key
        .encrypt(&mut rng, oaep(), plaintext)
        .wrapped(ErrorKind::Crypto)
}

/// Decrypts a single RSA-OAEP ciphertext portion.
pub fn decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    private_key.decrypt(oaep(), ciphertext).wrapped(ErrorKind::Crypto)
}

/// Encrypts an arbitrarily long plaintext by splitting it into
/// `portion_size`-sized chunks, RSA-encrypting each chunk, and
/// concatenating the chunks as `ASCII(len) || 0x00 || chunk`, mirroring
/// the outer frame's own length-prefix scheme.
pub fn encrypt_chunked(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let chunk_len = portion_size(public_key);
    let mut out = Vec::new();
    for chunk in plaintext.chunks(chunk_len.max(1)) {
        let encrypted = encrypt(public_key, chunk)?;
        out.extend_from_slice(encrypted.len().to_string().as_bytes());
        out.push(0);
        out.extend_from_slice(&encrypted);
    }
    Ok(out)
}

/// Reverses `encrypt_chunked`.
pub fn decrypt_chunked(private_key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let sep = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::simple(ErrorKind::Crypto))?;
        let len: usize = std::str::from_utf8(&rest[..sep])
            .simple_msg(ErrorKind::Crypto, "non UTF-8 chunk length")?
            .parse()
            .simple_msg(ErrorKind::Crypto, "malformed chunk length")?;
        let body_start = sep + 1;
        let body_end = body_start + len;
        if rest.len() < body_end {
            return Err("truncated RSA chunk").simple(ErrorKind::Crypto);
        }
        let chunk = decrypt(private_key, &rest[body_start..body_end])?;
        out.extend_from_slice(&chunk);
        rest = &rest[body_end..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = OsRng;
        let sk = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pk = RsaPublicKey::from(&sk);
        (sk, pk)
    }

    #[test]
    fn round_trips_a_single_portion() {
        let (sk, pk) = keypair();
        let plaintext = b"a short payload";
        let ciphertext = encrypt(&pk, plaintext).unwrap();
        let decrypted = decrypt(&sk, &ciphertext).unwrap();
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn round_trips_a_multi_chunk_message() {
        let (sk, pk) = keypair();
        let plaintext: Vec<u8> = (0..500).map(|i| (i % 251) as u8).collect();
        let ciphertext = encrypt_chunked(&pk, &plaintext).unwrap();
        let decrypted = decrypt_chunked(&sk, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
