//! AES-256-CBC, used for the encrypted transport's steady-state frames
//! once a session key has been established by the RSA handshake.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::engine::error::*;

type Encryptor = cbc::Encryptor<aes::Aes256>;
type Decryptor = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// A 256-bit AES session key.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generates a fresh random session key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err("AES key has an invalid length").simple(ErrorKind::Crypto);
        }
        let mut inner = [0u8; KEY_LEN];
        inner.copy_from_slice(bytes);
        Ok(Self(inner))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Encrypts `plaintext` under `key`, prepending a fresh random IV, as
/// specified for the encrypted transport's steady-state frames:
/// `IV(16 bytes) || AES-256-CBC(plaintext)`.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = Encryptor::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Reverses `encrypt`: strips the leading IV and decrypts the rest.
pub fn decrypt(key: &SessionKey, framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < IV_LEN {
        return Err("AES frame shorter than one IV").simple(ErrorKind::Crypto);
    }
    let (iv, ciphertext) = framed.split_at(IV_LEN);
    Decryptor::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .simple(ErrorKind::Crypto)
}
