//! Record encryption with AES-256 in CFB mode.
//!
//! A sealed record is `IV (16 bytes) || ciphertext`. The plaintext is padded
//! to the block size with explicit-length padding (every pad byte holds the
//! pad length, between 1 and 16) before encryption, and a fresh random IV is
//! drawn for every record.
//!
//! CFB gives confidentiality only. A record opened under the wrong key almost
//! always fails the padding check, which is how a key mismatch or a corrupted
//! stream surfaces.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// AES block size, also the IV length.
pub const BLOCK_SIZE: usize = 16;

/// Length of the session key in bytes (AES-256).
pub const KEY_LENGTH: usize = 32;

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

/// Symmetric key shared by both ends of one session.
///
/// Zeroed when dropped.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; KEY_LENGTH]>);

impl SessionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for SessionKey {}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Pads, encrypts under a fresh IV and returns `IV || ciphertext`.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = pad(plaintext);
    Aes256CfbEnc::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&iv),
    )
    .encrypt(&mut buffer);

    let mut record = Vec::with_capacity(BLOCK_SIZE + buffer.len());
    record.extend_from_slice(&iv);
    record.extend_from_slice(&buffer);
    record
}

/// Splits off the IV, decrypts and strips padding.
pub fn open(key: &SessionKey, record: &[u8]) -> Result<Vec<u8>> {
    if record.len() < 2 * BLOCK_SIZE || record.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Malformed(format!(
            "encrypted record of {} bytes is not a whole number of blocks after the IV",
            record.len()
        )));
    }

    let (iv, ciphertext) = record.split_at(BLOCK_SIZE);
    let mut buffer = ciphertext.to_vec();
    Aes256CfbDec::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(iv),
    )
    .decrypt(&mut buffer);

    unpad(buffer)
}

/// Appends 1..=16 bytes, each holding the pad length.
fn pad(data: &[u8]) -> Vec<u8> {
    let padding = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + padding);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding, padding as u8);
    padded
}

fn unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let padding = match data.last() {
        Some(&last) => last as usize,
        None => return Err(ProtocolError::InvalidPadding),
    };

    if padding == 0 || padding > BLOCK_SIZE || padding > data.len() {
        return Err(ProtocolError::InvalidPadding);
    }
    if data[data.len() - padding..]
        .iter()
        .any(|&b| b as usize != padding)
    {
        return Err(ProtocolError::InvalidPadding);
    }

    data.truncate(data.len() - padding);
    Ok(data)
}
