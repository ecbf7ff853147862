//! Finite-field Diffie-Hellman over the RFC 3526 2048-bit MODP group.
//!
//! Each connection creates one [`KeyExchange`] per side, sends its public
//! value, and derives the session key from the peer's value with
//! [`KeyExchange::agree`]. Secrets are never reused across connections.

use std::sync::OnceLock;

use num_bigint_dig::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::{SessionKey, KEY_LENGTH};
use crate::error::{ProtocolError, Result};

/// RFC 3526 group 14 prime.
const MODP_2048_PRIME: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
    C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
    83655D23DCA3AD961C62F356208552BB9ED529077096966D\
    670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
    DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
    15728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// Group generator.
pub const GENERATOR: u32 = 2;

/// Size of the secret exponent in bits.
pub const SECRET_BITS: usize = 2048;

/// Wire length of a public value: the prime's width, big-endian, left-padded.
pub const DH_PUBLIC_LENGTH: usize = 256;

/// Returns the group prime.
pub fn modulus() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        BigUint::parse_bytes(MODP_2048_PRIME.as_bytes(), 16)
            .expect("RFC 3526 prime is valid hex")
    })
}

/// One side of an ephemeral key agreement.
///
/// The secret exponent is zeroed when the exchange is dropped.
pub struct KeyExchange {
    secret: Zeroizing<BigUint>,
    public: BigUint,
}

impl KeyExchange {
    /// Draws a fresh secret exponent and computes `g^secret mod p`.
    pub fn new() -> Self {
        let two = BigUint::from(2u32);
        let secret = loop {
            let candidate = Zeroizing::new(OsRng.gen_biguint(SECRET_BITS));
            if *candidate >= two {
                break candidate;
            }
        };
        let public = BigUint::from(GENERATOR).modpow(&secret, modulus());

        Self { secret, public }
    }

    /// Public value in its fixed-width wire encoding.
    pub fn public_bytes(&self) -> [u8; DH_PUBLIC_LENGTH] {
        to_fixed_width(&self.public)
    }

    /// Computes the shared secret from the peer's public value and hashes it
    /// into the session key.
    ///
    /// The key is `SHA-256` of the shared secret's minimal big-endian bytes.
    pub fn agree(&self, peer_public: &[u8]) -> Result<SessionKey> {
        let shared = self.shared_secret(peer_public)?;

        let digest = Sha256::digest(shared.as_slice());
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&digest);
        Ok(SessionKey::from_bytes(key))
    }

    /// Minimal big-endian bytes of `peer^secret mod p`.
    fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if peer_public.len() != DH_PUBLIC_LENGTH {
            return Err(ProtocolError::HandshakeFailed(format!(
                "peer public value is {} bytes, expected {}",
                peer_public.len(),
                DH_PUBLIC_LENGTH
            )));
        }

        let p = modulus();
        let peer = BigUint::from_bytes_be(peer_public);
        // Rejects 0, 1, p-1 and anything outside the group.
        if peer < BigUint::from(2u32) || peer > p - 2u32 {
            return Err(ProtocolError::HandshakeFailed(
                "peer public value outside the group".to_string(),
            ));
        }

        let shared = Zeroizing::new(peer.modpow(&self.secret, p));
        Ok(Zeroizing::new(shared.to_bytes_be()))
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn to_fixed_width(value: &BigUint) -> [u8; DH_PUBLIC_LENGTH] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_PUBLIC_LENGTH];
    out[DH_PUBLIC_LENGTH - bytes.len()..].copy_from_slice(&bytes);
    out
}
