//! RSA identities, signatures and public key encoding.
//!
//! Every installation owns one [`Identity`] (an RSA key pair). Public keys
//! travel as PKCS#1 DER, and the exact DER bytes are what signed payloads
//! embed, so both ends must agree on the encoding byte for byte.
//!
//! Signatures are RSASSA-PSS over SHA-256 with a salt as long as the hash,
//! on clients and on the server alike.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::pss::{BlindedSigningKey, Signature as PssSignature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Smallest accepted RSA modulus, in bits.
pub const MIN_KEY_BITS: usize = 2048;

/// Modulus size used when nothing else is configured.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// File holding the PKCS#1 PEM private key inside a key directory.
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

/// File holding the PKCS#1 PEM public key inside a key directory.
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// Length of a key fingerprint in bytes (SHA-256 of the DER, truncated).
const FINGERPRINT_LENGTH: usize = 16;

/// An RSASSA-PSS signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// Wraps raw signature bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A public key as exchanged on the wire.
///
/// Keeps the canonical DER next to the parsed key so that re-encoding never
/// changes the bytes a peer signed.
#[derive(Clone)]
pub struct PeerKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PeerKey {
    /// Parses a PKCS#1 DER public key.
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let key = RsaPublicKey::from_pkcs1_der(bytes)?;
        Self::check_strength(&key)?;
        Ok(Self {
            key,
            der: bytes.to_vec(),
        })
    }

    /// Parses a PKCS#1 PEM (`RSA PUBLIC KEY`) public key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_pkcs1_pem(pem)?;
        Self::from_rsa(key)
    }

    fn from_rsa(key: RsaPublicKey) -> Result<Self> {
        Self::check_strength(&key)?;
        let der = key.to_pkcs1_der()?.as_bytes().to_vec();
        Ok(Self { key, der })
    }

    fn check_strength(key: &RsaPublicKey) -> Result<()> {
        let bits = key.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(ProtocolError::WeakKey {
                bits,
                min: MIN_KEY_BITS,
            });
        }
        Ok(())
    }

    /// Returns the canonical PKCS#1 DER encoding.
    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// Encodes the key as PKCS#1 PEM.
    pub fn to_pem(&self) -> Result<String> {
        self.key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(ProtocolError::from)
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }

    /// Verifies a PSS/SHA-256 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let verifying_key = VerifyingKey::<Sha256>::new(self.key.clone());
        let sig = PssSignature::try_from(signature.as_bytes())?;
        verifying_key
            .verify(message, &sig)
            .map_err(ProtocolError::from)
    }

    /// Short human-readable fingerprint of the key.
    ///
    /// Groups of 4 hex characters separated by colons, for example
    /// `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.der);
        hash[..FINGERPRINT_LENGTH]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl PartialEq for PeerKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PeerKey {}

impl std::fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerKey")
            .field("bits", &self.bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// The local RSA key pair.
///
/// The private half never leaves this struct except through
/// [`Identity::save`].
#[derive(Clone)]
pub struct Identity {
    private_key: RsaPrivateKey,
    public: PeerKey,
}

impl Identity {
    /// Generates a new key pair with a modulus of `bits` bits.
    ///
    /// This is slow (hundreds of milliseconds for 2048 bits); callers keep the
    /// result on disk with [`Identity::save`] and reuse it.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_KEY_BITS {
            return Err(ProtocolError::WeakKey {
                bits,
                min: MIN_KEY_BITS,
            });
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ProtocolError::Signing(format!("key generation failed: {}", e)))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public = PeerKey::from_rsa(RsaPublicKey::from(&private_key))?;
        Ok(Self {
            private_key,
            public,
        })
    }

    /// Parses a PKCS#1 PEM (`RSA PRIVATE KEY`) private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| ProtocolError::Storage(format!("invalid private key: {}", e)))?;
        Self::from_private_key(private_key)
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &PeerKey {
        &self.public
    }

    /// Signs `message` with RSASSA-PSS over SHA-256.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signing_key = BlindedSigningKey::<Sha256>::new(self.private_key.clone());
        let sig = signing_key
            .try_sign_with_rng(&mut OsRng, message)
            .map_err(|e| ProtocolError::Signing(e.to_string()))?;
        Ok(Signature(sig.to_vec()))
    }

    /// Human-readable fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Loads the key pair stored in `dir`, if any.
    ///
    /// Returns `Ok(None)` when no private key file exists. A file that exists
    /// but does not parse is an error; it is never silently replaced.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(PRIVATE_KEY_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let pem = fs::read_to_string(&path).map_err(|e| {
            ProtocolError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_pem(&pem).map(Some)
    }

    /// Writes both PEM files into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            ProtocolError::Storage(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let private_pem = self
            .private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::Storage(format!("failed to encode private key: {}", e)))?;
        write_private(&dir.join(PRIVATE_KEY_FILE), private_pem.as_bytes())?;
        write_private(&dir.join(PUBLIC_KEY_FILE), self.public.to_pem()?.as_bytes())?;

        Ok(())
    }

    /// Returns the identity stored in `dir`, generating and saving a new one
    /// only when none exists.
    pub fn load_or_generate(dir: &Path, bits: usize) -> Result<Self> {
        if let Some(identity) = Self::load(dir)? {
            tracing::debug!("Loaded identity {} from {:?}", identity.fingerprint(), dir);
            return Ok(identity);
        }

        tracing::info!("Generating new {}-bit identity in {:?}", bits, dir);
        let identity = Self::generate(bits)?;
        identity.save(dir)?;
        Ok(identity)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Writes `contents` to `path` readable by the owner only.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| {
        ProtocolError::Storage(format!("failed to open {}: {}", path.display(), e))
    })?;
    std::io::Write::write_all(&mut file, contents)
        .map_err(|e| ProtocolError::Storage(format!("failed to write {}: {}", path.display(), e)))
}
