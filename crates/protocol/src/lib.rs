//! # Whisper Protocol Library
//!
//! This crate provides the wire protocol, session encryption, identities and
//! the uid directory shared by the Whisper server and client.
//!
//! ## Overview
//!
//! - **Message Codec**: delimiter-joined byte fields
//! - **Identity**: RSA key pairs, RSASSA-PSS signatures, PKCS#1 key encoding
//! - **Key Agreement**: ephemeral Diffie-Hellman over the RFC 3526 group
//! - **Secure Session**: AES-256-CFB sealed, length-framed records
//! - **UID Directory**: uid allocation and uid → public key lookup
//! - **Handshake**: registration and key lookup messages, client state machine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Handshake (Request/Reply)        │  RSA-PSS signed
//! ├─────────────────────────────────────────┤
//! │              Message Codec              │  delimiter-joined fields
//! ├─────────────────────────────────────────┤
//! │            Record Encryption            │  AES-256-CFB, random IV
//! ├─────────────────────────────────────────┤
//! │              Record Framing             │  "WSPR" + length
//! ├─────────────────────────────────────────┤
//! │     TCP (after DH key agreement)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{codec, Identity, Request, DEFAULT_KEY_BITS};
//!
//! let identity = Identity::generate(DEFAULT_KEY_BITS).unwrap();
//! println!("Fingerprint: {}", identity.fingerprint());
//!
//! let request = Request::first_connection(&identity).unwrap();
//! let bytes = codec::encode(&request.to_fields());
//! assert_eq!(Request::from_fields(&codec::decode(&bytes)).unwrap(), request);
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: field encoding
//! - [`identity`]: key pairs and signatures
//! - [`dh`]: key agreement
//! - [`cipher`]: record encryption
//! - [`framing`]: record headers
//! - [`session`]: encrypted transport over a stream
//! - [`directory`]: uid directory and key stores
//! - [`handshake`]: protocol messages and client state machine
//! - [`error`]: Error types

pub mod cipher;
pub mod codec;
pub mod dh;
pub mod directory;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod session;

pub use cipher::SessionKey;
pub use directory::{FileKeyStore, KeyStore, MemoryKeyStore, Uid, UidDirectory, UID_LIMIT};
pub use error::{ErrorCategory, ProtocolError, Result};
pub use framing::{MAX_RECORD_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC};
pub use handshake::{
    ClientHandshake, Command, HandshakeState, QueryReply, Registration, Request, PROTOCOL_VERSION,
};
pub use identity::{Identity, PeerKey, Signature, DEFAULT_KEY_BITS, MIN_KEY_BITS};
pub use session::{SecureSession, DEFAULT_IO_TIMEOUT};
