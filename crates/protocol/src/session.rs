//! Encrypted, framed message transport over a byte stream.
//!
//! A [`SecureSession`] starts with an unauthenticated Diffie-Hellman exchange
//! (each side writes its public value, then reads the peer's) and from then on
//! carries codec-encoded messages as sealed records:
//!
//! ```text
//! fields ──encode──▶ plaintext ──seal──▶ IV || ciphertext ──frame──▶ socket
//! ```
//!
//! The exchange is symmetric, so client and server use the same constructor.
//! Peer identity is established later by the handshake protocol's signatures.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::cipher::{self, SessionKey};
use crate::codec;
use crate::dh::{KeyExchange, DH_PUBLIC_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::framing::{self, RECORD_HEADER_SIZE};

/// Bound on every socket read or write when nothing else is configured.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// An established session: the stream plus the agreed symmetric key.
pub struct SecureSession<S> {
    stream: S,
    key: SessionKey,
    io_timeout: Duration,
}

impl<S> SecureSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the key exchange on `stream` and returns the ready session.
    ///
    /// Any I/O failure, short read or timeout during the exchange is reported
    /// as [`ProtocolError::HandshakeFailed`].
    pub async fn establish(mut stream: S, io_timeout: Duration) -> Result<Self> {
        let exchange = KeyExchange::new();
        let own_public = exchange.public_bytes();

        let exchanged = timeout(io_timeout, async {
            stream.write_all(&own_public).await?;
            stream.flush().await?;

            let mut peer_public = [0u8; DH_PUBLIC_LENGTH];
            stream.read_exact(&mut peer_public).await?;
            Ok::<_, std::io::Error>(peer_public)
        })
        .await;

        let peer_public = match exchanged {
            Ok(Ok(peer_public)) => peer_public,
            Ok(Err(e)) => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "key exchange i/o failed: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "key exchange timed out after {:?}",
                    io_timeout
                )))
            }
        };

        let key = exchange.agree(&peer_public)?;
        tracing::debug!("Session key agreed");

        Ok(Self {
            stream,
            key,
            io_timeout,
        })
    }

    /// Encodes, encrypts and writes one message.
    pub async fn send<T: AsRef<[u8]>>(&mut self, fields: &[T]) -> Result<()> {
        let body = cipher::seal(&self.key, &codec::encode(fields));
        let record = framing::frame(&body)?;

        let stream = &mut self.stream;
        timeout(self.io_timeout, async {
            stream.write_all(&record).await?;
            stream.flush().await
        })
        .await??;

        tracing::trace!("Sent record of {} bytes", record.len());
        Ok(())
    }

    /// Reads, decrypts and decodes one message.
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] if the peer closes the
    /// stream, including the clean case of EOF before a record starts.
    pub async fn recv(&mut self) -> Result<Vec<Vec<u8>>> {
        let stream = &mut self.stream;
        let body = timeout(self.io_timeout, async {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            stream.read_exact(&mut header).await?;
            let body_len = framing::decode_header(&header)?;

            let mut body = vec![0u8; body_len];
            stream.read_exact(&mut body).await?;
            Ok::<_, ProtocolError>(body)
        })
        .await??;

        tracing::trace!("Received record of {} bytes", body.len());
        let plaintext = cipher::open(&self.key, &body)?;
        Ok(codec::decode(&plaintext))
    }

    /// Shuts down the write half of the stream.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S> std::fmt::Debug for SecureSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("key", &self.key)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}
