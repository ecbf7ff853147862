//! # Whisper Client Library
//!
//! Connects to a Whisper server, registers on first use, and looks up the
//! public keys of other users by uid.
//!
//! All persistent client state lives in one directory:
//!
//! - `whisper.toml`: server address and the uid assigned at registration
//! - `private_key.pem`, `public_key.pem`: the client's RSA key pair
//! - `uids/<uid>`: cached public keys, with the server's at uid 0
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use client::Client;
//! use protocol::Uid;
//!
//! let mut client = Client::open("/home/me/.config/whisper/client")?;
//! let address = client.config().address.clone();
//! client.connect(&address).await?;
//! let my_uid = client.handshake().await?;
//! let key = client.query_uid(Uid(12345678901)).await?;
//! ```

pub mod config;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use protocol::{
    ClientHandshake, FileKeyStore, HandshakeState, Identity, PeerKey, ProtocolError, QueryReply,
    Registration, SecureSession, Uid, UidDirectory, DEFAULT_KEY_BITS, UID_LIMIT,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub use config::{default_client_dir, ClientConfig, CONFIG_FILE, DEFAULT_SERVER_ADDRESS};

/// Errors surfaced to client users.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Session, handshake or directory failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The TCP connection could not be opened.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address that was dialed.
        address: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The server answered a query with an error message.
    #[error("query rejected by server: {0}")]
    QueryRejected(String),

    /// An operation needed a connection but none is open.
    #[error("not connected to a server")]
    NotConnected,

    /// Config file failure.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// The operations a presentation layer needs from a client.
#[allow(async_fn_in_trait)]
pub trait Messenger {
    /// Registers or authenticates with the connected server and returns the
    /// local uid.
    async fn handshake(&mut self) -> Result<Uid>;

    /// Fetches, verifies and caches the public key of `uid`.
    async fn query_uid(&mut self, uid: Uid) -> Result<PeerKey>;

    /// Uids with a cached key, excluding the server.
    fn list_uids(&self) -> Result<BTreeSet<Uid>>;
}

/// A Whisper client bound to one client directory.
pub struct Client {
    dir: PathBuf,
    config: ClientConfig,
    identity: Identity,
    directory: UidDirectory,
    handshake: ClientHandshake,
    session: Option<SecureSession<TcpStream>>,
}

impl Client {
    /// Opens the client directory, creating the config and key pair on
    /// first use.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        let config = ClientConfig::load_or_create(&dir)?;
        let identity = Identity::load_or_generate(&dir, DEFAULT_KEY_BITS)?;
        let directory = UidDirectory::open(FileKeyStore::new(&dir), UID_LIMIT)?;
        let handshake = Self::new_handshake(&config, &directory);

        debug!(
            "Opened client directory {:?} (uid {}, key {})",
            dir,
            config.uid,
            identity.fingerprint()
        );

        Ok(Self {
            dir,
            config,
            identity,
            directory,
            handshake,
            session: None,
        })
    }

    fn new_handshake(config: &ClientConfig, directory: &UidDirectory) -> ClientHandshake {
        ClientHandshake::new(config.uid, directory.get(Uid::SERVER).ok())
    }

    /// The client directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The local key pair.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Local uid, zero until registered.
    pub fn uid(&self) -> Uid {
        self.config.uid
    }

    /// State of the handshake on the current connection.
    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Whether a connection is open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Dials `address` and runs key agreement. Replaces any open connection.
    pub async fn connect(&mut self, address: &str) -> Result<()> {
        let io_timeout = self.config.io_timeout();

        let stream = tokio::time::timeout(io_timeout, TcpStream::connect(address))
            .await
            .map_err(ProtocolError::from)?
            .map_err(|source| ClientError::Connect {
                address: address.to_string(),
                source,
            })?;

        let session = SecureSession::establish(stream, io_timeout).await?;
        info!("Connected to {}", address);

        self.session = Some(session);
        self.handshake = Self::new_handshake(&self.config, &self.directory);
        Ok(())
    }

    /// Closes the connection, if any.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }

    /// Registers with the server on first use, otherwise authenticates from
    /// the stored uid and server key. Returns the local uid.
    ///
    /// A new registration caches the server key under uid 0 and persists the
    /// assigned uid before returning. A server key already in slot 0 from an
    /// earlier, unfinished registration is replaced. If the outcome cannot be
    /// persisted, or the exchange fails in transit, the handshake is
    /// [`HandshakeState::Aborted`] and the config keeps uid 0.
    pub async fn handshake(&mut self) -> Result<Uid> {
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;

        let Some(request) = self.handshake.begin(&self.identity)? else {
            info!("Authenticated as uid {}", self.config.uid);
            return Ok(self.config.uid);
        };

        let reply = match exchange(session, &request.to_fields()).await {
            Ok(reply) => reply,
            Err(e) => {
                self.handshake.abort();
                return Err(e.into());
            }
        };
        let registration = self.handshake.complete_registration(&reply)?;

        if let Err(e) = self.persist_registration(&registration) {
            warn!("Failed to persist registration: {}", e);
            self.handshake.abort();
            return Err(e);
        }

        info!(
            "Registered as uid {} with server {}",
            registration.uid,
            registration.server_key.fingerprint()
        );
        Ok(registration.uid)
    }

    fn persist_registration(&mut self, registration: &Registration) -> Result<()> {
        self.directory
            .replace_server_key(registration.server_key.clone())?;

        let mut config = self.config.clone();
        config.uid = registration.uid;
        config.save(&self.dir)?;
        self.config = config;
        Ok(())
    }

    /// Looks up the public key of `uid` and caches it.
    ///
    /// An error reply from the server, signed or bare, is returned as
    /// [`ClientError::QueryRejected`] carrying the server's message.
    pub async fn query_uid(&mut self, uid: Uid) -> Result<PeerKey> {
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;

        let request = self.handshake.query_request(&self.identity, uid)?;
        session.send(&request.to_fields()).await?;
        let reply = session.recv().await?;

        match self.handshake.read_query_reply(uid, &reply)? {
            QueryReply::Found { public_key, .. } => {
                self.directory.put(uid, public_key.clone())?;
                info!("Cached key {} for uid {}", public_key.fingerprint(), uid);
                Ok(public_key)
            }
            QueryReply::Rejected { message, .. } | QueryReply::Unsigned { message } => {
                Err(ClientError::QueryRejected(message))
            }
        }
    }

    /// Uids with a cached key, excluding the server slot.
    pub fn list_known_uids(&self) -> Result<BTreeSet<Uid>> {
        let mut uids = self.directory.list()?;
        uids.remove(&Uid::SERVER);
        Ok(uids)
    }

    /// The cached key of `uid`, without contacting the server.
    pub fn cached_key(&self, uid: Uid) -> Result<PeerKey> {
        Ok(self.directory.get(uid)?)
    }
}

async fn exchange(
    session: &mut SecureSession<TcpStream>,
    fields: &[Vec<u8>],
) -> std::result::Result<Vec<Vec<u8>>, ProtocolError> {
    session.send(fields).await?;
    session.recv().await
}

impl Messenger for Client {
    async fn handshake(&mut self) -> Result<Uid> {
        Client::handshake(self).await
    }

    async fn query_uid(&mut self, uid: Uid) -> Result<PeerKey> {
        Client::query_uid(self, uid).await
    }

    fn list_uids(&self) -> Result<BTreeSet<Uid>> {
        self.list_known_uids()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("dir", &self.dir)
            .field("uid", &self.config.uid)
            .field("state", &self.handshake.state())
            .field("connected", &self.session.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::KeyStore;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    /// A peer that completes key agreement and then holds the connection
    /// open until the client goes away.
    async fn key_agreement_peer() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut session = SecureSession::establish(stream, Duration::from_secs(10))
                .await
                .unwrap();
            let _ = session.recv().await;
        });

        (address, task)
    }

    /// A peer that answers the first request with `reply`.
    async fn replying_peer(reply: Vec<Vec<u8>>) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut session = SecureSession::establish(stream, Duration::from_secs(10))
                .await
                .unwrap();
            session.recv().await.unwrap();
            session.send(&reply).await.unwrap();
            let _ = session.recv().await;
        });

        (address, task)
    }

    #[test]
    fn test_open_creates_state() {
        let temp_dir = TempDir::new().unwrap();
        let client = Client::open(temp_dir.path()).unwrap();

        assert!(temp_dir.path().join(CONFIG_FILE).exists());
        assert!(temp_dir
            .path()
            .join(protocol::identity::PRIVATE_KEY_FILE)
            .exists());
        assert!(client.uid().is_server());
        assert_eq!(client.state(), HandshakeState::Uninitialized);
        assert!(client.list_known_uids().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_identity() {
        let temp_dir = TempDir::new().unwrap();
        let first = Client::open(temp_dir.path()).unwrap();
        let second = Client::open(temp_dir.path()).unwrap();

        assert_eq!(first.identity().public_key(), second.identity().public_key());
    }

    #[tokio::test]
    async fn test_operations_need_a_connection() {
        let temp_dir = TempDir::new().unwrap();
        let mut client = Client::open(temp_dir.path()).unwrap();

        assert!(matches!(
            client.handshake().await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.query_uid(Uid(1)).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let temp_dir = TempDir::new().unwrap();
        let mut client = Client::open(temp_dir.path()).unwrap();

        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client.connect(&address).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_registered_uid_without_server_key_aborts() {
        let temp_dir = TempDir::new().unwrap();
        let config = ClientConfig {
            uid: Uid(31337),
            ..ClientConfig::default()
        };
        config.save(temp_dir.path()).unwrap();

        let mut client = Client::open(temp_dir.path()).unwrap();
        let (address, peer) = key_agreement_peer().await;
        client.connect(&address).await.unwrap();

        let err = client.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::MissingServerKey)
        ));
        assert_eq!(client.state(), HandshakeState::Aborted);

        client.disconnect().await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_before_handshake_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let mut client = Client::open(temp_dir.path()).unwrap();
        let (address, peer) = key_agreement_peer().await;
        client.connect(&address).await.unwrap();

        let err = client.query_uid(Uid(5)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::HandshakeIncomplete)
        ));

        client.disconnect().await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_registration_keeps_uid_zero() {
        let temp_dir = TempDir::new().unwrap();
        let mut client = Client::open(temp_dir.path()).unwrap();
        let (address, peer) = replying_peer(vec![b"registration closed".to_vec()]).await;
        client.connect(&address).await.unwrap();

        let err = client.handshake().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "handshake failed: registration refused: registration closed"
        );
        assert_eq!(client.state(), HandshakeState::Aborted);
        assert!(client.uid().is_server());
        assert!(client.cached_key(Uid::SERVER).is_err());

        client.disconnect().await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsaved_registration_aborts() {
        let temp_dir = TempDir::new().unwrap();
        let mut client = Client::open(temp_dir.path()).unwrap();

        let server = Identity::generate(DEFAULT_KEY_BITS).unwrap();
        let reply = Registration::new(&server, Uid(4242)).unwrap().to_fields();
        let (address, peer) = replying_peer(reply).await;
        client.connect(&address).await.unwrap();

        // The config file can no longer be written.
        let config_path = ClientConfig::path(temp_dir.path());
        std::fs::remove_file(&config_path).unwrap();
        std::fs::create_dir(&config_path).unwrap();

        let err = client.handshake().await.unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert_eq!(client.state(), HandshakeState::Aborted);
        assert!(client.uid().is_server());
        assert!(matches!(
            client.query_uid(Uid(1)).await,
            Err(ClientError::Protocol(ProtocolError::HandshakeIncomplete))
        ));

        client.disconnect().await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_replaces_stale_server_key() {
        let temp_dir = TempDir::new().unwrap();
        let stale = Identity::generate(DEFAULT_KEY_BITS).unwrap();
        FileKeyStore::new(temp_dir.path())
            .store(Uid::SERVER, stale.public_key())
            .unwrap();
        let mut client = Client::open(temp_dir.path()).unwrap();

        let server = Identity::generate(DEFAULT_KEY_BITS).unwrap();
        let reply = Registration::new(&server, Uid(4242)).unwrap().to_fields();
        let (address, peer) = replying_peer(reply).await;
        client.connect(&address).await.unwrap();

        assert_eq!(client.handshake().await.unwrap(), Uid(4242));
        assert_eq!(client.state(), HandshakeState::Registered);
        assert_eq!(client.cached_key(Uid::SERVER).unwrap(), *server.public_key());

        client.disconnect().await.unwrap();
        peer.await.unwrap();

        let reopened = Client::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.uid(), Uid(4242));
        assert_eq!(reopened.cached_key(Uid::SERVER).unwrap(), *server.public_key());
    }

    #[test]
    fn test_query_rejected_display() {
        let err = ClientError::QueryRejected("unknown uid: 9".to_string());
        assert_eq!(err.to_string(), "query rejected by server: unknown uid: 9");
    }
}
