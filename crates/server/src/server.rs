//! Server: loads the identity and directory, accepts connections, and runs
//! one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{FileKeyStore, Identity, ProtocolError, SecureSession, UidDirectory};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::handler::RequestHandler;

/// The Whisper directory server.
pub struct Server {
    config: Config,
    identity: Arc<Identity>,
    directory: Arc<UidDirectory>,
    handler: Arc<RequestHandler>,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Loads (or creates) the server identity and opens the uid directory
    /// under the configured data directory.
    pub fn new(config: Config) -> Result<Self> {
        let data_dir = config.server.data_dir.clone();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let identity = Identity::load_or_generate(&data_dir, config.server.key_bits)
            .context("Failed to load server identity")?;
        info!("Server identity {}", identity.fingerprint());

        let uid_limit = config.server.uid_limit;
        let directory = UidDirectory::open(FileKeyStore::new(&data_dir), uid_limit)
            .context("Failed to open uid directory")?;

        let identity = Arc::new(identity);
        let directory = Arc::new(directory);
        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&identity),
            Arc::clone(&directory),
        ));

        Ok(Self {
            config,
            identity,
            directory,
            handler,
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// The server's key pair.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The shared uid directory.
    pub fn directory(&self) -> &Arc<UidDirectory> {
        &self.directory
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = &self.config.server.listen_address;
        TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind {}", address))
    }

    /// Accepts connections on `listener` until shut down, then waits for
    /// open connections to finish.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().context("Listener has no address")?;
        info!("Listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("All connections closed");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let span = tracing::info_span!("connection", id = %Uuid::new_v4(), peer = %peer_addr);
        let handler = Arc::clone(&self.handler);
        let shutdown = self.shutdown_token.clone();
        let io_timeout = self.config.io_timeout();

        self.tracker.spawn(
            async move {
                debug!("Accepted connection");
                handle_connection(stream, handler, io_timeout, shutdown).await;
                debug!("Connection finished");
            }
            .instrument(span),
        );
    }
}

/// Runs key agreement, then answers requests until the peer closes, a
/// request fails, or the server shuts down.
async fn handle_connection(
    stream: TcpStream,
    handler: Arc<RequestHandler>,
    io_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut session = match SecureSession::establish(stream, io_timeout).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Key agreement failed: {}", e);
            return;
        }
    };

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = session.recv() => received,
        };

        let fields = match received {
            Ok(fields) => fields,
            Err(ProtocolError::ConnectionClosed(_)) => {
                debug!("Peer closed the connection");
                break;
            }
            Err(e) => {
                warn!("Dropping connection: {}", e);
                break;
            }
        };

        match handler.handle(&fields) {
            Ok(reply) => {
                if let Err(e) = session.send(&reply).await {
                    warn!("Failed to send reply: {}", e);
                    break;
                }
            }
            Err(e) => {
                warn!("Rejected request: {}", e);
                if let Some(reply) = handler.error_reply(&e) {
                    if let Err(e) = session.send(&reply).await {
                        debug!("Failed to send error reply: {}", e);
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = session.close().await {
        debug!("Error while closing connection: {}", e);
    }
}
