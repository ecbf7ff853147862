//! Registration and key lookup messages, and the client-side state machine.
//!
//! Every message is a list of fields (see [`crate::codec`]) carried in one
//! session record. Requests start with a command tag:
//!
//! ```text
//! first connection:  ["first connection", client_der, sig]
//!                    sig = sign_client(encode(["first connection", client_der]))
//! uid query:         ["uid query", requester, queried, sig]
//!                    sig = sign_requester(encode(["uid query", requester, queried]))
//! ```
//!
//! Replies are signed by the server over every field but the last:
//!
//! ```text
//! registration:      [uid, server_der, sig]     sig over encode([uid, server_der])
//! refusal:           [message, sig]             sig over message
//! query, found:      [uid, key_der, sig]        sig over encode([uid, key_der])
//! query, rejected:   [message, sig]             sig over message
//! bare error:        [message]                  unsigned
//! ```
//!
//! Any reply with fewer than three fields is an error whose text is field 0.
//! A bare error is surfaced as is; it carries no key and changes no state.
//!
//! A returning client (non-zero uid with the server key cached) goes straight
//! to [`HandshakeState::Authenticated`] without proving possession of its
//! private key. Its first signed query is the first proof the server sees.

use crate::codec;
use crate::directory::Uid;
use crate::error::{ProtocolError, Result};
use crate::identity::{Identity, PeerKey, Signature};

/// Current protocol version.
///
/// Version 2 frames every record with an explicit length and sends
/// fixed-width key agreement values.
pub const PROTOCOL_VERSION: u8 = 2;

/// Request command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Register a new public key and receive a uid.
    FirstConnection,
    /// Look up the public key of a uid.
    UidQuery,
}

impl Command {
    /// Literal tag carried in field 0.
    pub fn tag(&self) -> &'static [u8] {
        match self {
            Command::FirstConnection => b"first connection",
            Command::UidQuery => b"uid query",
        }
    }

    /// Parses field 0 of a request.
    pub fn from_tag(tag: &[u8]) -> Result<Self> {
        match tag {
            b"first connection" => Ok(Command::FirstConnection),
            b"uid query" => Ok(Command::UidQuery),
            other => Err(ProtocolError::UnknownCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Number of fields a request with this tag carries, tag included.
    pub fn field_count(&self) -> usize {
        match self {
            Command::FirstConnection => 3,
            Command::UidQuery => 4,
        }
    }

    fn context(&self) -> &'static str {
        match self {
            Command::FirstConnection => "first connection",
            Command::UidQuery => "uid query",
        }
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Registration of a fresh key, self-signed.
    FirstConnection {
        /// The key to register.
        public_key: PeerKey,
        /// Signature by `public_key` over the tag and key.
        signature: Signature,
    },
    /// Public key lookup by a registered client.
    UidQuery {
        /// Uid of the asking client.
        requester: Uid,
        /// Uid being looked up.
        queried: Uid,
        /// Signature by the requester's key over tag, requester and queried.
        signature: Signature,
    },
}

impl Request {
    /// Builds a signed registration request for `identity`.
    pub fn first_connection(identity: &Identity) -> Result<Self> {
        let public_key = identity.public_key().clone();
        if codec::contains_delimiter(public_key.to_der()) {
            return Err(ProtocolError::Malformed(
                "public key encoding contains the field delimiter".to_string(),
            ));
        }

        let payload = codec::encode(&[Command::FirstConnection.tag(), public_key.to_der()]);
        let signature = identity.sign(&payload)?;
        Ok(Request::FirstConnection {
            public_key,
            signature,
        })
    }

    /// Builds a signed lookup of `queried` on behalf of `requester`.
    pub fn uid_query(identity: &Identity, requester: Uid, queried: Uid) -> Result<Self> {
        let payload = codec::encode(&[
            Command::UidQuery.tag(),
            requester.to_field().as_slice(),
            queried.to_field().as_slice(),
        ]);
        let signature = identity.sign(&payload)?;
        Ok(Request::UidQuery {
            requester,
            queried,
            signature,
        })
    }

    /// The command tag of this request.
    pub fn command(&self) -> Command {
        match self {
            Request::FirstConnection { .. } => Command::FirstConnection,
            Request::UidQuery { .. } => Command::UidQuery,
        }
    }

    /// The bytes covered by the request's signature.
    pub fn signed_payload(&self) -> Vec<u8> {
        match self {
            Request::FirstConnection { public_key, .. } => {
                codec::encode(&[Command::FirstConnection.tag(), public_key.to_der()])
            }
            Request::UidQuery {
                requester, queried, ..
            } => codec::encode(&[
                Command::UidQuery.tag(),
                requester.to_field().as_slice(),
                queried.to_field().as_slice(),
            ]),
        }
    }

    /// The signature carried by the request.
    pub fn signature(&self) -> &Signature {
        match self {
            Request::FirstConnection { signature, .. } | Request::UidQuery { signature, .. } => {
                signature
            }
        }
    }

    /// Checks the request's signature against `key`.
    ///
    /// For a first connection `key` is the embedded key itself; for a query it
    /// is the requester's key from the directory.
    pub fn verify(&self, key: &PeerKey) -> Result<()> {
        key.verify(&self.signed_payload(), self.signature())
    }

    /// Encodes the request as message fields.
    pub fn to_fields(&self) -> Vec<Vec<u8>> {
        match self {
            Request::FirstConnection {
                public_key,
                signature,
            } => vec![
                Command::FirstConnection.tag().to_vec(),
                public_key.to_der().to_vec(),
                signature.as_bytes().to_vec(),
            ],
            Request::UidQuery {
                requester,
                queried,
                signature,
            } => vec![
                Command::UidQuery.tag().to_vec(),
                requester.to_field(),
                queried.to_field(),
                signature.as_bytes().to_vec(),
            ],
        }
    }

    /// Decodes a request, validating the tag, field count and field syntax.
    ///
    /// Signatures are not checked here; see [`Request::verify`].
    pub fn from_fields(fields: &[Vec<u8>]) -> Result<Self> {
        let tag = fields
            .first()
            .ok_or_else(|| ProtocolError::Malformed("empty request".to_string()))?;
        let command = Command::from_tag(tag)?;

        if fields.len() != command.field_count() {
            return Err(ProtocolError::FieldCount {
                context: command.context(),
                expected: command.field_count(),
                got: fields.len(),
            });
        }

        match command {
            Command::FirstConnection => Ok(Request::FirstConnection {
                public_key: PeerKey::from_der(&fields[1])?,
                signature: Signature::from_bytes(fields[2].clone()),
            }),
            Command::UidQuery => Ok(Request::UidQuery {
                requester: Uid::from_field(&fields[1])?,
                queried: Uid::from_field(&fields[2])?,
                signature: Signature::from_bytes(fields[3].clone()),
            }),
        }
    }
}

/// The server's answer to a first connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The uid assigned to the client.
    pub uid: Uid,
    /// The server's public key.
    pub server_key: PeerKey,
    /// Server signature over uid and server key.
    pub signature: Signature,
}

impl Registration {
    /// Signs the assignment of `uid` with the server identity.
    pub fn new(server: &Identity, uid: Uid) -> Result<Self> {
        let server_key = server.public_key().clone();
        let payload = codec::encode(&[uid.to_field().as_slice(), server_key.to_der()]);
        let signature = server.sign(&payload)?;
        Ok(Self {
            uid,
            server_key,
            signature,
        })
    }

    /// Encodes the reply as message fields.
    pub fn to_fields(&self) -> Vec<Vec<u8>> {
        vec![
            self.uid.to_field(),
            self.server_key.to_der().to_vec(),
            self.signature.as_bytes().to_vec(),
        ]
    }

    /// Decodes a registration reply.
    pub fn from_fields(fields: &[Vec<u8>]) -> Result<Self> {
        if fields.len() != 3 {
            return Err(ProtocolError::FieldCount {
                context: "registration reply",
                expected: 3,
                got: fields.len(),
            });
        }

        Ok(Self {
            uid: Uid::from_field(&fields[0])?,
            server_key: PeerKey::from_der(&fields[1])?,
            signature: Signature::from_bytes(fields[2].clone()),
        })
    }

    /// Checks that the reply is signed by the key it carries.
    pub fn verify(&self) -> Result<()> {
        let payload = codec::encode(&[self.uid.to_field().as_slice(), self.server_key.to_der()]);
        self.server_key.verify(&payload, &self.signature)
    }
}

/// The server's answer to a uid query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    /// The queried uid and its key.
    Found {
        /// Echo of the queried uid.
        uid: Uid,
        /// Key bound to `uid`.
        public_key: PeerKey,
        /// Server signature over uid and key.
        signature: Signature,
    },
    /// The query failed; `message` says why.
    Rejected {
        /// Human-readable reason.
        message: String,
        /// Server signature over the message.
        signature: Signature,
    },
    /// An error without a signature.
    Unsigned {
        /// Human-readable reason.
        message: String,
    },
}

impl QueryReply {
    /// Signed success reply.
    pub fn found(server: &Identity, uid: Uid, public_key: PeerKey) -> Result<Self> {
        let payload = codec::encode(&[uid.to_field().as_slice(), public_key.to_der()]);
        let signature = server.sign(&payload)?;
        Ok(QueryReply::Found {
            uid,
            public_key,
            signature,
        })
    }

    /// Signed error reply.
    pub fn rejected(server: &Identity, message: impl Into<String>) -> Result<Self> {
        let message = message.into();
        let signature = server.sign(message.as_bytes())?;
        Ok(QueryReply::Rejected { message, signature })
    }

    fn signed_payload(&self) -> Vec<u8> {
        match self {
            QueryReply::Found {
                uid, public_key, ..
            } => codec::encode(&[uid.to_field().as_slice(), public_key.to_der()]),
            QueryReply::Rejected { message, .. } | QueryReply::Unsigned { message } => {
                message.as_bytes().to_vec()
            }
        }
    }

    /// Checks the reply's signature against the server key.
    ///
    /// An [`QueryReply::Unsigned`] error never verifies.
    pub fn verify(&self, server_key: &PeerKey) -> Result<()> {
        let signature = match self {
            QueryReply::Found { signature, .. } | QueryReply::Rejected { signature, .. } => {
                signature
            }
            QueryReply::Unsigned { .. } => {
                return Err(ProtocolError::InvalidSignature(
                    "reply carries no signature".to_string(),
                ))
            }
        };
        server_key.verify(&self.signed_payload(), signature)
    }

    /// Encodes the reply as message fields.
    pub fn to_fields(&self) -> Vec<Vec<u8>> {
        match self {
            QueryReply::Found {
                uid,
                public_key,
                signature,
            } => vec![
                uid.to_field(),
                public_key.to_der().to_vec(),
                signature.as_bytes().to_vec(),
            ],
            QueryReply::Rejected { message, signature } => vec![
                message.as_bytes().to_vec(),
                signature.as_bytes().to_vec(),
            ],
            QueryReply::Unsigned { message } => vec![message.as_bytes().to_vec()],
        }
    }

    /// Decodes a query reply: three fields are a success, two a signed error,
    /// one a bare error.
    pub fn from_fields(fields: &[Vec<u8>]) -> Result<Self> {
        match fields.len() {
            3 => Ok(QueryReply::Found {
                uid: Uid::from_field(&fields[0])?,
                public_key: PeerKey::from_der(&fields[1])?,
                signature: Signature::from_bytes(fields[2].clone()),
            }),
            2 => Ok(QueryReply::Rejected {
                message: String::from_utf8_lossy(&fields[0]).into_owned(),
                signature: Signature::from_bytes(fields[1].clone()),
            }),
            0 | 1 => Ok(QueryReply::Unsigned {
                message: fields
                    .first()
                    .map(|f| String::from_utf8_lossy(f).into_owned())
                    .unwrap_or_default(),
            }),
            got => Err(ProtocolError::FieldCount {
                context: "uid query reply",
                expected: 3,
                got,
            }),
        }
    }
}

/// Progress of the client side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Uninitialized,
    /// Registration request sent, waiting for the server's reply.
    FirstConnection,
    /// Registration completed during this connection.
    Registered,
    /// Known uid and cached server key; no round trip was needed.
    Authenticated,
    /// A step failed; the connection must be dropped.
    Aborted,
}

/// Client-side handshake state machine.
///
/// Pure message logic: the caller moves fields over a
/// [`crate::session::SecureSession`] and persists the outcome.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    uid: Uid,
    server_key: Option<PeerKey>,
    state: HandshakeState,
}

impl ClientHandshake {
    /// Starts from the configured uid (zero if unregistered) and the cached
    /// server key, if any.
    pub fn new(uid: Uid, server_key: Option<PeerKey>) -> Self {
        Self {
            uid,
            server_key,
            state: HandshakeState::Uninitialized,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Local uid, zero until registration completes.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Server key, once known.
    pub fn server_key(&self) -> Option<&PeerKey> {
        self.server_key.as_ref()
    }

    /// Whether queries may be sent.
    pub fn is_established(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Registered | HandshakeState::Authenticated
        )
    }

    /// Marks the handshake as failed, e.g. when its outcome could not be
    /// persisted. Queries are refused from then on.
    pub fn abort(&mut self) {
        self.state = HandshakeState::Aborted;
    }

    /// Takes the first step.
    ///
    /// Returns the registration request to send for an unregistered client,
    /// or `None` when the client is already authenticated.
    pub fn begin(&mut self, identity: &Identity) -> Result<Option<Request>> {
        if self.state != HandshakeState::Uninitialized {
            return Err(ProtocolError::HandshakeFailed(format!(
                "handshake already started (state {:?})",
                self.state
            )));
        }

        if self.uid.is_server() {
            return match Request::first_connection(identity) {
                Ok(request) => {
                    self.state = HandshakeState::FirstConnection;
                    Ok(Some(request))
                }
                Err(e) => {
                    self.state = HandshakeState::Aborted;
                    Err(e)
                }
            };
        }

        if self.server_key.is_none() {
            self.state = HandshakeState::Aborted;
            return Err(ProtocolError::MissingServerKey);
        }

        self.state = HandshakeState::Authenticated;
        Ok(None)
    }

    /// Verifies the registration reply and adopts the assigned uid and the
    /// server key.
    pub fn complete_registration(&mut self, fields: &[Vec<u8>]) -> Result<Registration> {
        if self.state != HandshakeState::FirstConnection {
            return Err(ProtocolError::HandshakeFailed(format!(
                "no registration in progress (state {:?})",
                self.state
            )));
        }

        if fields.len() < 3 {
            self.state = HandshakeState::Aborted;
            let reason = fields
                .first()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            return Err(ProtocolError::HandshakeFailed(format!(
                "registration refused: {}",
                reason
            )));
        }

        let registration = match Registration::from_fields(fields).and_then(|r| {
            r.verify()?;
            Ok(r)
        }) {
            Ok(registration) => registration,
            Err(e) => {
                self.state = HandshakeState::Aborted;
                return Err(e);
            }
        };

        if registration.uid.is_server() {
            self.state = HandshakeState::Aborted;
            return Err(ProtocolError::Malformed(
                "server assigned the reserved uid 0".to_string(),
            ));
        }

        self.uid = registration.uid;
        self.server_key = Some(registration.server_key.clone());
        self.state = HandshakeState::Registered;
        Ok(registration)
    }

    /// Builds a signed query for `queried`.
    pub fn query_request(&self, identity: &Identity, queried: Uid) -> Result<Request> {
        if !self.is_established() {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        Request::uid_query(identity, self.uid, queried)
    }

    /// Verifies the reply to a query for `queried`.
    ///
    /// A signature failure aborts the handshake. A bare error is returned
    /// without verification.
    pub fn read_query_reply(&mut self, queried: Uid, fields: &[Vec<u8>]) -> Result<QueryReply> {
        if !self.is_established() {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        let server_key = self
            .server_key
            .as_ref()
            .ok_or(ProtocolError::MissingServerKey)?;

        let reply = QueryReply::from_fields(fields)?;
        if let QueryReply::Unsigned { message } = &reply {
            tracing::debug!("Server sent an unsigned error: {}", message);
            return Ok(reply);
        }
        if let Err(e) = reply.verify(server_key) {
            self.state = HandshakeState::Aborted;
            return Err(e);
        }

        if let QueryReply::Found { uid, .. } = &reply {
            if *uid != queried {
                return Err(ProtocolError::Malformed(format!(
                    "reply names uid {} but {} was queried",
                    uid, queried
                )));
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryKeyStore, UidDirectory, UID_LIMIT};
    use crate::identity::testing::{alice, bob, carol};

    fn server() -> &'static Identity {
        carol()
    }

    /// Drives a fresh registration for `client` against `directory`.
    fn register(client: &Identity, directory: &UidDirectory) -> ClientHandshake {
        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        let request = handshake.begin(client).unwrap().unwrap();
        assert_eq!(handshake.state(), HandshakeState::FirstConnection);

        let received = Request::from_fields(&request.to_fields()).unwrap();
        let Request::FirstConnection { ref public_key, .. } = received else {
            panic!("expected a first connection request");
        };
        received.verify(public_key).unwrap();
        let uid = directory.register(public_key.clone()).unwrap();

        let reply = Registration::new(server(), uid).unwrap();
        handshake.complete_registration(&reply.to_fields()).unwrap();
        handshake
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(Command::FirstConnection.tag(), b"first connection");
        assert_eq!(Command::UidQuery.tag(), b"uid query");
        assert_eq!(
            Command::from_tag(b"uid query").unwrap(),
            Command::UidQuery
        );
        assert!(matches!(
            Command::from_tag(b"hello"),
            Err(ProtocolError::UnknownCommand(ref tag)) if tag == "hello"
        ));
    }

    #[test]
    fn test_first_connection_layout() {
        let request = Request::first_connection(alice()).unwrap();
        let fields = request.to_fields();

        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], b"first connection");
        assert_eq!(fields[1], alice().public_key().to_der());

        let payload = codec::encode(&[fields[0].as_slice(), fields[1].as_slice()]);
        let signature = Signature::from_bytes(fields[2].clone());
        assert!(alice().public_key().verify(&payload, &signature).is_ok());
    }

    #[test]
    fn test_uid_query_layout() {
        let request = Request::uid_query(alice(), Uid(12), Uid(34)).unwrap();
        let fields = request.to_fields();

        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], b"uid query");
        assert_eq!(fields[1], b"12");
        assert_eq!(fields[2], b"34");

        let decoded = Request::from_fields(&fields).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.verify(alice().public_key()).is_ok());
    }

    #[test]
    fn test_first_connection_signed_by_other_key_fails() {
        let Request::FirstConnection { signature, .. } =
            Request::first_connection(bob()).unwrap()
        else {
            panic!("expected a first connection request");
        };
        let forged = Request::FirstConnection {
            public_key: alice().public_key().clone(),
            signature,
        };

        let received = Request::from_fields(&forged.to_fields()).unwrap();
        assert!(matches!(
            received.verify(alice().public_key()),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_request_field_count_is_exact() {
        let mut fields = Request::uid_query(alice(), Uid(1), Uid(2))
            .unwrap()
            .to_fields();
        fields.push(b"extra".to_vec());

        assert!(matches!(
            Request::from_fields(&fields),
            Err(ProtocolError::FieldCount {
                expected: 4,
                got: 5,
                ..
            })
        ));

        let short = vec![b"first connection".to_vec(), b"key".to_vec()];
        assert!(matches!(
            Request::from_fields(&short),
            Err(ProtocolError::FieldCount {
                expected: 3,
                got: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_request_rejects_unknown_tag() {
        let fields = vec![b"ping".to_vec(), b"1".to_vec()];
        assert!(matches!(
            Request::from_fields(&fields),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_request_rejects_bad_uid_and_key() {
        let fields = vec![
            b"uid query".to_vec(),
            b"abc".to_vec(),
            b"2".to_vec(),
            b"sig".to_vec(),
        ];
        assert!(matches!(
            Request::from_fields(&fields),
            Err(ProtocolError::Malformed(_))
        ));

        let fields = vec![
            b"first connection".to_vec(),
            b"not der".to_vec(),
            b"sig".to_vec(),
        ];
        assert!(matches!(
            Request::from_fields(&fields),
            Err(ProtocolError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_registration_flow() {
        let directory = UidDirectory::open(MemoryKeyStore::new(), UID_LIMIT).unwrap();
        let handshake = register(alice(), &directory);

        assert_eq!(handshake.state(), HandshakeState::Registered);
        assert!(!handshake.uid().is_server());
        assert!(handshake.uid().to_string().len() <= 11);
        assert_eq!(handshake.server_key(), Some(server().public_key()));
        assert_eq!(
            directory.get(handshake.uid()).unwrap(),
            *alice().public_key()
        );
    }

    #[test]
    fn test_registration_with_altered_uid_aborts() {
        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        handshake.begin(alice()).unwrap();

        let mut fields = Registration::new(server(), Uid(1234)).unwrap().to_fields();
        fields[0] = b"1235".to_vec();

        let err = handshake.complete_registration(&fields).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)));
        assert_eq!(handshake.state(), HandshakeState::Aborted);
        assert!(handshake.uid().is_server());
        assert!(handshake.server_key().is_none());
    }

    #[test]
    fn test_registration_signed_by_other_key_aborts() {
        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        handshake.begin(alice()).unwrap();

        // Server key claimed in the reply, signature made by someone else.
        let genuine = Registration::new(server(), Uid(77)).unwrap();
        let forged = Registration::new(bob(), Uid(77)).unwrap();
        let fields = vec![
            genuine.uid.to_field(),
            genuine.server_key.to_der().to_vec(),
            forged.signature.as_bytes().to_vec(),
        ];

        assert!(handshake.complete_registration(&fields).is_err());
        assert_eq!(handshake.state(), HandshakeState::Aborted);
    }

    #[test]
    fn test_registration_reply_with_wrong_field_count_aborts() {
        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        handshake.begin(alice()).unwrap();

        let mut fields = Registration::new(server(), Uid(3)).unwrap().to_fields();
        fields.push(b"trailing".to_vec());

        let err = handshake.complete_registration(&fields).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldCount { got: 4, .. }));
        assert_eq!(handshake.state(), HandshakeState::Aborted);
    }

    #[test]
    fn test_refused_registration_surfaces_reason() {
        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        handshake.begin(alice()).unwrap();

        let refusal = QueryReply::rejected(server(), "uid space exhausted").unwrap();
        let err = handshake
            .complete_registration(&refusal.to_fields())
            .unwrap_err();
        assert!(err.to_string().contains("uid space exhausted"));
        assert_eq!(handshake.state(), HandshakeState::Aborted);
    }

    #[test]
    fn test_registration_reply_without_request_is_refused() {
        let mut handshake = ClientHandshake::new(Uid(5), Some(server().public_key().clone()));
        let fields = Registration::new(server(), Uid(5)).unwrap().to_fields();
        assert!(handshake.complete_registration(&fields).is_err());
    }

    #[test]
    fn test_returning_client_is_authenticated_without_round_trip() {
        let mut handshake = ClientHandshake::new(Uid(4242), Some(server().public_key().clone()));
        assert!(handshake.begin(alice()).unwrap().is_none());
        assert_eq!(handshake.state(), HandshakeState::Authenticated);
        assert_eq!(handshake.uid(), Uid(4242));
    }

    #[test]
    fn test_returning_client_without_server_key_aborts() {
        let mut handshake = ClientHandshake::new(Uid(4242), None);
        let err = handshake.begin(alice()).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingServerKey));
        assert_eq!(handshake.state(), HandshakeState::Aborted);
    }

    #[test]
    fn test_begin_twice_is_refused() {
        let mut handshake = ClientHandshake::new(Uid(1), Some(server().public_key().clone()));
        handshake.begin(alice()).unwrap();
        assert!(handshake.begin(alice()).is_err());
    }

    #[test]
    fn test_query_before_handshake() {
        let handshake = ClientHandshake::new(Uid::SERVER, None);
        assert!(matches!(
            handshake.query_request(alice(), Uid(1)),
            Err(ProtocolError::HandshakeIncomplete)
        ));

        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        assert!(matches!(
            handshake.read_query_reply(Uid(1), &[]),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn test_query_roundtrip() {
        let directory = UidDirectory::open(MemoryKeyStore::new(), UID_LIMIT).unwrap();
        let mut alice_side = register(alice(), &directory);
        let bob_side = register(bob(), &directory);

        let request = alice_side.query_request(alice(), bob_side.uid()).unwrap();
        let received = Request::from_fields(&request.to_fields()).unwrap();
        let Request::UidQuery {
            requester, queried, ..
        } = received
        else {
            panic!("expected a uid query");
        };
        received.verify(&directory.get(requester).unwrap()).unwrap();

        let reply =
            QueryReply::found(server(), queried, directory.get(queried).unwrap()).unwrap();
        let read = alice_side
            .read_query_reply(bob_side.uid(), &reply.to_fields())
            .unwrap();

        match read {
            QueryReply::Found { uid, public_key, .. } => {
                assert_eq!(uid, bob_side.uid());
                assert_eq!(public_key, *bob().public_key());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_rejected_reply() {
        let mut handshake = ClientHandshake::new(Uid(9), Some(server().public_key().clone()));
        handshake.begin(alice()).unwrap();

        let reply = QueryReply::rejected(server(), "unknown uid: 31337").unwrap();
        let fields = reply.to_fields();
        assert_eq!(fields.len(), 2);

        match handshake.read_query_reply(Uid(31337), &fields).unwrap() {
            QueryReply::Rejected { message, .. } => assert_eq!(message, "unknown uid: 31337"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_reply_with_mismatched_uid() {
        let mut handshake = ClientHandshake::new(Uid(9), Some(server().public_key().clone()));
        handshake.begin(alice()).unwrap();

        let reply = QueryReply::found(server(), Uid(100), bob().public_key().clone()).unwrap();
        let err = handshake
            .read_query_reply(Uid(101), &reply.to_fields())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_reply_signed_by_other_key_aborts() {
        let mut handshake = ClientHandshake::new(Uid(9), Some(server().public_key().clone()));
        handshake.begin(alice()).unwrap();

        let reply = QueryReply::found(bob(), Uid(100), bob().public_key().clone()).unwrap();
        let err = handshake
            .read_query_reply(Uid(100), &reply.to_fields())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature(_)));
        assert_eq!(handshake.state(), HandshakeState::Aborted);
    }

    #[test]
    fn test_single_field_reply_is_bare_error() {
        let mut handshake = ClientHandshake::new(Uid(9), Some(server().public_key().clone()));
        handshake.begin(alice()).unwrap();

        let fields = vec![b"server busy".to_vec()];
        match handshake.read_query_reply(Uid(100), &fields).unwrap() {
            QueryReply::Unsigned { message } => assert_eq!(message, "server busy"),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(handshake.is_established());

        let bare = QueryReply::from_fields(&fields).unwrap();
        assert!(matches!(
            bare.verify(server().public_key()),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_reply_with_too_many_fields() {
        let fields = vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()];
        assert!(matches!(
            QueryReply::from_fields(&fields),
            Err(ProtocolError::FieldCount { got: 4, .. })
        ));
    }

    #[test]
    fn test_single_field_registration_reply_is_refusal() {
        let mut handshake = ClientHandshake::new(Uid::SERVER, None);
        handshake.begin(alice()).unwrap();

        let err = handshake
            .complete_registration(&[b"maintenance".to_vec()])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "handshake failed: registration refused: maintenance"
        );
        assert_eq!(handshake.state(), HandshakeState::Aborted);
    }

    #[test]
    fn test_abort_stops_queries() {
        let directory = UidDirectory::open(MemoryKeyStore::new(), UID_LIMIT).unwrap();
        let mut handshake = register(alice(), &directory);
        assert!(handshake.query_request(alice(), Uid(1)).is_ok());

        handshake.abort();
        assert_eq!(handshake.state(), HandshakeState::Aborted);
        assert!(matches!(
            handshake.query_request(alice(), Uid(1)),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }
}
