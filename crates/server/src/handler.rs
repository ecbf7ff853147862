//! Request handler: turns one decoded request into the server's reply.
//!
//! The handler is synchronous and holds no per-connection state. The
//! connection loop in [`crate::server`] feeds it every received message and
//! decides from the result whether to reply, reply and close, or just close.

use std::sync::Arc;

use protocol::{
    Identity, PeerKey, ProtocolError, QueryReply, Registration, Request, Uid, UidDirectory,
};
use tracing::{debug, info};

/// Result type for handler operations: the reply fields on success.
pub type HandlerResult = Result<Vec<Vec<u8>>, HandlerError>;

/// Reasons a request is not answered normally.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Wrong field count, unknown tag or unparsable field.
    #[error("invalid request: {0}")]
    InvalidRequest(ProtocolError),

    /// A signature did not verify.
    #[error("authentication error: {0}")]
    Auth(ProtocolError),

    /// The query names a requester that never registered.
    #[error("unknown requester: {0}")]
    UnknownRequester(Uid),

    /// The directory cannot serve the request, e.g. no uid is left to
    /// assign.
    #[error(transparent)]
    Directory(ProtocolError),

    /// Directory, storage or signing failure on our side.
    #[error("internal error: {0}")]
    Internal(ProtocolError),
}

impl HandlerError {
    /// Whether the peer gets a signed explanation before the connection is
    /// closed.
    ///
    /// Unknown requesters and directory refusals are told why. Forged
    /// requests are dropped silently and malformed ones carry nothing worth
    /// answering.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            HandlerError::UnknownRequester(_) | HandlerError::Directory(_)
        )
    }
}

/// Answers registration and lookup requests against the shared directory.
pub struct RequestHandler {
    identity: Arc<Identity>,
    directory: Arc<UidDirectory>,
}

impl RequestHandler {
    /// Creates a handler signing with `identity` and reading `directory`.
    pub fn new(identity: Arc<Identity>, directory: Arc<UidDirectory>) -> Self {
        Self {
            identity,
            directory,
        }
    }

    /// Handles one request and returns the reply fields.
    pub fn handle(&self, fields: &[Vec<u8>]) -> HandlerResult {
        let request = Request::from_fields(fields).map_err(HandlerError::InvalidRequest)?;
        debug!("Handling {:?} request", request.command());

        match &request {
            Request::FirstConnection { public_key, .. } => {
                self.first_connection(&request, public_key)
            }
            Request::UidQuery {
                requester, queried, ..
            } => self.uid_query(&request, *requester, *queried),
        }
    }

    /// Signed error reply for a request that failed with `error`, if the
    /// peer is to be told.
    pub fn error_reply(&self, error: &HandlerError) -> Option<Vec<Vec<u8>>> {
        if !error.is_reported() {
            return None;
        }
        QueryReply::rejected(&self.identity, error.to_string())
            .ok()
            .map(|reply| reply.to_fields())
    }

    fn first_connection(&self, request: &Request, public_key: &PeerKey) -> HandlerResult {
        request.verify(public_key).map_err(HandlerError::Auth)?;

        let uid = self
            .directory
            .register(public_key.clone())
            .map_err(|e| match e {
                ProtocolError::DirectoryExhausted { .. } => HandlerError::Directory(e),
                e => HandlerError::Internal(e),
            })?;
        info!("Registered new client as uid {}", uid);

        let reply = Registration::new(&self.identity, uid).map_err(HandlerError::Internal)?;
        Ok(reply.to_fields())
    }

    fn uid_query(&self, request: &Request, requester: Uid, queried: Uid) -> HandlerResult {
        let requester_key = match self.directory.get(requester) {
            Ok(key) => key,
            Err(ProtocolError::UnknownUid { .. }) => {
                return Err(HandlerError::UnknownRequester(requester))
            }
            Err(e) => return Err(HandlerError::Internal(e)),
        };
        request.verify(&requester_key).map_err(HandlerError::Auth)?;

        let reply = match self.directory.get(queried) {
            Ok(key) => {
                debug!("uid {} looked up uid {}", requester, queried);
                QueryReply::found(&self.identity, queried, key)
            }
            Err(e @ ProtocolError::UnknownUid { .. }) => {
                debug!("uid {} looked up unknown uid {}", requester, queried);
                QueryReply::rejected(&self.identity, e.to_string())
            }
            Err(e) => return Err(HandlerError::Internal(e)),
        }
        .map_err(HandlerError::Internal)?;

        Ok(reply.to_fields())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{MemoryKeyStore, DEFAULT_KEY_BITS, UID_LIMIT};
    use std::sync::OnceLock;

    fn identity(slot: usize) -> &'static Identity {
        static IDENTITIES: OnceLock<Vec<Identity>> = OnceLock::new();
        &IDENTITIES.get_or_init(|| {
            (0..3)
                .map(|_| Identity::generate(DEFAULT_KEY_BITS).unwrap())
                .collect()
        })[slot]
    }

    fn server_identity() -> &'static Identity {
        identity(0)
    }

    fn handler() -> RequestHandler {
        let directory = UidDirectory::open(MemoryKeyStore::new(), UID_LIMIT).unwrap();
        RequestHandler::new(Arc::new(server_identity().clone()), Arc::new(directory))
    }

    fn register(handler: &RequestHandler, client: &Identity) -> Uid {
        let request = Request::first_connection(client).unwrap();
        let reply = handler.handle(&request.to_fields()).unwrap();
        let registration = Registration::from_fields(&reply).unwrap();
        registration.verify().unwrap();
        registration.uid
    }

    #[test]
    fn test_first_connection_registers_client() {
        let handler = handler();
        let uid = register(&handler, identity(1));

        assert!(!uid.is_server());
        assert_eq!(handler.directory.get(uid).unwrap(), *identity(1).public_key());
    }

    #[test]
    fn test_registration_reply_carries_server_key() {
        let handler = handler();
        let request = Request::first_connection(identity(1)).unwrap();
        let reply = handler.handle(&request.to_fields()).unwrap();

        let registration = Registration::from_fields(&reply).unwrap();
        assert_eq!(registration.server_key, *server_identity().public_key());
    }

    #[test]
    fn test_first_connection_with_forged_signature() {
        let handler = handler();
        let mut fields = Request::first_connection(identity(1)).unwrap().to_fields();
        let other = Request::first_connection(identity(2)).unwrap().to_fields();
        fields[2] = other[2].clone();

        let err = handler.handle(&fields).unwrap_err();
        assert!(matches!(err, HandlerError::Auth(_)));
        assert!(handler.error_reply(&err).is_none());
        assert!(handler.directory.list().unwrap().is_empty());
    }

    #[test]
    fn test_query_for_registered_uid() {
        let handler = handler();
        let alice = register(&handler, identity(1));
        let bob = register(&handler, identity(2));

        let request = Request::uid_query(identity(1), alice, bob).unwrap();
        let reply = handler.handle(&request.to_fields()).unwrap();

        match QueryReply::from_fields(&reply).unwrap() {
            QueryReply::Found {
                uid,
                public_key,
                ..
            } => {
                assert_eq!(uid, bob);
                assert_eq!(public_key, *identity(2).public_key());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_query_for_unknown_uid_is_signed_rejection() {
        let handler = handler();
        let alice = register(&handler, identity(1));

        let request = Request::uid_query(identity(1), alice, Uid(999)).unwrap();
        let reply = handler.handle(&request.to_fields()).unwrap();
        assert_eq!(reply.len(), 2);

        let parsed = QueryReply::from_fields(&reply).unwrap();
        parsed.verify(server_identity().public_key()).unwrap();
        match parsed {
            QueryReply::Rejected { message, .. } => assert_eq!(message, "unknown uid: 999"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_query_from_unknown_requester() {
        let handler = handler();
        let request = Request::uid_query(identity(1), Uid(4242), Uid(1)).unwrap();

        let err = handler.handle(&request.to_fields()).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownRequester(Uid(4242))));

        let reply = handler.error_reply(&err).unwrap();
        match QueryReply::from_fields(&reply).unwrap() {
            QueryReply::Rejected { message, .. } => {
                assert_eq!(message, "unknown requester: 4242")
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_query_signed_by_wrong_key() {
        let handler = handler();
        let alice = register(&handler, identity(1));
        let bob = register(&handler, identity(2));

        // Bob signs a query claiming to be Alice.
        let request = Request::uid_query(identity(2), alice, bob).unwrap();
        let err = handler.handle(&request.to_fields()).unwrap_err();
        assert!(matches!(err, HandlerError::Auth(_)));
        assert!(handler.error_reply(&err).is_none());
    }

    #[test]
    fn test_structural_errors() {
        let handler = handler();

        let err = handler
            .handle(&[b"hello".to_vec(), b"world".to_vec()])
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::InvalidRequest(ProtocolError::UnknownCommand(_))
        ));

        let err = handler
            .handle(&[b"uid query".to_vec(), b"1".to_vec()])
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::InvalidRequest(ProtocolError::FieldCount { .. })
        ));

        let err = handler
            .handle(&[
                b"first connection".to_vec(),
                b"garbage".to_vec(),
                b"sig".to_vec(),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::InvalidRequest(ProtocolError::MalformedKey(_))
        ));
        assert!(handler.error_reply(&err).is_none());
    }

    #[test]
    fn test_exhausted_directory_refuses_registration() {
        let directory = UidDirectory::open(MemoryKeyStore::new(), 2).unwrap();
        let handler =
            RequestHandler::new(Arc::new(server_identity().clone()), Arc::new(directory));

        register(&handler, identity(1));
        let request = Request::first_connection(identity(2)).unwrap();
        let err = handler.handle(&request.to_fields()).unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Directory(ProtocolError::DirectoryExhausted { limit: 1 })
        ));

        // The refusal is a signed two-field reply the client can verify.
        let reply = handler.error_reply(&err).unwrap();
        assert_eq!(reply.len(), 2);
        let refusal = QueryReply::from_fields(&reply).unwrap();
        refusal.verify(server_identity().public_key()).unwrap();
        match refusal {
            QueryReply::Rejected { message, .. } => assert_eq!(
                message,
                "uid space exhausted: all 1 identifiers are taken"
            ),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
