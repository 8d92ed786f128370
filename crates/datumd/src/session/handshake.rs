//! Handshake — Hello, PublicKey and Root exchange over one transport.
//!
//! Initiator:
//!   → Hello            ← HelloReply (same Id)
//!   ← PublicKey        → PublicKeyReply (our key)
//!   ← Root             → RootReply (our root)
//!
//! The accepting side runs the mirror image. The peer key learned from the
//! PublicKey exchange is installed on the transport, so every datagram after
//! it must carry a valid signature.

use bytes::Bytes;
use datum_core::crypto::PublicKey;
use datum_core::merkle::{Hash, HASH_LEN};
use datum_core::wire::{HelloBody, Message, MessageId, MessageType, WireError};

use crate::transport::{Reply, Resend, Transport, TransportError};

/// Where a handshake has got to. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    HelloSent,
    HelloAcked,
    KeyExchanged,
    RootExchanged,
    Ready,
}

/// What the handshake learned about the remote peer.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub name: Option<String>,
    pub public_key: Option<PublicKey>,
    pub root: Option<Hash>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no reply while {0:?}")]
    Timeout(Phase),

    #[error("peer reported an error while {phase:?}: {reason}")]
    Remote { phase: Phase, reason: String },

    #[error("peer signature does not match its advertised key: {0}")]
    Auth(WireError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The peer answered, but not in a way the protocol allows.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("reply Id {got} does not match request Id {expected}")]
    IdMismatch { expected: MessageId, got: MessageId },

    #[error("expected {expected:?} while {phase:?}, got {got:?}")]
    UnexpectedType {
        phase: Phase,
        expected: MessageType,
        got: MessageType,
    },

    #[error("malformed {kind:?} body: {reason}")]
    BadBody { kind: MessageType, reason: String },
}

/// One handshake over a borrowed transport.
pub struct Handshake<'a> {
    transport: &'a mut Transport,
    name: &'a str,
    local_root: Hash,
    phase: Phase,
    peer: PeerInfo,
    /// Our last reply, resent if the peer repeats the request it answered.
    last_reply: Option<Message>,
}

impl<'a> Handshake<'a> {
    pub fn new(transport: &'a mut Transport, name: &'a str, local_root: Hash) -> Self {
        Self {
            transport,
            name,
            local_root,
            phase: Phase::Init,
            peer: PeerInfo::default(),
            last_reply: None,
        }
    }

    /// Run the handshake from the side that sends Hello.
    pub async fn initiate(mut self) -> Result<PeerInfo, HandshakeError> {
        let hello = Message::new(
            MessageId::random(),
            MessageType::Hello,
            HelloBody::new(self.name).encode(),
        );
        self.phase = Phase::HelloSent;
        let reply = self.exchange(&hello, MessageType::HelloReply).await?;
        self.peer.name = HelloBody::parse(&reply.body).ok().map(|body| body.name);
        self.advance(Phase::HelloAcked);

        let request = self.await_request(MessageType::PublicKey, hello.id).await?;
        let key = parse_key(&request)?;
        self.install_key(key, &request)?;
        let own_key = self.transport.keypair().public().to_bytes();
        self.reply(&request, MessageType::PublicKeyReply, Bytes::copy_from_slice(&own_key))
            .await?;
        self.advance(Phase::KeyExchanged);

        let request = self.await_request(MessageType::Root, hello.id).await?;
        self.peer.root = Some(parse_root(&request)?);
        let root = Bytes::copy_from_slice(&self.local_root);
        self.reply(&request, MessageType::RootReply, root).await?;
        self.advance(Phase::RootExchanged);

        self.advance(Phase::Ready);
        Ok(self.peer)
    }

    /// Run the handshake from the side that receives Hello.
    pub async fn accept(mut self) -> Result<PeerInfo, HandshakeError> {
        let hello = self
            .await_request(MessageType::Hello, MessageId::ZERO)
            .await?;
        self.peer.name = HelloBody::parse(&hello.body).ok().map(|body| body.name);
        let body = HelloBody::new(self.name).encode();
        self.reply(&hello, MessageType::HelloReply, body).await?;
        self.advance(Phase::HelloAcked);

        let own_key = self.transport.keypair().public().to_bytes();
        let request = Message::new(
            MessageId::random(),
            MessageType::PublicKey,
            Bytes::copy_from_slice(&own_key),
        );
        let reply = self.exchange(&request, MessageType::PublicKeyReply).await?;
        let key = parse_key(&reply)?;
        self.install_key(key, &reply)?;
        self.advance(Phase::KeyExchanged);

        let request = Message::new(
            MessageId::random(),
            MessageType::Root,
            Bytes::copy_from_slice(&self.local_root),
        );
        let reply = self.exchange(&request, MessageType::RootReply).await?;
        self.peer.root = Some(parse_root(&reply)?);
        self.advance(Phase::RootExchanged);

        self.advance(Phase::Ready);
        Ok(self.peer)
    }

    fn advance(&mut self, phase: Phase) {
        tracing::debug!(
            peer = %self.transport.peer_addr(),
            from = ?self.phase,
            to = ?phase,
            "handshake phase"
        );
        self.phase = phase;
    }

    /// Send a request and insist on a reply of type `expected`.
    async fn exchange(
        &mut self,
        request: &Message,
        expected: MessageType,
    ) -> Result<Message, HandshakeError> {
        match self.transport.request(request, Resend::Yes).await? {
            Reply::Answer(reply) if reply.kind == expected => Ok(reply),
            Reply::Answer(reply) => Err(self.unexpected(reply, expected).await),
            Reply::Timeout { stray: Some(stray) } if stray.kind == expected => {
                let err = ProtocolError::IdMismatch {
                    expected: request.id,
                    got: stray.id,
                };
                self.complain(stray.id, &err).await;
                Err(err.into())
            }
            Reply::Timeout { stray: Some(stray) } if stray.kind == MessageType::Error => {
                Err(HandshakeError::Remote {
                    phase: self.phase,
                    reason: stray.reason(),
                })
            }
            Reply::Timeout { .. } => Err(HandshakeError::Timeout(self.phase)),
        }
    }

    /// Wait for the peer to send a request of type `expected`. Repeats of
    /// the previous request are answered again; a late duplicate reply to
    /// our own Hello (`answered`) is skipped.
    async fn await_request(
        &mut self,
        expected: MessageType,
        answered: MessageId,
    ) -> Result<Message, HandshakeError> {
        loop {
            let Some(msg) = self.transport.listen().await? else {
                return Err(HandshakeError::Timeout(self.phase));
            };
            if msg.kind == expected {
                return Ok(msg);
            }
            if msg.kind.is_reply() && msg.id == answered && !answered.is_zero() {
                tracing::trace!(id = %msg.id, "skipping duplicate reply");
                continue;
            }
            if let Some(last) = &self.last_reply {
                if last.id == msg.id {
                    let last = last.clone();
                    self.transport.send(&last).await?;
                    continue;
                }
            }
            return Err(self.unexpected(msg, expected).await);
        }
    }

    async fn reply(
        &mut self,
        request: &Message,
        kind: MessageType,
        body: Bytes,
    ) -> Result<(), HandshakeError> {
        let reply = Message::new(request.id, kind, body);
        self.transport.send(&reply).await?;
        self.last_reply = Some(reply);
        Ok(())
    }

    /// Accept the peer's advertised key. A message that was signed before
    /// the key was known must verify against it. Advertising no key leaves
    /// an already pinned key in place.
    fn install_key(
        &mut self,
        key: Option<PublicKey>,
        carrier: &Message,
    ) -> Result<(), HandshakeError> {
        if let Some(key) = &key {
            if carrier.signature.is_some() {
                carrier.verify(key).map_err(HandshakeError::Auth)?;
            }
            self.transport.set_peer_key(Some(key.clone()));
        }
        self.peer.public_key = key;
        Ok(())
    }

    async fn unexpected(&mut self, msg: Message, expected: MessageType) -> HandshakeError {
        if msg.kind == MessageType::Error {
            return HandshakeError::Remote {
                phase: self.phase,
                reason: msg.reason(),
            };
        }
        let err = ProtocolError::UnexpectedType {
            phase: self.phase,
            expected,
            got: msg.kind,
        };
        self.complain(msg.id, &err).await;
        err.into()
    }

    /// Tell the peer what went wrong. Failures to send are only logged.
    async fn complain(&self, id: MessageId, err: &ProtocolError) {
        tracing::warn!(peer = %self.transport.peer_addr(), error = %err, "handshake failed");
        if let Err(e) = self.transport.send(&Message::error(id, err.to_string())).await {
            tracing::debug!(error = %e, "could not report handshake failure");
        }
    }
}

/// PublicKey / PublicKeyReply body: 64 key bytes, or empty for "no key".
fn parse_key(msg: &Message) -> Result<Option<PublicKey>, ProtocolError> {
    if msg.body.is_empty() {
        return Ok(None);
    }
    PublicKey::from_bytes(&msg.body)
        .map(Some)
        .map_err(|e| ProtocolError::BadBody {
            kind: msg.kind,
            reason: e.to_string(),
        })
}

fn parse_root(msg: &Message) -> Result<Hash, ProtocolError> {
    Hash::try_from(&msg.body[..]).map_err(|_| ProtocolError::BadBody {
        kind: msg.kind,
        reason: format!("expected {HASH_LEN} bytes, got {}", msg.body.len()),
    })
}
