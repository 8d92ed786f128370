//! Peer sessions: a handshaken transport plus what we learned about the peer.

pub mod handshake;
pub mod nat;
pub mod server;

pub use handshake::{Handshake, HandshakeError, Phase, PeerInfo, ProtocolError};
pub use nat::{NatError, Traversal};
pub use server::{traversal_body, LinkError, ServerHandle, ServerLink};

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use datum_core::crypto::Keypair;
use datum_core::merkle::Hash;
use datum_core::wire::{Message, MessageId, MessageType};

use crate::fetch::Fetcher;
use crate::transport::{Reply, Resend, RetrySchedule, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no candidate completed a handshake: tried {0:?}")]
    Unreachable(Vec<SocketAddr>),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A transport whose handshake has completed.
pub struct PeerSession {
    transport: Transport,
    peer: PeerInfo,
}

impl PeerSession {
    /// Run the initiating handshake over `transport`.
    pub async fn establish(
        mut transport: Transport,
        name: &str,
        local_root: Hash,
    ) -> Result<Self, HandshakeError> {
        let peer = Handshake::new(&mut transport, name, local_root)
            .initiate()
            .await?;
        tracing::info!(
            peer = %transport.peer_addr(),
            name = peer.name.as_deref().unwrap_or(""),
            root = peer.root.map(hex::encode).unwrap_or_default(),
            "session established"
        );
        Ok(Self { transport, peer })
    }

    /// Run the accepting handshake over `transport`.
    pub async fn accept(
        mut transport: Transport,
        name: &str,
        local_root: Hash,
    ) -> Result<Self, HandshakeError> {
        let peer = Handshake::new(&mut transport, name, local_root)
            .accept()
            .await?;
        tracing::info!(
            peer = %transport.peer_addr(),
            name = peer.name.as_deref().unwrap_or(""),
            "session accepted"
        );
        Ok(Self { transport, peer })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn into_transport(self) -> Transport {
        self.transport
    }

    pub fn fetcher(&mut self, integrity_retries: u32) -> Fetcher<'_> {
        Fetcher::new(&mut self.transport, integrity_retries)
    }

    /// Ask the peer for its current root. Our own root goes in the body.
    pub async fn request_root(&mut self, local_root: Hash) -> Result<Hash, HandshakeError> {
        let request = Message::new(
            MessageId::random(),
            MessageType::Root,
            Bytes::copy_from_slice(&local_root),
        );
        let reply = match self.transport.request(&request, Resend::Yes).await? {
            Reply::Answer(reply) => reply,
            Reply::Timeout { .. } => return Err(HandshakeError::Timeout(Phase::Ready)),
        };
        match reply.kind {
            MessageType::RootReply => {}
            MessageType::Error => {
                return Err(HandshakeError::Remote {
                    phase: Phase::Ready,
                    reason: reply.reason(),
                })
            }
            other => {
                return Err(ProtocolError::UnexpectedType {
                    phase: Phase::Ready,
                    expected: MessageType::RootReply,
                    got: other,
                }
                .into())
            }
        }
        let root = Hash::try_from(&reply.body[..]).map_err(|_| ProtocolError::BadBody {
            kind: MessageType::RootReply,
            reason: format!("expected 32 bytes, got {}", reply.body.len()),
        })?;
        self.peer.root = Some(root);
        Ok(root)
    }
}

/// Handshake with each candidate in turn; the first to succeed wins.
pub async fn connect_any(
    candidates: &[SocketAddr],
    keypair: Arc<Keypair>,
    schedule: RetrySchedule,
    name: &str,
    local_root: Hash,
) -> Result<PeerSession, SessionError> {
    for &addr in candidates {
        let transport = Transport::connect(addr, keypair.clone(), schedule.clone()).await?;
        match PeerSession::establish(transport, name, local_root).await {
            Ok(session) => return Ok(session),
            Err(e) => tracing::warn!(%addr, error = %e, "candidate failed"),
        }
    }
    Err(SessionError::Unreachable(candidates.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serve::Responder;
    use crate::testing::schedule;
    use crate::transport::Answerer;
    use datum_core::merkle::EMPTY_ROOT;
    use datum_services::export_bytes;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn connect_any_skips_dead_candidates() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let live = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let keypair = Arc::new(Keypair::generate());
        let dag = Arc::new(export_bytes(b"served"));
        let root = dag.root_hash();
        let responder = Responder::new("server", &keypair, dag);

        tokio::spawn(async move {
            let transport = Transport::accept(live, keypair, schedule()).await.unwrap();
            let mut session = PeerSession::accept(transport, "server", root).await.unwrap();
            let transport = session.transport_mut();
            loop {
                let msg = transport.recv().await.unwrap();
                if let Some(reply) = responder.answer(&msg) {
                    transport.send(&reply).await.unwrap();
                }
            }
        });

        let candidates = [dead.local_addr().unwrap(), live_addr];
        let mut session = connect_any(
            &candidates,
            Arc::new(Keypair::generate()),
            schedule(),
            "client",
            EMPTY_ROOT,
        )
        .await
        .unwrap();

        assert_eq!(session.peer().name.as_deref(), Some("server"));
        assert_eq!(session.peer().root, Some(root));
        assert_eq!(session.transport().peer_addr(), live_addr);
        assert_eq!(session.request_root(EMPTY_ROOT).await.unwrap(), root);
    }
}
