//! NAT traversal through the rendezvous server.
//!
//! For each candidate address: ask the server to relay a traversal request,
//! wait for the remote to punch its side, then open a fresh socket to the
//! candidate and exchange Hellos. The first candidate to complete both
//! directions wins.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use datum_core::crypto::Keypair;
use datum_core::wire::{HelloBody, Message, MessageId, MessageType};

use super::server::{LinkError, ServerHandle};
use crate::transport::{Reply, Resend, RetrySchedule, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("no candidate answered: tried {0:?}")]
    Unreachable(Vec<SocketAddr>),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Why one candidate did not work out.
#[derive(Debug, thiserror::Error)]
enum PunchError {
    #[error("candidate stayed silent")]
    Silent,

    #[error("candidate never sent its own Hello")]
    NoHello,

    #[error("candidate never acknowledged our Hello")]
    NoReply,

    #[error("unexpected {0:?} during traversal")]
    Unexpected(MessageType),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Traversal {
    server: ServerHandle,
    keypair: Arc<Keypair>,
    schedule: RetrySchedule,
    name: String,
    settle: Duration,
}

impl Traversal {
    pub fn new(
        server: ServerHandle,
        keypair: Arc<Keypair>,
        schedule: RetrySchedule,
        name: impl Into<String>,
        settle: Duration,
    ) -> Self {
        Self {
            server,
            keypair,
            schedule,
            name: name.into(),
            settle,
        }
    }

    /// Try each candidate in order. Returns a transport on which both
    /// sides have seen each other's Hello.
    pub async fn reach(&self, candidates: &[SocketAddr]) -> Result<Transport, NatError> {
        for &addr in candidates {
            self.server.request_traversal(addr).await?;
            tokio::time::sleep(self.settle).await;

            let mut transport =
                match Transport::connect(addr, self.keypair.clone(), self.schedule.clone()).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        tracing::warn!(%addr, error = %e, "cannot open socket for candidate");
                        continue;
                    }
                };
            match punch(&mut transport, &self.name).await {
                Ok(()) => {
                    tracing::info!(%addr, "NAT traversal succeeded");
                    return Ok(transport);
                }
                Err(e) => tracing::warn!(%addr, error = %e, "NAT traversal failed"),
            }
        }
        Err(NatError::Unreachable(candidates.to_vec()))
    }
}

/// Send our Hello, then require both a Hello from the remote (which we
/// answer) and a HelloReply to ours, in either order.
async fn punch(transport: &mut Transport, name: &str) -> Result<(), PunchError> {
    let body = HelloBody::new(name).encode();
    let hello = Message::new(MessageId::random(), MessageType::Hello, body.clone());
    transport.send(&hello).await?;

    let mut greeted = false;
    let mut acked = false;

    let first = transport.listen().await?.ok_or(PunchError::Silent)?;
    match first.kind {
        MessageType::Hello if !first.id.is_zero() => {
            greet(transport, &first, &body).await?;
            greeted = true;
        }
        MessageType::HelloReply if first.id == hello.id => acked = true,
        other => return Err(PunchError::Unexpected(other)),
    }

    if !acked {
        match transport.request(&hello, Resend::Yes).await? {
            Reply::Answer(reply) if reply.kind == MessageType::HelloReply => {}
            Reply::Answer(reply) => return Err(PunchError::Unexpected(reply.kind)),
            Reply::Timeout { .. } => return Err(PunchError::NoReply),
        }
    }

    if !greeted {
        match transport.listen().await? {
            Some(msg) if msg.kind == MessageType::Hello && !msg.id.is_zero() => {
                greet(transport, &msg, &body).await?;
            }
            _ => return Err(PunchError::NoHello),
        }
    }
    Ok(())
}

async fn greet(transport: &Transport, hello: &Message, body: &Bytes) -> Result<(), PunchError> {
    let reply = Message::new(hello.id, MessageType::HelloReply, body.clone());
    transport.send(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::server::ServerLink;
    use crate::testing::{pair, schedule};

    #[tokio::test]
    async fn punch_completes_when_remote_greets_first() {
        let (mut local, mut remote) = pair().await;
        tokio::spawn(async move {
            let ours = remote.recv().await.unwrap();
            let theirs = Message::new(MessageId([4, 4, 4, 4]), MessageType::Hello, vec![0u8; 4]);
            remote.send(&theirs).await.unwrap();
            let ack = remote.recv().await.unwrap();
            assert_eq!(ack.kind, MessageType::HelloReply);
            assert_eq!(ack.id, theirs.id);
            // Our Hello is resent by the request loop; answer the next copy.
            let again = remote.recv().await.unwrap();
            assert_eq!(again.id, ours.id);
            remote
                .send(&Message::new(ours.id, MessageType::HelloReply, vec![0u8; 4]))
                .await
                .unwrap();
        });
        punch(&mut local, "me").await.unwrap();
    }

    #[tokio::test]
    async fn silent_candidates_are_unreachable() {
        let (server_side, _server_peer) = pair().await;
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let (link, handle) = ServerLink::new(
            server_side,
            "me",
            Duration::from_secs(3600),
            shutdown_tx.subscribe(),
        );
        tokio::spawn(link.run());

        // Bound but never read.
        let dead = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let traversal = Traversal::new(
            handle,
            Arc::new(Keypair::generate()),
            schedule(),
            "me",
            Duration::from_millis(1),
        );
        match traversal.reach(&[dead.local_addr().unwrap()]).await {
            Err(NatError::Unreachable(tried)) => assert_eq!(tried.len(), 1),
            Err(other) => panic!("expected Unreachable, got {other}"),
            Ok(_) => panic!("dead candidate must not be reachable"),
        }
    }
}
