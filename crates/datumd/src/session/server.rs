//! Rendezvous server link.
//!
//! One task owns the transport to the server. It re-sends Hello every
//! heartbeat interval to keep the registration alive, answers whatever the
//! server asks in between, and forwards NAT traversal requests it receives
//! over its command channel. Nothing else touches this socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use datum_core::wire::{HelloBody, Message, MessageId, MessageType};

use crate::transport::{Reply, Resend, Transport, TransportError};

pub enum ServerCommand {
    /// Ask the server to tell `peer` to send us a packet.
    NatTraversal {
        peer: SocketAddr,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("server link task has stopped")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Cloneable handle for talking to the [`ServerLink`] task.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    /// Send a NatTraversalRequest for `peer` through the server.
    pub async fn request_traversal(&self, peer: SocketAddr) -> Result<(), LinkError> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(ServerCommand::NatTraversal { peer, done })
            .await
            .map_err(|_| LinkError::Closed)?;
        result.await.map_err(|_| LinkError::Closed)??;
        Ok(())
    }
}

pub struct ServerLink {
    transport: Transport,
    hello: Bytes,
    interval: Duration,
    commands: mpsc::Receiver<ServerCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl ServerLink {
    /// `transport` should have completed its handshake with the server.
    pub fn new(
        transport: Transport,
        name: &str,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, ServerHandle) {
        let (tx, commands) = mpsc::channel(8);
        let link = Self {
            transport,
            hello: HelloBody::new(name).encode(),
            interval,
            commands,
            shutdown,
        };
        (link, ServerHandle { tx })
    }

    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        tracing::info!(server = %self.transport.peer_addr(), "server link running");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("server link shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.heartbeat().await?;
                }
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => commands_open = false,
                },
                msg = self.transport.recv() => {
                    let msg = msg?;
                    if msg.kind == MessageType::Error {
                        tracing::warn!(id = %msg.id, reason = %msg.reason(), "server reported error");
                    } else if !self.transport.answer(&msg).await? {
                        tracing::debug!(id = %msg.id, kind = ?msg.kind, "ignoring server message");
                    }
                }
            }
        }
    }

    /// Fresh-Id Hello. A failed heartbeat is logged; the next one retries.
    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        let hello = Message::new(MessageId::random(), MessageType::Hello, self.hello.clone());
        match self.transport.request(&hello, Resend::Yes).await? {
            Reply::Answer(reply) if reply.kind == MessageType::HelloReply => {
                tracing::debug!(id = %hello.id, "heartbeat acknowledged");
            }
            Reply::Answer(reply) => {
                tracing::warn!(kind = ?reply.kind, reason = %reply.reason(), "heartbeat refused");
            }
            Reply::Timeout { .. } => {
                tracing::warn!(server = %self.transport.peer_addr(), "heartbeat timed out");
            }
        }
        Ok(())
    }

    async fn handle(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::NatTraversal { peer, done } => {
                let request = Message::new(
                    MessageId::random(),
                    MessageType::NatTraversalRequest,
                    traversal_body(peer),
                );
                let result = self.transport.send(&request).await;
                tracing::info!(%peer, ok = result.is_ok(), "NAT traversal requested");
                let _ = done.send(result);
            }
        }
    }
}

/// NatTraversalRequest body: IP bytes (4 or 16) then big-endian port.
pub fn traversal_body(addr: SocketAddr) -> Bytes {
    let mut out = BytesMut::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(ip) => out.put_slice(&ip.octets()),
        IpAddr::V6(ip) => out.put_slice(&ip.octets()),
    }
    out.put_u16(addr.port());
    out.freeze()
}
