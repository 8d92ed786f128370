//! Reliable request/response over one UDP socket.
//!
//! Every request is sent and then awaited under a read deadline that
//! starts at `initial` and doubles on each inner attempt. After
//! `inner_attempts` silent deadlines the identical bytes are resent, for
//! up to `outer_attempts` cycles. Running out of attempts is reported as
//! [`Reply::Timeout`], not as an error; callers branch on it.
//!
//! Only a reply carrying the outstanding request's Id completes a request.
//! Peer-initiated requests that arrive meanwhile are answered by the
//! attached [`Answerer`] or queued for [`Transport::listen`]; replies to
//! other requests are dropped.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use datum_core::config::TransportConfig;
use datum_core::crypto::{Keypair, PublicKey};
use datum_core::wire::{peek_header, Message, MessageId, MessageType, WireError, MAX_DATAGRAM};

/// Unsolicited requests kept for `listen` before the oldest is dropped.
const MAX_PENDING: usize = 16;

// ── Schedule ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub initial: Duration,
    pub inner_attempts: u32,
    pub outer_attempts: u32,
}

impl RetrySchedule {
    /// Read deadlines of one inner loop, doubling from `initial`. Saturates
    /// instead of overflowing when a config asks for many attempts.
    pub fn waits(&self) -> impl Iterator<Item = Duration> {
        std::iter::successors(Some(self.initial), |wait| Some(wait.saturating_mul(2)))
            .take(self.inner_attempts as usize)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for RetrySchedule {
    fn from(config: &TransportConfig) -> Self {
        Self {
            initial: config.initial_timeout(),
            inner_attempts: config.inner_attempts,
            outer_attempts: config.outer_attempts,
        }
    }
}

/// Whether a request is resent after a full inner backoff loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resend {
    Yes,
    No,
}

/// Outcome of a request.
#[derive(Debug)]
pub enum Reply {
    /// A reply whose Id matches the request.
    Answer(Message),
    /// Budget exhausted. `stray` is the last reply seen that carried
    /// some other Id, if any.
    Timeout { stray: Option<Message> },
}

/// Answers peer-initiated requests that arrive while a request is pending.
pub trait Answerer: Send + Sync {
    /// Build the reply for `request`, or None to leave it unanswered.
    fn answer(&self, request: &Message) -> Option<Message>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot encode outgoing message: {0}")]
    Encode(#[from] WireError),
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// One UDP socket talking to one peer. Owned by exactly one task.
pub struct Transport {
    socket: UdpSocket,
    peer: SocketAddr,
    keypair: Arc<Keypair>,
    peer_key: Option<PublicKey>,
    schedule: RetrySchedule,
    answerer: Option<Arc<dyn Answerer>>,
    pending: VecDeque<Message>,
    buf: Vec<u8>,
}

impl Transport {
    /// Bind an ephemeral local port for talking to `peer`.
    pub async fn connect(
        peer: SocketAddr,
        keypair: Arc<Keypair>,
        schedule: RetrySchedule,
    ) -> Result<Self, TransportError> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::new(socket, peer, keypair, schedule))
    }

    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        keypair: Arc<Keypair>,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            socket,
            peer,
            keypair,
            peer_key: None,
            schedule,
            answerer: None,
            pending: VecDeque::new(),
            buf: vec![0u8; MAX_DATAGRAM + 1],
        }
    }

    /// Wait on an unbound-peer socket for the first decodable datagram and
    /// talk to its sender from then on. That datagram is queued for
    /// [`Transport::listen`].
    pub async fn accept(
        socket: UdpSocket,
        keypair: Arc<Keypair>,
        schedule: RetrySchedule,
    ) -> Result<Self, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            match Message::decode(&buf[..len], None) {
                Ok(first) => {
                    tracing::debug!(peer = %from, kind = ?first.kind, "accepted peer");
                    let mut transport = Self::new(socket, from, keypair, schedule);
                    transport.pending.push_back(first);
                    return Ok(transport);
                }
                Err(e) => tracing::debug!(%from, error = %e, "ignoring undecodable datagram"),
            }
        }
    }

    pub fn set_answerer(&mut self, answerer: Arc<dyn Answerer>) {
        self.answerer = Some(answerer);
    }

    /// Key incoming datagrams must be signed with. None = accept unverified.
    pub fn set_peer_key(&mut self, key: Option<PublicKey>) {
        self.peer_key = key;
    }

    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer_key.as_ref()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn encode(&self, msg: &Message) -> Result<Bytes, TransportError> {
        Ok(msg.clone().sign(&self.keypair)?.encode()?)
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, self.peer).await?;
        Ok(())
    }

    /// Sign, encode and send one message without waiting for anything.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let bytes = self.encode(msg)?;
        self.send_raw(&bytes).await?;
        tracing::trace!(
            peer = %self.peer,
            id = %msg.id,
            kind = ?msg.kind,
            len = msg.body.len(),
            "message sent"
        );
        Ok(())
    }

    /// Send `request` and wait for the reply carrying its Id.
    ///
    /// At most `outer_attempts` sends and `inner_attempts * outer_attempts`
    /// read deadlines with [`Resend::Yes`]; one send and `inner_attempts`
    /// deadlines with [`Resend::No`].
    pub async fn request(
        &mut self,
        request: &Message,
        resend: Resend,
    ) -> Result<Reply, TransportError> {
        let bytes = self.encode(request)?;
        let cycles = match resend {
            Resend::Yes => self.schedule.outer_attempts.max(1),
            Resend::No => 1,
        };
        let mut stray = None;

        self.send_raw(&bytes).await?;
        for cycle in 0..cycles {
            if cycle > 0 {
                tracing::debug!(
                    peer = %self.peer,
                    id = %request.id,
                    kind = ?request.kind,
                    cycle,
                    "no reply, resending"
                );
                self.send_raw(&bytes).await?;
            }

            for wait in self.schedule.waits() {
                let deadline = Instant::now().checked_add(wait);
                while let Some(msg) = self.recv_datagram(deadline).await? {
                    if msg.id == request.id && msg.kind.is_reply() {
                        return Ok(Reply::Answer(msg));
                    }
                    if let Some(other) = self.unsolicited(msg).await? {
                        stray = Some(other);
                    }
                }
            }
        }

        tracing::debug!(
            peer = %self.peer,
            id = %request.id,
            kind = ?request.kind,
            "request timed out"
        );
        Ok(Reply::Timeout { stray })
    }

    /// Wait for any peer-initiated message, under one inner backoff loop
    /// and without sending anything. None when the loop runs out.
    pub async fn listen(&mut self) -> Result<Option<Message>, TransportError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        for wait in self.schedule.waits() {
            if let Some(msg) = self.recv_datagram(Instant::now().checked_add(wait)).await? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Wait without a deadline for the next message from the peer.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        loop {
            if let Some(msg) = self.recv_datagram(None).await? {
                return Ok(msg);
            }
        }
    }

    /// Answer `request` with the attached answerer. Returns true if a
    /// reply was sent.
    pub async fn answer(&self, request: &Message) -> Result<bool, TransportError> {
        let Some(answerer) = self.answerer.clone() else {
            return Ok(false);
        };
        match answerer.answer(request) {
            Some(reply) => {
                self.send(&reply).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Route a message that did not answer the outstanding request.
    /// Returns it back if it was a reply meant for some other request.
    async fn unsolicited(&mut self, msg: Message) -> Result<Option<Message>, TransportError> {
        if msg.kind.is_reply() {
            tracing::debug!(
                peer = %self.peer,
                id = %msg.id,
                kind = ?msg.kind,
                "reply does not match outstanding request, dropping"
            );
            return Ok(Some(msg));
        }
        if self.answer(&msg).await? {
            return Ok(None);
        }
        if self.pending.len() == MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(msg);
        Ok(None)
    }

    /// Read datagrams until one from the peer decodes, or the deadline
    /// passes. Datagrams that fail to decode are answered with Error(254).
    async fn recv_datagram(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Option<Message>, TransportError> {
        loop {
            let received = match deadline {
                Some(deadline) => {
                    match timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await {
                        Ok(result) => result,
                        Err(_) => return Ok(None),
                    }
                }
                None => self.socket.recv_from(&mut self.buf).await,
            };
            let (len, from) = received?;

            if from != self.peer {
                tracing::trace!(%from, peer = %self.peer, "datagram from unexpected address, ignoring");
                continue;
            }

            let datagram = &self.buf[..len];
            match Message::decode(datagram, self.peer_key.as_ref()) {
                Ok(msg) => {
                    tracing::trace!(
                        peer = %self.peer,
                        id = %msg.id,
                        kind = ?msg.kind,
                        len = msg.body.len(),
                        "message received"
                    );
                    return Ok(Some(msg));
                }
                Err(e) => {
                    let header = peek_header(datagram);
                    self.reject(header, &e).await;
                }
            }
        }
    }

    /// Report an undecodable datagram to the peer. Never answers an
    /// Error(254), so two peers cannot bounce errors forever.
    async fn reject(&self, header: Option<(MessageId, u8)>, err: &WireError) {
        tracing::warn!(
            peer = %self.peer,
            error = %err,
            auth = err.is_auth(),
            "rejecting datagram"
        );
        let id = match header {
            Some((_, kind)) if kind == u8::from(MessageType::Error) => return,
            Some((id, _)) => id,
            None => MessageId::ZERO,
        };
        if let Err(e) = self.send(&Message::error(id, err.to_string())).await {
            tracing::warn!(peer = %self.peer, error = %e, "failed to send error reply");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
