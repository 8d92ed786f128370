use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use datum_core::crypto::{Keypair, PublicKey};
use datum_core::merkle::Hash;
use datum_core::wire::{Message, MessageType};
use datum_services::Dag;
use datumd::serve::Responder;
use datumd::session::PeerSession;
use datumd::transport::{Answerer, RetrySchedule, Transport};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

// ── PeerGuard — Drop-based cleanup ──────────────────────────────────────────

/// Aborts the fake peer's task when the test is done with it, panicking or not.
pub struct PeerGuard(pub JoinHandle<()>);

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// 10ms first deadline: a silent request gives up after ~1.5s.
pub fn fast_schedule() -> RetrySchedule {
    RetrySchedule {
        initial: Duration::from_millis(10),
        inner_attempts: 5,
        outer_attempts: 5,
    }
}

pub async fn loopback() -> Result<UdpSocket> {
    UdpSocket::bind("127.0.0.1:0")
        .await
        .context("bind loopback socket")
}

pub async fn client_to(addr: SocketAddr) -> Result<Transport> {
    Transport::connect(addr, Arc::new(Keypair::generate()), fast_schedule())
        .await
        .with_context(|| format!("client socket to {addr}"))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(tag: &str) -> Result<PathBuf> {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "datum-it-{tag}-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

// ── Fake peers ──────────────────────────────────────────────────────────────

/// How a fake peer misbehaves once the handshake is done.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    None,
    /// Ignore the first N GetDatum datagrams.
    DropGetDatum(usize),
    /// Flip a byte in every Datum payload.
    CorruptDatum,
}

/// What a fake peer has seen, readable from the test.
#[derive(Default)]
pub struct Counters {
    pub get_datum: AtomicUsize,
    pub errors_received: AtomicUsize,
}

pub struct FakePeer {
    pub addr: SocketAddr,
    pub root: Hash,
    pub public_key: PublicKey,
    pub counters: Arc<Counters>,
    pub _guard: PeerGuard,
}

/// Spawn a peer that accepts one handshake and then serves `dag`.
pub async fn spawn_peer(dag: Dag, name: &str, fault: Fault) -> Result<FakePeer> {
    let socket = loopback().await?;
    let addr = socket.local_addr().context("fake peer address")?;
    let keypair = Arc::new(Keypair::generate());
    let public_key = keypair.public().clone();
    let dag = Arc::new(dag);
    let root = dag.root_hash();
    let responder = Responder::new(name, &keypair, dag);
    let counters = Arc::new(Counters::default());

    let name = name.to_string();
    let seen = counters.clone();
    let task = tokio::spawn(async move {
        let Ok(transport) = Transport::accept(socket, keypair, fast_schedule()).await else {
            return;
        };
        let Ok(mut session) = PeerSession::accept(transport, &name, root).await else {
            return;
        };
        let transport = session.transport_mut();
        while let Ok(msg) = transport.recv().await {
            match msg.kind {
                MessageType::GetDatum => {
                    let n = seen.get_datum.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Fault::DropGetDatum(drops) = fault {
                        if n <= drops {
                            continue;
                        }
                    }
                }
                MessageType::Error => {
                    seen.errors_received.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                _ => {}
            }
            let Some(mut reply) = responder.answer(&msg) else {
                continue;
            };
            if matches!(fault, Fault::CorruptDatum) && reply.kind == MessageType::Datum {
                reply = corrupt(reply);
            }
            if transport.send(&reply).await.is_err() {
                return;
            }
        }
    });

    Ok(FakePeer {
        addr,
        root,
        public_key,
        counters,
        _guard: PeerGuard(task),
    })
}

fn corrupt(mut reply: Message) -> Message {
    let mut body = reply.body.to_vec();
    if let Some(last) = body.last_mut() {
        *last ^= 0x5a;
    }
    reply.body = body.into();
    reply
}
