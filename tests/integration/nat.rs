use crate::*;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use datum_core::crypto::Keypair;
use datum_core::merkle::EMPTY_ROOT;
use datum_core::wire::{HelloBody, Message, MessageId, MessageType};
use datum_services::{export_bytes, Dag};
use datumd::serve::{serve, Responder};
use datumd::session::{self, traversal_body, PeerSession, ServerLink, Traversal};
use datumd::transport::{Answerer, Resend, Transport};
use tokio::sync::{broadcast, Notify};

/// Rendezvous server: registers one client, answers its heartbeats, and
/// records every traversal request body, waking `punch` for each.
async fn spawn_rendezvous(
    punch: Arc<Notify>,
    seen: Arc<Mutex<Vec<Bytes>>>,
) -> Result<(SocketAddr, PeerGuard)> {
    let socket = loopback().await?;
    let addr = socket.local_addr()?;
    let keypair = Arc::new(Keypair::generate());
    let responder = Responder::new("rendezvous", &keypair, Arc::new(Dag::new()));

    let task = tokio::spawn(async move {
        let Ok(transport) = Transport::accept(socket, keypair, fast_schedule()).await else {
            return;
        };
        let Ok(mut session) = PeerSession::accept(transport, "rendezvous", EMPTY_ROOT).await else {
            return;
        };
        let transport = session.transport_mut();
        while let Ok(msg) = transport.recv().await {
            if msg.kind == MessageType::NatTraversalRequest {
                seen.lock().unwrap().push(msg.body.clone());
                punch.notify_one();
            } else if let Some(reply) = responder.answer(&msg) {
                let _ = transport.send(&reply).await;
            }
        }
    });
    Ok((addr, PeerGuard(task)))
}

/// A peer behind a "NAT": it drops everything until the rendezvous server
/// relays a traversal request, then greets whoever Hellos it and serves.
async fn spawn_natted_peer(data: &[u8], punch: Arc<Notify>) -> Result<(SocketAddr, PeerGuard)> {
    let socket = loopback().await?;
    let addr = socket.local_addr()?;
    let keypair = Arc::new(Keypair::generate());
    let dag = Arc::new(export_bytes(data));
    let root = dag.root_hash();
    let responder = Responder::new("hidden", &keypair, dag);

    let task = tokio::spawn(async move {
        punch.notified().await;
        let mut buf = vec![0u8; 2048];
        while socket.try_recv_from(&mut buf).is_ok() {}

        let Ok(mut transport) = Transport::accept(socket, keypair, fast_schedule()).await else {
            return;
        };
        // The first datagram is the client's Hello: answer it, then send ours.
        let Ok(Some(hello)) = transport.listen().await else {
            return;
        };
        if let Some(reply) = responder.answer(&hello) {
            let _ = transport.send(&reply).await;
        }
        let ours = Message::new(
            MessageId::random(),
            MessageType::Hello,
            HelloBody::new("hidden").encode(),
        );
        if transport.request(&ours, Resend::Yes).await.is_err() {
            return;
        }

        let Ok(mut session) = PeerSession::accept(transport, "hidden", root).await else {
            return;
        };
        let (_stop, stop_rx) = broadcast::channel(1);
        let _ = serve(session.transport_mut(), &responder, stop_rx).await;
    });
    Ok((addr, PeerGuard(task)))
}

#[tokio::test]
async fn test_nat_traversal_reaches_hidden_peer() -> Result<()> {
    let punch = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let data = pattern(3000);

    let (server_addr, _server) = spawn_rendezvous(punch.clone(), seen.clone()).await?;
    let (peer_addr, _peer) = spawn_natted_peer(&data, punch).await?;

    let keypair = Arc::new(Keypair::generate());
    let server = Transport::connect(server_addr, keypair.clone(), fast_schedule()).await?;
    let server = PeerSession::establish(server, "me", EMPTY_ROOT)
        .await
        .context("registration")?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let (link, handle) = ServerLink::new(
        server.into_transport(),
        "me",
        Duration::from_secs(3600),
        shutdown_tx.subscribe(),
    );
    let link_task = tokio::spawn(link.run());

    // The NAT swallows direct attempts.
    let direct =
        session::connect_any(&[peer_addr], keypair.clone(), fast_schedule(), "me", EMPTY_ROOT).await;
    assert!(direct.is_err());

    let traversal =
        Traversal::new(handle, keypair, fast_schedule(), "me", Duration::from_millis(50));
    let transport = traversal
        .reach(&[peer_addr])
        .await
        .context("traversal should succeed")?;
    assert_eq!(seen.lock().unwrap().as_slice(), &[traversal_body(peer_addr)]);

    let mut session = PeerSession::establish(transport, "me", EMPTY_ROOT).await?;
    let root = session.peer().root.context("root learned during handshake")?;
    let bytes = session.fetcher(10).reconstruct_file(&root).await?;
    assert_eq!(bytes, data);

    shutdown_tx.send(())?;
    link_task.await??;
    Ok(())
}
