use crate::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use datum_core::merkle::EMPTY_ROOT;
use datum_core::wire::{Message, MessageId, MessageType};
use datum_services::{export_bytes, Dag};
use datumd::session::{HandshakeError, PeerSession, ProtocolError};

#[tokio::test]
async fn test_handshake_learns_name_key_and_root() -> Result<()> {
    let peer = spawn_peer(export_bytes(b"hello"), "alice", Fault::None).await?;
    let session = PeerSession::establish(client_to(peer.addr).await?, "bob", EMPTY_ROOT)
        .await
        .context("handshake should complete")?;

    assert_eq!(session.peer().name.as_deref(), Some("alice"));
    assert_eq!(session.peer().public_key.as_ref(), Some(&peer.public_key));
    assert_eq!(session.peer().root, Some(peer.root));
    assert_eq!(session.transport().peer_key(), Some(&peer.public_key));
    Ok(())
}

#[tokio::test]
async fn test_empty_export_advertises_zero_root() -> Result<()> {
    let peer = spawn_peer(Dag::new(), "empty", Fault::None).await?;
    let mut session =
        PeerSession::establish(client_to(peer.addr).await?, "bob", EMPTY_ROOT).await?;
    assert_eq!(session.peer().root, Some(EMPTY_ROOT));
    assert_eq!(session.request_root(EMPTY_ROOT).await?, EMPTY_ROOT);
    Ok(())
}

#[tokio::test]
async fn test_mismatched_hello_reply_id_stops_handshake() -> Result<()> {
    let socket = loopback().await?;
    let addr = socket.local_addr()?;
    let key_replies = Arc::new(AtomicUsize::new(0));
    let seen = key_replies.clone();

    // Answers every Hello with a HelloReply under the wrong Id.
    let _guard = PeerGuard(tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(msg) = Message::decode(&buf[..len], None) else {
                continue;
            };
            match msg.kind {
                MessageType::Hello => {
                    let mut wrong = msg.id.0;
                    wrong[0] ^= 0xff;
                    let reply = Message::new(MessageId(wrong), MessageType::HelloReply, vec![0u8; 4]);
                    let _ = socket.send_to(&reply.encode().unwrap(), from).await;
                }
                MessageType::PublicKeyReply => {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }));

    let err = PeerSession::establish(client_to(addr).await?, "bob", EMPTY_ROOT)
        .await
        .err()
        .expect("handshake must fail");
    assert!(
        matches!(err, HandshakeError::Protocol(ProtocolError::IdMismatch { .. })),
        "{err}"
    );
    assert_eq!(key_replies.load(Ordering::SeqCst), 0);
    Ok(())
}
