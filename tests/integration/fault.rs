use crate::*;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};

use datum_core::merkle::EMPTY_ROOT;
use datum_services::export_bytes;
use datumd::fetch::FetchError;
use datumd::session::PeerSession;

#[tokio::test]
async fn test_dropped_requests_are_resent() -> Result<()> {
    let data = b"worth waiting for".to_vec();
    let peer = spawn_peer(export_bytes(&data), "lossy", Fault::DropGetDatum(4)).await?;
    let mut session =
        PeerSession::establish(client_to(peer.addr).await?, "me", EMPTY_ROOT).await?;

    let bytes = session
        .fetcher(10)
        .reconstruct_file(&peer.root)
        .await
        .context("fifth send should be answered")?;
    assert_eq!(bytes, data);
    assert_eq!(peer.counters.get_datum.load(Ordering::SeqCst), 5);
    Ok(())
}

#[tokio::test]
async fn test_corrupted_content_fails_integrity() -> Result<()> {
    let peer = spawn_peer(export_bytes(b"tampered"), "liar", Fault::CorruptDatum).await?;
    let mut session =
        PeerSession::establish(client_to(peer.addr).await?, "me", EMPTY_ROOT).await?;

    match session.fetcher(10).get_datum(&peer.root).await {
        Err(FetchError::Integrity { attempts, .. }) => assert_eq!(attempts, 11),
        Err(other) => panic!("expected integrity error, got {other}"),
        Ok(node) => panic!("corrupted content accepted: {node:?}"),
    }
    assert_eq!(peer.counters.get_datum.load(Ordering::SeqCst), 11);
    Ok(())
}

#[tokio::test]
async fn test_unknown_hash_is_refused() -> Result<()> {
    let peer = spawn_peer(export_bytes(b"x"), "strict", Fault::None).await?;
    let mut session =
        PeerSession::establish(client_to(peer.addr).await?, "me", EMPTY_ROOT).await?;

    let err = session.fetcher(10).get_datum(&[0xab; 32]).await.unwrap_err();
    assert!(matches!(err, FetchError::Remote { .. }), "{err}");
    Ok(())
}
