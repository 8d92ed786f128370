use crate::*;

use anyhow::{Context, Result};

use datum_core::merkle::{CHUNK_SIZE, EMPTY_ROOT};
use datum_services::{export_bytes, export_dir, FsSink};
use datumd::fetch::Browser;
use datumd::session::PeerSession;

#[tokio::test]
async fn test_file_reconstruction_by_chunk_count() -> Result<()> {
    for chunks in [0usize, 1, 33, 1024] {
        let data = pattern(chunks * CHUNK_SIZE);
        let peer = spawn_peer(export_bytes(&data), "files", Fault::None).await?;
        let mut session =
            PeerSession::establish(client_to(peer.addr).await?, "me", EMPTY_ROOT).await?;

        let root = session.peer().root.context("root learned during handshake")?;
        let bytes = session
            .fetcher(10)
            .reconstruct_file(&root)
            .await
            .with_context(|| format!("reconstruct {chunks} chunks"))?;
        assert_eq!(bytes.len(), data.len(), "{chunks} chunks");
        assert_eq!(bytes, data, "{chunks} chunks");
    }
    Ok(())
}

#[tokio::test]
async fn test_full_tree_retrieval_to_disk() -> Result<()> {
    let export = temp_dir("export")?;
    std::fs::create_dir_all(export.join("docs/deep"))?;
    std::fs::write(export.join("README"), b"top level")?;
    std::fs::write(export.join("docs/big.bin"), pattern(40 * CHUNK_SIZE + 17))?;
    std::fs::write(export.join("docs/deep/empty"), b"")?;
    let dag = export_dir(&export).context("export fixture tree")?;

    let peer = spawn_peer(dag, "tree", Fault::None).await?;
    let mut session =
        PeerSession::establish(client_to(peer.addr).await?, "me", EMPTY_ROOT).await?;
    let root = session.peer().root.context("root learned during handshake")?;

    let out = temp_dir("download")?;
    let mut sink = FsSink::new(&out);
    let mut browser = Browser::open(session.fetcher(10), root, "root").await?;
    let stats = browser.download(&mut sink).await?;

    assert_eq!(stats.dirs, 3);
    assert_eq!(stats.files, 3);
    assert_eq!(std::fs::read(out.join("root/README"))?, b"top level");
    assert_eq!(
        std::fs::read(out.join("root/docs/big.bin"))?,
        pattern(40 * CHUNK_SIZE + 17)
    );
    assert_eq!(std::fs::read(out.join("root/docs/deep/empty"))?, b"");

    let _ = std::fs::remove_dir_all(&export);
    let _ = std::fs::remove_dir_all(&out);
    Ok(())
}
