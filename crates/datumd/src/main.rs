//! datumd — Merkle-DAG exchange client.
//!
//! Registers with the rendezvous server, keeps that registration alive,
//! then connects to a peer (directly, or through NAT traversal) and lets
//! the user browse and download its exported tree.
//!
//! Usage: datumd [PEER_ADDR ...]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use datum_core::config::DatumConfig;
use datum_core::crypto::{Keypair, PublicKey};
use datum_core::merkle::{Hash, EMPTY_ROOT};
use datum_services::{export_dir, Dag, FsSink};

use datumd::fetch::Browser;
use datumd::serve::Responder;
use datumd::session::{self, PeerSession, ServerHandle, ServerLink, Traversal};
use datumd::transport::{RetrySchedule, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = DatumConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DatumConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DatumConfig::default()
    });
    let name = config.identity.name.clone();
    tracing::info!(name, "datumd starting");

    // Keypair
    let keypair = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .with_context(|| format!("keypair at {}", config.identity.keypair_path.display()))?,
    );
    tracing::info!(public_key = hex::encode(keypair.public().to_bytes()), "keypair ready");

    // Export
    let dag = Arc::new(match &config.export.root {
        Some(root) => export_dir(root).with_context(|| format!("exporting {}", root.display()))?,
        None => Dag::new(),
    });
    let local_root = dag.root_hash();
    let responder = Arc::new(Responder::new(&name, &keypair, dag.clone()));
    let schedule = RetrySchedule::from(&config.transport);

    // ── Rendezvous server ────────────────────────────────────────────────────
    let server_addr = resolve(&config.network.server_addr).await?;
    let mut server = Transport::connect(server_addr, keypair.clone(), schedule.clone()).await?;
    if !config.network.server_public_key.is_empty() {
        let key = PublicKey::from_hex(&config.network.server_public_key)
            .context("network.server_public_key")?;
        server.set_peer_key(Some(key));
    }
    let server = PeerSession::establish(server, &name, local_root)
        .await
        .context("registration with rendezvous server failed")?;
    let mut server = server.into_transport();
    server.set_answerer(responder.clone());

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let (link, server_handle) = ServerLink::new(
        server,
        &name,
        config.transport.heartbeat_interval(),
        shutdown_tx.subscribe(),
    );
    let link_task = tokio::spawn(async move {
        if let Err(e) = link.run().await {
            tracing::error!(error = %e, "server link failed");
        }
    });

    // ── Peer ─────────────────────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    let targets = if args.is_empty() {
        config.network.peer_addresses.clone()
    } else {
        args
    };

    if targets.is_empty() {
        tracing::info!(root = hex::encode(local_root), "no peer given, serving only");
    } else {
        let mut candidates = Vec::with_capacity(targets.len());
        for target in &targets {
            candidates.push(resolve(target).await?);
        }
        let mut shutdown = shutdown_tx.subscribe();
        let peer = PeerContext {
            config: &config,
            keypair: keypair.clone(),
            schedule,
            responder,
            server: server_handle,
            local_root,
        };
        tokio::select! {
            result = peer.run(&candidates) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "peer session failed");
                }
            }
            _ = shutdown.recv() => {}
        }
        let _ = shutdown_tx.send(());
    }

    let _ = link_task.await;
    tracing::info!("datumd stopped");
    Ok(())
}

async fn resolve(target: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("resolving {target}"))?
        .next()
        .with_context(|| format!("{target} resolved to no address"))
}

struct PeerContext<'a> {
    config: &'a DatumConfig,
    keypair: Arc<Keypair>,
    schedule: RetrySchedule,
    responder: Arc<Responder>,
    server: ServerHandle,
    local_root: Hash,
}

impl PeerContext<'_> {
    async fn run(self, candidates: &[SocketAddr]) -> Result<()> {
        let name = &self.config.identity.name;
        let mut session = match session::connect_any(
            candidates,
            self.keypair.clone(),
            self.schedule.clone(),
            name,
            self.local_root,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "direct connection failed, trying NAT traversal");
                let traversal = Traversal::new(
                    self.server.clone(),
                    self.keypair.clone(),
                    self.schedule.clone(),
                    name.as_str(),
                    self.config.network.nat_settle(),
                );
                let transport = traversal.reach(candidates).await?;
                PeerSession::establish(transport, name, self.local_root).await?
            }
        };
        session.transport_mut().set_answerer(self.responder.clone());

        let root = match session.peer().root {
            Some(root) if root != EMPTY_ROOT => root,
            _ => session.request_root(self.local_root).await?,
        };
        if root == EMPTY_ROOT {
            tracing::info!("peer exports nothing");
            return Ok(());
        }

        let peer_name = session
            .peer()
            .name
            .clone()
            .filter(|n| !n.is_empty() && !n.contains(['/', '\\', '.']))
            .unwrap_or_else(|| "peer".to_string());
        let mut sink = FsSink::new(self.config.download.output_dir.join(format!("download_from_{peer_name}")));
        tracing::info!(base = %sink.base().display(), "downloads go here");

        let fetcher = session.fetcher(self.config.transport.integrity_retries);
        let mut browser = Browser::open(fetcher, root, "root").await?;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            if !browser.is_directory() {
                let stats = browser.download(&mut sink).await?;
                println!("downloaded {} ({} bytes)", browser.path().display(), stats.bytes);
                return Ok(());
            }

            let entries = browser.entries();
            println!("\n{}", browser.path().display());
            for (i, entry) in entries.iter().enumerate() {
                println!("{i:>3}  {}", entry.name());
            }
            println!("{:>3}  <download everything here>", entries.len());

            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            let count = entries.len();
            match line.trim().parse::<usize>() {
                Ok(choice) if choice == count => {
                    let stats = browser.download(&mut sink).await?;
                    println!(
                        "downloaded {} directories, {} files, {} bytes",
                        stats.dirs, stats.files, stats.bytes
                    );
                    return Ok(());
                }
                Ok(choice) if choice < count => browser.descend(choice).await?,
                _ => println!("enter a number between 0 and {count}"),
            }
        }
    }
}
