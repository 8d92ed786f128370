//! Serving side: answers peer requests from the exported DAG.

use std::sync::Arc;

use bytes::Bytes;
use datum_core::crypto::Keypair;
use datum_core::merkle::{Hash, HASH_LEN};
use datum_core::wire::{HelloBody, Message, MessageType};
use datum_services::Dag;
use tokio::sync::broadcast;

use crate::transport::{Answerer, Transport, TransportError};

/// Answers Hello, PublicKey, Root and GetDatum requests.
pub struct Responder {
    hello: Bytes,
    public_key: Bytes,
    dag: Arc<Dag>,
}

impl Responder {
    pub fn new(name: &str, keypair: &Keypair, dag: Arc<Dag>) -> Self {
        Self {
            hello: HelloBody::new(name).encode(),
            public_key: Bytes::copy_from_slice(&keypair.public().to_bytes()),
            dag,
        }
    }

    pub fn root(&self) -> Hash {
        self.dag.root_hash()
    }

    fn datum(&self, request: &Message) -> Message {
        let Ok(hash) = <Hash>::try_from(&request.body[..]) else {
            return Message::error(
                request.id,
                format!("GetDatum body must be {HASH_LEN} bytes, got {}", request.body.len()),
            );
        };
        match self.dag.datum(&hash) {
            Some(datum) => {
                tracing::trace!(
                    hash = hex::encode(hash),
                    depth = self.dag.depth(&hash),
                    "serving datum"
                );
                Message::new(request.id, MessageType::Datum, datum.encode())
            }
            None => {
                tracing::debug!(hash = hex::encode(hash), "GetDatum for unknown hash");
                Message::error(request.id, format!("no datum {}", hex::encode(hash)))
            }
        }
    }
}

impl Answerer for Responder {
    fn answer(&self, request: &Message) -> Option<Message> {
        let reply = match request.kind {
            MessageType::Hello => {
                Message::new(request.id, MessageType::HelloReply, self.hello.clone())
            }
            MessageType::PublicKey => {
                Message::new(request.id, MessageType::PublicKeyReply, self.public_key.clone())
            }
            MessageType::Root => Message::new(
                request.id,
                MessageType::RootReply,
                Bytes::copy_from_slice(&self.dag.root_hash()),
            ),
            MessageType::GetDatum => self.datum(request),
            _ => return None,
        };
        Some(reply)
    }
}

/// Answer everything the peer sends until shutdown.
pub async fn serve(
    transport: &mut Transport,
    answerer: &dyn Answerer,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    tracing::info!(peer = %transport.peer_addr(), "serving");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(peer = %transport.peer_addr(), "serve loop shutting down");
                return Ok(());
            }
            msg = transport.recv() => {
                let msg = msg?;
                match answerer.answer(&msg) {
                    Some(reply) => transport.send(&reply).await?,
                    None => tracing::debug!(
                        peer = %transport.peer_addr(),
                        kind = ?msg.kind,
                        "nothing to answer"
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_core::merkle::{Datum, EMPTY_ROOT};
    use datum_core::wire::MessageId;

    fn responder(dag: Dag) -> Responder {
        Responder::new("tester", &Keypair::generate(), Arc::new(dag))
    }

    fn request(kind: MessageType, body: impl Into<Bytes>) -> Message {
        Message::new(MessageId([1, 2, 3, 4]), kind, body)
    }

    #[test]
    fn replies_echo_request_id() {
        let r = responder(Dag::new());
        for kind in [MessageType::Hello, MessageType::PublicKey, MessageType::Root] {
            let reply = r.answer(&request(kind, Bytes::new())).unwrap();
            assert_eq!(reply.id, MessageId([1, 2, 3, 4]));
            assert!(reply.kind.is_reply());
        }
    }

    #[test]
    fn hello_reply_carries_name() {
        let reply = responder(Dag::new())
            .answer(&request(MessageType::Hello, vec![0u8; 4]))
            .unwrap();
        assert_eq!(HelloBody::parse(&reply.body).unwrap().name, "tester");
    }

    #[test]
    fn empty_export_advertises_zero_root() {
        let reply = responder(Dag::new())
            .answer(&request(MessageType::Root, Bytes::new()))
            .unwrap();
        assert_eq!(reply.kind, MessageType::RootReply);
        assert_eq!(&reply.body[..], &EMPTY_ROOT);
    }

    #[test]
    fn get_datum_serves_verifiable_content() {
        let dag = datum_services::export_bytes(&[5u8; 300]);
        let root = dag.root_hash();
        let reply = responder(dag)
            .answer(&request(MessageType::GetDatum, Bytes::copy_from_slice(&root)))
            .unwrap();
        assert_eq!(reply.kind, MessageType::Datum);
        let datum = Datum::parse(&reply.body).unwrap();
        assert_eq!(datum.hash, root);
    }

    #[test]
    fn unknown_hash_and_bad_body_get_errors() {
        let r = responder(Dag::new());
        let missing = r
            .answer(&request(MessageType::GetDatum, vec![9u8; 32]))
            .unwrap();
        assert_eq!(missing.kind, MessageType::Error);

        let short = r.answer(&request(MessageType::GetDatum, vec![9u8; 5])).unwrap();
        assert_eq!(short.kind, MessageType::Error);
        assert!(short.reason().contains("32 bytes"));
    }

    #[tokio::test]
    async fn serve_loop_answers_until_shutdown() {
        use crate::testing::pair;
        use crate::transport::{Reply, Resend};

        let (mut client, mut server) = pair().await;
        let dag = datum_services::export_bytes(b"served over the loop");
        let root = dag.root_hash();
        let r = Responder::new("srv", server.keypair(), Arc::new(dag));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { serve(&mut server, &r, shutdown_rx).await });

        let request = Message::new(
            datum_core::wire::MessageId::random(),
            MessageType::GetDatum,
            Bytes::copy_from_slice(&root),
        );
        match client.request(&request, Resend::Yes).await.unwrap() {
            Reply::Answer(reply) => assert_eq!(Datum::parse(&reply.body).unwrap().hash, root),
            other => panic!("expected Datum, got {other:?}"),
        }

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn replies_are_not_answered() {
        let r = responder(Dag::new());
        assert!(r.answer(&request(MessageType::Datum, Bytes::new())).is_none());
        assert!(r.answer(&request(MessageType::Error, Bytes::new())).is_none());
    }
}
