//! datumd — peer-to-peer Merkle-DAG exchange over UDP.
//!
//! `transport` is the reliable request/response engine, `session` the
//! handshake, rendezvous link and NAT traversal, `fetch` verified retrieval
//! and `serve` the answering side.

pub mod fetch;
pub mod serve;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use datum_core::crypto::Keypair;
    use tokio::net::UdpSocket;

    use crate::transport::{RetrySchedule, Transport};

    /// 10ms first deadline: a silent request gives up after ~1.5s.
    pub fn schedule() -> RetrySchedule {
        RetrySchedule {
            initial: Duration::from_millis(10),
            inner_attempts: 5,
            outer_attempts: 5,
        }
    }

    /// Two transports on loopback, pointed at each other.
    pub async fn pair() -> (Transport, Transport) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        (
            Transport::new(a, b_addr, Arc::new(Keypair::generate()), schedule()),
            Transport::new(b, a_addr, Arc::new(Keypair::generate()), schedule()),
        )
    }
}
