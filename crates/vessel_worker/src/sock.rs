//! Simulated sockets for the in-sandbox `net` surface.
//!
//! A connection is a pair of queues; `write` enqueues and returns
//! immediately, delivery happens when the peer polls. The return value
//! of `write` is the advisory back-pressure signal: `false` once a chunk
//! exceeds the 16 KiB high-water mark, even though the write itself
//! still completes on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use vessel_protocol::defaults::SOCKET_HIGH_WATER_MARK;

/// Events observed on one end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Data(Vec<u8>),
    End,
    Close,
    Error(String),
}

/// One end of a simulated duplex connection.
#[derive(Debug)]
pub struct VirtualSocket {
    outgoing: mpsc::UnboundedSender<SocketEvent>,
    incoming: mpsc::UnboundedReceiver<SocketEvent>,
    /// This side's write direction; cleared by `end`.
    write_open: AtomicBool,
    /// Whole-connection liveness; cleared by `destroy` on either side.
    alive: Arc<AtomicBool>,
}

/// Create a connected socket pair.
pub fn socket_pair() -> (VirtualSocket, VirtualSocket) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let alive = Arc::new(AtomicBool::new(true));
    (
        VirtualSocket {
            outgoing: b_tx,
            incoming: a_rx,
            write_open: AtomicBool::new(true),
            alive: Arc::clone(&alive),
        },
        VirtualSocket {
            outgoing: a_tx,
            incoming: b_rx,
            write_open: AtomicBool::new(true),
            alive,
        },
    )
}

impl VirtualSocket {
    /// Queue bytes for the peer.
    ///
    /// Returns `false` when the chunk exceeds the high-water mark or the
    /// connection is no longer writable; the caller should pause until
    /// the queue drains. Small writes on an open connection return
    /// `true`.
    pub fn write(&self, data: &[u8]) -> bool {
        if !self.is_writable() {
            return false;
        }
        if self.outgoing.send(SocketEvent::Data(data.to_vec())).is_err() {
            return false;
        }
        data.len() <= SOCKET_HIGH_WATER_MARK
    }

    /// Half-close: no more writes from this side; the peer observes `End`.
    pub fn end(&self) {
        if self.write_open.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(SocketEvent::End);
        }
    }

    /// Tear the whole connection down, optionally with an error the peer
    /// observes before `Close`.
    pub fn destroy(&self, error: Option<&str>) {
        if self.alive.swap(false, Ordering::SeqCst) {
            if let Some(error) = error {
                let _ = self.outgoing.send(SocketEvent::Error(error.to_string()));
            }
            let _ = self.outgoing.send(SocketEvent::Close);
        }
        self.write_open.store(false, Ordering::SeqCst);
    }

    /// Next event from the peer; `None` once the peer side is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.incoming.recv().await
    }

    /// Non-blocking poll used by cooperative loops.
    pub fn try_recv(&mut self) -> Option<SocketEvent> {
        self.incoming.try_recv().ok()
    }

    pub fn is_writable(&self) -> bool {
        self.write_open.load(Ordering::SeqCst) && self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_deliver_in_order() {
        let (client, mut server) = socket_pair();
        assert!(client.write(b"one"));
        assert!(client.write(b"two"));
        assert_eq!(server.recv().await, Some(SocketEvent::Data(b"one".to_vec())));
        assert_eq!(server.recv().await, Some(SocketEvent::Data(b"two".to_vec())));
    }

    #[tokio::test]
    async fn oversized_chunk_signals_backpressure_but_still_delivers() {
        let (client, mut server) = socket_pair();
        let big = vec![0u8; SOCKET_HIGH_WATER_MARK + 1];
        assert!(!client.write(&big));
        match server.recv().await {
            Some(SocketEvent::Data(data)) => assert_eq!(data.len(), big.len()),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn end_half_closes_only_the_local_direction() {
        let (client, mut server) = socket_pair();
        client.write(b"last");
        client.end();
        assert!(!client.write(b"after end"));
        assert_eq!(server.recv().await, Some(SocketEvent::Data(b"last".to_vec())));
        assert_eq!(server.recv().await, Some(SocketEvent::End));
        // The other direction stays open.
        assert!(server.write(b"reply"));
    }

    #[tokio::test]
    async fn destroy_surfaces_error_then_close_on_both_sides() {
        let (client, mut server) = socket_pair();
        client.destroy(Some("connection reset"));
        assert_eq!(
            server.recv().await,
            Some(SocketEvent::Error("connection reset".to_string()))
        );
        assert_eq!(server.recv().await, Some(SocketEvent::Close));
        assert!(!client.is_writable());
        assert!(!server.is_writable());
    }
}
