//! Raw transport boundary between coordinator and worker processes.
//!
//! The core never opens or closes the duplex channel itself; it only needs
//! a way to hand a message to whatever channel the host pair already holds,
//! plus an inbound stream of delivered messages. [`RawTransport`] is that
//! seam. Two implementations ship here:
//!
//! - [`PairTransport`]: in-memory duplex pair for tests and same-process wiring
//! - [`FramedTransport`]: length-prefixed JSON frames over any AsyncWrite,
//!   with [`spawn_reader`] pumping the matching inbound half

use std::io;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer side of the channel is gone. Retry policy belongs to the
    /// coordinator, not this layer.
    #[error("transport closed")]
    Closed,

    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Send half of the duplex channel a coordinator/worker pair shares.
#[async_trait]
pub trait RawTransport: Send + Sync {
    /// Hand one message to the transport. Resolves when the transport has
    /// accepted it, not when the remote has seen it.
    async fn send(&self, message: Value) -> Result<(), TransportError>;
}

/// In-memory duplex transport; each side sends into the other's inbox.
pub struct PairTransport {
    tx: mpsc::Sender<Value>,
    inbox: Mutex<mpsc::Receiver<Value>>,
}

impl PairTransport {
    /// Create both ends of a connected pair.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (left_tx, right_inbox) = mpsc::channel(capacity);
        let (right_tx, left_inbox) = mpsc::channel(capacity);
        (
            Self {
                tx: left_tx,
                inbox: Mutex::new(left_inbox),
            },
            Self {
                tx: right_tx,
                inbox: Mutex::new(right_inbox),
            },
        )
    }

    /// Next message delivered to this side, or `None` once the peer is gone
    /// and the inbox has drained.
    pub async fn recv(&self) -> Option<Value> {
        self.inbox.lock().await.recv().await
    }
}

#[async_trait]
impl RawTransport for PairTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// [`RawTransport`] over any byte sink using length-prefixed JSON frames.
pub struct FramedTransport<W> {
    writer: Mutex<FramedWrite<W, JsonCodec<Value>>>,
}

impl<W: AsyncWrite + Unpin + Send> FramedTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(FramedWrite::new(writer, JsonCodec::new())),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RawTransport for FramedTransport<W> {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(message).await.map_err(TransportError::from)
    }
}

/// Pump inbound frames from `reader` into `tx` until the stream ends, a
/// frame fails to decode, or the receiver goes away. One task per inbound
/// half; the broker and the control-protocol handler share the resulting
/// channel.
pub fn spawn_reader<R>(reader: R, tx: mpsc::Sender<Value>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, JsonCodec::<Value>::new());
        loop {
            match frames.next().await {
                Some(Ok(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    tracing::error!(%error, "Inbound frame error");
                    break;
                }
                None => break,
            }
        }
        tracing::debug!("Inbound reader exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (left, right) = PairTransport::pair(8);

        left.send(json!({"seq": 1})).await.unwrap();
        left.send(json!({"seq": 2})).await.unwrap();

        assert_eq!(right.recv().await.unwrap(), json!({"seq": 1}));
        assert_eq!(right.recv().await.unwrap(), json!({"seq": 2}));
    }

    #[tokio::test]
    async fn pair_is_bidirectional() {
        let (left, right) = PairTransport::pair(8);

        left.send(json!("ping")).await.unwrap();
        right.send(json!("pong")).await.unwrap();

        assert_eq!(right.recv().await.unwrap(), json!("ping"));
        assert_eq!(left.recv().await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn send_after_peer_dropped_is_closed() {
        let (left, right) = PairTransport::pair(1);
        drop(right);

        let err = left.send(json!(null)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn framed_transport_roundtrips_through_reader() {
        let (client, server) = tokio::io::duplex(1024);
        let transport = FramedTransport::new(client);

        let (tx, mut rx) = mpsc::channel(8);
        let _reader = spawn_reader(server, tx);

        let message = json!({"tag": 3, "data": null});
        transport.send(message.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);
    }

    #[tokio::test]
    async fn reader_exits_when_writer_closes() {
        let (client, server) = tokio::io::duplex(1024);
        let transport = FramedTransport::new(client);

        let (tx, mut rx) = mpsc::channel(8);
        let _reader = spawn_reader(server, tx);

        transport.send(json!(1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!(1));

        drop(transport);
        assert!(rx.recv().await.is_none());
    }
}
