//! Wire-level stream halves the stream adapters are written against.
//!
//! A gRPC stream is one [`WireSource`] and one [`WireSink`]. Keeping the
//! adapters generic over these lets the same read/write tasks run over
//! tonic streams in production and in-memory channels in tests.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Status, Streaming};

/// Receiving half of a wire stream.
#[async_trait]
pub trait WireSource<T>: Send {
    /// Next message, or `Ok(None)` once the peer half-closed its side.
    async fn recv(&mut self) -> Result<Option<T>, Status>;
}

/// Sending half of a wire stream. Dropping it half-closes the stream.
#[async_trait]
pub trait WireSink<T>: Send {
    async fn send(&mut self, msg: T) -> Result<(), Status>;
}

#[async_trait]
impl<T: Send + 'static> WireSource<T> for Streaming<T> {
    async fn recv(&mut self) -> Result<Option<T>, Status> {
        self.message().await
    }
}

/// In-process source: the stream ends when every sender is gone.
#[async_trait]
impl<T: Send> WireSource<T> for mpsc::Receiver<T> {
    async fn recv(&mut self) -> Result<Option<T>, Status> {
        Ok(mpsc::Receiver::recv(self).await)
    }
}

/// Outbound request stream of a gRPC client call.
#[async_trait]
impl<T: Send> WireSink<T> for mpsc::Sender<T> {
    async fn send(&mut self, msg: T) -> Result<(), Status> {
        mpsc::Sender::send(self, msg)
            .await
            .map_err(|_| Status::unavailable("outbound join stream closed"))
    }
}

/// Create a channel whose receiving end can back a gRPC response stream.
///
/// Messages and a terminal error status share one ordered channel, so the
/// status always arrives after every message sent before it.
pub fn status_channel<T>(buffer: usize) -> (StatusSender<T>, StatusReceiver<T>) {
    let (tx, rx) = mpsc::channel(buffer);
    (StatusSender { tx }, StatusReceiver { rx })
}

/// Sending end of a [`status_channel`].
#[derive(Debug)]
pub struct StatusSender<T> {
    tx: mpsc::Sender<Result<T, Status>>,
}

impl<T> Clone for StatusSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> StatusSender<T> {
    /// End the stream with `status`. Returns `false` if the peer is gone.
    pub async fn fail(&self, status: Status) -> bool {
        self.tx.send(Err(status)).await.is_ok()
    }
}

#[async_trait]
impl<T: Send> WireSink<T> for StatusSender<T> {
    async fn send(&mut self, msg: T) -> Result<(), Status> {
        self.tx
            .send(Ok(msg))
            .await
            .map_err(|_| Status::cancelled("join stream closed by peer"))
    }
}

/// Receiving end of a [`status_channel`].
#[derive(Debug)]
pub struct StatusReceiver<T> {
    rx: mpsc::Receiver<Result<T, Status>>,
}

impl<T> StatusReceiver<T> {
    /// Adapt into the stream tonic sends as a server response.
    pub fn into_stream(self) -> ReceiverStream<Result<T, Status>> {
        ReceiverStream::new(self.rx)
    }
}

#[async_trait]
impl<T: Send> WireSource<T> for StatusReceiver<T> {
    async fn recv(&mut self) -> Result<Option<T>, Status> {
        match self.rx.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(status)) => Err(status),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_channel_delivers_messages_then_status() {
        let (mut tx, mut rx) = status_channel::<u32>(4);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert!(tx.fail(Status::internal("boom")).await);
        drop(tx);

        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(rx.recv().await.unwrap(), Some(2));
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_sender_is_half_close() {
        let (mut tx, mut rx) = mpsc::channel::<u32>(1);
        WireSink::send(&mut tx, 7).await.unwrap();
        drop(tx);

        assert_eq!(WireSource::recv(&mut rx).await.unwrap(), Some(7));
        assert_eq!(WireSource::recv(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_to_closed_peer_fails() {
        let (mut tx, rx) = status_channel::<u32>(1);
        drop(rx);
        assert!(WireSink::send(&mut tx, 1).await.is_err());
    }
}
