//! The channel contract between the stream adapters and join logic.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::JoinError;
use crate::messages::{Request, Response};

/// What the transport knows about the peer of a join stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Version the peer reported in its request metadata.
    pub client_version: Option<String>,
    /// Whether the peer is a proxy allowed to supply `ProxySuppliedParameters`.
    pub trusted_proxy: bool,
}

/// Per-stream context handed to a [`JoinHandler`].
#[derive(Debug, Clone)]
pub struct JoinContext {
    /// Cancelled when any task of the stream fails or the stream is torn down.
    pub cancel: CancellationToken,
    pub peer: PeerInfo,
}

impl JoinContext {
    pub fn new(cancel: CancellationToken, peer: PeerInfo) -> Self {
        Self { cancel, peer }
    }
}

/// Join logic driven by a server stream adapter.
///
/// `requests` yields decoded requests in arrival order and ends when the
/// peer half-closes. Returning drops `responses`, which is the only signal
/// that ends the outbound stream; an `Err` fails the stream instead.
#[async_trait]
pub trait JoinHandler: Send + Sync {
    async fn join(
        &self,
        ctx: JoinContext,
        requests: mpsc::Receiver<Request>,
        responses: mpsc::Sender<Response>,
    ) -> Result<(), JoinError>;
}
