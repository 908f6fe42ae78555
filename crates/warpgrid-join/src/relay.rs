//! Join relay for proxies.
//!
//! A proxy that terminates a node's connection forwards the join upstream
//! and stamps the `ClientInit` with where the node really came from. The
//! upstream authority must list the proxy in its `trusted_proxies`.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::JoinClient;
use crate::error::{JoinError, StreamError};
use crate::handler::{JoinContext, JoinHandler, PeerInfo};
use crate::messages::{ClientInit, ProxySuppliedParameters, Request, Response};
use crate::server::DEFAULT_STREAM_BUFFER;

/// [`JoinHandler`] that relays every join to an upstream authority.
#[derive(Debug, Clone)]
pub struct ProxyRelay {
    upstream: JoinClient,
    buffer: usize,
}

impl ProxyRelay {
    pub fn new(upstream: JoinClient) -> Self {
        Self {
            upstream,
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

/// Record the node's address and version on its `ClientInit`.
///
/// Parameters already present were set by an earlier trusted hop (the server
/// adapter drops streams carrying them from anyone else) and are kept.
fn stamp_proxy_parameters(init: &mut ClientInit, peer: &PeerInfo) {
    if init.proxy_supplied_parameters.is_some() {
        return;
    }
    init.proxy_supplied_parameters = Some(ProxySuppliedParameters {
        remote_addr: peer
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
        client_version: peer.client_version.clone().unwrap_or_default(),
    });
}

#[async_trait]
impl JoinHandler for ProxyRelay {
    async fn join(
        &self,
        ctx: JoinContext,
        mut requests: mpsc::Receiver<Request>,
        responses: mpsc::Sender<Response>,
    ) -> Result<(), JoinError> {
        let mut upstream = self.upstream.clone();
        let (upstream_tx, upstream_rx) = mpsc::channel(self.buffer);

        let forward = async {
            loop {
                let request = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(JoinError::Canceled),
                    request = requests.recv() => request,
                };
                let Some(mut request) = request else {
                    break;
                };
                if let Request::ClientInit(init) = &mut request {
                    stamp_proxy_parameters(init, &ctx.peer);
                    debug!(node = %init.node_name, "relaying join upstream");
                }
                if upstream_tx.send(request).await.is_err() {
                    return Err(JoinError::sequence(
                        "request received after the upstream join ended",
                    ));
                }
            }
            // Node half-closed; pass it on.
            drop(upstream_tx);
            Ok(())
        };
        let relay = async {
            upstream
                .join(&ctx.cancel, upstream_rx, responses)
                .await
                .map_err(StreamError::into_inner)
        };

        tokio::try_join!(forward, relay)?;
        Ok(())
    }
}
