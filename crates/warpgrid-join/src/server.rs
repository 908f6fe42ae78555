//! Join gRPC server: cluster authority side.
//!
//! [`serve_join_stream`] bridges one accepted stream to a [`JoinHandler`].
//! Three tasks share a cancellation token and the first error wins:
//!
//! ```text
//! wire ──> reader ──requests──> JoinHandler ──responses──> writer ──> wire
//! ```
//!
//! [`JoinServer`] mounts that adapter as the tonic `JoinService`.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};

use crate::config::JoinConfig;
use crate::convert;
use crate::error::{JoinError, StreamError, StreamTask};
use crate::handler::{JoinContext, JoinHandler, PeerInfo};
use crate::messages::{Request, Response};
use crate::proto;
use crate::proto::join_service_server::{JoinService as GrpcJoinService, JoinServiceServer};
use crate::transport::{WireSink, WireSource, status_channel};

/// Request metadata header carrying the joining client's version.
pub const CLIENT_VERSION_HEADER: &str = "warpgrid-client-version";

/// Default capacity of the channels between the stream tasks.
pub const DEFAULT_STREAM_BUFFER: usize = 8;

/// Default time the reader waits for the peer's half-close once the
/// handler has finished.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Per-stream tuning shared by every join stream a server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Capacity of the request and response channels.
    pub buffer: usize,
    /// How long a finished stream stays open waiting for the peer to
    /// half-close before it is closed from this side.
    pub close_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_STREAM_BUFFER,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Run one join stream to completion.
///
/// The handler runs on its own task so blocking work inside a verifier or
/// issuer cannot starve the reader and writer. Returns once all three have
/// stopped. The reader treats the peer's half-close as the end of requests,
/// not as an error; once the handler has dropped its request receiver it
/// waits at most `settings.close_grace` for that half-close. The writer
/// stops when the handler drops its response sender. Any other failure
/// cancels the remaining tasks and is returned tagged with the task it came
/// from.
pub async fn serve_join_stream<H, S, K>(
    handler: Arc<H>,
    ctx: JoinContext,
    source: S,
    sink: K,
    settings: StreamSettings,
) -> Result<(), StreamError>
where
    H: JoinHandler + ?Sized + 'static,
    S: WireSource<proto::JoinRequest>,
    K: WireSink<proto::JoinResponse>,
{
    let cancel = ctx.cancel.child_token();
    let _guard = cancel.clone().drop_guard();
    let trusted_proxy = ctx.peer.trusted_proxy;
    let buffer = settings.buffer.max(1);

    let (request_tx, request_rx) = mpsc::channel(buffer);
    let (response_tx, response_rx) = mpsc::channel(buffer);

    let service_ctx = JoinContext::new(cancel.clone(), ctx.peer);
    // Dropping the handle aborts the handler if another task fails first.
    let task = AbortOnDropHandle::new(tokio::spawn(async move {
        handler.join(service_ctx, request_rx, response_tx).await
    }));
    let service = async move {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Err(JoinError::Canceled),
            Err(err) => Err(JoinError::Transport(Status::internal(format!(
                "join handler panicked: {err}"
            )))),
        };
        outcome.map_err(|e| StreamError::new(StreamTask::Service, e))
    };
    let reader = async {
        read_requests(source, request_tx, &cancel, trusted_proxy, settings.close_grace)
            .await
            .map_err(|e| StreamError::new(StreamTask::Recv, e))
    };
    let writer = async {
        write_responses(sink, response_rx, &cancel)
            .await
            .map_err(|e| StreamError::new(StreamTask::Send, e))
    };

    tokio::try_join!(service, reader, writer)?;
    Ok(())
}

async fn read_requests<S>(
    mut source: S,
    requests: mpsc::Sender<Request>,
    cancel: &CancellationToken,
    trusted_proxy: bool,
    close_grace: Duration,
) -> Result<(), JoinError>
where
    S: WireSource<proto::JoinRequest>,
{
    loop {
        let wire = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            _ = requests.closed() => {
                return await_half_close(&mut source, cancel, close_grace).await;
            }
            wire = source.recv() => wire.map_err(JoinError::from_status)?,
        };
        let Some(wire) = wire else {
            debug!("join client closed its request stream");
            return Ok(());
        };

        let request = convert::request_from_wire(wire)?;
        if let Request::ClientInit(init) = &request {
            if init.proxy_supplied_parameters.is_some() && !trusted_proxy {
                return Err(JoinError::InvalidRequest(
                    "proxy supplied parameters from a peer that is not a trusted proxy"
                        .to_string(),
                ));
            }
        }
        debug!(kind = request.kind(), "received join request");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            sent = requests.send(request) => {
                if sent.is_err() {
                    return Err(late_request());
                }
            }
        }
    }
}

/// The handler stopped reading. Give the peer `grace` to half-close; any
/// request it sends instead is out of sequence.
async fn await_half_close<S>(
    source: &mut S,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<(), JoinError>
where
    S: WireSource<proto::JoinRequest>,
{
    let next = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(JoinError::Canceled),
        next = tokio::time::timeout(grace, source.recv()) => next,
    };
    match next {
        Ok(Ok(None)) => {
            debug!("join client closed its request stream");
            Ok(())
        }
        Ok(Ok(Some(_))) => Err(late_request()),
        Ok(Err(status)) => Err(JoinError::from_status(status)),
        Err(_) => {
            debug!(?grace, "join client did not half-close, closing the stream");
            Ok(())
        }
    }
}

fn late_request() -> JoinError {
    JoinError::sequence("request received after the join service stopped reading")
}

async fn write_responses<K>(
    mut sink: K,
    mut responses: mpsc::Receiver<Response>,
    cancel: &CancellationToken,
) -> Result<(), JoinError>
where
    K: WireSink<proto::JoinResponse>,
{
    loop {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            response = responses.recv() => response,
        };
        let Some(response) = response else {
            return Ok(());
        };

        let kind = response.kind();
        let wire = convert::response_to_wire(response)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            sent = sink.send(wire) => sent.map_err(JoinError::from_status)?,
        }
        debug!(kind, "sent join response");
    }
}

type JoinResponseStream =
    Pin<Box<dyn Stream<Item = Result<proto::JoinResponse, Status>> + Send + 'static>>;

/// gRPC implementation of the join service.
pub struct JoinServer<H> {
    handler: Arc<H>,
    settings: StreamSettings,
    trusted_proxies: Arc<Vec<IpAddr>>,
    shutdown: CancellationToken,
}

impl<H: JoinHandler + 'static> JoinServer<H> {
    /// Create a server that runs `handler` for every accepted join stream.
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            settings: StreamSettings::default(),
            trusted_proxies: Arc::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Apply stream buffering and proxy trust from the config file.
    pub fn with_config(self, config: &JoinConfig) -> Self {
        self.with_buffer(config.stream_buffer)
            .with_trusted_proxies(config.trusted_proxies.iter().copied())
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.settings.buffer = buffer.max(1);
        self
    }

    /// How long a finished join waits for the node to half-close.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.settings.close_grace = grace;
        self
    }

    /// Peers connecting from these addresses may relay joins for other nodes.
    pub fn with_trusted_proxies(mut self, proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_proxies = Arc::new(proxies.into_iter().map(|ip| ip.to_canonical()).collect());
        self
    }

    /// Cancelling `shutdown` stops the server and every in-flight stream.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> JoinServiceServer<Self> {
        JoinServiceServer::new(self)
    }

    /// Serve on `addr` until the shutdown token is cancelled.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
        let shutdown = self.shutdown.clone();
        info!(%addr, "join server starting");

        tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await?;

        info!("join server shut down");
        Ok(())
    }

    /// Serve connections accepted from `listener` until shutdown.
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
    ) -> Result<(), tonic::transport::Error> {
        let shutdown = self.shutdown.clone();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "join server starting");
        }

        tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;

        info!("join server shut down");
        Ok(())
    }

    fn peer_info<T>(&self, request: &tonic::Request<T>) -> PeerInfo {
        let remote_addr = request.remote_addr();
        let client_version = request
            .metadata()
            .get(CLIENT_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let trusted_proxy = remote_addr
            .is_some_and(|addr| self.trusted_proxies.contains(&addr.ip().to_canonical()));

        PeerInfo {
            remote_addr,
            client_version,
            trusted_proxy,
        }
    }
}

#[tonic::async_trait]
impl<H: JoinHandler + 'static> GrpcJoinService for JoinServer<H> {
    type JoinStream = JoinResponseStream;

    async fn join(
        &self,
        request: tonic::Request<Streaming<proto::JoinRequest>>,
    ) -> Result<tonic::Response<Self::JoinStream>, Status> {
        let peer = self.peer_info(&request);
        let inbound = request.into_inner();

        info!(
            remote = ?peer.remote_addr,
            version = peer.client_version.as_deref().unwrap_or("unknown"),
            trusted_proxy = peer.trusted_proxy,
            "join stream opened"
        );

        let (sink, outbound) = status_channel(self.settings.buffer);
        let handler = Arc::clone(&self.handler);
        let ctx = JoinContext::new(self.shutdown.child_token(), peer);
        let settings = self.settings;

        tokio::spawn(async move {
            let trailer = sink.clone();
            match serve_join_stream(handler, ctx, inbound, sink, settings).await {
                Ok(()) => debug!("join stream finished"),
                Err(err) => {
                    warn!(error = %err, "join stream failed");
                    // The peer may already be gone; nothing left to tell it.
                    let _ = trailer.fail(err.into_status()).await;
                }
            }
        });

        Ok(tonic::Response::new(Box::pin(outbound.into_stream())))
    }
}
