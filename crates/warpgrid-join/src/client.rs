//! Join client: joining node side.
//!
//! [`drive_join_stream`] is the mirror image of the server adapter: a send
//! task drains the caller's requests onto the wire and half-closes it when
//! the caller is done, while a receive task decodes responses back to the
//! caller. [`JoinClient`] opens the gRPC stream and runs it.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::convert;
use crate::error::{JoinError, StreamError, StreamTask};
use crate::messages::{Request, Response};
use crate::proto;
use crate::proto::join_service_client::JoinServiceClient;
use crate::server::{CLIENT_VERSION_HEADER, DEFAULT_STREAM_BUFFER};
use crate::transport::{WireSink, WireSource};

/// Run the client half of one join stream.
///
/// Returns `Ok` only after every request the caller enqueued was written and
/// every response up to and including `Result` was delivered in order. The
/// stream must end after `Result`; anything else is a protocol violation.
pub async fn drive_join_stream<K, S>(
    cancel: &CancellationToken,
    requests: mpsc::Receiver<Request>,
    responses: mpsc::Sender<Response>,
    sink: K,
    source: S,
) -> Result<(), StreamError>
where
    K: WireSink<proto::JoinRequest>,
    S: WireSource<proto::JoinResponse>,
{
    let cancel = cancel.child_token();
    let _guard = cancel.clone().drop_guard();

    let sender = async {
        send_requests(requests, sink, &cancel)
            .await
            .map_err(|e| StreamError::new(StreamTask::Send, e))
    };
    let receiver = async {
        receive_responses(source, responses, &cancel)
            .await
            .map_err(|e| StreamError::new(StreamTask::Recv, e))
    };

    tokio::try_join!(sender, receiver)?;
    Ok(())
}

async fn send_requests<K>(
    mut requests: mpsc::Receiver<Request>,
    mut sink: K,
    cancel: &CancellationToken,
) -> Result<(), JoinError>
where
    K: WireSink<proto::JoinRequest>,
{
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            request = requests.recv() => request,
        };
        let Some(request) = request else {
            // Dropping the sink half-closes the stream so the server's
            // reader sees a clean end of requests.
            drop(sink);
            debug!("join requests done, closed send side");
            return Ok(());
        };

        let kind = request.kind();
        let wire = convert::request_to_wire(request)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            sent = sink.send(wire) => sent.map_err(JoinError::from_status)?,
        }
        debug!(kind, "sent join request");
    }
}

async fn receive_responses<S>(
    mut source: S,
    responses: mpsc::Sender<Response>,
    cancel: &CancellationToken,
) -> Result<(), JoinError>
where
    S: WireSource<proto::JoinResponse>,
{
    let mut got_result = false;
    loop {
        let wire = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            wire = source.recv() => wire.map_err(JoinError::from_status)?,
        };
        let Some(wire) = wire else {
            if !got_result {
                return Err(JoinError::sequence("join stream ended before Result"));
            }
            return Ok(());
        };

        let response = convert::response_from_wire(wire)?;
        if got_result {
            return Err(JoinError::sequence(format!(
                "received {} after Result",
                response.kind()
            )));
        }
        got_result = matches!(response, Response::Result(_));
        debug!(kind = response.kind(), "received join response");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JoinError::Canceled),
            sent = responses.send(response) => {
                if sent.is_err() {
                    // Nobody is left to hand responses to.
                    return Err(JoinError::Canceled);
                }
            }
        }
    }
}

/// Client for the cluster authority's join service.
#[derive(Debug, Clone)]
pub struct JoinClient {
    inner: JoinServiceClient<Channel>,
    client_version: String,
    buffer: usize,
}

impl JoinClient {
    /// Wrap an established channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: JoinServiceClient::new(channel),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Connect to the authority at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let endpoint = format!("http://{addr}");
        let channel = Channel::from_shared(endpoint)?.connect().await?;
        debug!(%addr, "connected to join service");
        Ok(Self::new(channel))
    }

    /// Version reported to the server in request metadata.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Open a join stream and run it until it ends.
    ///
    /// `requests` is drained onto the stream until the caller closes it;
    /// `responses` receives every server message in order. The stream is
    /// torn down when this returns, whatever the outcome, and cancelling
    /// `cancel` aborts it.
    pub async fn join(
        &mut self,
        cancel: &CancellationToken,
        requests: mpsc::Receiver<Request>,
        responses: mpsc::Sender<Response>,
    ) -> Result<(), StreamError> {
        let cancel = cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        let (wire_tx, wire_rx) = mpsc::channel(self.buffer);
        let mut request = tonic::Request::new(ReceiverStream::new(wire_rx));
        if let Ok(version) = MetadataValue::try_from(self.client_version.as_str()) {
            request.metadata_mut().insert(CLIENT_VERSION_HEADER, version);
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JoinError::Canceled),
            opened = self.inner.join(request) => opened.map_err(JoinError::from_status),
        }
        .map_err(|e| StreamError::new(StreamTask::Open, e))?;
        info!("join stream opened");

        drive_join_stream(&cancel, requests, responses, wire_tx, opened.into_inner()).await
    }
}
