//! Node-side join handshake.
//!
//! [`join_cluster`] is what a node runs at startup: it sends its
//! `ClientInit`, answers whatever the join method asks through a
//! [`ChallengeSolver`], and hands back the issued credentials.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::JoinClient;
use crate::error::{JoinError, StreamError};
use crate::messages::{ClientInit, JoinResult, MethodPayload, Request, Response};
use crate::server::DEFAULT_STREAM_BUFFER;

/// Node half of a join method's exchange.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Answer one method payload from the authority.
    async fn solve(&self, init: &ClientInit, challenge: Vec<u8>) -> Result<Vec<u8>, JoinError>;
}

/// Solver for join methods that never send a challenge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChallenges;

#[async_trait]
impl ChallengeSolver for NoChallenges {
    async fn solve(&self, init: &ClientInit, _challenge: Vec<u8>) -> Result<Vec<u8>, JoinError> {
        Err(JoinError::sequence(format!(
            "join method {:?} sent a challenge this node cannot answer",
            init.join_method
        )))
    }
}

/// Join the cluster through `client`.
///
/// Succeeds only with a complete `Result`. Any failure means the whole
/// handshake has to be retried from a fresh `ClientInit`.
pub async fn join_cluster(
    client: &mut JoinClient,
    cancel: &CancellationToken,
    init: ClientInit,
    solver: &dyn ChallengeSolver,
) -> Result<JoinResult, JoinError> {
    let (request_tx, request_rx) = mpsc::channel(DEFAULT_STREAM_BUFFER);
    let (response_tx, response_rx) = mpsc::channel(DEFAULT_STREAM_BUFFER);
    let node = init.node_name.clone();

    let stream = async {
        client
            .join(cancel, request_rx, response_tx)
            .await
            .map_err(StreamError::into_inner)
    };
    let handshake = handshake(init, request_tx, response_rx, solver);

    let ((), result) = tokio::try_join!(stream, handshake)?;
    info!(%node, host_id = %result.host_id, "joined cluster");
    Ok(result)
}

async fn handshake(
    init: ClientInit,
    requests: mpsc::Sender<Request>,
    mut responses: mpsc::Receiver<Response>,
    solver: &dyn ChallengeSolver,
) -> Result<JoinResult, JoinError> {
    send(&requests, Request::ClientInit(init.clone())).await?;

    match responses.recv().await {
        Some(Response::ServerInit(server_init)) if server_init.join_method == init.join_method => {
            debug!(method = %init.join_method, "authority accepted join method");
        }
        Some(Response::ServerInit(server_init)) => {
            return Err(JoinError::sequence(format!(
                "authority answered join method {:?} for {:?}",
                server_init.join_method, init.join_method
            )));
        }
        Some(other) => {
            return Err(JoinError::sequence(format!(
                "expected ServerInit, got {}",
                other.kind()
            )));
        }
        None => return Err(JoinError::sequence("join stream ended before ServerInit")),
    }

    loop {
        match responses.recv().await {
            Some(Response::MethodPayload(challenge)) => {
                let answer = solver.solve(&init, challenge.payload).await?;
                send(&requests, Request::MethodPayload(MethodPayload::new(answer))).await?;
            }
            Some(Response::Result(result)) => {
                // Half-close: nothing more to send.
                drop(requests);
                return Ok(result);
            }
            Some(Response::ServerInit(_)) => {
                return Err(JoinError::sequence("duplicate ServerInit"));
            }
            None => return Err(JoinError::sequence("join stream ended before Result")),
        }
    }
}

async fn send(requests: &mpsc::Sender<Request>, request: Request) -> Result<(), JoinError> {
    requests
        .send(request)
        .await
        .map_err(|_| JoinError::Canceled)
}
