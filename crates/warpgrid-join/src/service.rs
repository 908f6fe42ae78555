//! The join service: the authority's state machine for one join attempt.
//!
//! ```text
//! AwaitingInit ──ClientInit──> MethodExchange ──verified──> Issuing ──Result──> Closed
//!       │                            │                         │
//!       └────────── any error: return Err, never send Result ──┘
//! ```
//!
//! The whole walk is bounded by `max_join_duration` and by the stream's
//! cancellation token, so a slow node or verifier cannot hold a stream open.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::JoinConfig;
use crate::error::JoinError;
use crate::handler::{JoinContext, JoinHandler};
use crate::issuer::{CertIssuer, IssueRequest};
use crate::messages::{ClientInit, Request, Response, ServerInit};
use crate::method::{MethodExchange, VerifierRegistry};

/// Where a join attempt is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    AwaitingInit,
    MethodExchange,
    Issuing,
    Closed,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinState::AwaitingInit => "awaiting-init",
            JoinState::MethodExchange => "method-exchange",
            JoinState::Issuing => "issuing",
            JoinState::Closed => "closed",
        })
    }
}

/// Join logic of the cluster authority.
pub struct JoinService {
    verifiers: VerifierRegistry,
    issuer: Arc<dyn CertIssuer>,
    max_join_duration: Duration,
    max_cert_ttl: Duration,
}

impl JoinService {
    pub fn new(verifiers: VerifierRegistry, issuer: Arc<dyn CertIssuer>) -> Self {
        Self::from_config(&JoinConfig::default(), verifiers, issuer)
    }

    /// Take the join deadline and certificate TTL limit from `config`.
    pub fn from_config(
        config: &JoinConfig,
        verifiers: VerifierRegistry,
        issuer: Arc<dyn CertIssuer>,
    ) -> Self {
        if verifiers.is_empty() {
            warn!("join service has no join methods registered; every join will be refused");
        }
        Self {
            verifiers,
            issuer,
            max_join_duration: config.max_join_duration(),
            max_cert_ttl: config.max_cert_ttl(),
        }
    }

    pub fn with_max_join_duration(mut self, limit: Duration) -> Self {
        self.max_join_duration = limit;
        self
    }

    pub fn with_max_cert_ttl(mut self, ttl: Duration) -> Self {
        self.max_cert_ttl = ttl;
        self
    }

    /// Check the requested expiry and clamp it to the TTL limit.
    fn certificate_expiry(&self, init: &ClientInit) -> Result<SystemTime, JoinError> {
        let now = SystemTime::now();
        if init.expires <= now {
            return Err(JoinError::InvalidRequest(
                "requested certificate expiry is not in the future".to_string(),
            ));
        }
        let latest = now + self.max_cert_ttl;
        if init.expires > latest {
            debug!(
                node = %init.node_name,
                max_ttl_secs = self.max_cert_ttl.as_secs(),
                "clamping requested certificate expiry"
            );
            return Ok(latest);
        }
        Ok(init.expires)
    }

    async fn run(
        &self,
        ctx: &JoinContext,
        requests: &mut mpsc::Receiver<Request>,
        responses: &mpsc::Sender<Response>,
    ) -> Result<(), JoinError> {
        let mut state = JoinState::AwaitingInit;
        debug!(%state, "join started");

        let init = match requests.recv().await {
            Some(Request::ClientInit(init)) => init,
            Some(other) => {
                return Err(JoinError::sequence(format!(
                    "expected ClientInit, got {}",
                    other.kind()
                )));
            }
            None => return Err(JoinError::sequence("stream closed before ClientInit")),
        };

        let Some(verifier) = self.verifiers.get(&init.join_method) else {
            return Err(JoinError::UnsupportedJoinMethod(init.join_method));
        };
        let not_after = self.certificate_expiry(&init)?;

        let (remote, client_version) = match &init.proxy_supplied_parameters {
            Some(proxied) => (
                Some(proxied.remote_addr.clone()),
                Some(proxied.client_version.as_str()),
            ),
            None => (
                ctx.peer.remote_addr.map(|a| a.to_string()),
                ctx.peer.client_version.as_deref(),
            ),
        };
        info!(
            node = %init.node_name,
            method = %init.join_method,
            role = %init.role,
            remote = remote.as_deref().unwrap_or("unknown"),
            version = client_version.unwrap_or("unknown"),
            "join requested"
        );

        send(
            responses,
            Response::ServerInit(ServerInit {
                join_method: init.join_method.clone(),
            }),
        )
        .await?;
        state = JoinState::MethodExchange;
        debug!(%state, method = %init.join_method, "join method accepted");

        let mut exchange = MethodExchange::new(&init.join_method, requests, responses);
        verifier.verify(&init, &mut exchange).await?;
        exchange.ensure_drained()?;

        state = JoinState::Issuing;
        debug!(%state, node = %init.node_name, "node verified");

        let result = self
            .issuer
            .issue(&IssueRequest {
                init: &init,
                not_after,
            })
            .await?;
        let host_id = result.host_id.clone();
        send(responses, Response::Result(result)).await?;

        state = JoinState::Closed;
        debug!(%state, "join finished");
        info!(node = %init.node_name, %host_id, "node joined");
        Ok(())
    }
}

async fn send(responses: &mpsc::Sender<Response>, response: Response) -> Result<(), JoinError> {
    responses
        .send(response)
        .await
        // The writer only stops reading when the stream is torn down.
        .map_err(|_| JoinError::Canceled)
}

#[async_trait]
impl JoinHandler for JoinService {
    async fn join(
        &self,
        ctx: JoinContext,
        mut requests: mpsc::Receiver<Request>,
        responses: mpsc::Sender<Response>,
    ) -> Result<(), JoinError> {
        let bounded = tokio::time::timeout(
            self.max_join_duration,
            self.run(&ctx, &mut requests, &responses),
        );

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(JoinError::Canceled),
            res = bounded => res.unwrap_or(Err(JoinError::DeadlineExceeded)),
        };

        if let Err(err) = &outcome {
            warn!(error = %err, "join failed");
        }
        // `responses` drops here, which ends the outbound stream.
        outcome
    }
}
