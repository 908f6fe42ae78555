//! Join-method verifiers.
//!
//! A verifier owns the trust decision for one join method. The service hands
//! it the node's `ClientInit` and a [`MethodExchange`] for any round trips
//! the method needs; the payloads are opaque to everything but the verifier
//! and the node's matching solver.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::JoinError;
use crate::messages::{ClientInit, MethodPayload, Request, Response};

/// Trust decision for one join method.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Accept or reject the node.
    ///
    /// Return `Ok(())` once the node is trusted; a rejection should be
    /// [`JoinError::VerifierRejected`]. Retries inside the method are the
    /// verifier's business, but the service bounds the whole call with its
    /// join deadline.
    async fn verify(
        &self,
        init: &ClientInit,
        exchange: &mut MethodExchange<'_>,
    ) -> Result<(), JoinError>;
}

/// Method-specific round trips between a verifier and the joining node.
pub struct MethodExchange<'a> {
    method: &'a str,
    requests: &'a mut mpsc::Receiver<Request>,
    responses: &'a mpsc::Sender<Response>,
}

impl<'a> MethodExchange<'a> {
    pub fn new(
        method: &'a str,
        requests: &'a mut mpsc::Receiver<Request>,
        responses: &'a mpsc::Sender<Response>,
    ) -> Self {
        Self {
            method,
            requests,
            responses,
        }
    }

    /// Join method this exchange belongs to.
    pub fn method(&self) -> &str {
        self.method
    }

    /// Send one method payload to the node.
    pub async fn send(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), JoinError> {
        self.responses
            .send(Response::MethodPayload(MethodPayload::new(payload)))
            .await
            // The writer only goes away when the stream is being torn down.
            .map_err(|_| JoinError::Canceled)
    }

    /// Wait for the node's next method payload.
    pub async fn recv(&mut self) -> Result<Vec<u8>, JoinError> {
        match self.requests.recv().await {
            Some(Request::MethodPayload(msg)) => Ok(msg.payload),
            Some(other) => Err(JoinError::sequence(format!(
                "unexpected {} during {} method exchange",
                other.kind(),
                self.method
            ))),
            None => Err(JoinError::sequence(format!(
                "node closed the stream during {} method exchange",
                self.method
            ))),
        }
    }

    /// Send a challenge and wait for the answer.
    pub async fn round_trip(&mut self, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>, JoinError> {
        self.send(payload).await?;
        self.recv().await
    }

    /// Fail if the node sent requests the verifier never consumed.
    pub(crate) fn ensure_drained(&mut self) -> Result<(), JoinError> {
        match self.requests.try_recv() {
            Ok(extra) => Err(JoinError::sequence(format!(
                "unexpected {} after {} method exchange",
                extra.kind(),
                self.method
            ))),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(()),
        }
    }
}

/// Verifiers keyed by join method identifier.
#[derive(Clone, Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<String, Arc<dyn Verifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `verifier` for `method`, replacing any earlier one.
    pub fn register(&mut self, method: impl Into<String>, verifier: Arc<dyn Verifier>) {
        self.verifiers.insert(method.into(), verifier);
    }

    pub fn with(mut self, method: impl Into<String>, verifier: Arc<dyn Verifier>) -> Self {
        self.register(method, verifier);
        self
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Verifier>> {
        self.verifiers.get(method).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    /// Registered method identifiers, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.verifiers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

impl fmt::Debug for VerifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifierRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl Verifier for AcceptAll {
        async fn verify(
            &self,
            _init: &ClientInit,
            _exchange: &mut MethodExchange<'_>,
        ) -> Result<(), JoinError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lookup() {
        assert!(VerifierRegistry::new().is_empty());
        let registry = VerifierRegistry::new()
            .with("token", Arc::new(AcceptAll))
            .with("iam", Arc::new(AcceptAll));

        assert!(!registry.is_empty());
        assert!(registry.get("token").is_some());
        assert!(registry.get("unknown-method").is_none());
        assert_eq!(registry.methods(), vec!["iam", "token"]);
    }

    #[tokio::test]
    async fn round_trip_sends_then_receives() {
        let (req_tx, mut req_rx) = mpsc::channel(4);
        let (resp_tx, mut resp_rx) = mpsc::channel(4);
        req_tx
            .send(Request::MethodPayload(MethodPayload::new(b"answer".to_vec())))
            .await
            .unwrap();

        let mut exchange = MethodExchange::new("token", &mut req_rx, &resp_tx);
        let answer = exchange.round_trip(b"challenge".to_vec()).await.unwrap();
        assert_eq!(answer, b"answer");
        assert!(exchange.ensure_drained().is_ok());

        assert_eq!(
            resp_rx.recv().await,
            Some(Response::MethodPayload(MethodPayload::new(b"challenge".to_vec())))
        );
    }

    #[tokio::test]
    async fn client_init_during_exchange_is_a_violation() {
        let (req_tx, mut req_rx) = mpsc::channel(4);
        let (resp_tx, _resp_rx) = mpsc::channel(4);
        req_tx
            .send(Request::ClientInit(ClientInit::new("token", "node-1")))
            .await
            .unwrap();

        let mut exchange = MethodExchange::new("token", &mut req_rx, &resp_tx);
        assert!(matches!(
            exchange.recv().await,
            Err(JoinError::ProtocolSequenceViolation(_))
        ));
    }

    #[tokio::test]
    async fn half_close_during_exchange_is_a_violation() {
        let (req_tx, mut req_rx) = mpsc::channel::<Request>(1);
        drop(req_tx);
        let (resp_tx, _resp_rx) = mpsc::channel(1);

        let mut exchange = MethodExchange::new("iam", &mut req_rx, &resp_tx);
        assert!(matches!(
            exchange.recv().await,
            Err(JoinError::ProtocolSequenceViolation(_))
        ));
        // A closed channel has nothing left over.
        assert!(exchange.ensure_drained().is_ok());
    }

    #[tokio::test]
    async fn leftover_request_is_reported() {
        let (req_tx, mut req_rx) = mpsc::channel(4);
        let (resp_tx, _resp_rx) = mpsc::channel(4);
        req_tx
            .send(Request::ClientInit(ClientInit::new("token", "node-1")))
            .await
            .unwrap();

        let mut exchange = MethodExchange::new("token", &mut req_rx, &resp_tx);
        let err = exchange.ensure_drained().unwrap_err();
        assert!(err.to_string().contains("ClientInit"));
    }
}
