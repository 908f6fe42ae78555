//! End-to-end join tests over real loopback gRPC.
//!
//! Each test binds its own authority (and relay, where needed) on an
//! ephemeral port and joins through `JoinClient`.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use warpgrid_join::{
    ChallengeSolver, ClientInit, ClusterCa, JoinClient, JoinError, JoinHandler, JoinServer,
    JoinService, MethodExchange, NoChallenges, ProxyRelay, ProxySuppliedParameters, Request,
    Response, Verifier, VerifierRegistry, join_cluster,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("warpgrid_join=debug")
            .with_test_writer()
            .init();
    });
}

const SECRET: &str = "join-token-1";

/// Accepts nodes presenting the shared token name.
struct TokenVerifier;

#[async_trait]
impl Verifier for TokenVerifier {
    async fn verify(
        &self,
        init: &ClientInit,
        _exchange: &mut MethodExchange<'_>,
    ) -> Result<(), JoinError> {
        if init.token_name != SECRET {
            return Err(JoinError::rejected(&init.join_method, "unknown token"));
        }
        Ok(())
    }
}

/// Sends a nonce and expects it back reversed.
struct ReverseChallenge;

#[async_trait]
impl Verifier for ReverseChallenge {
    async fn verify(
        &self,
        _init: &ClientInit,
        exchange: &mut MethodExchange<'_>,
    ) -> Result<(), JoinError> {
        let nonce = b"0123456789".to_vec();
        let answer = exchange.round_trip(nonce.clone()).await?;
        if answer.iter().rev().ne(nonce.iter()) {
            return Err(JoinError::rejected(exchange.method(), "bad challenge answer"));
        }
        Ok(())
    }
}

struct ReverseSolver;

#[async_trait]
impl ChallengeSolver for ReverseSolver {
    async fn solve(&self, _init: &ClientInit, challenge: Vec<u8>) -> Result<Vec<u8>, JoinError> {
        Ok(challenge.into_iter().rev().collect())
    }
}

/// Only accepts joins relayed by a proxy that saw the node's version.
struct RequireProxy;

#[async_trait]
impl Verifier for RequireProxy {
    async fn verify(
        &self,
        init: &ClientInit,
        _exchange: &mut MethodExchange<'_>,
    ) -> Result<(), JoinError> {
        match &init.proxy_supplied_parameters {
            Some(params) if params.client_version == "9.9.9-node" && !params.remote_addr.is_empty() => {
                Ok(())
            }
            other => Err(JoinError::rejected(
                &init.join_method,
                format!("unexpected proxy parameters: {other:?}"),
            )),
        }
    }
}

/// Never finishes.
struct Stall;

#[async_trait]
impl Verifier for Stall {
    async fn verify(
        &self,
        _init: &ClientInit,
        _exchange: &mut MethodExchange<'_>,
    ) -> Result<(), JoinError> {
        std::future::pending().await
    }
}

fn authority() -> Arc<JoinService> {
    let ca = ClusterCa::generate("warpgrid-test").unwrap();
    let verifiers = VerifierRegistry::new()
        .with("token", Arc::new(TokenVerifier))
        .with("challenge", Arc::new(ReverseChallenge))
        .with("proxied", Arc::new(RequireProxy))
        .with("stall", Arc::new(Stall));
    Arc::new(JoinService::new(verifiers, Arc::new(ca)))
}

/// Serve `handler` on an ephemeral loopback port until the returned token
/// is cancelled.
async fn start<H: JoinHandler + 'static>(
    handler: Arc<H>,
    trusted_proxies: Vec<IpAddr>,
) -> (SocketAddr, CancellationToken) {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let server = JoinServer::new(handler)
        .with_trusted_proxies(trusted_proxies)
        .with_shutdown(shutdown.clone());
    tokio::spawn(server.serve_with_listener(listener));

    (addr, shutdown)
}

async fn connect(addr: SocketAddr) -> JoinClient {
    JoinClient::connect(&addr.to_string()).await.unwrap()
}

fn node_init(method: &str) -> ClientInit {
    let key = rcgen::KeyPair::generate().unwrap();
    let csr = rcgen::CertificateParams::new(vec!["node-1".to_string()])
        .unwrap()
        .serialize_request(&key)
        .unwrap()
        .pem()
        .unwrap();

    ClientInit::new(method, "node-1")
        .token_name(SECRET)
        .role("node")
        .public_tls_key(csr)
        .expires_at(SystemTime::now() + Duration::from_secs(3600))
}

#[tokio::test]
async fn token_join_issues_certificates() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let result = join_cluster(
        &mut client,
        &CancellationToken::new(),
        node_init("token"),
        &NoChallenges,
    )
    .await
    .unwrap();

    assert_eq!(result.host_id.len(), 32);
    let cert = String::from_utf8(result.tls_cert).unwrap();
    assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(result.tls_ca_certs.len(), 1);
    shutdown.cancel();
}

#[tokio::test]
async fn challenge_method_round_trips_over_the_wire() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let result = join_cluster(
        &mut client,
        &CancellationToken::new(),
        node_init("challenge"),
        &ReverseSolver,
    )
    .await
    .unwrap();
    assert!(!result.host_id.is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn unsupported_method_reaches_the_client() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let err = join_cluster(
        &mut client,
        &CancellationToken::new(),
        node_init("unknown-method"),
        &NoChallenges,
    )
    .await
    .unwrap_err();
    assert!(
        matches!(&err, JoinError::UnsupportedJoinMethod(m) if m == "unknown-method"),
        "unexpected error: {err:?}"
    );
    shutdown.cancel();
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let err = join_cluster(
        &mut client,
        &CancellationToken::new(),
        node_init("token").token_name("stolen"),
        &NoChallenges,
    )
    .await
    .unwrap_err();
    assert!(
        matches!(&err, JoinError::VerifierRejected { method, .. } if method == "token"),
        "unexpected error: {err:?}"
    );
    shutdown.cancel();
}

#[tokio::test]
async fn half_close_after_client_init_still_joins() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let (req_tx, req_rx) = mpsc::channel(4);
    let (resp_tx, mut resp_rx) = mpsc::channel(4);
    req_tx
        .send(Request::ClientInit(node_init("token")))
        .await
        .unwrap();
    // Nothing more to say.
    drop(req_tx);

    client
        .join(&CancellationToken::new(), req_rx, resp_tx)
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Some(resp) = resp_rx.recv().await {
        kinds.push(resp.kind());
    }
    assert_eq!(kinds, vec!["ServerInit", "Result"]);
    shutdown.cancel();
}

#[tokio::test]
async fn client_cancel_ends_the_join_promptly() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        }
    };
    let join = tokio::time::timeout(
        Duration::from_secs(5),
        join_cluster(&mut client, &cancel, node_init("stall"), &NoChallenges),
    );
    let (outcome, ()) = tokio::join!(join, canceller);

    let err = outcome.expect("join outlived its cancellation").unwrap_err();
    assert!(matches!(err, JoinError::Canceled), "unexpected error: {err:?}");
    shutdown.cancel();
}

#[tokio::test]
async fn forged_proxy_parameters_are_refused() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let mut init = node_init("token");
    init.proxy_supplied_parameters = Some(ProxySuppliedParameters {
        remote_addr: "10.9.9.9:1234".to_string(),
        client_version: "9.9.9-node".to_string(),
    });

    let err = join_cluster(&mut client, &CancellationToken::new(), init, &NoChallenges)
        .await
        .unwrap_err();
    assert!(matches!(err, JoinError::InvalidRequest(_)), "unexpected error: {err:?}");
    shutdown.cancel();
}

#[tokio::test]
async fn relay_stamps_proxy_parameters() {
    let loopback: IpAddr = "127.0.0.1".parse().unwrap();
    let (upstream_addr, upstream_shutdown) = start(authority(), vec![loopback]).await;
    let relay = ProxyRelay::new(connect(upstream_addr).await);
    let (relay_addr, relay_shutdown) = start(Arc::new(relay), Vec::new()).await;

    let mut client = connect(relay_addr).await.with_client_version("9.9.9-node");
    let result = join_cluster(
        &mut client,
        &CancellationToken::new(),
        node_init("proxied"),
        &NoChallenges,
    )
    .await
    .unwrap();
    assert_eq!(result.host_id.len(), 32);

    // Without the relay the same method refuses the node.
    let mut direct = connect(upstream_addr).await.with_client_version("9.9.9-node");
    let err = join_cluster(
        &mut direct,
        &CancellationToken::new(),
        node_init("proxied"),
        &NoChallenges,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, JoinError::VerifierRejected { .. }), "unexpected error: {err:?}");

    relay_shutdown.cancel();
    upstream_shutdown.cancel();
}

#[tokio::test]
async fn responses_arrive_in_protocol_order() {
    let (addr, shutdown) = start(authority(), Vec::new()).await;
    let mut client = connect(addr).await;

    let (req_tx, req_rx) = mpsc::channel(4);
    let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(4);
    let cancel = CancellationToken::new();

    let node = async move {
        req_tx
            .send(Request::ClientInit(node_init("challenge")))
            .await
            .unwrap();
        let mut kinds = Vec::new();
        while let Some(resp) = resp_rx.recv().await {
            kinds.push(resp.kind());
            match resp {
                Response::MethodPayload(challenge) => {
                    let answer: Vec<u8> = challenge.payload.into_iter().rev().collect();
                    req_tx
                        .send(Request::MethodPayload(
                            warpgrid_join::messages::MethodPayload::new(answer),
                        ))
                        .await
                        .unwrap();
                }
                Response::Result(_) => break,
                Response::ServerInit(_) => {}
            }
        }
        drop(req_tx);
        kinds
    };
    let (joined, kinds) = tokio::join!(client.join(&cancel, req_rx, resp_tx), node);

    joined.unwrap();
    assert_eq!(kinds, vec!["ServerInit", "MethodPayload", "Result"]);
    shutdown.cancel();
}
