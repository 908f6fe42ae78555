//! warpgrid-join: how nodes join a WarpGrid cluster.
//!
//! An unenrolled node opens one bidirectional gRPC stream to the cluster
//! authority, proves it may join with one of the registered join methods,
//! and receives the certificates it needs to act as a cluster member.
//!
//! # Architecture
//!
//! ```text
//! Joining node                               Cluster authority
//!   join_cluster()                             JoinServer (gRPC)
//!   └── JoinClient                             └── serve_join_stream
//!       ├── send task ──── JoinRequest ────>       ├── reader ──> JoinService
//!       └── recv task <─── JoinResponse ────       ├── writer <──     ├── VerifierRegistry
//!                                                  │                  └── CertIssuer (ClusterCa)
//!                                                  └── first error cancels the rest
//!
//! Proxy: JoinServer<ProxyRelay> ── stamps ProxySuppliedParameters ──> upstream JoinClient
//! ```
//!
//! Everything above the stream adapters works on [`messages`] values; only
//! [`convert`] knows the wire schema in [`proto`].

pub mod client;
pub mod config;
pub mod convert;
pub mod error;
pub mod handler;
pub mod issuer;
pub mod joiner;
pub mod messages;
pub mod method;
pub mod proto;
pub mod relay;
pub mod server;
pub mod service;
pub mod tls;
pub mod transport;

pub use client::JoinClient;
pub use config::JoinConfig;
pub use error::{JoinError, StreamError, StreamTask};
pub use handler::{JoinContext, JoinHandler, PeerInfo};
pub use issuer::{CertIssuer, IssueRequest};
pub use joiner::{ChallengeSolver, NoChallenges, join_cluster};
pub use messages::{ClientInit, JoinResult, ProxySuppliedParameters, Request, Response};
pub use method::{MethodExchange, Verifier, VerifierRegistry};
pub use relay::ProxyRelay;
pub use server::{JoinServer, StreamSettings};
pub use service::JoinService;
pub use tls::ClusterCa;
