//! Transport-independent join protocol messages.
//!
//! These are the values the join service and its tests work with. They know
//! nothing about the gRPC schema; [`crate::convert`] maps them to and from
//! the wire. Adding a join method that needs its own messages means adding a
//! variant here, never changing an existing one.

use std::time::SystemTime;

/// A message sent by a joining node (or a proxy on its behalf).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// First message of every join stream.
    ClientInit(ClientInit),
    /// Opaque method-specific message (challenge answer, attestation, ...).
    MethodPayload(MethodPayload),
}

impl Request {
    /// Variant name, used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::ClientInit(_) => "ClientInit",
            Request::MethodPayload(_) => "MethodPayload",
        }
    }
}

/// A message sent by the cluster authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The server accepted the join method and is ready for its exchange.
    ServerInit(ServerInit),
    /// Opaque method-specific message (challenge, nonce, ...).
    MethodPayload(MethodPayload),
    /// Terminal success: the issued credentials.
    Result(JoinResult),
}

impl Response {
    /// Variant name, used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::ServerInit(_) => "ServerInit",
            Response::MethodPayload(_) => "MethodPayload",
            Response::Result(_) => "Result",
        }
    }
}

/// The join request that opens a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInit {
    /// Join method identifier, e.g. `"token"` or `"iam"`.
    pub join_method: String,
    /// Name of the provisioning token the node presents.
    pub token_name: String,
    pub node_name: String,
    pub role: String,
    pub additional_principals: Vec<String>,
    pub dns_names: Vec<String>,
    /// Node's public TLS key material, opaque to the protocol engine.
    pub public_tls_key: Vec<u8>,
    /// Node's public SSH key material, opaque to the protocol engine.
    pub public_ssh_key: Vec<u8>,
    /// Requested certificate expiry.
    pub expires: SystemTime,
    /// Set only by a trusted proxy relaying the join for the node.
    pub proxy_supplied_parameters: Option<ProxySuppliedParameters>,
}

impl ClientInit {
    /// Start a request for `node_name` using `join_method`.
    ///
    /// Everything else is empty and the expiry is the Unix epoch, which the
    /// service rejects; set it with [`ClientInit::expires_at`].
    pub fn new(join_method: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            join_method: join_method.into(),
            token_name: String::new(),
            node_name: node_name.into(),
            role: String::new(),
            additional_principals: Vec::new(),
            dns_names: Vec::new(),
            public_tls_key: Vec::new(),
            public_ssh_key: Vec::new(),
            expires: SystemTime::UNIX_EPOCH,
            proxy_supplied_parameters: None,
        }
    }

    pub fn token_name(mut self, token_name: impl Into<String>) -> Self {
        self.token_name = token_name.into();
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Extra principals for the node's SSH certificate.
    pub fn additional_principals<I, P>(mut self, principals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.additional_principals = principals.into_iter().map(Into::into).collect();
        self
    }

    /// Names to put in the certificate's subject alternative names.
    pub fn dns_names<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.dns_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn public_tls_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.public_tls_key = key.into();
        self
    }

    pub fn public_ssh_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.public_ssh_key = key.into();
        self
    }

    pub fn expires_at(mut self, expires: SystemTime) -> Self {
        self.expires = expires;
        self
    }
}

/// Metadata a relaying proxy attaches about the node it forwards for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySuppliedParameters {
    /// Address the node connected to the proxy from.
    pub remote_addr: String,
    /// Version the node reported to the proxy.
    pub client_version: String,
}

/// Server acknowledgement of the join method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub join_method: String,
}

/// Method-specific message body. Only the selected verifier (and the node's
/// matching solver) interpret the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodPayload {
    pub payload: Vec<u8>,
}

impl MethodPayload {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Credentials issued to a node that completed its join.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JoinResult {
    pub tls_cert: Vec<u8>,
    pub tls_ca_certs: Vec<Vec<u8>>,
    pub ssh_cert: Vec<u8>,
    pub ssh_ca_keys: Vec<Vec<u8>>,
    /// Host identifier assigned to the node.
    pub host_id: String,
}
