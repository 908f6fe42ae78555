//! Protocol translator between [`crate::messages`] and the gRPC schema.
//!
//! One wire message maps to exactly one protocol message and back. This is
//! the only module that knows the shape of [`crate::proto`].

use std::time::SystemTime;

use crate::error::JoinError;
use crate::messages::{
    ClientInit, JoinResult, MethodPayload, ProxySuppliedParameters, Request, Response, ServerInit,
};
use crate::proto::{self, join_request, join_response};

/// Decode a request received by the server.
pub fn request_from_wire(req: proto::JoinRequest) -> Result<Request, JoinError> {
    match req.payload {
        Some(join_request::Payload::ClientInit(init)) => {
            Ok(Request::ClientInit(client_init_from_wire(init)?))
        }
        Some(join_request::Payload::MethodPayload(msg)) => {
            Ok(Request::MethodPayload(MethodPayload::new(msg.payload)))
        }
        None => Err(JoinError::UnrecognizedMessage(
            "join request carries no known payload".to_string(),
        )),
    }
}

/// Encode a request sent by the client.
pub fn request_to_wire(req: Request) -> Result<proto::JoinRequest, JoinError> {
    let payload = match req {
        Request::ClientInit(init) => join_request::Payload::ClientInit(client_init_to_wire(init)),
        Request::MethodPayload(msg) => {
            join_request::Payload::MethodPayload(proto::MethodPayload {
                payload: msg.payload,
            })
        }
    };
    Ok(proto::JoinRequest {
        payload: Some(payload),
    })
}

/// Decode a response received by the client.
pub fn response_from_wire(resp: proto::JoinResponse) -> Result<Response, JoinError> {
    match resp.payload {
        Some(join_response::Payload::Init(init)) => Ok(Response::ServerInit(ServerInit {
            join_method: init.join_method,
        })),
        Some(join_response::Payload::MethodPayload(msg)) => {
            Ok(Response::MethodPayload(MethodPayload::new(msg.payload)))
        }
        Some(join_response::Payload::Result(result)) => Ok(Response::Result(JoinResult {
            tls_cert: result.tls_cert,
            tls_ca_certs: result.tls_ca_certs,
            ssh_cert: result.ssh_cert,
            ssh_ca_keys: result.ssh_ca_keys,
            host_id: result.host_id,
        })),
        None => Err(JoinError::UnrecognizedMessage(
            "join response carries no known payload".to_string(),
        )),
    }
}

/// Encode a response sent by the server.
pub fn response_to_wire(resp: Response) -> Result<proto::JoinResponse, JoinError> {
    let payload = match resp {
        Response::ServerInit(init) => join_response::Payload::Init(proto::ServerInit {
            join_method: init.join_method,
        }),
        Response::MethodPayload(msg) => {
            join_response::Payload::MethodPayload(proto::MethodPayload {
                payload: msg.payload,
            })
        }
        Response::Result(result) => join_response::Payload::Result(proto::Result {
            tls_cert: result.tls_cert,
            tls_ca_certs: result.tls_ca_certs,
            ssh_cert: result.ssh_cert,
            ssh_ca_keys: result.ssh_ca_keys,
            host_id: result.host_id,
        }),
    };
    Ok(proto::JoinResponse {
        payload: Some(payload),
    })
}

fn client_init_from_wire(init: proto::ClientInit) -> Result<ClientInit, JoinError> {
    // An absent expiry decodes as the epoch; the service rejects it as expired.
    let expires = match init.expires {
        Some(ts) => SystemTime::try_from(ts).map_err(|e| {
            JoinError::UnrecognizedMessage(format!("invalid expiry timestamp: {e}"))
        })?,
        None => SystemTime::UNIX_EPOCH,
    };

    Ok(ClientInit {
        join_method: init.join_method,
        token_name: init.token_name,
        node_name: init.node_name,
        role: init.role,
        additional_principals: init.additional_principals,
        dns_names: init.dns_names,
        public_tls_key: init.public_tls_key,
        public_ssh_key: init.public_ssh_key,
        expires,
        proxy_supplied_parameters: init.proxy_supplied_parameters.map(|p| {
            ProxySuppliedParameters {
                remote_addr: p.remote_addr,
                client_version: p.client_version,
            }
        }),
    })
}

fn client_init_to_wire(init: ClientInit) -> proto::ClientInit {
    proto::ClientInit {
        join_method: init.join_method,
        token_name: init.token_name,
        node_name: init.node_name,
        role: init.role,
        additional_principals: init.additional_principals,
        dns_names: init.dns_names,
        public_tls_key: init.public_tls_key,
        public_ssh_key: init.public_ssh_key,
        expires: Some(prost_types::Timestamp::from(init.expires)),
        proxy_supplied_parameters: init.proxy_supplied_parameters.map(|p| {
            proto::ProxySuppliedParameters {
                remote_addr: p.remote_addr,
                client_version: p.client_version,
            }
        }),
    }
}
