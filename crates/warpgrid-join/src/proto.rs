//! Wire schema for `warpgrid.join.v1.JoinService`.
//!
//! The messages are written out as prost types; `build.rs` generates the
//! `join_service_server` and `join_service_client` modules around them.
//!
//! ```text
//! service JoinService {
//!   rpc Join(stream JoinRequest) returns (stream JoinResponse);
//! }
//! ```

#![allow(missing_docs)]

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRequest {
    #[prost(oneof = "join_request::Payload", tags = "1, 2")]
    pub payload: ::core::option::Option<join_request::Payload>,
}

pub mod join_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        ClientInit(super::ClientInit),
        #[prost(message, tag = "2")]
        MethodPayload(super::MethodPayload),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinResponse {
    #[prost(oneof = "join_response::Payload", tags = "1, 2, 3")]
    pub payload: ::core::option::Option<join_response::Payload>,
}

pub mod join_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Init(super::ServerInit),
        #[prost(message, tag = "2")]
        MethodPayload(super::MethodPayload),
        #[prost(message, tag = "3")]
        Result(super::Result),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientInit {
    #[prost(string, tag = "1")]
    pub join_method: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub token_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub node_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub role: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "5")]
    pub additional_principals: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "6")]
    pub dns_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "7")]
    pub public_tls_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub public_ssh_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "9")]
    pub expires: ::core::option::Option<::prost_types::Timestamp>,
    #[prost(message, optional, tag = "10")]
    pub proxy_supplied_parameters: ::core::option::Option<ProxySuppliedParameters>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxySuppliedParameters {
    #[prost(string, tag = "1")]
    pub remote_addr: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub client_version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerInit {
    #[prost(string, tag = "1")]
    pub join_method: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MethodPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Result {
    #[prost(bytes = "vec", tag = "1")]
    pub tls_cert: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub tls_ca_certs: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", tag = "3")]
    pub ssh_cert: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub ssh_ca_keys: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, tag = "5")]
    pub host_id: ::prost::alloc::string::String,
}

include!(concat!(env!("OUT_DIR"), "/warpgrid.join.v1.JoinService.rs"));
