//! Generates the `JoinService` gRPC stubs.
//!
//! The wire messages are hand-written prost types in `src/proto.rs`, so the
//! service is described manually and no `protoc` is needed at build time.

fn main() {
    let join = tonic_build::manual::Method::builder()
        .name("join")
        .route_name("Join")
        .input_type("crate::proto::JoinRequest")
        .output_type("crate::proto::JoinResponse")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("JoinService")
        .package("warpgrid.join.v1")
        .method(join)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
