//! gRPC frontend: descriptor-driven codec, unknown-method handler and the
//! dynamic reverse proxy.

pub mod descriptor;
pub mod frame;
pub mod handler;
pub mod invoker;
pub mod matching;
pub mod server;
pub mod status;

pub use server::GrpcServer;
