//! HTTP frontend: the mock (echo) handler, the reverse proxy and the admin
//! API, all served from one listener.

pub mod admin;
pub mod handler;
pub mod proxy;
pub mod server;

pub use server::HttpServer;
