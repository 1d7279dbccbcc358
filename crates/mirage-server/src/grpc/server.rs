//! gRPC listener: a hand-rolled HTTP/2 service so that every method of
//! every uploaded proto is reachable without generated routing.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::grpc::descriptor::ServiceDescriptors;
use crate::storage::FileStorage;
use crate::store::StubStore;

use super::handler::GrpcHandler;

/// Serves gRPC traffic for the mock.
pub struct GrpcServer {
    handler: Arc<GrpcHandler>,
}

impl GrpcServer {
    pub fn new(
        store: Arc<dyn StubStore>,
        files: Arc<dyn FileStorage>,
        descriptors: Arc<ServiceDescriptors>,
    ) -> Self {
        Self {
            handler: Arc::new(GrpcHandler::new(store, files, descriptors)),
        }
    }

    pub async fn run(self, addr: &str) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener; tests bind to an
    /// ephemeral port and pass it in.
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        info!("grpc server listening on {}", listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let handler = Arc::clone(&self.handler);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler.handle(req).await) }
                });

                let connection = http2::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service);

                if let Err(e) = connection.await {
                    debug!("grpc connection error: {e}");
                }
            });
        }
    }
}
