use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mirage_server::config::Config;
use mirage_server::grpc::descriptor::ServiceDescriptors;
use mirage_server::grpc::GrpcServer;
use mirage_server::http::server::AppState;
use mirage_server::http::HttpServer;
use mirage_server::storage::LocalStorage;
use mirage_server::store::{StubCache, StubMemoryStore};

#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
struct Args {
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = Config::from_env();
    info!("starting mirage on {} (grpc {})", config.server_address, config.grpc_address);

    let source = Arc::new(StubMemoryStore::new());
    let cache = Arc::new(StubCache::new(
        source.clone(),
        source.clone(),
        config.stub_cache_strategy,
        config.stub_cache_ttl,
    ));
    StubCache::spawn_janitor(cache.clone(), std::time::Duration::from_secs(60));

    let files = Arc::new(LocalStorage::new(config.file_storage.clone()));
    let descriptors = Arc::new(ServiceDescriptors::new(files.clone()));

    let state = AppState::new(
        cache.clone(),
        files.clone(),
        descriptors.clone(),
        config.body_store_threshold,
    );

    let http_server = HttpServer::new(state);
    let grpc_server = GrpcServer::new(cache, files, descriptors);

    let http_addr = config.server_address.clone();
    let grpc_addr = config.grpc_address.clone();

    tokio::select! {
        result = http_server.run(&http_addr) => result?,
        result = grpc_server.run(&grpc_addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
