use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quorum_lite::api;
use quorum_lite::config;
use quorum_lite::shutdown;
use quorum_lite::Cluster;

/// Fixed port of the HTTP control surface.
const CONTROL_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "quorum-lite")]
#[command(about = "An in-process Raft-style cluster with an HTTP control surface")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config::load_config(&args.config)?;

    tracing::info!(nodes = config.nodes_number, "starting cluster");
    let cluster = Arc::new(Cluster::new(config.nodes_number).await?);

    let token = shutdown::install_shutdown_handler();

    let cluster_task = tokio::spawn({
        let cluster = cluster.clone();
        let token = token.clone();
        async move { cluster.run(token).await }
    });

    let addr: SocketAddr = ([0, 0, 0, 0], CONTROL_PORT).into();
    let served = api::serve(addr, cluster, token.clone()).await;

    // The API is down, whether by signal or by error: stop the nodes too.
    token.cancel();
    cluster_task.await??;
    served?;

    tracing::info!("shutdown complete");
    Ok(())
}
