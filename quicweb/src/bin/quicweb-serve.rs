//! Serve a directory over HTTP/3 until Ctrl-C.

use clap::Parser;
use quicweb::config::ServeArgs;
use quicweb::{Server, logging};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServeArgs::parse();
    logging::init(logging::DEFAULT_FILTER);

    let server = Server::bind(&args.server_config()).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                signal.cancel();
            }
            Err(error) => warn!(%error, "cannot listen for Ctrl-C"),
        }
    });

    server.run(shutdown).await?;
    Ok(())
}
