use clap::Parser;
use std::net::SocketAddr;
use tntbench::{TupleServer, TupleStore};
use tokio::signal::ctrl_c;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    #[clap(long, default_value = "127.0.0.1:3301")]
    addr: SocketAddr,

    /// Space ids to create on startup.
    #[clap(long, value_delimiter = ',', default_value = "1024")]
    spaces: Vec<u32>,

    #[clap(long, default_value = "info", env = "TNT_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .init();

    let store = TupleStore::with_spaces(app.spaces.iter().copied());
    let server = TupleServer::bind(store, app.addr).await?;
    info!(spaces = ?app.spaces, "Serving in-memory tuple store");

    tokio::select! {
        res = server.run() => res?,
        res = ctrl_c() => match res {
            Ok(_) => info!("Received shutdown signal"),
            Err(e) => error!("Error receiving Ctrl-C: {e}"),
        },
    }

    Ok(())
}
