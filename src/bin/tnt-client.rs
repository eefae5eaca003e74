use clap::Parser;
use std::path::PathBuf;
use tntbench::client::Action;
use tntbench::{BlockingAdapter, Properties, DEFAULT_TABLE};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Properties file to load. Later files override earlier ones.
    #[clap(short = 'P', long = "properties", global = true)]
    property_files: Vec<PathBuf>,

    /// Single property as key=value, applied after all files.
    #[clap(short = 'p', long = "property", global = true)]
    properties: Vec<String>,

    #[clap(long, global = true, default_value = DEFAULT_TABLE)]
    table: String,

    #[clap(long, global = true, default_value = "warn", env = "TNT_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,

    #[clap(subcommand)]
    subcmd: Action,
}

fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .with_writer(std::io::stderr)
        .init();

    let mut props = Properties::new();
    for file in &app.property_files {
        props.merge(Properties::from_file(file)?);
    }
    for pair in &app.properties {
        props.set_pair(pair)?;
    }

    let adapter = BlockingAdapter::init(&props)?;
    let status = app
        .subcmd
        .execute(&adapter, &app.table, &mut std::io::stdout().lock())?;
    if !adapter.cleanup().is_ok() {
        warn!("Connection was not closed cleanly");
    }
    std::process::exit(status.code());
}
