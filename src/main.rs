use anyhow::Result;
use clap::Parser;
use daikinmodbus::{config::{init_logging, BusArgs}, engine::Engine};
use tracing::info;


/// Keep every unit behind the adaptor discovered and in sync, logging each
/// unit's status registers as they are read.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    bus: BusArgs,
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging();

    let client = args.bus.connect().await?;

    let mut engine = Engine::new(client, args.bus.engine_config());

    engine.on_status(|unit, status| {
        info!("unit {} ({}): {:02x?}", unit.index(), unit.kind(), status);
    });

    let handle = engine.spawn();

    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    drop(handle);

    Ok(())
}
