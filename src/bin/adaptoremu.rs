use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use clap::Parser;
use daikinmodbus::{config::init_logging, emulator::*, protocol::addresses::UNIT_COUNT, unit::StatusBlock};
use rand::Rng;
use tokio::{net::TcpListener, sync::Mutex, time::sleep};
use tracing::{info, warn};


/// Emulator for the Modbus adaptor and the units behind it
///
/// Connect with a tcp+raw://host:port URL.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address and port to listen on (host:port)
    #[arg(default_value = "127.0.0.1:5020")]
    listen: String,

    /// Slots with an air conditioner connected
    #[arg(long, value_delimiter = ',', default_values_t = [0, 1, 3])]
    units: Vec<usize>,

    /// Slots with a heat reclaim ventilation unit connected
    #[arg(long, value_delimiter = ',')]
    ventilation: Vec<usize>,

    /// Seconds the adaptor reports "not ready" after starting
    #[arg(long, default_value_t = 0)]
    boot_secs: u64,
}


/// A status block for a unit that is on, heating, at a random room temperature.
fn random_status() -> StatusBlock {
    let room: i16 = rand::thread_rng().gen_range(180..260);
    let setpoint: i16 = 220;

    let mut status = [0; 12];
    status[0..2].copy_from_slice(&1u16.to_be_bytes());
    status[2..4].copy_from_slice(&1u16.to_be_bytes());
    status[4..6].copy_from_slice(&setpoint.to_be_bytes());
    status[8..10].copy_from_slice(&room.to_be_bytes());
    status
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging();

    let mut adaptor = Adaptor::new();

    for &index in &args.units {
        if index >= UNIT_COUNT {
            bail!("unit slot {index} out of range");
        }
        adaptor.connect(index, AIR_CONDITIONER_CAPABILITIES, random_status());
    }

    for &index in &args.ventilation {
        if index >= UNIT_COUNT {
            bail!("unit slot {index} out of range");
        }
        adaptor.connect(index, VENTILATION_CAPABILITIES, random_status());
    }

    let adaptor = Arc::new(Mutex::new(adaptor));

    if args.boot_secs > 0 {
        adaptor.lock().await.set_ready(false);

        tokio::spawn({
            let adaptor = adaptor.clone();
            let boot = Duration::from_secs(args.boot_secs);

            async move {
                sleep(boot).await;
                adaptor.lock().await.set_ready(true);
                info!("adaptor ready");
            }
        });
    }

    let listener = TcpListener::bind(&args.listen).await?;

    info!("listening on {}", args.listen);

    loop {
        let (socket, addr) = listener.accept().await?;

        socket.set_nodelay(true)?;

        info!("new connection from {addr}");

        tokio::spawn({
            let adaptor = adaptor.clone();

            async move {
                if let Err(err) = serve(socket, adaptor).await {
                    warn!("connection from {addr} failed: {err}");
                }
            }
        });
    }
}
