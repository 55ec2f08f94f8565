use anyhow::{Result, Context, bail};

use clap::{Parser, Subcommand};
use daikinmodbus::{config::{init_logging, BusArgs}, engine::Engine};


/// Write registers of the adaptor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    bus: BusArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write one holding register
    Raw {
        /// Register number (40001-based)
        register: u16,

        /// Register value in hex, e.g. 0001
        value: String,
    },

    /// Switch a unit on or off
    ///
    /// The low byte of the unit's first control register is 1 for on and 0 for
    /// off; the high byte is written back as last read.
    Power {
        /// Unit slot (0-15)
        unit: u8,

        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}


fn parse_value(value: &str) -> Result<[u8; 2]> {
    let value = u16::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid register value {value}"))?;

    Ok(value.to_be_bytes())
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging();

    let client = args.bus.connect().await?;

    match args.command {
        Command::Raw { register, value } => {
            let value = parse_value(&value)?;

            client.send_preset_single_register_command(args.bus.slave, register, value).await
                .with_context(|| format!("writing register {register} failed"))?;

            println!("{register} = {:02x}{:02x}", value[0], value[1]);
        },
        Command::Power { unit, state } => {
            let mut engine = Engine::new(client, args.bus.engine_config());

            engine.discover().await.context("discovery failed")?;
            engine.read_all_status().await.context("reading unit status failed")?;

            let Some(status) = engine.unit(unit).and_then(|unit| unit.status()) else {
                bail!("unit {unit} is not connected");
            };

            let value = [status[0], (state == "on") as u8];

            engine.write(unit, 0, value).await
                .with_context(|| format!("switching unit {unit} {state} failed"))?;

            println!("unit {unit} switched {state}");
        }
    }

    Ok(())
}
