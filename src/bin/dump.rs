use anyhow::{Result, Context};

use clap::Parser;
use colored::{Colorize, ColoredString};
use daikinmodbus::{config::{init_logging, BusArgs}, engine::Engine, unit::{Unit, UnitKind}};


/// Discover the units behind the adaptor, read their status once and print it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    bus: BusArgs,
}


fn describe(unit: &Unit) -> String {
    let caps = unit.capabilities();

    let modes: Vec<&str> = [
        (caps.fan_mode, "fan"),
        (caps.cooling_mode, "cool"),
        (caps.heating_mode, "heat"),
        (caps.auto_mode, "auto"),
        (caps.dry_mode, "dry"),
    ].into_iter().filter_map(|(supported, name)| supported.then_some(name)).collect();

    let status = match unit.status() {
        Some(status) => format!("{status:02x?}"),
        None => "unknown".to_string()
    };

    format!(
        "{:2}: {: <26} modes: {: <22} cool {}..{}C heat {}..{}C  status: {status}",
        unit.index(), unit.kind().to_string(), modes.join(","),
        caps.cooling_lower_limit, caps.cooling_upper_limit,
        caps.heating_lower_limit, caps.heating_upper_limit,
    )
}

fn coloured(unit: &Unit, line: String) -> ColoredString {
    match unit.kind() {
        UnitKind::AirConditioner => line.on_green().bright_white(),
        UnitKind::HeatReclaimVentilation => line.on_magenta().bright_white(),
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging();

    let client = args.bus.connect().await?;
    let mut engine = Engine::new(client, args.bus.engine_config());

    engine.discover().await.context("discovery failed")?;
    engine.read_all_status().await.context("reading unit status failed")?;

    for (index, slot) in engine.units().iter().enumerate() {
        match slot {
            Some(unit) => println!("{}", coloured(unit, describe(unit))),
            None => println!("{}", format!("{index:2}: not connected").dimmed()),
        }
    }

    Ok(())
}
