//! syntcm - TouchComm touch controller tool
//!
//! Talks to a TouchComm touch controller over a host SPI bus: identifies
//! it, reads and writes dynamic configuration, watches decoded touch
//! reports and rewrites firmware from the bootloader.
//!
//! Buses are selected with a string (`-b dummy`,
//! `-b linux_spi:dev=/dev/spidev0.0`). Everything board specific comes
//! from an optional TOML configuration file (`--config`).

mod buses;
mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, OnOff};
use syntcm_core::TcmConfig;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let config = match &cli.config {
        Some(path) => {
            let config = TcmConfig::from_file(path)?;
            log::info!("Loaded configuration from {:?}", path);
            config
        }
        None => TcmConfig::default(),
    };

    // commands that need no bus
    match &cli.command {
        Commands::ListBuses => {
            commands::list_buses();
            return Ok(());
        }
        Commands::Decode {
            layout,
            report,
            max_objects,
        } => return commands::monitor::cmd_decode(layout, report, *max_objects),
        _ => {}
    }

    let bus = cli
        .bus
        .as_deref()
        .ok_or_else(|| format!("No bus given. Use -b <bus>\n\n{}", buses::bus_help()))?;
    let device = buses::open_device(bus, config)?;

    match cli.command {
        Commands::Identify => commands::info::cmd_identify(&device),
        Commands::Info => commands::info::cmd_info(&device),
        Commands::GetConfig { id } => commands::info::cmd_get_config(&device, id),
        Commands::SetConfig { id, value } => commands::info::cmd_set_config(&device, id, value),
        Commands::Sleep { state } => commands::info::cmd_sleep(&device, state == OnOff::On),
        Commands::Reset => commands::info::cmd_reset(&device),
        Commands::Collect { report, count } => {
            commands::info::cmd_collect(&device, report, count)
        }
        Commands::Monitor { count, gesture } => {
            commands::monitor::cmd_monitor(device, count, gesture)
        }
        Commands::Reflash { region } => commands::reflash::cmd_reflash(&device, &region),
        Commands::ListBuses | Commands::Decode { .. } => Ok(()),
    }
}
