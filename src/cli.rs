//! CLI argument parsing

use crate::buses;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let v = parse_hex_u32(s)?;
    u8::try_from(v).map_err(|_| format!("Value out of range for 8 bits: {}", s))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let v = parse_hex_u32(s)?;
    u16::try_from(v).map_err(|_| format!("Value out of range for 16 bits: {}", s))
}

/// Generate dynamic help text for the bus argument
fn bus_help() -> String {
    format!("Bus to use [available: {}]", buses::bus_names_short())
}

#[derive(Parser)]
#[command(name = "syntcm")]
#[command(author, version, about = "TouchComm touch controller tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Device configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = bus_help())]
    pub bus: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnOff {
    On,
    Off,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Identify the controller
    Identify,

    /// Show identify, application and bootloader information
    Info,

    /// Read a dynamic config entry
    GetConfig {
        /// Entry id (hex with 0x prefix, or decimal)
        #[arg(value_parser = parse_hex_u8)]
        id: u8,
    },

    /// Write a dynamic config entry
    SetConfig {
        #[arg(value_parser = parse_hex_u8)]
        id: u8,

        #[arg(value_parser = parse_hex_u16)]
        value: u16,
    },

    /// Enter or leave deep sleep
    Sleep {
        #[arg(value_enum)]
        state: OnOff,
    },

    /// Reset the controller and bring up application firmware
    Reset,

    /// Print decoded touch reports as they arrive
    Monitor {
        /// Stop after this many touch reports
        #[arg(short, long)]
        count: Option<usize>,

        /// Use the gesture report layout (wake-gesture mode)
        #[arg(long)]
        gesture: bool,
    },

    /// Enable a report type and dump a number of its reports
    Collect {
        /// Report code, e.g. 0x12 for delta images
        #[arg(short, long, value_parser = parse_hex_u8)]
        report: u8,

        #[arg(short, long, default_value = "1")]
        count: usize,
    },

    /// Decode a touch report offline, without a bus
    Decode {
        /// Layout program, e.g. "foreach_active_object, object_index:4, ..."
        #[arg(short, long)]
        layout: String,

        /// Report payload as hex
        #[arg(short, long)]
        report: String,

        #[arg(long, default_value = "10")]
        max_objects: usize,
    },

    /// Rewrite flash regions from the bootloader
    Reflash {
        /// Region to write as <address>:<file>, may be repeated
        #[arg(short, long, required = true)]
        region: Vec<String>,
    },

    /// List available buses
    ListBuses,
}
