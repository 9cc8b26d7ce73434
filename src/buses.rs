//! Bus registration and opening
//!
//! A bus string is a name optionally followed by options, e.g. `dummy` or
//! `linux_spi:dev=/dev/spidev0.0,spispeed=8000`.

use syntcm_core::{SpiBus, TcmConfig, TcmDevice};

/// Information about a bus backend
pub struct BusInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
}

/// All buses enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_buses() -> Vec<BusInfo> {
    let mut buses = Vec::new();

    #[cfg(feature = "dummy")]
    buses.push(BusInfo {
        name: "dummy",
        aliases: &[],
        description: "Emulated controller for testing (mode=app|boot,max_write=<bytes>)",
    });

    #[cfg(feature = "linux-spi")]
    buses.push(BusInfo {
        name: "linux_spi",
        aliases: &["linux-spi", "spidev"],
        description:
            "Linux spidev interface (dev=/dev/spidevX.Y,spispeed=<kHz>,mode=<0-3>,delay=<us>)",
    });

    buses
}

/// Help text listing all available buses
pub fn bus_help() -> String {
    let buses = available_buses();
    if buses.is_empty() {
        return "No buses available (recompile with bus features enabled)".to_string();
    }

    let mut help = String::from("Available buses:\n");
    for b in &buses {
        help.push_str(&format!("  {:12} - {}\n", b.name, b.description));
    }
    help
}

/// Short list of bus names for CLI help
pub fn bus_names_short() -> String {
    let buses = available_buses();
    let names: Vec<&str> = buses.iter().map(|b| b.name).collect();
    names.join(", ")
}

/// Canonical name of an available bus
pub fn find_bus(name: &str) -> Option<&'static str> {
    available_buses()
        .into_iter()
        .find(|b| b.name == name || b.aliases.contains(&name))
        .map(|b| b.name)
}

/// Parse bus string into name and options
pub fn parse_bus_string(s: &str) -> (&str, Vec<(&str, &str)>) {
    if let Some((name, opts)) = s.split_once(':') {
        let options: Vec<_> = opts
            .split(',')
            .filter_map(|opt| opt.split_once('='))
            .collect();
        (name, options)
    } else {
        (s, Vec::new())
    }
}

fn unknown_bus_error(name: &str) -> Box<dyn std::error::Error> {
    let mut msg = format!("Unknown bus: {}\n\n", name);
    msg.push_str(&bus_help());
    msg.push_str("\nUse 'syntcm list-buses' for more details");
    msg.into()
}

/// A device on whatever bus was selected
pub type Device = TcmDevice<Box<dyn SpiBus>>;

/// Open the bus named by `bus` and wrap it in a device
#[allow(unused_mut)]
pub fn open_device(
    bus: &str,
    mut config: TcmConfig,
) -> Result<Device, Box<dyn std::error::Error>> {
    let (name, options) = parse_bus_string(bus);
    let canonical = find_bus(name).ok_or_else(|| unknown_bus_error(name))?;

    let boxed: Box<dyn SpiBus> = match canonical {
        #[cfg(feature = "dummy")]
        "dummy" => Box::new(open_dummy(&options)?),

        #[cfg(feature = "linux-spi")]
        "linux_spi" => {
            let spi = syntcm_linux_spi::open_linux_spi(&options)?;
            let max = spi.max_transfer_size();
            clamp_chunk_sizes(&mut config, max);
            Box::new(spi)
        }

        _ => return Err(unknown_bus_error(name)),
    };

    Ok(TcmDevice::new(boxed, config)?)
}

#[cfg(feature = "dummy")]
fn open_dummy(
    options: &[(&str, &str)],
) -> Result<syntcm_dummy::DummyController, Box<dyn std::error::Error>> {
    use syntcm_core::FirmwareMode;
    use syntcm_dummy::{DummyConfig, DummyController};

    let mut config = DummyConfig::default();
    for (key, value) in options {
        match *key {
            "mode" => {
                config.boot_mode = match *value {
                    "app" => FirmwareMode::Application,
                    "boot" => FirmwareMode::Bootloader,
                    other => return Err(format!("Invalid dummy mode: {}", other).into()),
                }
            }
            "max_write" => {
                config.max_write_size = value
                    .parse()
                    .map_err(|_| format!("Invalid max_write value: {}", value))?;
            }
            _ => log::warn!("dummy: Unknown option: {}={}", key, value),
        }
    }
    Ok(DummyController::new(config))
}

/// Keep chunk sizes within what one bus transfer can carry
#[cfg_attr(not(feature = "linux-spi"), allow(dead_code))]
fn clamp_chunk_sizes(config: &mut TcmConfig, max: usize) {
    for (what, size) in [
        ("read", &mut config.read_chunk_size),
        ("write", &mut config.write_chunk_size),
    ] {
        if *size == 0 || *size > max {
            log::info!("Limiting {} chunk size to {} bytes", what, max);
            *size = max;
        }
    }
}
