//! syntcm-linux-spi - Linux spidev bus for TouchComm controllers
//!
//! The Linux SPI driver exposes SPI controllers through character devices
//! at `/dev/spidevX.Y` where X is the bus number and Y is the chip select.
//! [`LinuxSpiBus`] implements the engine's [`SpiBus`](syntcm_core::SpiBus)
//! on top of one of them.
//!
//! # Example
//!
//! ```no_run
//! use syntcm_core::{TcmConfig, TcmDevice};
//! use syntcm_linux_spi::{LinuxSpiBus, LinuxSpiConfig};
//!
//! let config = LinuxSpiConfig::new("/dev/spidev0.0")
//!     .with_speed(8_000_000)
//!     .with_mode(3);
//! let bus = LinuxSpiBus::open(&config)?;
//! let device = TcmDevice::new(bus, TcmConfig::default())?;
//! let info = device.initialize()?;
//! println!("{} build {}", info.part_number(), info.build_id);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Usage with the syntcm CLI
//!
//! ```bash
//! syntcm -b linux_spi:dev=/dev/spidev0.0 identify
//! syntcm -b linux_spi:dev=/dev/spidev0.0,spispeed=8000,mode=3,delay=20 monitor
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with spidev support enabled (`CONFIG_SPI_SPIDEV`)
//! - Read/write access to `/dev/spidevX.Y`
//! - The touch controller's own kernel driver must not be bound to the
//!   same chip select

pub mod device;
pub mod error;

pub use device::{mode, parse_options, LinuxSpiBus, LinuxSpiConfig};
pub use error::{LinuxSpiError, Result};

/// Open a Linux SPI bus from CLI-style options
///
/// - `dev=/dev/spidev0.0` - Required: device path
/// - `spispeed=8000` - Optional: speed in kHz (default: 2000)
/// - `mode=3` - Optional: SPI mode 0-3 (default: 3)
/// - `delay=20` - Optional: delay after each transfer in microseconds
pub fn open_linux_spi(
    options: &[(&str, &str)],
) -> std::result::Result<LinuxSpiBus, Box<dyn std::error::Error>> {
    let config = parse_options(options)?;
    Ok(LinuxSpiBus::open(&config)?)
}
