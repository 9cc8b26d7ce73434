//! Linux spidev bus
//!
//! Every bus primitive is a single `SPI_IOC_MESSAGE(1)` transfer, so chip
//! select stays asserted for exactly one write or one read. Reads clock
//! out `READ_FILL_BYTE` while receiving.

use crate::error::{LinuxSpiError, Result};

use syntcm_core::error::TransportError;
use syntcm_core::protocol::READ_FILL_BYTE;
use syntcm_core::SpiBus;

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

const BUF_SIZE_SYSFS: &str = "/sys/module/spidev/parameters/bufsiz";

const DEFAULT_SPEED_HZ: u32 = 2_000_000;

const BITS_PER_WORD: u8 = 8;

/// SPI mode constants
pub mod mode {
    /// CPOL=0, CPHA=0
    pub const MODE_0: u8 = 0;
    /// CPOL=0, CPHA=1
    pub const MODE_1: u8 = 1;
    /// CPOL=1, CPHA=0
    pub const MODE_2: u8 = 2;
    /// CPOL=1, CPHA=1
    pub const MODE_3: u8 = 3;
}

/// Linux spidev ioctl constants
mod ioctl {
    use nix::ioctl_write_ptr;

    const SPI_IOC_MAGIC: u8 = b'k';

    const SPI_IOC_TYPE_MODE: u8 = 1;
    const SPI_IOC_TYPE_BITS_PER_WORD: u8 = 3;
    const SPI_IOC_TYPE_MAX_SPEED_HZ: u8 = 4;

    ioctl_write_ptr!(spi_ioc_wr_mode, SPI_IOC_MAGIC, SPI_IOC_TYPE_MODE, u8);
    ioctl_write_ptr!(
        spi_ioc_wr_bits_per_word,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_BITS_PER_WORD,
        u8
    );
    ioctl_write_ptr!(
        spi_ioc_wr_max_speed_hz,
        SPI_IOC_MAGIC,
        SPI_IOC_TYPE_MAX_SPEED_HZ,
        u32
    );

    /// Size of struct spi_ioc_transfer
    pub const SPI_IOC_TRANSFER_SIZE: usize = 32;

    /// SPI_IOC_MESSAGE(n) = _IOW(SPI_IOC_MAGIC, 0, char[n * sizeof(spi_ioc_transfer)])
    pub fn spi_ioc_message(n: u8) -> libc::c_ulong {
        let size = (n as usize) * SPI_IOC_TRANSFER_SIZE;
        ((1u32 << 30) | ((size as u32) << 16) | ((SPI_IOC_MAGIC as u32) << 8)) as libc::c_ulong
    }
}

/// Kernel's struct spi_ioc_transfer
#[repr(C)]
#[derive(Debug, Default, Clone)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    _pad: u8,
}

/// How to open and clock a spidev device
#[derive(Debug, Clone)]
pub struct LinuxSpiConfig {
    /// Device path (e.g., "/dev/spidev0.0")
    pub device: String,
    /// SPI clock speed in Hz (default: 2 MHz)
    pub speed_hz: u32,
    /// SPI mode (0-3, default: 3)
    pub mode: u8,
    /// Delay after each transfer, in microseconds
    pub block_delay_us: u16,
}

impl Default for LinuxSpiConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            speed_hz: DEFAULT_SPEED_HZ,
            mode: mode::MODE_3,
            block_delay_us: 0,
        }
    }
}

impl LinuxSpiConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn with_speed(mut self, speed_hz: u32) -> Self {
        self.speed_hz = speed_hz;
        self
    }

    pub fn with_mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_block_delay(mut self, delay_us: u16) -> Self {
        self.block_delay_us = delay_us;
        self
    }
}

/// TouchComm bus on a `/dev/spidevX.Y` device
pub struct LinuxSpiBus {
    file: File,
    max_kernel_buf_size: usize,
    speed_hz: u32,
    block_delay_us: u16,
    tx_fill: Vec<u8>,
}

impl LinuxSpiBus {
    /// Open a spidev device with the given configuration
    pub fn open(config: &LinuxSpiConfig) -> Result<Self> {
        if config.device.is_empty() {
            return Err(LinuxSpiError::NoDevice);
        }

        log::debug!("linux_spi: Opening device {}", config.device);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|e| LinuxSpiError::OpenFailed {
                path: config.device.clone(),
                source: e,
            })?;

        let fd = file.as_raw_fd();
        let mode = config.mode;
        let bits = BITS_PER_WORD;
        let speed = config.speed_hz;
        // SAFETY: fd is an open spidev descriptor and each pointer refers
        // to a live local of the size the ioctl expects
        unsafe {
            setup("mode", mode.into(), ioctl::spi_ioc_wr_mode(fd, &mode))?;
            setup("bits per word", bits.into(), ioctl::spi_ioc_wr_bits_per_word(fd, &bits))?;
            setup("max speed", speed, ioctl::spi_ioc_wr_max_speed_hz(fd, &speed))?;
        }

        log::info!(
            "linux_spi: Opened {} (mode={}, speed={} kHz, delay={} us)",
            config.device,
            mode,
            speed / 1000,
            config.block_delay_us
        );

        let max_kernel_buf_size = get_max_kernel_buf_size();
        log::debug!(
            "linux_spi: Max kernel buffer size: {} bytes",
            max_kernel_buf_size
        );

        Ok(Self {
            file,
            max_kernel_buf_size,
            speed_hz: speed,
            block_delay_us: config.block_delay_us,
            tx_fill: Vec::new(),
        })
    }

    /// Longest single transfer the kernel accepts
    ///
    /// Read and write chunk sizes should not exceed this.
    pub fn max_transfer_size(&self) -> usize {
        self.max_kernel_buf_size
    }

    pub fn speed_hz(&self) -> u32 {
        self.speed_hz
    }

    fn transfer(&self, tx: *const u8, rx: *mut u8, len: usize) -> Result<()> {
        if len > self.max_kernel_buf_size {
            return Err(LinuxSpiError::TransferTooLong {
                len,
                max: self.max_kernel_buf_size,
            });
        }

        let xfer = SpiIocTransfer {
            tx_buf: tx as u64,
            rx_buf: rx as u64,
            len: len as u32,
            speed_hz: self.speed_hz,
            delay_usecs: self.block_delay_us,
            bits_per_word: BITS_PER_WORD,
            ..Default::default()
        };

        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                ioctl::spi_ioc_message(1),
                &xfer as *const SpiIocTransfer,
            )
        };
        if ret < 0 {
            return Err(LinuxSpiError::TransferFailed(
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl SpiBus for LinuxSpiBus {
    fn write(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
        if data.is_empty() {
            return Err(TransportError::InvalidLength(0));
        }
        self.transfer(data.as_ptr(), std::ptr::null_mut(), data.len())
            .map_err(|e| TransportError::Bus(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<(), TransportError> {
        if buf.is_empty() {
            return Err(TransportError::InvalidLength(0));
        }
        if self.tx_fill.len() < buf.len() {
            self.tx_fill
                .try_reserve(buf.len() - self.tx_fill.len())
                .map_err(|_| TransportError::Allocation {
                    requested: buf.len(),
                })?;
            self.tx_fill.resize(buf.len(), READ_FILL_BYTE);
        }
        self.transfer(self.tx_fill.as_ptr(), buf.as_mut_ptr(), buf.len())
            .map_err(|e| TransportError::Bus(e.to_string()))
    }
}

fn setup(
    setting: &'static str,
    value: u32,
    ret: nix::Result<libc::c_int>,
) -> Result<()> {
    ret.map(|_| ()).map_err(|e| LinuxSpiError::Setup {
        setting,
        value,
        source: std::io::Error::from(e),
    })
}

/// spidev's `bufsiz` module parameter, or the page size it defaults to
fn get_max_kernel_buf_size() -> usize {
    if let Ok(content) = std::fs::read_to_string(BUF_SIZE_SYSFS) {
        if let Ok(size) = content.trim().parse::<usize>() {
            if size > 0 {
                return size;
            }
        }
        log::warn!("linux_spi: Invalid buffer size in {}", BUF_SIZE_SYSFS);
    } else {
        log::debug!("linux_spi: Cannot read {}, using page size", BUF_SIZE_SYSFS);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as usize
    } else {
        4096
    }
}

/// Build a config from `dev=`, `spispeed=` (kHz), `mode=` and `delay=` (us)
pub fn parse_options(options: &[(&str, &str)]) -> std::result::Result<LinuxSpiConfig, String> {
    let mut config = LinuxSpiConfig::default();

    for (key, value) in options {
        match *key {
            "dev" => {
                config.device = value.to_string();
            }
            "spispeed" => {
                // kHz
                let speed_khz: u32 = value
                    .parse()
                    .map_err(|_| format!("Invalid spispeed value: {}", value))?;
                config.speed_hz = speed_khz
                    .checked_mul(1000)
                    .ok_or_else(|| format!("spispeed out of range: {}", value))?;
            }
            "mode" => {
                let mode: u8 = value
                    .parse()
                    .map_err(|_| format!("Invalid mode value: {}", value))?;
                if mode > 3 {
                    return Err(format!("Invalid SPI mode: {} (must be 0-3)", mode));
                }
                config.mode = mode;
            }
            "delay" => {
                config.block_delay_us = value
                    .parse()
                    .map_err(|_| format!("Invalid delay value: {}", value))?;
            }
            _ => {
                log::warn!("linux_spi: Unknown option: {}={}", key, value);
            }
        }
    }

    if config.device.is_empty() {
        return Err("No device specified. Use dev=/dev/spidevX.Y".to_string());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let config = parse_options(&[
            ("dev", "/dev/spidev1.0"),
            ("spispeed", "8000"),
            ("mode", "0"),
            ("delay", "50"),
        ])
        .unwrap();
        assert_eq!(config.device, "/dev/spidev1.0");
        assert_eq!(config.speed_hz, 8_000_000);
        assert_eq!(config.mode, mode::MODE_0);
        assert_eq!(config.block_delay_us, 50);
    }

    #[test]
    fn test_parse_options_defaults_and_errors() {
        let config = parse_options(&[("dev", "/dev/spidev0.0")]).unwrap();
        assert_eq!(config.speed_hz, DEFAULT_SPEED_HZ);
        assert_eq!(config.mode, mode::MODE_3);

        assert!(parse_options(&[]).is_err());
        assert!(parse_options(&[("dev", "/dev/spidev0.0"), ("mode", "4")]).is_err());
        assert!(parse_options(&[("dev", "/dev/spidev0.0"), ("delay", "x")]).is_err());
    }

    #[test]
    fn test_spi_ioc_message_number() {
        // _IOW('k', 0, char[32])
        assert_eq!(ioctl::spi_ioc_message(1), 0x4020_6B00);
    }

    #[test]
    fn test_open_without_device() {
        assert!(matches!(
            LinuxSpiBus::open(&LinuxSpiConfig::default()),
            Err(LinuxSpiError::NoDevice)
        ));
    }
}
