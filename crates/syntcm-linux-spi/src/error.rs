//! spidev errors

use thiserror::Error;

/// Errors from opening or driving a spidev device
#[derive(Debug, Error)]
pub enum LinuxSpiError {
    #[error("cannot open spidev {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// One of the setup ioctls (mode, word size, clock) was refused
    #[error("spidev rejected {setting} = {value}: {source}")]
    Setup {
        setting: &'static str,
        value: u32,
        #[source]
        source: std::io::Error,
    },

    /// A transfer is longer than the kernel's spidev buffer
    #[error("{len} byte transfer exceeds the {max} byte spidev buffer")]
    TransferTooLong { len: usize, max: usize },

    #[error("spidev transfer failed: {0}")]
    TransferFailed(#[source] std::io::Error),

    #[error("no spidev device given, use dev=/dev/spidevX.Y")]
    NoDevice,
}

pub type Result<T> = std::result::Result<T, LinuxSpiError>;
