//! Error types for the TCM protocol engine

use crate::protocol::Command;
use thiserror::Error;

/// Bus-level failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The underlying bus transfer failed
    #[error("bus transfer failed: {0}")]
    Bus(String),

    /// A transfer buffer could not be grown
    #[error("failed to allocate {requested} byte transfer buffer")]
    Allocation { requested: usize },

    /// A raw transfer was requested with an unusable length
    #[error("invalid transfer length: {0}")]
    InvalidLength(usize),
}

/// Framing failure, the link is out of sync
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("incorrect header marker 0x{0:02x}")]
    WrongMarker(u8),

    #[error("incorrect continued-read header code 0x{0:02x}")]
    WrongContinuationCode(u8),

    #[error("incorrect message padding byte 0x{0:02x}")]
    PaddingMismatch(u8),

    #[error("unexpected status code 0x{0:02x} in message header")]
    UnexpectedStatus(u8),
}

/// Failure of a single command/response exchange
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No response arrived in time; the command is still considered busy
    #[error("timed out waiting for response to {command}")]
    Timeout { command: Command },

    /// The device answered with an error status
    #[error("{command} failed on device (error code {})", fmt_code(*.code))]
    DeviceError { command: Command, code: Option<u8> },

    /// The wait was cut short by a framing error or a device reset
    #[error("{command} aborted")]
    Aborted { command: Command },

    /// Writing the command to the bus failed
    #[error("failed to send {command}: {source}")]
    Send {
        command: Command,
        #[source]
        source: TransportError,
    },

    /// The command needs application firmware and it is not running
    #[error("{command} requires running application firmware")]
    NotInApplication { command: Command },

    /// The response did not have the expected shape
    #[error("unexpected response to {command}: {reason}")]
    UnexpectedResponse {
        command: Command,
        reason: &'static str,
    },
}

fn fmt_code(code: Option<u8>) -> String {
    match code {
        Some(c) => format!("0x{:02x}", c),
        None => "unknown".to_string(),
    }
}

/// Failure while decoding a touch report
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("object index {index} out of range (max objects {max})")]
    ObjectIndexOutOfRange { index: u32, max: usize },

    #[error("no touch report layout program installed")]
    NoProgram,
}

/// Failure while parsing a touch report layout program
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("op 0x{code:02x} at offset {offset} is missing its bit width")]
    MissingWidth { code: u8, offset: usize },

    #[error("unknown layout op name: {0}")]
    UnknownOpName(String),

    #[error("invalid bit width in layout op: {0}")]
    InvalidWidth(String),

    #[error("foreach block at op {0} is never closed")]
    UnclosedForeach(usize),

    #[error("foreach end at op {0} has no matching start")]
    UnmatchedForeachEnd(usize),

    #[error("nested foreach at op {0}")]
    NestedForeach(usize),

    #[error("program is {size} bytes, device accepts at most {max}")]
    TooLarge { size: usize, max: usize },
}

/// Failure during a reflash sequence
#[derive(Debug, Error)]
pub enum ReflashError {
    #[error("write block size {block} bytes exceeds write chunk size {chunk}")]
    BlockSizeExceedsChunk { block: usize, chunk: usize },

    #[error("device reported an unusable flash geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("region at 0x{0:08x} is empty")]
    EmptyRegion(u32),

    #[error("region at 0x{address:08x} is not aligned to the {page_size} byte erase page")]
    UnalignedRegion { address: u32, page_size: usize },

    #[error("device did not enter bootloader mode")]
    NotInBootloader,

    #[error("device did not return to application mode")]
    NotInApplication,

    #[error("failed to erase pages {start}..{end}: {source}")]
    Erase {
        start: u32,
        end: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to write block at 0x{address:08x}: {source}")]
    Write {
        address: u32,
        #[source]
        source: Box<Error>,
    },
}

/// Failure loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid layout program `{name}`: {source}")]
    Layout {
        name: &'static str,
        #[source]
        source: LayoutError,
    },
}

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Reflash(#[from] ReflashError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// True for a command that never got an answer
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Command(CommandError::Timeout { .. }))
    }
}

/// Result type for the TCM engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let e = CommandError::DeviceError {
            command: Command::GetDynamicConfig,
            code: Some(0x05),
        };
        assert_eq!(
            e.to_string(),
            "GetDynamicConfig (0x23) failed on device (error code 0x05)"
        );
        let e = CommandError::DeviceError {
            command: Command::Other(0x77),
            code: None,
        };
        assert_eq!(
            e.to_string(),
            "command 0x77 failed on device (error code unknown)"
        );
    }

    #[test]
    fn test_is_timeout() {
        let e: Error = CommandError::Timeout {
            command: Command::Identify,
        }
        .into();
        assert!(e.is_timeout());
        let e: Error = ProtocolError::WrongMarker(0x00).into();
        assert!(!e.is_timeout());
    }
}
