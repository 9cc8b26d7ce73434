//! Hardware capabilities the engine is built on
//!
//! The engine never touches hardware directly. A bus backend provides the
//! two physical transfer primitives and, optionally, control over the
//! reset line.

use crate::error::TransportError;
use std::time::Duration;

/// A synchronous SPI link to the touch controller
///
/// Each call is exactly one physical transfer with chip select asserted
/// for its whole length.
pub trait SpiBus: Send {
    /// Clock `data` out to the device
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Fill `buf` from the device, clocking out `READ_FILL_BYTE` dummies
    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;
}

impl<B: SpiBus + ?Sized> SpiBus for Box<B> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read(buf)
    }
}

/// Reset line and timing control
pub trait HardwareControl: Send {
    /// Drive the reset line; `true` holds the device in reset
    fn set_reset(&mut self, asserted: bool);

    /// Whether a reset line is wired at all
    fn has_reset(&self) -> bool {
        true
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Hardware without a reset line; resets fall back to the reset command
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardwareControl;

impl HardwareControl for NoHardwareControl {
    fn set_reset(&mut self, _asserted: bool) {}

    fn has_reset(&self) -> bool {
        false
    }
}
