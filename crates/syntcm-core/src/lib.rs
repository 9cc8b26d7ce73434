//! syntcm-core - Host-side engine for TouchComm touch controllers
//!
//! The controller talks over a SPI link that only moves fixed-size
//! chunks. This crate turns that link into complete messages, pairs
//! command responses with the command that is waiting for them, routes
//! asynchronous reports and decodes touch reports with the layout program
//! the firmware is configured with.
//!
//! - [`transport`] and [`message`]: chunking and framing
//! - [`command`]: command/response correlation
//! - [`dispatch`]: report routing
//! - [`report`]: the touch report layout language and decoder
//! - [`reflash`]: flash erase/write sequencing
//! - [`device`]: the [`TcmDevice`] facade over all of the above
//!
//! # Example
//!
//! ```ignore
//! use syntcm_core::{TcmConfig, TcmDevice};
//!
//! fn show<B: syntcm_core::SpiBus>(bus: B) -> syntcm_core::Result<()> {
//!     let device = TcmDevice::new(bus, TcmConfig::default())?;
//!     let info = device.initialize()?;
//!     println!("{} build {}", info.part_number(), info.build_id);
//!     Ok(())
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod bus;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod info;
pub mod message;
pub mod protocol;
pub mod recovery;
pub mod reflash;
pub mod report;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bus::{HardwareControl, NoHardwareControl, SpiBus};
pub use command::ResponseTimeout;
pub use config::{DynamicConfigIds, TcmConfig, Timeouts};
pub use device::{PollerHandle, TcmDevice};
pub use dispatch::{DispatchEvent, TriggerReason};
pub use error::{Error, Result};
pub use info::{AppInfo, BootInfo, IdentifyInfo};
pub use protocol::{Command, FirmwareMode};
pub use reflash::{NoProgress, ReflashProgress, ReflashRegion};
pub use report::{LayoutProgram, TouchFrameResult, TouchPoint};
