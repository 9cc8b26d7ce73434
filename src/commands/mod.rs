//! CLI command implementations
//!
//! Every command except `decode` and `list-buses` runs against a
//! [`Device`](crate::buses::Device) opened from the `--bus` string.

pub mod info;
pub mod monitor;
pub mod reflash;

pub use info::list_buses;
