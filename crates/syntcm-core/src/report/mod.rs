//! Touch report decoding
//!
//! - [`layout`]: the byte-code program describing the report layout
//! - [`bits`]: bit-level field extraction
//! - [`decoder`]: the program interpreter
//! - [`touch`]: the decoded data model

pub mod bits;
pub mod decoder;
pub mod layout;
pub mod touch;

pub use bits::{extract_bits, extract_wide, FieldBits};
pub use decoder::ReportDecoder;
pub use layout::{FieldKind, LayoutOp, LayoutProgram};
pub use touch::{
    ContactChanges, ContactTracker, FingerprintEvent, GripMetrics, HealthCounters, ObjectSlot,
    ObjectStatus, TouchFrameResult, TouchPoint,
};
