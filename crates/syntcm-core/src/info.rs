//! Device information blocks returned by identify, get-app-info and
//! get-boot-info
//!
//! All multi-byte fields are little-endian. A response shorter than the
//! full block is accepted; missing trailing fields read as zero.

use crate::protocol::{app_status, FirmwareMode};

/// Cursor over a response payload that reads zero past the end
struct LeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let b = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes([self.u8(), self.u8()])
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes([self.u8(), self.u8(), self.u8(), self.u8()])
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        for b in out.iter_mut() {
            *b = self.u8();
        }
        out
    }
}

/// Render a fixed-size, NUL-padded identifier
fn id_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// Identify information, sent as a report on reset and as a response to
/// the identify command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub version: u8,
    pub mode: FirmwareMode,
    pub part_number: [u8; 16],
    pub build_id: u32,
    /// Largest write transfer the device accepts
    pub max_write_size: u16,
}

impl IdentifyInfo {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Self {
        let mut r = LeReader::new(data);
        Self {
            version: r.u8(),
            mode: FirmwareMode::from(r.u8()),
            part_number: r.bytes(),
            build_id: r.u32(),
            max_write_size: r.u16(),
        }
    }

    pub fn part_number(&self) -> String {
        id_string(&self.part_number)
    }
}

/// Application firmware information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub version: u16,
    pub status: u16,
    pub static_config_size: u16,
    pub dynamic_config_size: u16,
    pub app_config_start_write_block: u16,
    pub app_config_size: u16,
    pub max_touch_report_config_size: u16,
    pub max_touch_report_payload_size: u16,
    pub customer_config_id: [u8; 16],
    pub max_x: u16,
    pub max_y: u16,
    pub max_objects: u16,
    pub num_of_buttons: u16,
    pub num_of_image_rows: u16,
    pub num_of_image_cols: u16,
    pub has_hybrid_data: u16,
}

impl AppInfo {
    pub const SIZE: usize = 46;

    pub fn parse(data: &[u8]) -> Self {
        let mut r = LeReader::new(data);
        Self {
            version: r.u16(),
            status: r.u16(),
            static_config_size: r.u16(),
            dynamic_config_size: r.u16(),
            app_config_start_write_block: r.u16(),
            app_config_size: r.u16(),
            max_touch_report_config_size: r.u16(),
            max_touch_report_payload_size: r.u16(),
            customer_config_id: r.bytes(),
            max_x: r.u16(),
            max_y: r.u16(),
            max_objects: r.u16(),
            num_of_buttons: r.u16(),
            num_of_image_rows: r.u16(),
            num_of_image_cols: r.u16(),
            has_hybrid_data: r.u16(),
        }
    }

    /// Firmware is still starting up or applying an update
    pub fn is_settling(&self) -> bool {
        matches!(self.status, app_status::BOOTING | app_status::UPDATING)
    }

    pub fn customer_config_id(&self) -> String {
        id_string(&self.customer_config_id)
    }
}

/// Bootloader information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub version: u8,
    pub status: u8,
    pub asic_id: u16,
    pub write_block_size_words: u8,
    pub erase_page_size_words: u16,
    pub max_write_payload_size: u16,
    pub last_reset_reason: u8,
    pub pc_at_time_of_last_reset: u16,
}

impl BootInfo {
    pub const SIZE: usize = 12;

    pub fn parse(data: &[u8]) -> Self {
        let mut r = LeReader::new(data);
        Self {
            version: r.u8(),
            status: r.u8(),
            asic_id: r.u16(),
            write_block_size_words: r.u8(),
            erase_page_size_words: r.u16(),
            max_write_payload_size: r.u16(),
            last_reset_reason: r.u8(),
            pc_at_time_of_last_reset: r.u16(),
        }
    }

    /// Flash write block size in bytes
    pub fn write_block_size(&self) -> usize {
        self.write_block_size_words as usize * 2
    }

    /// Flash erase page size in bytes
    pub fn erase_page_size(&self) -> usize {
        self.erase_page_size_words as usize * 2
    }
}
