//! TCM wire protocol constants and code types
//!
//! Every message the controller sends starts with a 4-byte header:
//! `[MESSAGE_MARKER][code][len_lo][len_hi]`, followed by `len` payload
//! bytes and a single `MESSAGE_PADDING` byte. Commands sent by the host
//! are `[command][len_lo][len_hi][payload...]`.

/// Sentinel byte that starts every device-to-host message
pub const MESSAGE_MARKER: u8 = 0xA5;
/// Trailing byte that ends every device-to-host message
pub const MESSAGE_PADDING: u8 = 0x5A;
/// Size of the message header (marker, code, 2-byte length)
pub const MESSAGE_HEADER_SIZE: usize = 4;
/// Size of the header embedded in every continued-read chunk (marker, code)
pub const CHUNK_HEADER_SIZE: usize = 2;
/// Smallest initial read used when predictive reading shrinks the read length
pub const MIN_READ_LENGTH: usize = MESSAGE_HEADER_SIZE;
/// Byte clocked out by the host while reading
pub const READ_FILL_BYTE: u8 = 0xFF;

/// Bytes of framing overhead in a flash write command chunk:
/// command, 2-byte length, 2-byte block address
pub const WRITE_FLASH_OVERHEAD: usize = 5;

/// Status codes (message codes below `REPORT_IDENTIFY`)
pub mod status {
    /// Nothing to report
    pub const IDLE: u8 = 0x00;
    /// Command completed successfully
    pub const OK: u8 = 0x01;
    /// Device is busy processing a command
    pub const BUSY: u8 = 0x02;
    /// Chunk header of a continued read
    pub const CONTINUED_READ: u8 = 0x03;
    /// Command cannot run while in deep sleep
    pub const NOT_EXECUTED_IN_DEEP_SLEEP: u8 = 0x0B;
    /// Device receive buffer overflowed
    pub const RECEIVE_BUFFER_OVERFLOW: u8 = 0x0C;
    /// A previous command is still pending
    pub const PREVIOUS_COMMAND_PENDING: u8 = 0x0D;
    /// Command is not implemented by the running firmware
    pub const NOT_IMPLEMENTED: u8 = 0x0E;
    /// Command failed; the first payload byte carries the error code
    pub const ERROR: u8 = 0x0F;
    /// Bus is floating or the device is absent
    pub const INVALID: u8 = 0xFF;
}

/// Report codes (message codes at or above `IDENTIFY`)
pub mod report {
    /// Identify report, sent after every reset and mode change
    pub const IDENTIFY: u8 = 0x10;
    /// Touch report decoded with the active layout program
    pub const TOUCH: u8 = 0x11;
    /// Delta image
    pub const DELTA: u8 = 0x12;
    /// Raw image
    pub const RAW: u8 = 0x13;
    /// Touch-and-hold (under-display fingerprint) report
    pub const TOUCH_HOLD: u8 = 0x20;
    /// Firmware log / health report
    pub const LOG: u8 = 0x1D;
}

/// Command opcodes
pub mod opcodes {
    pub const NONE: u8 = 0x00;
    /// Prefix of every write chunk after the first
    pub const CONTINUE_WRITE: u8 = 0x01;
    pub const IDENTIFY: u8 = 0x02;
    pub const RESET: u8 = 0x04;
    pub const ENABLE_REPORT: u8 = 0x05;
    pub const DISABLE_REPORT: u8 = 0x06;
    pub const GET_BOOT_INFO: u8 = 0x10;
    pub const ERASE_FLASH: u8 = 0x11;
    pub const WRITE_FLASH: u8 = 0x12;
    pub const READ_FLASH: u8 = 0x13;
    pub const RUN_APPLICATION_FIRMWARE: u8 = 0x14;
    pub const RUN_BOOTLOADER_FIRMWARE: u8 = 0x1F;
    pub const GET_APPLICATION_INFO: u8 = 0x20;
    pub const GET_DYNAMIC_CONFIG: u8 = 0x23;
    pub const SET_DYNAMIC_CONFIG: u8 = 0x24;
    pub const GET_TOUCH_REPORT_CONFIG: u8 = 0x25;
    pub const SET_TOUCH_REPORT_CONFIG: u8 = 0x26;
    pub const PRODUCTION_TEST: u8 = 0x2A;
    pub const ENTER_DEEP_SLEEP: u8 = 0x2C;
    pub const EXIT_DEEP_SLEEP: u8 = 0x2D;
}

/// Host command
///
/// Each variant maps to exactly one opcode; opcodes this crate has no name
/// for travel as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Identify,
    Reset,
    EnableReport,
    DisableReport,
    GetBootInfo,
    EraseFlash,
    WriteFlash,
    ReadFlash,
    RunApplicationFirmware,
    RunBootloaderFirmware,
    GetApplicationInfo,
    GetDynamicConfig,
    SetDynamicConfig,
    GetTouchReportConfig,
    SetTouchReportConfig,
    ProductionTest,
    EnterDeepSleep,
    ExitDeepSleep,
    Other(u8),
}

impl Command {
    /// Wire opcode for this command
    pub fn opcode(self) -> u8 {
        match self {
            Command::Identify => opcodes::IDENTIFY,
            Command::Reset => opcodes::RESET,
            Command::EnableReport => opcodes::ENABLE_REPORT,
            Command::DisableReport => opcodes::DISABLE_REPORT,
            Command::GetBootInfo => opcodes::GET_BOOT_INFO,
            Command::EraseFlash => opcodes::ERASE_FLASH,
            Command::WriteFlash => opcodes::WRITE_FLASH,
            Command::ReadFlash => opcodes::READ_FLASH,
            Command::RunApplicationFirmware => opcodes::RUN_APPLICATION_FIRMWARE,
            Command::RunBootloaderFirmware => opcodes::RUN_BOOTLOADER_FIRMWARE,
            Command::GetApplicationInfo => opcodes::GET_APPLICATION_INFO,
            Command::GetDynamicConfig => opcodes::GET_DYNAMIC_CONFIG,
            Command::SetDynamicConfig => opcodes::SET_DYNAMIC_CONFIG,
            Command::GetTouchReportConfig => opcodes::GET_TOUCH_REPORT_CONFIG,
            Command::SetTouchReportConfig => opcodes::SET_TOUCH_REPORT_CONFIG,
            Command::ProductionTest => opcodes::PRODUCTION_TEST,
            Command::EnterDeepSleep => opcodes::ENTER_DEEP_SLEEP,
            Command::ExitDeepSleep => opcodes::EXIT_DEEP_SLEEP,
            Command::Other(code) => code,
        }
    }

    /// Commands whose completion is signalled by an identify report
    /// instead of a response
    pub fn completes_on_identify(self) -> bool {
        matches!(
            self,
            Command::Reset | Command::RunBootloaderFirmware | Command::RunApplicationFirmware
        )
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            opcodes::IDENTIFY => Command::Identify,
            opcodes::RESET => Command::Reset,
            opcodes::ENABLE_REPORT => Command::EnableReport,
            opcodes::DISABLE_REPORT => Command::DisableReport,
            opcodes::GET_BOOT_INFO => Command::GetBootInfo,
            opcodes::ERASE_FLASH => Command::EraseFlash,
            opcodes::WRITE_FLASH => Command::WriteFlash,
            opcodes::READ_FLASH => Command::ReadFlash,
            opcodes::RUN_APPLICATION_FIRMWARE => Command::RunApplicationFirmware,
            opcodes::RUN_BOOTLOADER_FIRMWARE => Command::RunBootloaderFirmware,
            opcodes::GET_APPLICATION_INFO => Command::GetApplicationInfo,
            opcodes::GET_DYNAMIC_CONFIG => Command::GetDynamicConfig,
            opcodes::SET_DYNAMIC_CONFIG => Command::SetDynamicConfig,
            opcodes::GET_TOUCH_REPORT_CONFIG => Command::GetTouchReportConfig,
            opcodes::SET_TOUCH_REPORT_CONFIG => Command::SetTouchReportConfig,
            opcodes::PRODUCTION_TEST => Command::ProductionTest,
            opcodes::ENTER_DEEP_SLEEP => Command::EnterDeepSleep,
            opcodes::EXIT_DEEP_SLEEP => Command::ExitDeepSleep,
            other => Command::Other(other),
        }
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Other(code) => write!(f, "command 0x{:02x}", code),
            named => write!(f, "{:?} (0x{:02x})", named, named.opcode()),
        }
    }
}

/// Report class, by message code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Identify,
    Touch,
    TouchHold,
    Log,
    Other(u8),
}

impl ReportKind {
    pub fn code(self) -> u8 {
        match self {
            ReportKind::Identify => report::IDENTIFY,
            ReportKind::Touch => report::TOUCH,
            ReportKind::TouchHold => report::TOUCH_HOLD,
            ReportKind::Log => report::LOG,
            ReportKind::Other(code) => code,
        }
    }
}

impl From<u8> for ReportKind {
    fn from(code: u8) -> Self {
        match code {
            report::IDENTIFY => ReportKind::Identify,
            report::TOUCH => ReportKind::Touch,
            report::TOUCH_HOLD => ReportKind::TouchHold,
            report::LOG => ReportKind::Log,
            other => ReportKind::Other(other),
        }
    }
}

/// Classification of a message code into the three disjoint frame classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Idle, busy or an out-of-sync continued read: never dispatched
    Ignored(u8),
    /// OK or ERROR: the response to the pending command
    Response(u8),
    /// Identify or any other report code
    Report(ReportKind),
    /// A status code that is never valid at the header stage
    Invalid(u8),
}

impl FrameClass {
    pub fn of(code: u8) -> Self {
        match code {
            status::IDLE | status::BUSY | status::CONTINUED_READ => FrameClass::Ignored(code),
            status::OK | status::ERROR => FrameClass::Response(code),
            status::INVALID => FrameClass::Invalid(code),
            c if c >= report::IDENTIFY => FrameClass::Report(ReportKind::from(c)),
            c => FrameClass::Invalid(c),
        }
    }
}

/// Firmware mode reported in identify info
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareMode {
    #[default]
    Unknown,
    Application,
    HostDownload,
    Bootloader,
    TddiBootloader,
    ProductionTest,
    Other(u8),
}

impl FirmwareMode {
    pub const APPLICATION: u8 = 0x01;
    pub const HOST_DOWNLOAD: u8 = 0x02;
    pub const BOOTLOADER: u8 = 0x0B;
    pub const TDDI_BOOTLOADER: u8 = 0x0C;
    pub const PRODUCTION_TEST: u8 = 0x0E;

    pub fn is_application(self) -> bool {
        self == FirmwareMode::Application
    }

    pub fn is_bootloader(self) -> bool {
        matches!(self, FirmwareMode::Bootloader | FirmwareMode::TddiBootloader)
    }
}

impl From<u8> for FirmwareMode {
    fn from(mode: u8) -> Self {
        match mode {
            Self::APPLICATION => FirmwareMode::Application,
            Self::HOST_DOWNLOAD => FirmwareMode::HostDownload,
            Self::BOOTLOADER => FirmwareMode::Bootloader,
            Self::TDDI_BOOTLOADER => FirmwareMode::TddiBootloader,
            Self::PRODUCTION_TEST => FirmwareMode::ProductionTest,
            other => FirmwareMode::Other(other),
        }
    }
}

impl From<FirmwareMode> for u8 {
    fn from(mode: FirmwareMode) -> u8 {
        match mode {
            FirmwareMode::Unknown => 0x00,
            FirmwareMode::Application => FirmwareMode::APPLICATION,
            FirmwareMode::HostDownload => FirmwareMode::HOST_DOWNLOAD,
            FirmwareMode::Bootloader => FirmwareMode::BOOTLOADER,
            FirmwareMode::TddiBootloader => FirmwareMode::TDDI_BOOTLOADER,
            FirmwareMode::ProductionTest => FirmwareMode::PRODUCTION_TEST,
            FirmwareMode::Other(m) => m,
        }
    }
}

/// Application firmware status values from application info
pub mod app_status {
    pub const OK: u16 = 0x00;
    pub const BOOTING: u16 = 0x01;
    pub const UPDATING: u16 = 0x02;
}

/// Gesture codes as decoded from the gesture field of a touch report
pub mod gesture {
    pub const NONE: u8 = 0x00;
    pub const DOUBLE_TAP: u8 = 0x01;
    pub const SWIPE: u8 = 0x02;
    pub const TRIANGLE: u8 = 0x03;
    pub const CIRCLE: u8 = 0x04;
    pub const VEE: u8 = 0x05;
    pub const HEART: u8 = 0x06;
    pub const UNICODE: u8 = 0x08;
    pub const SINGLE_TAP: u8 = 0x10;
    pub const TOUCH_HOLD_DOWN: u8 = 0x80;
    pub const TOUCH_HOLD_UP: u8 = 0x81;

    /// Short display name for a gesture code
    pub fn name(code: u8) -> &'static str {
        match code {
            NONE => "none",
            DOUBLE_TAP => "double-tap",
            SWIPE => "swipe",
            TRIANGLE => "triangle",
            CIRCLE => "circle",
            VEE => "vee",
            HEART => "heart",
            UNICODE => "unicode",
            SINGLE_TAP => "single-tap",
            TOUCH_HOLD_DOWN => "touch-hold-down",
            TOUCH_HOLD_UP => "touch-hold-up",
            _ => "unknown",
        }
    }

    pub fn is_touch_hold(code: u8) -> bool {
        code == TOUCH_HOLD_DOWN || code == TOUCH_HOLD_UP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_class_partitions_codes() {
        assert_eq!(FrameClass::of(status::IDLE), FrameClass::Ignored(0x00));
        assert_eq!(FrameClass::of(status::BUSY), FrameClass::Ignored(0x02));
        assert_eq!(
            FrameClass::of(status::CONTINUED_READ),
            FrameClass::Ignored(0x03)
        );
        assert_eq!(FrameClass::of(status::OK), FrameClass::Response(0x01));
        assert_eq!(FrameClass::of(status::ERROR), FrameClass::Response(0x0F));
        assert_eq!(
            FrameClass::of(status::NOT_IMPLEMENTED),
            FrameClass::Invalid(0x0E)
        );
        assert_eq!(FrameClass::of(status::INVALID), FrameClass::Invalid(0xFF));
        assert_eq!(
            FrameClass::of(report::IDENTIFY),
            FrameClass::Report(ReportKind::Identify)
        );
        assert_eq!(
            FrameClass::of(0x42),
            FrameClass::Report(ReportKind::Other(0x42))
        );
    }

    #[test]
    fn test_command_opcode_mapping() {
        for code in 0..=0xFFu8 {
            assert_eq!(Command::from(code).opcode(), code);
        }
        assert_eq!(Command::from(0x14), Command::RunApplicationFirmware);
        assert!(Command::Reset.completes_on_identify());
        assert!(!Command::Identify.completes_on_identify());
    }

    #[test]
    fn test_firmware_mode_mapping() {
        assert!(FirmwareMode::from(0x01).is_application());
        assert!(FirmwareMode::from(0x0C).is_bootloader());
        assert_eq!(u8::from(FirmwareMode::from(0x33)), 0x33);
    }
}
