//! Device configuration
//!
//! Everything board specific is supplied here rather than hardcoded: bus
//! chunk sizes, timeouts, object count, layout programs and the ids of
//! the dynamic config entries used for gesture mode. A configuration can
//! be built in code or loaded from TOML:
//!
//! ```toml
//! read_chunk_size = 256
//! write_chunk_size = 256
//! max_objects = 10
//!
//! [timeouts]
//! default_ms = 1000
//!
//! [layout]
//! normal = "gesture_double_tap:8, foreach_active_object, object_index:4, ..."
//!
//! [dynamic_config]
//! gesture_mode = 0x09
//! ```

use crate::command::ResponseTimeout;
use crate::error::ConfigError;
use crate::report::LayoutProgram;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Most objects a touch report can describe; the active mask is 32 bits
pub const MAX_SUPPORTED_OBJECTS: usize = 32;

/// Response timeouts, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub short_ms: u64,
    pub default_ms: u64,
    pub long_ms: u64,
    pub flash_ms: u64,
    /// Wait per report when collecting reports
    pub report_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            short_ms: 300,
            default_ms: 1000,
            long_ms: 3000,
            flash_ms: 5000,
            report_ms: 1000,
        }
    }
}

impl Timeouts {
    pub fn resolve(&self, timeout: ResponseTimeout) -> Duration {
        match timeout {
            ResponseTimeout::Default => Duration::from_millis(self.default_ms),
            ResponseTimeout::Short => Duration::from_millis(self.short_ms),
            ResponseTimeout::Long => Duration::from_millis(self.long_ms),
            ResponseTimeout::Flash => Duration::from_millis(self.flash_ms),
            ResponseTimeout::Custom(d) if d.is_zero() => Duration::from_millis(self.default_ms),
            ResponseTimeout::Custom(d) => d,
        }
    }

    pub fn report(&self) -> Duration {
        Duration::from_millis(self.report_ms)
    }
}

/// Ids of the dynamic config entries the engine writes itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DynamicConfigIds {
    #[serde(deserialize_with = "deserialize_hex_u8")]
    pub gesture_mode: u8,
    #[serde(deserialize_with = "deserialize_hex_u8")]
    pub gesture_mask: u8,
    #[serde(deserialize_with = "deserialize_hex_u8")]
    pub touch_hold: u8,
}

impl Default for DynamicConfigIds {
    fn default() -> Self {
        Self {
            gesture_mode: 0x09,
            gesture_mask: 0xFE,
            touch_hold: 0xD4,
        }
    }
}

/// Configuration of one touch controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcmConfig {
    /// Largest read transfer, 0 for unbounded
    pub read_chunk_size: usize,
    /// Largest write transfer, 0 for unbounded
    pub write_chunk_size: usize,
    /// First read length of every message
    pub initial_read_length: usize,
    /// Size the next first read after the last message
    pub predictive_reading: bool,
    pub max_objects: usize,
    pub timeouts: Timeouts,
    /// Layout for normal reporting; `None` selects the built-in program
    pub normal_layout: Option<LayoutProgram>,
    /// Layout for gesture reporting; `None` selects the built-in program
    pub gesture_layout: Option<LayoutProgram>,
    /// Touch report config version passed to the built-in normal program
    pub layout_version: u8,
    pub dynamic_config: DynamicConfigIds,
    /// Gestures enabled while in gesture mode
    pub gesture_mask: u16,
}

impl Default for TcmConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 256,
            write_chunk_size: 256,
            initial_read_length: 4,
            predictive_reading: false,
            max_objects: 10,
            timeouts: Timeouts::default(),
            normal_layout: None,
            gesture_layout: None,
            layout_version: 1,
            dynamic_config: DynamicConfigIds::default(),
            gesture_mask: 0xFFFF,
        }
    }
}

impl TcmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_chunk_size = read;
        self.write_chunk_size = write;
        self
    }

    pub fn with_initial_read_length(mut self, len: usize) -> Self {
        self.initial_read_length = len;
        self
    }

    pub fn with_predictive_reading(mut self, enabled: bool) -> Self {
        self.predictive_reading = enabled;
        self
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_normal_layout(mut self, program: LayoutProgram) -> Self {
        self.normal_layout = Some(program);
        self
    }

    pub fn with_gesture_layout(mut self, program: LayoutProgram) -> Self {
        self.gesture_layout = Some(program);
        self
    }

    pub fn with_dynamic_config(mut self, ids: DynamicConfigIds) -> Self {
        self.dynamic_config = ids;
        self
    }

    /// Program installed for normal reporting
    pub fn normal_program(&self) -> LayoutProgram {
        self.normal_layout
            .clone()
            .unwrap_or_else(|| LayoutProgram::normal(self.layout_version))
    }

    /// Program installed for gesture reporting
    pub fn gesture_program(&self) -> LayoutProgram {
        self.gesture_layout
            .clone()
            .unwrap_or_else(LayoutProgram::gesture)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_objects == 0 || self.max_objects > MAX_SUPPORTED_OBJECTS {
            return Err(ConfigError::Invalid(format!(
                "max_objects must be 1..={}, got {}",
                MAX_SUPPORTED_OBJECTS, self.max_objects
            )));
        }
        if self.read_chunk_size != 0 && self.initial_read_length > self.read_chunk_size {
            log::warn!(
                "tcm: initial read length {} exceeds read chunk size {}, it will be capped",
                self.initial_read_length,
                self.read_chunk_size
            );
        }
        Ok(())
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse a configuration from a TOML string; missing keys keep defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: TomlConfigFile = toml::from_str(content)?;
        let mut config = TcmConfig::default();

        if let Some(v) = file.read_chunk_size {
            config.read_chunk_size = v as usize;
        }
        if let Some(v) = file.write_chunk_size {
            config.write_chunk_size = v as usize;
        }
        if let Some(v) = file.initial_read_length {
            config.initial_read_length = v as usize;
        }
        if let Some(v) = file.predictive_reading {
            config.predictive_reading = v;
        }
        if let Some(v) = file.max_objects {
            config.max_objects = v as usize;
        }
        if let Some(v) = file.gesture_mask {
            config.gesture_mask = u16::try_from(v).map_err(|_| {
                ConfigError::Invalid(format!("gesture_mask 0x{:x} does not fit in 16 bits", v))
            })?;
        }
        if let Some(t) = file.timeouts {
            config.timeouts = t;
        }
        if let Some(ids) = file.dynamic_config {
            config.dynamic_config = ids;
        }
        if let Some(layout) = file.layout {
            if let Some(text) = layout.normal {
                config.normal_layout = Some(parse_layout("normal", &text)?);
            }
            if let Some(text) = layout.gesture {
                config.gesture_layout = Some(parse_layout("gesture", &text)?);
            }
            if let Some(v) = layout.version {
                config.layout_version = v;
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_layout(name: &'static str, text: &str) -> Result<LayoutProgram, ConfigError> {
    text.parse()
        .map_err(|source| ConfigError::Layout { name, source })
}

/// TOML configuration file structure
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfigFile {
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    read_chunk_size: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    write_chunk_size: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    initial_read_length: Option<u32>,
    predictive_reading: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    max_objects: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    gesture_mask: Option<u32>,
    timeouts: Option<Timeouts>,
    layout: Option<TomlLayout>,
    dynamic_config: Option<DynamicConfigIds>,
}

/// Layout programs in text form
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlLayout {
    normal: Option<String>,
    gesture: Option<String>,
    version: Option<u8>,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum HexOrInt {
    Int(u32),
    Str(String),
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_hex_u32(deserializer).map(Some)
}

fn deserialize_hex_u8<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let n = deserialize_hex_u32(deserializer)?;
    u8::try_from(n).map_err(|_| serde::de::Error::custom(format!("0x{:x} does not fit in a byte", n)))
}

/// Parse a number that can be hex (0x...) or decimal
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::layout::codes;

    #[test]
    fn test_defaults() {
        let config = TcmConfig::default();
        assert_eq!(config.read_chunk_size, 256);
        assert_eq!(config.write_chunk_size, 256);
        assert_eq!(config.max_objects, 10);
        assert_eq!(config.gesture_mask, 0xFFFF);
        assert_eq!(config.normal_program(), LayoutProgram::normal(1));
        assert_eq!(config.gesture_program(), LayoutProgram::gesture());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_resolution() {
        let t = Timeouts::default();
        assert_eq!(t.resolve(ResponseTimeout::Short), Duration::from_millis(300));
        assert_eq!(t.resolve(ResponseTimeout::Default), Duration::from_millis(1000));
        assert_eq!(t.resolve(ResponseTimeout::Long), Duration::from_millis(3000));
        assert_eq!(t.resolve(ResponseTimeout::Flash), Duration::from_millis(5000));
        assert_eq!(
            t.resolve(ResponseTimeout::Custom(Duration::from_millis(7))),
            Duration::from_millis(7)
        );
        assert_eq!(
            t.resolve(ResponseTimeout::Custom(Duration::ZERO)),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_from_toml_str() {
        let config = TcmConfig::from_toml_str(
            r#"
            read_chunk_size = 64
            write_chunk_size = "0x40"
            predictive_reading = true
            max_objects = 5
            gesture_mask = "0x00ff"

            [timeouts]
            default_ms = 50

            [layout]
            normal = "foreach_active_object, object_index:4, x_position:16, foreach_end, end"

            [dynamic_config]
            gesture_mode = "0x0a"
            "#,
        )
        .unwrap();
        assert_eq!(config.read_chunk_size, 64);
        assert_eq!(config.write_chunk_size, 64);
        assert!(config.predictive_reading);
        assert_eq!(config.max_objects, 5);
        assert_eq!(config.gesture_mask, 0x00FF);
        assert_eq!(config.timeouts.default_ms, 50);
        assert_eq!(config.timeouts.short_ms, 300);
        assert_eq!(config.dynamic_config.gesture_mode, 0x0A);
        assert_eq!(config.dynamic_config.touch_hold, 0xD4);
        let program = config.normal_program();
        assert_eq!(program.ops()[1].code(), codes::OBJECT_N_INDEX);
    }

    #[test]
    fn test_bad_layout_is_named() {
        let err = TcmConfig::from_toml_str("[layout]\ngesture = \"no_such_op:3\"").unwrap_err();
        assert!(matches!(err, ConfigError::Layout { name: "gesture", .. }));
    }

    #[test]
    fn test_rejects_too_many_objects() {
        let err = TcmConfig::from_toml_str("max_objects = 33").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(TcmConfig::from_toml_str("bogus = 1").is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x10"), Ok(16));
        assert_eq!(parse_number(" 42 "), Ok(42));
        assert!(parse_number("0xZZ").is_err());
    }
}
