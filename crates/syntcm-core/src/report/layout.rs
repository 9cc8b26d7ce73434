//! Touch report layout programs
//!
//! The device describes the layout of its touch report with a byte-code
//! program: a sequence of op codes, each field op followed by one byte
//! giving the field width in bits. The host may also install its own
//! program with `SET_TOUCH_REPORT_CONFIG`.
//!
//! Programs are compiled once into [`LayoutOp`]s with every jump target
//! resolved, so decoding is a single forward pass over a flat op table.

use crate::error::LayoutError;
use std::fmt;
use std::str::FromStr;

/// Raw layout op codes
pub mod codes {
    pub const END: u8 = 0;
    pub const FOREACH_ACTIVE_OBJECT: u8 = 1;
    pub const FOREACH_OBJECT: u8 = 2;
    pub const FOREACH_END: u8 = 3;
    pub const PAD_TO_NEXT_BYTE: u8 = 4;
    pub const TIMESTAMP: u8 = 5;
    pub const OBJECT_N_INDEX: u8 = 6;
    pub const OBJECT_N_CLASSIFICATION: u8 = 7;
    pub const OBJECT_N_X_POSITION: u8 = 8;
    pub const OBJECT_N_Y_POSITION: u8 = 9;
    pub const OBJECT_N_Z: u8 = 10;
    pub const OBJECT_N_X_WIDTH: u8 = 11;
    pub const OBJECT_N_Y_WIDTH: u8 = 12;
    pub const OBJECT_N_TX_POSITION_TIXELS: u8 = 13;
    pub const OBJECT_N_RX_POSITION_TIXELS: u8 = 14;
    pub const BUTTONS_STATE_0D: u8 = 15;
    pub const GESTURE_DOUBLE_TAP: u8 = 16;
    pub const FRAME_RATE: u8 = 17;
    pub const POWER_IM: u8 = 18;
    pub const CID_IM: u8 = 19;
    pub const RAIL_IM: u8 = 20;
    pub const CID_VARIANCE_IM: u8 = 21;
    pub const NSM_FREQUENCY: u8 = 22;
    pub const NSM_STATE: u8 = 23;
    pub const NUM_OF_ACTIVE_OBJECTS: u8 = 24;
    pub const NUM_OF_CPU_CYCLES: u8 = 25;
    pub const TUNING_GAUSSIAN_WIDTHS: u8 = 0x80;
    pub const TUNING_SMALL_OBJECT_PARAMS: u8 = 0x81;
    pub const TUNING_0D_BUTTONS_VARIANCE: u8 = 0x82;
    pub const GESTURE_SWIPE: u8 = 0xC1;
    pub const GESTURE_CIRCLE: u8 = 0xC2;
    pub const GESTURE_UNICODE: u8 = 0xC3;
    pub const GESTURE_VEE: u8 = 0xC4;
    pub const GESTURE_TRIANGLE: u8 = 0xC5;
    pub const GESTURE_INFO: u8 = 0xC6;
    pub const GESTURE_COORDINATE: u8 = 0xC7;
    pub const CUSTOMER_GRIP_INFO: u8 = 0xCB;
}

/// Destination of an extracted field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Timestamp,
    ObjectIndex,
    Classification,
    XPosition,
    YPosition,
    Z,
    XWidth,
    YWidth,
    TxPosition,
    RxPosition,
    ButtonsState,
    /// Any of the gesture-code fields; all land in the same gesture slot
    Gesture,
    GestureInfo,
    GestureCoordinate,
    GripInfo,
    FrameRate,
    PowerIm,
    CidIm,
    RailIm,
    CidVarianceIm,
    NsmFrequency,
    NsmState,
    CpuCycles,
    /// Tuning data: the width is consumed, the value dropped
    Tuning,
}

/// A compiled layout op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutOp {
    End,
    /// Start of a loop over reported objects; ends at op `end`
    ForeachActiveObject { end: usize },
    /// Start of a loop over all `max_objects` slots; ends at op `end`
    ForeachObject { end: usize },
    /// Loop back edge to the first op of the body
    ForeachEnd { body: usize, active_only: bool },
    PadToNextByte,
    Field { code: u8, kind: FieldKind, bits: u8 },
    /// Object count; a count of 0 continues at op `skip_to`
    ActiveObjectCount { bits: u8, skip_to: usize },
    /// An op code with no known meaning; it consumes no report bits
    Unknown(u8),
}

impl LayoutOp {
    /// The raw op code this op was compiled from
    pub fn code(&self) -> u8 {
        match self {
            LayoutOp::End => codes::END,
            LayoutOp::ForeachActiveObject { .. } => codes::FOREACH_ACTIVE_OBJECT,
            LayoutOp::ForeachObject { .. } => codes::FOREACH_OBJECT,
            LayoutOp::ForeachEnd { .. } => codes::FOREACH_END,
            LayoutOp::PadToNextByte => codes::PAD_TO_NEXT_BYTE,
            LayoutOp::Field { code, .. } => *code,
            LayoutOp::ActiveObjectCount { .. } => codes::NUM_OF_ACTIVE_OBJECTS,
            LayoutOp::Unknown(code) => *code,
        }
    }

    pub fn bits(&self) -> Option<u8> {
        match self {
            LayoutOp::Field { bits, .. } | LayoutOp::ActiveObjectCount { bits, .. } => Some(*bits),
            _ => None,
        }
    }
}

/// Field kind for a width-carrying op code
fn field_kind(code: u8) -> Option<FieldKind> {
    use codes::*;
    let kind = match code {
        TIMESTAMP => FieldKind::Timestamp,
        OBJECT_N_INDEX => FieldKind::ObjectIndex,
        OBJECT_N_CLASSIFICATION => FieldKind::Classification,
        OBJECT_N_X_POSITION => FieldKind::XPosition,
        OBJECT_N_Y_POSITION => FieldKind::YPosition,
        OBJECT_N_Z => FieldKind::Z,
        OBJECT_N_X_WIDTH => FieldKind::XWidth,
        OBJECT_N_Y_WIDTH => FieldKind::YWidth,
        OBJECT_N_TX_POSITION_TIXELS => FieldKind::TxPosition,
        OBJECT_N_RX_POSITION_TIXELS => FieldKind::RxPosition,
        BUTTONS_STATE_0D => FieldKind::ButtonsState,
        GESTURE_DOUBLE_TAP | GESTURE_SWIPE | GESTURE_CIRCLE | GESTURE_UNICODE | GESTURE_VEE
        | GESTURE_TRIANGLE => FieldKind::Gesture,
        GESTURE_INFO => FieldKind::GestureInfo,
        GESTURE_COORDINATE => FieldKind::GestureCoordinate,
        CUSTOMER_GRIP_INFO => FieldKind::GripInfo,
        FRAME_RATE => FieldKind::FrameRate,
        POWER_IM => FieldKind::PowerIm,
        CID_IM => FieldKind::CidIm,
        RAIL_IM => FieldKind::RailIm,
        CID_VARIANCE_IM => FieldKind::CidVarianceIm,
        NSM_FREQUENCY => FieldKind::NsmFrequency,
        NSM_STATE => FieldKind::NsmState,
        NUM_OF_CPU_CYCLES => FieldKind::CpuCycles,
        TUNING_GAUSSIAN_WIDTHS | TUNING_SMALL_OBJECT_PARAMS | TUNING_0D_BUTTONS_VARIANCE => {
            FieldKind::Tuning
        }
        _ => return None,
    };
    Some(kind)
}

/// Op names used in the text form of a program
const OP_NAMES: &[(&str, u8)] = &[
    ("end", codes::END),
    ("foreach_active_object", codes::FOREACH_ACTIVE_OBJECT),
    ("foreach_object", codes::FOREACH_OBJECT),
    ("foreach_end", codes::FOREACH_END),
    ("pad_to_next_byte", codes::PAD_TO_NEXT_BYTE),
    ("timestamp", codes::TIMESTAMP),
    ("object_index", codes::OBJECT_N_INDEX),
    ("classification", codes::OBJECT_N_CLASSIFICATION),
    ("x_position", codes::OBJECT_N_X_POSITION),
    ("y_position", codes::OBJECT_N_Y_POSITION),
    ("z", codes::OBJECT_N_Z),
    ("x_width", codes::OBJECT_N_X_WIDTH),
    ("y_width", codes::OBJECT_N_Y_WIDTH),
    ("tx_position", codes::OBJECT_N_TX_POSITION_TIXELS),
    ("rx_position", codes::OBJECT_N_RX_POSITION_TIXELS),
    ("buttons_state", codes::BUTTONS_STATE_0D),
    ("gesture_double_tap", codes::GESTURE_DOUBLE_TAP),
    ("frame_rate", codes::FRAME_RATE),
    ("power_im", codes::POWER_IM),
    ("cid_im", codes::CID_IM),
    ("rail_im", codes::RAIL_IM),
    ("cid_variance_im", codes::CID_VARIANCE_IM),
    ("nsm_frequency", codes::NSM_FREQUENCY),
    ("nsm_state", codes::NSM_STATE),
    ("num_active_objects", codes::NUM_OF_ACTIVE_OBJECTS),
    ("cpu_cycles", codes::NUM_OF_CPU_CYCLES),
    ("tuning_gaussian_widths", codes::TUNING_GAUSSIAN_WIDTHS),
    ("tuning_small_object_params", codes::TUNING_SMALL_OBJECT_PARAMS),
    ("tuning_0d_buttons_variance", codes::TUNING_0D_BUTTONS_VARIANCE),
    ("gesture_swipe", codes::GESTURE_SWIPE),
    ("gesture_circle", codes::GESTURE_CIRCLE),
    ("gesture_unicode", codes::GESTURE_UNICODE),
    ("gesture_vee", codes::GESTURE_VEE),
    ("gesture_triangle", codes::GESTURE_TRIANGLE),
    ("gesture_info", codes::GESTURE_INFO),
    ("gesture_coordinate", codes::GESTURE_COORDINATE),
    ("grip_info", codes::CUSTOMER_GRIP_INFO),
];

fn op_name(code: u8) -> Option<&'static str> {
    OP_NAMES.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

fn op_code(name: &str) -> Option<u8> {
    OP_NAMES.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

fn takes_width(code: u8) -> bool {
    code == codes::NUM_OF_ACTIVE_OBJECTS || field_kind(code).is_some()
}

/// A compiled touch report layout program
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayoutProgram {
    ops: Vec<LayoutOp>,
}

impl LayoutProgram {
    /// Compile a program from its wire form
    pub fn parse(bytes: &[u8]) -> Result<Self, LayoutError> {
        Self::parse_raw(bytes, false)
    }

    /// Compile a program read back from the device
    ///
    /// The device pads the program with zeros up to its maximum size; the
    /// first end op terminates it.
    pub fn parse_device_config(bytes: &[u8]) -> Result<Self, LayoutError> {
        Self::parse_raw(bytes, true)
    }

    fn parse_raw(bytes: &[u8], stop_at_end: bool) -> Result<Self, LayoutError> {
        let mut raw = Vec::new();
        let mut idx = 0;
        while idx < bytes.len() {
            let code = bytes[idx];
            let offset = idx;
            idx += 1;
            if takes_width(code) {
                let bits = *bytes
                    .get(idx)
                    .ok_or(LayoutError::MissingWidth { code, offset })?;
                idx += 1;
                raw.push((code, bits));
            } else {
                raw.push((code, 0));
                if stop_at_end && code == codes::END {
                    break;
                }
            }
        }
        Self::link(&raw)
    }

    /// Build a program from `(code, width)` pairs; width is ignored for
    /// ops that take none
    pub fn from_ops(ops: &[(u8, u8)]) -> Result<Self, LayoutError> {
        Self::link(ops)
    }

    /// Resolve loop and skip targets
    fn link(raw: &[(u8, u8)]) -> Result<Self, LayoutError> {
        let mut ops = Vec::with_capacity(raw.len());
        let mut open: Option<(usize, bool)> = None;

        for (i, &(code, bits)) in raw.iter().enumerate() {
            let op = match code {
                codes::END => LayoutOp::End,
                codes::FOREACH_ACTIVE_OBJECT | codes::FOREACH_OBJECT => {
                    if open.is_some() {
                        return Err(LayoutError::NestedForeach(i));
                    }
                    let active_only = code == codes::FOREACH_ACTIVE_OBJECT;
                    open = Some((i, active_only));
                    // patched when the matching end is seen
                    if active_only {
                        LayoutOp::ForeachActiveObject { end: raw.len() }
                    } else {
                        LayoutOp::ForeachObject { end: raw.len() }
                    }
                }
                codes::FOREACH_END => {
                    let (start, active_only) =
                        open.take().ok_or(LayoutError::UnmatchedForeachEnd(i))?;
                    if let LayoutOp::ForeachActiveObject { end } | LayoutOp::ForeachObject { end } =
                        &mut ops[start]
                    {
                        *end = i;
                    }
                    LayoutOp::ForeachEnd {
                        body: start + 1,
                        active_only,
                    }
                }
                codes::PAD_TO_NEXT_BYTE => LayoutOp::PadToNextByte,
                codes::NUM_OF_ACTIVE_OBJECTS => LayoutOp::ActiveObjectCount {
                    bits,
                    skip_to: raw.len(),
                },
                code => match field_kind(code) {
                    Some(kind) => LayoutOp::Field { code, kind, bits },
                    None => {
                        log::debug!("tcm: layout op 0x{:02x} is not known, ignoring", code);
                        LayoutOp::Unknown(code)
                    }
                },
            };
            ops.push(op);
        }
        if let Some((start, _)) = open {
            return Err(LayoutError::UnclosedForeach(start));
        }

        // An empty object count skips to just past the next loop end.
        for i in 0..ops.len() {
            if let LayoutOp::ActiveObjectCount { bits, .. } = ops[i] {
                let skip_to = ops[i..]
                    .iter()
                    .position(|op| matches!(op, LayoutOp::ForeachEnd { .. }))
                    .map(|p| i + p + 1)
                    .unwrap_or(ops.len());
                ops[i] = LayoutOp::ActiveObjectCount { bits, skip_to };
            }
        }

        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[LayoutOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Wire form of the program
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ops.len() * 2);
        for op in &self.ops {
            out.push(op.code());
            if let Some(bits) = op.bits() {
                out.push(bits);
            }
        }
        out
    }

    /// Total bits consumed by one pass over the program, loops run once
    pub fn bits_per_pass(&self) -> usize {
        self.ops.iter().filter_map(|op| op.bits()).map(usize::from).sum()
    }

    /// Program for normal touch reporting
    ///
    /// Gesture data leads the report; configuration version 0 firmware also
    /// carries gesture info in normal mode.
    pub fn normal(config_version: u8) -> Self {
        use codes::*;
        let mut ops = vec![(GESTURE_DOUBLE_TAP, 8)];
        if config_version == 0 {
            ops.push((GESTURE_INFO, 48));
        }
        ops.extend_from_slice(&[
            (FOREACH_ACTIVE_OBJECT, 0),
            (OBJECT_N_INDEX, 4),
            (OBJECT_N_CLASSIFICATION, 4),
            (OBJECT_N_X_POSITION, 16),
            (OBJECT_N_Y_POSITION, 16),
            (OBJECT_N_X_WIDTH, 12),
            (OBJECT_N_Y_WIDTH, 12),
            (CUSTOMER_GRIP_INFO, 32),
            (FOREACH_END, 0),
            (END, 0),
        ]);
        Self::from_static(&ops)
    }

    /// Program for gesture (low-power wake) reporting
    pub fn gesture() -> Self {
        use codes::*;
        Self::from_static(&[
            (GESTURE_DOUBLE_TAP, 8),
            (GESTURE_INFO, 48),
            (GESTURE_COORDINATE, 192),
            (FOREACH_ACTIVE_OBJECT, 0),
            (OBJECT_N_INDEX, 4),
            (OBJECT_N_CLASSIFICATION, 4),
            (OBJECT_N_X_POSITION, 16),
            (OBJECT_N_Y_POSITION, 16),
            (FOREACH_END, 0),
            (END, 0),
        ])
    }

    fn from_static(ops: &[(u8, u8)]) -> Self {
        match Self::link(ops) {
            Ok(p) => p,
            Err(e) => unreachable!("built-in layout program is malformed: {}", e),
        }
    }
}

impl FromStr for LayoutProgram {
    type Err = LayoutError;

    /// Parse the text form: ops separated by commas or whitespace, each
    /// `name` or `name:bits`, e.g. `"foreach_active_object, x_position:16"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ops = Vec::new();
        for token in s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            ops.push(parse_op_token(token)?);
        }
        Self::link(&ops)
    }
}

/// Parse one `name[:bits]` token
pub fn parse_op_token(token: &str) -> Result<(u8, u8), LayoutError> {
    let (name, bits) = match token.split_once(':') {
        Some((name, bits)) => (name, Some(bits)),
        None => (token, None),
    };
    let code = op_code(name).ok_or_else(|| LayoutError::UnknownOpName(name.to_string()))?;
    let bits = match (takes_width(code), bits) {
        (true, Some(b)) => b
            .parse::<u8>()
            .map_err(|_| LayoutError::InvalidWidth(token.to_string()))?,
        (true, None) => return Err(LayoutError::InvalidWidth(token.to_string())),
        (false, Some(_)) => return Err(LayoutError::InvalidWidth(token.to_string())),
        (false, None) => 0,
    };
    Ok((code, bits))
}

impl fmt::Display for LayoutProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match op_name(op.code()) {
                Some(name) => f.write_str(name)?,
                None => write!(f, "0x{:02x}", op.code())?,
            }
            if let Some(bits) = op.bits() {
                write!(f, ":{}", bits)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_stops_at_end() {
        let bytes = [codes::GESTURE_DOUBLE_TAP, 8, codes::END, 0, 0, 0, 0];
        let program = LayoutProgram::parse_device_config(&bytes).unwrap();
        assert_eq!(program.ops().len(), 2);
        assert_eq!(program.to_bytes(), vec![codes::GESTURE_DOUBLE_TAP, 8, codes::END]);
        assert_eq!(LayoutProgram::parse(&bytes).unwrap().ops().len(), 6);
    }

    #[test]
    fn test_parse_links_loop() {
        let bytes = [
            codes::TIMESTAMP, 32,
            codes::NUM_OF_ACTIVE_OBJECTS, 8,
            codes::FOREACH_ACTIVE_OBJECT,
            codes::OBJECT_N_INDEX, 4,
            codes::OBJECT_N_X_POSITION, 16,
            codes::FOREACH_END,
            codes::END,
        ];
        let program = LayoutProgram::parse(&bytes).unwrap();
        assert_eq!(
            program.ops(),
            &[
                LayoutOp::Field { code: codes::TIMESTAMP, kind: FieldKind::Timestamp, bits: 32 },
                LayoutOp::ActiveObjectCount { bits: 8, skip_to: 6 },
                LayoutOp::ForeachActiveObject { end: 5 },
                LayoutOp::Field { code: codes::OBJECT_N_INDEX, kind: FieldKind::ObjectIndex, bits: 4 },
                LayoutOp::Field { code: codes::OBJECT_N_X_POSITION, kind: FieldKind::XPosition, bits: 16 },
                LayoutOp::ForeachEnd { body: 3, active_only: true },
                LayoutOp::End,
            ]
        );
        assert_eq!(program.to_bytes(), bytes.to_vec());
    }

    #[test]
    fn test_parse_missing_width() {
        assert_eq!(
            LayoutProgram::parse(&[codes::FOREACH_OBJECT, codes::OBJECT_N_X_POSITION]),
            Err(LayoutError::MissingWidth { code: codes::OBJECT_N_X_POSITION, offset: 1 })
        );
    }

    #[test]
    fn test_parse_rejects_bad_loops() {
        assert_eq!(
            LayoutProgram::parse(&[codes::FOREACH_END]),
            Err(LayoutError::UnmatchedForeachEnd(0))
        );
        assert_eq!(
            LayoutProgram::parse(&[codes::FOREACH_OBJECT, codes::FOREACH_ACTIVE_OBJECT]),
            Err(LayoutError::NestedForeach(1))
        );
        assert_eq!(
            LayoutProgram::from_ops(&[
                (codes::FOREACH_ACTIVE_OBJECT, 0),
                (codes::OBJECT_N_INDEX, 4),
                (codes::END, 0),
            ]),
            Err(LayoutError::UnclosedForeach(0))
        );
    }

    #[test]
    fn test_unknown_op_is_kept() {
        let program = LayoutProgram::parse(&[0x60, codes::TIMESTAMP, 16]).unwrap();
        assert_eq!(program.ops()[0], LayoutOp::Unknown(0x60));
        assert_eq!(program.to_bytes(), vec![0x60, codes::TIMESTAMP, 16]);
    }

    #[test]
    fn test_builtin_programs() {
        let normal = LayoutProgram::normal(1);
        assert_eq!(normal.bits_per_pass(), 8 + 4 + 4 + 16 + 16 + 12 + 12 + 32);
        let legacy = LayoutProgram::normal(0);
        assert_eq!(legacy.bits_per_pass(), normal.bits_per_pass() + 48);
        let gesture = LayoutProgram::gesture();
        assert_eq!(gesture.bits_per_pass(), 8 + 48 + 192 + 40);
    }

    #[test]
    fn test_text_form() {
        let program: LayoutProgram =
            "foreach_object, classification:4 x_position:16,foreach_end end"
                .parse()
                .unwrap();
        assert_eq!(
            program.to_bytes(),
            vec![
                codes::FOREACH_OBJECT,
                codes::OBJECT_N_CLASSIFICATION, 4,
                codes::OBJECT_N_X_POSITION, 16,
                codes::FOREACH_END,
                codes::END,
            ]
        );
        assert_eq!(
            program.to_string(),
            "foreach_object, classification:4, x_position:16, foreach_end, end"
        );
        assert_eq!(
            "x_position".parse::<LayoutProgram>(),
            Err(LayoutError::InvalidWidth("x_position".to_string()))
        );
        assert_eq!(
            "bogus:4".parse::<LayoutProgram>(),
            Err(LayoutError::UnknownOpName("bogus".to_string()))
        );
    }

    #[test]
    fn test_normal_program_round_trips_text() {
        let normal = LayoutProgram::normal(0);
        let reparsed: LayoutProgram = normal.to_string().parse().unwrap();
        assert_eq!(reparsed, normal);
    }
}
