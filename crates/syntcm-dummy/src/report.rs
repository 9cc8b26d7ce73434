//! Touch report encoding for the emulated controller
//!
//! Builds report payloads by running the active layout program forwards,
//! the mirror image of what the host decoder does.

use syntcm_core::report::{FieldKind, LayoutOp, LayoutProgram};

/// One contact to put in a touch report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TouchContact {
    pub index: u8,
    /// 0 = lift, 1 = finger, 2 = gloved finger
    pub classification: u8,
    pub x: u16,
    pub y: u16,
    pub z: u16,
    pub x_width: u16,
    pub y_width: u16,
}

impl TouchContact {
    /// A finger down at `(x, y)`
    pub fn finger(index: u8, x: u16, y: u16) -> Self {
        Self {
            index,
            classification: 1,
            x,
            y,
            z: 40,
            x_width: 6,
            y_width: 4,
        }
    }

    /// The report where slot `index` lifts
    pub fn lift(index: u8) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }
}

/// Content of one touch report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchInput {
    pub timestamp: u32,
    pub gesture: u8,
    pub gesture_info: Vec<u8>,
    pub gesture_coordinates: Vec<u8>,
    pub contacts: Vec<TouchContact>,
}

impl TouchInput {
    pub fn with_contacts(contacts: &[TouchContact]) -> Self {
        Self {
            contacts: contacts.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_gesture(gesture: u8, info: &[u8]) -> Self {
        Self {
            gesture,
            gesture_info: info.to_vec(),
            ..Default::default()
        }
    }
}

/// LSB-first bit packer
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    offset: usize,
}

impl BitWriter {
    fn push(&mut self, value: u32, bits: usize) {
        for i in 0..bits {
            let pos = self.offset + i;
            if self.bytes.len() <= pos / 8 {
                self.bytes.resize(pos / 8 + 1, 0);
            }
            if i < 32 && (value >> i) & 1 == 1 {
                self.bytes[pos / 8] |= 1 << (pos % 8);
            }
        }
        self.offset += bits;
    }

    fn push_bytes(&mut self, data: &[u8], bits: usize) {
        for i in 0..bits / 8 {
            self.push(u32::from(data.get(i).copied().unwrap_or(0)), 8);
        }
        self.push(0, bits % 8);
    }

    fn pad(&mut self) {
        let padded = self.offset.div_ceil(8) * 8;
        self.push(0, padded - self.offset);
    }

    fn finish(mut self) -> Vec<u8> {
        self.bytes.resize(self.offset.div_ceil(8), 0);
        self.bytes
    }
}

/// Encode `input` as a touch report for `program`
pub fn encode_touch_report(
    program: &LayoutProgram,
    input: &TouchInput,
    max_objects: usize,
) -> Vec<u8> {
    let ops = program.ops();
    let mut w = BitWriter::default();
    let mut pc = 0;

    while pc < ops.len() {
        match ops[pc] {
            LayoutOp::End => break,
            LayoutOp::ForeachActiveObject { end } | LayoutOp::ForeachObject { end } => {
                let body = &ops[pc + 1..end.min(ops.len())];
                let slots: Vec<TouchContact> = match ops[pc] {
                    LayoutOp::ForeachActiveObject { .. } => input.contacts.clone(),
                    _ => (0..max_objects)
                        .map(|i| {
                            input
                                .contacts
                                .iter()
                                .find(|c| c.index as usize == i)
                                .copied()
                                .unwrap_or(TouchContact::lift(i as u8))
                        })
                        .collect(),
                };
                for contact in &slots {
                    for op in body {
                        write_op(&mut w, op, input, Some(contact));
                    }
                }
                pc = end + 1;
            }
            LayoutOp::ActiveObjectCount { bits, .. } => {
                w.push(input.contacts.len() as u32, bits as usize);
                pc += 1;
            }
            ref op => {
                write_op(&mut w, op, input, None);
                pc += 1;
            }
        }
    }
    w.finish()
}

fn write_op(w: &mut BitWriter, op: &LayoutOp, input: &TouchInput, contact: Option<&TouchContact>) {
    let (kind, bits) = match *op {
        LayoutOp::PadToNextByte => return w.pad(),
        LayoutOp::Field { kind, bits, .. } => (kind, bits as usize),
        _ => return,
    };
    let c = contact.copied().unwrap_or_default();
    let value = match kind {
        FieldKind::ObjectIndex => u32::from(c.index),
        FieldKind::Classification => u32::from(c.classification),
        FieldKind::XPosition => u32::from(c.x),
        FieldKind::YPosition => u32::from(c.y),
        FieldKind::Z => u32::from(c.z),
        FieldKind::XWidth => u32::from(c.x_width),
        FieldKind::YWidth => u32::from(c.y_width),
        FieldKind::Timestamp => input.timestamp,
        FieldKind::Gesture => u32::from(input.gesture),
        FieldKind::GestureInfo => return w.push_bytes(&input.gesture_info, bits),
        FieldKind::GestureCoordinate => return w.push_bytes(&input.gesture_coordinates, bits),
        _ => 0,
    };
    if bits > 32 {
        w.push_bytes(&value.to_le_bytes(), bits);
    } else {
        w.push(value, bits);
    }
}
