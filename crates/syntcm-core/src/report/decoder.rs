//! Touch report decoder
//!
//! Runs a compiled [`LayoutProgram`] over a report buffer with a bit
//! cursor, writing each field into a [`TouchFrameResult`].

use super::bits::FieldBits;
use super::layout::{FieldKind, LayoutOp, LayoutProgram};
use super::touch::{GripMetrics, ObjectStatus, TouchFrameResult};
use crate::error::DecodeError;

/// Decodes touch reports with one layout program
#[derive(Debug, Clone)]
pub struct ReportDecoder {
    program: LayoutProgram,
    max_objects: usize,
}

impl ReportDecoder {
    pub fn new(program: LayoutProgram, max_objects: usize) -> Self {
        Self {
            program,
            max_objects,
        }
    }

    pub fn program(&self) -> &LayoutProgram {
        &self.program
    }

    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    /// Decode one report
    ///
    /// Object slots start out lifted and are overwritten, never carried
    /// over from an earlier report.
    pub fn decode(&self, report: &[u8]) -> Result<TouchFrameResult, DecodeError> {
        let ops = self.program.ops();
        if ops.is_empty() {
            return Err(DecodeError::NoProgram);
        }

        let report_bits = report.len() * 8;
        let mut result = TouchFrameResult::new(self.max_objects);
        let mut pc = 0;
        let mut offset = 0usize;
        let mut obj = 0usize;
        let mut active_objects: Option<u32> = None;
        let mut objects_seen = 0u32;
        let mut pass_start = 0usize;

        while pc < ops.len() {
            let op = ops[pc];
            pc += 1;

            match op {
                LayoutOp::End => break,
                LayoutOp::ForeachActiveObject { .. } | LayoutOp::ForeachObject { .. } => {
                    obj = 0;
                    pass_start = offset;
                }
                LayoutOp::ForeachEnd { body, active_only } => {
                    let again = if active_only {
                        match active_objects {
                            Some(count) => {
                                objects_seen += 1;
                                objects_seen < count && (objects_seen as usize) < self.max_objects
                            }
                            // No count: keep going while report bits remain.
                            None => offset < report_bits && offset > pass_start,
                        }
                    } else {
                        obj += 1;
                        obj < self.max_objects
                    };
                    if again {
                        pass_start = offset;
                        pc = body;
                    }
                }
                LayoutOp::PadToNextByte => {
                    offset = offset.div_ceil(8) * 8;
                }
                LayoutOp::ActiveObjectCount { bits, skip_to } => {
                    let count = FieldBits::extract(report, offset, bits as usize).value();
                    offset += bits as usize;
                    active_objects = Some(count);
                    result.num_active_objects = Some(count);
                    if count == 0 {
                        pc = skip_to;
                    }
                }
                // zero-width fields leave their destination untouched
                LayoutOp::Field { bits: 0, .. } => {}
                LayoutOp::Field { kind, bits, .. } => {
                    let field = FieldBits::extract(report, offset, bits as usize);
                    offset += bits as usize;
                    self.store(&mut result, &mut obj, kind, bits, field)?;
                }
                LayoutOp::Unknown(_) => {}
            }
        }

        log::trace!(
            "tcm: decoded touch report, {} of {} bits, {} active objects",
            offset.min(report_bits),
            report_bits,
            result.active_count()
        );
        Ok(result)
    }

    fn store(
        &self,
        result: &mut TouchFrameResult,
        obj: &mut usize,
        kind: FieldKind,
        bits: u8,
        field: FieldBits,
    ) -> Result<(), DecodeError> {
        let value = field.value();
        let slot = result.objects.get_mut(*obj);

        match kind {
            FieldKind::ObjectIndex => {
                if value as usize >= self.max_objects {
                    log::error!(
                        "tcm: object index {} out of range (max {})",
                        value,
                        self.max_objects
                    );
                    return Err(DecodeError::ObjectIndexOutOfRange {
                        index: value,
                        max: self.max_objects,
                    });
                }
                *obj = value as usize;
            }
            FieldKind::Classification => {
                if let Some(s) = slot {
                    s.status = ObjectStatus::from(value);
                }
            }
            FieldKind::XPosition => set(slot, |s| s.x = value),
            FieldKind::YPosition => set(slot, |s| s.y = value),
            FieldKind::Z => set(slot, |s| s.z = value),
            FieldKind::XWidth => set(slot, |s| s.x_width = value),
            FieldKind::YWidth => set(slot, |s| s.y_width = value),
            FieldKind::TxPosition => set(slot, |s| s.tx_pos = value),
            FieldKind::RxPosition => set(slot, |s| s.rx_pos = value),
            FieldKind::GripInfo => set(slot, |s| s.grip = GripMetrics::from_le(value)),
            FieldKind::Timestamp => result.timestamp = value,
            FieldKind::ButtonsState => result.buttons_state = value,
            FieldKind::Gesture => result.gesture_code = value,
            FieldKind::GestureInfo => result.gesture_info = field.into_bytes(bits as usize),
            FieldKind::GestureCoordinate => {
                result.gesture_coordinates = field.into_bytes(bits as usize)
            }
            FieldKind::FrameRate => result.frame_rate = value,
            FieldKind::PowerIm => result.health.power_im = value,
            FieldKind::CidIm => result.health.cid_im = value,
            FieldKind::RailIm => result.health.rail_im = value,
            FieldKind::CidVarianceIm => result.health.cid_variance_im = value,
            FieldKind::NsmFrequency => result.health.nsm_frequency = value,
            FieldKind::NsmState => result.health.nsm_state = value,
            FieldKind::CpuCycles => result.health.cpu_cycles = value,
            FieldKind::Tuning => {}
        }
        Ok(())
    }
}

fn set<S>(slot: Option<&mut S>, f: impl FnOnce(&mut S)) {
    if let Some(s) = slot {
        f(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::layout::codes::*;

    /// Packs fields LSB-first the way the device does
    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        bit: usize,
    }

    impl BitWriter {
        fn put(&mut self, value: u64, bits: usize) -> &mut Self {
            for i in 0..bits {
                if self.bit / 8 >= self.bytes.len() {
                    self.bytes.push(0);
                }
                if (value >> i) & 1 == 1 {
                    self.bytes[self.bit / 8] |= 1 << (self.bit % 8);
                }
                self.bit += 1;
            }
            self
        }

        fn finish(&mut self) -> Vec<u8> {
            self.bytes.clone()
        }
    }

    fn counted_program() -> LayoutProgram {
        LayoutProgram::from_ops(&[
            (NUM_OF_ACTIVE_OBJECTS, 8),
            (FOREACH_ACTIVE_OBJECT, 0),
            (OBJECT_N_INDEX, 4),
            (OBJECT_N_CLASSIFICATION, 4),
            (OBJECT_N_X_POSITION, 16),
            (OBJECT_N_Y_POSITION, 16),
            (FOREACH_END, 0),
            (END, 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_two_counted_objects() {
        let report = BitWriter::default()
            .put(2, 8)
            .put(1, 4).put(1, 4).put(100, 16).put(200, 16)
            .put(4, 4).put(2, 4).put(1079, 16).put(2399, 16)
            .finish();
        let decoder = ReportDecoder::new(counted_program(), 10);
        let frame = decoder.decode(&report).unwrap();

        assert_eq!(frame.num_active_objects, Some(2));
        assert_eq!(frame.active_count(), 2);
        assert_eq!(frame.active_mask(), 0b1_0010);
        assert_eq!(frame.objects[1].status, ObjectStatus::Finger);
        assert_eq!((frame.objects[1].x, frame.objects[1].y), (100, 200));
        assert_eq!(frame.objects[4].status, ObjectStatus::GlovedFinger);
        assert_eq!((frame.objects[4].x, frame.objects[4].y), (1079, 2399));
        assert_eq!(frame.objects.len(), 10);
    }

    #[test]
    fn test_zero_count_skips_loop_body() {
        // Trailing bytes would decode as an object if the body ran.
        let report = BitWriter::default()
            .put(0, 8)
            .put(3, 4).put(1, 4).put(500, 16).put(600, 16)
            .finish();
        let decoder = ReportDecoder::new(counted_program(), 10);
        let frame = decoder.decode(&report).unwrap();
        assert_eq!(frame.num_active_objects, Some(0));
        assert_eq!(frame.active_count(), 0);
        assert!(frame.objects.iter().all(|o| o.x == 0 && o.y == 0));
    }

    #[test]
    fn test_zero_count_continues_after_loop() {
        let program = LayoutProgram::from_ops(&[
            (NUM_OF_ACTIVE_OBJECTS, 8),
            (FOREACH_ACTIVE_OBJECT, 0),
            (OBJECT_N_X_POSITION, 16),
            (FOREACH_END, 0),
            (FRAME_RATE, 8),
            (END, 0),
        ])
        .unwrap();
        let report = BitWriter::default().put(0, 8).put(120, 8).finish();
        let frame = ReportDecoder::new(program, 4).decode(&report).unwrap();
        assert_eq!(frame.frame_rate, 120);
    }

    #[test]
    fn test_index_out_of_range() {
        let report = BitWriter::default()
            .put(1, 8)
            .put(12, 4).put(1, 4).put(1, 16).put(1, 16)
            .finish();
        let decoder = ReportDecoder::new(counted_program(), 10);
        assert_eq!(
            decoder.decode(&report),
            Err(DecodeError::ObjectIndexOutOfRange { index: 12, max: 10 })
        );
    }

    #[test]
    fn test_implicit_loop_stops_at_report_end() {
        let program = LayoutProgram::from_ops(&[
            (FOREACH_ACTIVE_OBJECT, 0),
            (OBJECT_N_INDEX, 4),
            (OBJECT_N_CLASSIFICATION, 4),
            (OBJECT_N_X_POSITION, 16),
            (FOREACH_END, 0),
            (END, 0),
        ])
        .unwrap();
        // Three records of exactly 24 bits: the loop ends when the cursor
        // lands on offset == report length * 8.
        let report = BitWriter::default()
            .put(0, 4).put(1, 4).put(10, 16)
            .put(1, 4).put(1, 4).put(11, 16)
            .put(2, 4).put(1, 4).put(12, 16)
            .finish();
        assert_eq!(report.len() * 8, 72);
        let frame = ReportDecoder::new(program.clone(), 10).decode(&report).unwrap();
        assert_eq!(frame.active_count(), 3);
        assert_eq!(
            frame.objects.iter().take(3).map(|o| o.x).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );

        // One byte more: a fourth pass runs and reads the zero-filled tail.
        let mut longer = report.clone();
        longer.push(0x03);
        let frame = ReportDecoder::new(program, 10).decode(&longer).unwrap();
        assert_eq!(frame.active_count(), 3);
        assert_eq!(frame.objects[3].x, 0);
    }

    #[test]
    fn test_foreach_object_walks_every_slot() {
        let program = LayoutProgram::from_ops(&[
            (TIMESTAMP, 16),
            (FOREACH_OBJECT, 0),
            (OBJECT_N_CLASSIFICATION, 2),
            (OBJECT_N_Z, 6),
            (FOREACH_END, 0),
            (END, 0),
        ])
        .unwrap();
        let mut w = BitWriter::default();
        w.put(0xBEEF, 16);
        for i in 0..4u64 {
            w.put(i % 2, 2).put(i + 20, 6);
        }
        let frame = ReportDecoder::new(program, 4).decode(&w.finish()).unwrap();
        assert_eq!(frame.timestamp, 0xBEEF);
        assert_eq!(frame.active_mask(), 0b1010);
        assert_eq!(
            frame.objects.iter().map(|o| o.z).collect::<Vec<_>>(),
            vec![20, 21, 22, 23]
        );
    }

    #[test]
    fn test_pad_and_tuning_advance_cursor() {
        let program = LayoutProgram::from_ops(&[
            (BUTTONS_STATE_0D, 3),
            (PAD_TO_NEXT_BYTE, 0),
            (TUNING_GAUSSIAN_WIDTHS, 8),
            (NSM_STATE, 8),
            (END, 0),
        ])
        .unwrap();
        let report = [0b0000_0101, 0xFF, 0x42];
        let frame = ReportDecoder::new(program, 1).decode(&report).unwrap();
        assert_eq!(frame.buttons_state, 0b101);
        assert_eq!(frame.health.nsm_state, 0x42);
    }

    #[test]
    fn test_gesture_layout_wide_fields() {
        let mut w = BitWriter::default();
        w.put(0x80, 8);
        for b in [0x20u64, 0x01, 0x40, 0x02, 0x32, 0x00] {
            w.put(b, 8);
        }
        for i in 0..24u64 {
            w.put(i, 8);
        }
        w.put(0, 4).put(1, 4).put(300, 16).put(400, 16);
        let frame = ReportDecoder::new(LayoutProgram::gesture(), 10)
            .decode(&w.finish())
            .unwrap();

        assert!(frame.is_touch_hold());
        assert_eq!(frame.gesture_info, vec![0x20, 0x01, 0x40, 0x02, 0x32, 0x00]);
        assert_eq!(frame.gesture_coordinates.len(), 24);
        assert_eq!(frame.gesture_points()[0], (0x0100, 0x0302));
        assert_eq!((frame.objects[0].x, frame.objects[0].y), (300, 400));
    }

    #[test]
    fn test_normal_layout_with_grip() {
        let report = BitWriter::default()
            .put(0, 8)
            .put(2, 4).put(1, 4).put(640, 16).put(1280, 16).put(9, 12).put(5, 12)
            .put(0x0403_0201, 32)
            .finish();
        let frame = ReportDecoder::new(LayoutProgram::normal(1), 10)
            .decode(&report)
            .unwrap();
        let slot = frame.objects[2];
        assert_eq!((slot.x, slot.y, slot.x_width, slot.y_width), (640, 1280, 9, 5));
        assert_eq!(slot.grip.ey_width, 1);
        assert_eq!(slot.grip.xe_ratio, 4);
        assert_eq!(frame.active_mask(), 0b100);
    }

    #[test]
    fn test_short_report_reads_zero() {
        let report = BitWriter::default().put(1, 8).put(0x21, 8).finish();
        let frame = ReportDecoder::new(counted_program(), 10).decode(&report).unwrap();
        assert_eq!(frame.objects[1].status, ObjectStatus::GlovedFinger);
        assert_eq!(frame.objects[1].x, 0);
    }

    #[test]
    fn test_zero_width_field_is_not_stored() {
        let program = LayoutProgram::from_ops(&[
            (OBJECT_N_INDEX, 4),
            (OBJECT_N_CLASSIFICATION, 4),
            (OBJECT_N_INDEX, 0),
            (OBJECT_N_X_POSITION, 16),
            (END, 0),
        ])
        .unwrap();
        let report = BitWriter::default().put(3, 4).put(1, 4).put(77, 16).finish();
        let frame = ReportDecoder::new(program, 10).decode(&report).unwrap();
        assert_eq!(frame.objects[3].x, 77);
        assert_eq!(frame.objects[0].x, 0);
    }

    #[test]
    fn test_empty_program() {
        let decoder = ReportDecoder::new(LayoutProgram::default(), 10);
        assert_eq!(decoder.decode(&[0]), Err(DecodeError::NoProgram));
    }
}
