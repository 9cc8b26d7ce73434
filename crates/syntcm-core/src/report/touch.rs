//! Decoded touch data

use crate::protocol::gesture;

/// Object classification reported per slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectStatus {
    #[default]
    Lift,
    Finger,
    GlovedFinger,
    Other(u32),
}

impl From<u32> for ObjectStatus {
    fn from(v: u32) -> Self {
        match v {
            0 => ObjectStatus::Lift,
            1 => ObjectStatus::Finger,
            2 => ObjectStatus::GlovedFinger,
            other => ObjectStatus::Other(other),
        }
    }
}

/// Grip suppression metrics, one byte each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GripMetrics {
    pub ey_width: u8,
    pub ex_width: u8,
    pub ye_ratio: u8,
    pub xe_ratio: u8,
}

impl GripMetrics {
    pub fn from_le(value: u32) -> Self {
        let [ey_width, ex_width, ye_ratio, xe_ratio] = value.to_le_bytes();
        Self {
            ey_width,
            ex_width,
            ye_ratio,
            xe_ratio,
        }
    }
}

/// One touch contact slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectSlot {
    pub status: ObjectStatus,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub x_width: u32,
    pub y_width: u32,
    pub tx_pos: u32,
    pub rx_pos: u32,
    pub grip: GripMetrics,
}

impl ObjectSlot {
    pub fn is_active(&self) -> bool {
        self.status != ObjectStatus::Lift
    }
}

/// Firmware health values carried in touch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthCounters {
    pub power_im: u32,
    pub cid_im: u32,
    pub rail_im: u32,
    pub cid_variance_im: u32,
    pub nsm_frequency: u32,
    pub nsm_state: u32,
    pub cpu_cycles: u32,
}

/// Everything decoded from one touch report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TouchFrameResult {
    pub timestamp: u32,
    /// One slot per possible object, indexed by object index
    pub objects: Vec<ObjectSlot>,
    /// Object count field, if the layout has one
    pub num_active_objects: Option<u32>,
    pub buttons_state: u32,
    pub gesture_code: u32,
    /// Raw gesture info field
    pub gesture_info: Vec<u8>,
    /// Raw gesture coordinate field
    pub gesture_coordinates: Vec<u8>,
    pub frame_rate: u32,
    pub health: HealthCounters,
}

/// A reported contact position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchPoint {
    pub slot: usize,
    pub x: u32,
    pub y: u32,
    pub touch_major: u32,
    pub width_major: u32,
    pub grip: GripMetrics,
}

/// Under-display fingerprint event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintEvent {
    Down { x: u16, y: u16, area_rate: u16 },
    Up,
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([
        bytes.get(at).copied().unwrap_or(0),
        bytes.get(at + 1).copied().unwrap_or(0),
    ])
}

impl TouchFrameResult {
    pub fn new(max_objects: usize) -> Self {
        Self {
            objects: vec![ObjectSlot::default(); max_objects],
            ..Default::default()
        }
    }

    /// Bit `n` set for every slot `n` that is not lifted
    pub fn active_mask(&self) -> u32 {
        self.objects
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, o)| o.is_active())
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    pub fn active_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_active()).count()
    }

    pub fn touch_points(&self) -> Vec<TouchPoint> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_active())
            .map(|(slot, o)| TouchPoint {
                slot,
                x: o.x,
                y: o.y,
                touch_major: o.x_width.max(o.y_width),
                width_major: o.x_width.min(o.y_width),
                grip: o.grip,
            })
            .collect()
    }

    pub fn gesture_name(&self) -> &'static str {
        u8::try_from(self.gesture_code)
            .map(gesture::name)
            .unwrap_or("unknown")
    }

    pub fn is_touch_hold(&self) -> bool {
        u8::try_from(self.gesture_code).is_ok_and(gesture::is_touch_hold)
    }

    /// Gesture trace points: start, end, then up to four corner points
    pub fn gesture_points(&self) -> Vec<(u16, u16)> {
        self.gesture_coordinates
            .chunks_exact(4)
            .map(|c| (le16(c, 0), le16(c, 2)))
            .collect()
    }

    /// Fingerprint state from a touch-hold gesture
    pub fn fingerprint(&self) -> Option<FingerprintEvent> {
        match u8::try_from(self.gesture_code).ok()? {
            gesture::TOUCH_HOLD_DOWN if self.gesture_info.len() >= 6 => Some(FingerprintEvent::Down {
                x: le16(&self.gesture_info, 0),
                y: le16(&self.gesture_info, 2),
                area_rate: le16(&self.gesture_info, 4),
            }),
            gesture::TOUCH_HOLD_UP => Some(FingerprintEvent::Up),
            _ => None,
        }
    }
}

/// Contact state carried across reports
///
/// A slot is attended from the first report where it is down until the
/// first report where it has lifted; that report yields its lift.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactTracker {
    attention: u32,
}

/// Changes between two consecutive reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContactChanges {
    pub down: u32,
    pub lifted: u32,
    pub attention: u32,
}

impl ContactTracker {
    pub fn update(&mut self, frame: &TouchFrameResult) -> ContactChanges {
        let active = frame.active_mask();
        let changes = ContactChanges {
            down: active & !self.attention,
            lifted: self.attention & !active,
            attention: active,
        };
        self.attention = active;
        changes
    }

    pub fn attention(&self) -> u32 {
        self.attention
    }

    pub fn reset(&mut self) {
        self.attention = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(slots: &[(usize, u32, u32)]) -> TouchFrameResult {
        let mut f = TouchFrameResult::new(10);
        for &(i, x, y) in slots {
            f.objects[i] = ObjectSlot {
                status: ObjectStatus::Finger,
                x,
                y,
                x_width: 3,
                y_width: 7,
                ..Default::default()
            };
        }
        f
    }

    #[test]
    fn test_active_mask_and_points() {
        let f = frame_with(&[(0, 10, 20), (3, 30, 40)]);
        assert_eq!(f.active_mask(), 0b1001);
        assert_eq!(f.active_count(), 2);
        let points = f.touch_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].slot, 3);
        assert_eq!((points[1].x, points[1].y), (30, 40));
        assert_eq!(points[0].touch_major, 7);
        assert_eq!(points[0].width_major, 3);
    }

    #[test]
    fn test_contact_tracker() {
        let mut t = ContactTracker::default();
        let c = t.update(&frame_with(&[(0, 1, 1), (2, 1, 1)]));
        assert_eq!((c.down, c.lifted), (0b101, 0));
        let c = t.update(&frame_with(&[(2, 1, 1)]));
        assert_eq!((c.down, c.lifted), (0, 0b001));
        assert_eq!(t.attention(), 0b100);
        let c = t.update(&frame_with(&[]));
        assert_eq!(c.lifted, 0b100);
        assert_eq!(t.attention(), 0);
    }

    #[test]
    fn test_fingerprint_from_gesture_info() {
        let mut f = TouchFrameResult::new(1);
        f.gesture_code = gesture::TOUCH_HOLD_DOWN as u32;
        f.gesture_info = vec![0x20, 0x01, 0x40, 0x02, 0x32, 0x00];
        assert!(f.is_touch_hold());
        assert_eq!(
            f.fingerprint(),
            Some(FingerprintEvent::Down {
                x: 0x120,
                y: 0x240,
                area_rate: 0x32
            })
        );
        f.gesture_code = gesture::TOUCH_HOLD_UP as u32;
        assert_eq!(f.fingerprint(), Some(FingerprintEvent::Up));
        f.gesture_code = gesture::DOUBLE_TAP as u32;
        assert_eq!(f.fingerprint(), None);
        assert_eq!(f.gesture_name(), "double-tap");
    }

    #[test]
    fn test_gesture_points() {
        let mut f = TouchFrameResult::new(1);
        f.gesture_coordinates = vec![1, 0, 2, 0, 0x10, 0x01, 0x20, 0x02];
        assert_eq!(f.gesture_points(), vec![(1, 2), (0x110, 0x220)]);
    }

    #[test]
    fn test_grip_metrics_byte_order() {
        let g = GripMetrics::from_le(0x0403_0201);
        assert_eq!((g.ey_width, g.ex_width, g.ye_ratio, g.xe_ratio), (1, 2, 3, 4));
    }
}
