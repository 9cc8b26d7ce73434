//! Routing of received frames
//!
//! Every complete frame read from the device lands here. Responses go to
//! the pending command, identify reports update the device state and may
//! settle or abort the pending command, and all other reports are routed
//! by code. Touch reports are decoded on the spot and handed back to the
//! caller; nothing is queued.

use crate::command::{lock, CommandChannel, CommandStatus};
use crate::error::DecodeError;
use crate::info::IdentifyInfo;
use crate::message::Frame;
use crate::protocol::{gesture, FirmwareMode, FrameClass, ReportKind};
use crate::recovery::RecoveryRequest;
use crate::report::{ContactChanges, ContactTracker, LayoutProgram, ReportDecoder, TouchFrameResult};
use bitflags::bitflags;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

bitflags! {
    /// Events raised by dispatched reports
    ///
    /// Flags accumulate until the consumer takes them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TriggerReason: u32 {
        const TOUCH = 1 << 0;
        const GESTURE = 1 << 1;
        const FINGERPRINT = 1 << 2;
        const FW_HEALTH = 1 << 3;
        /// Identify report in application mode; nothing to report
        const IGNORE = 1 << 4;
    }
}

/// What a dispatched frame turned into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Idle or busy status, nothing was dispatched
    Ignored,
    /// A response; `delivered` is false if no command was waiting
    Response { delivered: bool },
    Identify(IdentifyInfo),
    Touch {
        frame: TouchFrameResult,
        changes: ContactChanges,
    },
    TouchHold,
    Log,
    /// Report stored by an active report collection
    Collected(u8),
    /// Report dropped, e.g. a touch report while reflashing
    Dropped(u8),
    Report(u8),
}

/// Reports gathered for `collect_reports`
#[derive(Debug)]
struct Collection {
    code: u8,
    wanted: usize,
    reports: Vec<Vec<u8>>,
}

impl Collection {
    fn is_complete(&self) -> bool {
        self.reports.len() >= self.wanted
    }
}

#[derive(Debug)]
struct DispatchState {
    identify: IdentifyInfo,
    identify_count: u32,
    decoder: ReportDecoder,
    trigger: TriggerReason,
    tracker: ContactTracker,
    last_log: Option<Vec<u8>>,
    suspended: bool,
    reflashing: bool,
    collection: Option<Collection>,
}

/// Routes frames to the command channel, the decoder and the recovery
/// worker
pub struct ReportDispatcher {
    channel: Arc<CommandChannel>,
    state: Mutex<DispatchState>,
    collected: Condvar,
    recovery: Mutex<Option<Sender<RecoveryRequest>>>,
}

impl ReportDispatcher {
    pub fn new(channel: Arc<CommandChannel>, decoder: ReportDecoder) -> Self {
        Self {
            channel,
            state: Mutex::new(DispatchState {
                identify: IdentifyInfo::default(),
                identify_count: 0,
                decoder,
                trigger: TriggerReason::empty(),
                tracker: ContactTracker::default(),
                last_log: None,
                suspended: false,
                reflashing: false,
                collection: None,
            }),
            collected: Condvar::new(),
            recovery: Mutex::new(None),
        }
    }

    /// Queue recovery requests to `tx` from now on
    pub fn set_recovery_sender(&self, tx: Sender<RecoveryRequest>) {
        *lock(&self.recovery) = Some(tx);
    }

    /// Stop queueing recovery requests, closing the worker's queue
    pub fn clear_recovery_sender(&self) {
        *lock(&self.recovery) = None;
    }

    /// Route one frame
    pub fn dispatch(&self, frame: Frame) -> Result<DispatchEvent, DecodeError> {
        match frame.class() {
            FrameClass::Ignored(_) | FrameClass::Invalid(_) => Ok(DispatchEvent::Ignored),
            FrameClass::Response(code) => {
                // Trigger bits stay set until take_trigger_reason.
                let delivered = self.channel.deliver_response(code, frame.payload);
                Ok(DispatchEvent::Response { delivered })
            }
            FrameClass::Report(ReportKind::Identify) => Ok(self.dispatch_identify(&frame.payload)),
            FrameClass::Report(kind) => self.dispatch_report(kind, frame.payload),
        }
    }

    fn dispatch_identify(&self, payload: &[u8]) -> DispatchEvent {
        let info = IdentifyInfo::parse(payload);
        log::info!(
            "tcm: received identify report (firmware mode = 0x{:02x})",
            u8::from(info.mode)
        );

        let first = {
            let mut state = lock(&self.state);
            state.identify = info.clone();
            state.identify_count += 1;
            state.tracker.reset();
            state.identify_count == 1
        };

        let resolved = self.channel.resolve_on_identify(payload);
        let expected = matches!(resolved, Some((_, CommandStatus::Idle)));

        match info.mode {
            FirmwareMode::HostDownload => {}
            FirmwareMode::Application => {
                if !first && !expected && !self.channel.reset_in_progress() {
                    self.schedule_recovery(RecoveryRequest::Reidentify);
                }
                lock(&self.state).trigger |= TriggerReason::IGNORE;
            }
            _ => {
                if !self.channel.reset_in_progress() {
                    self.schedule_recovery(RecoveryRequest::RunApplicationFirmware);
                }
            }
        }

        DispatchEvent::Identify(info)
    }

    fn schedule_recovery(&self, request: RecoveryRequest) {
        let recovery = lock(&self.recovery);
        let Some(tx) = recovery.as_ref() else {
            log::debug!("tcm: no recovery worker, not scheduling {:?}", request);
            return;
        };
        if !self.channel.try_schedule_recovery() {
            log::debug!("tcm: recovery already scheduled");
            return;
        }
        if tx.send(request).is_err() {
            log::warn!("tcm: recovery worker has stopped");
            self.channel.recovery_finished();
        }
    }

    fn dispatch_report(&self, kind: ReportKind, payload: Vec<u8>) -> Result<DispatchEvent, DecodeError> {
        let mut state = lock(&self.state);
        match kind {
            ReportKind::Touch => {
                if state.reflashing {
                    log::debug!("tcm: dropping touch report while reflashing");
                    return Ok(DispatchEvent::Dropped(kind.code()));
                }
                let frame = state.decoder.decode(&payload).map_err(|e| {
                    log::error!("tcm: failed to decode touch report: {}", e);
                    e
                })?;
                if state.suspended {
                    state.trigger |= TriggerReason::GESTURE;
                } else {
                    state.trigger |= TriggerReason::TOUCH;
                    if u8::try_from(frame.gesture_code).is_ok_and(gesture::is_touch_hold) {
                        state.trigger |= TriggerReason::FINGERPRINT;
                    }
                }
                let changes = state.tracker.update(&frame);
                Ok(DispatchEvent::Touch { frame, changes })
            }
            ReportKind::TouchHold => {
                state.trigger |= TriggerReason::FINGERPRINT;
                Ok(DispatchEvent::TouchHold)
            }
            ReportKind::Log => {
                state.trigger |= TriggerReason::FW_HEALTH;
                state.last_log = Some(payload);
                Ok(DispatchEvent::Log)
            }
            ReportKind::Identify | ReportKind::Other(_) => {
                let code = kind.code();
                match state.collection.as_mut() {
                    Some(c) if c.code == code && !c.is_complete() => {
                        c.reports.push(payload);
                        if c.is_complete() {
                            self.collected.notify_all();
                        }
                        Ok(DispatchEvent::Collected(code))
                    }
                    _ => {
                        log::debug!("tcm: report 0x{:02x} not requested", code);
                        Ok(DispatchEvent::Report(code))
                    }
                }
            }
        }
    }

    /// Take the accumulated trigger flags, clearing them
    pub fn take_trigger_reason(&self) -> TriggerReason {
        std::mem::take(&mut lock(&self.state).trigger)
    }

    pub fn trigger_reason(&self) -> TriggerReason {
        lock(&self.state).trigger
    }

    /// Identify info from the last identify report or response
    pub fn identify_info(&self) -> IdentifyInfo {
        lock(&self.state).identify.clone()
    }

    /// Number of identify reports dispatched so far
    pub fn identify_count(&self) -> u32 {
        lock(&self.state).identify_count
    }

    /// Record identify info obtained from an identify response
    pub fn set_identify_info(&self, info: IdentifyInfo) {
        lock(&self.state).identify = info;
    }

    pub fn set_suspended(&self, suspended: bool) {
        lock(&self.state).suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }

    pub fn set_reflashing(&self, reflashing: bool) {
        lock(&self.state).reflashing = reflashing;
    }

    pub fn is_reflashing(&self) -> bool {
        lock(&self.state).reflashing
    }

    /// Install the layout program touch reports are decoded with
    pub fn set_program(&self, program: LayoutProgram) {
        let mut state = lock(&self.state);
        let max_objects = state.decoder.max_objects();
        state.decoder = ReportDecoder::new(program, max_objects);
    }

    pub fn program(&self) -> LayoutProgram {
        lock(&self.state).decoder.program().clone()
    }

    /// Payload of the most recent log report
    pub fn last_log_report(&self) -> Option<Vec<u8>> {
        lock(&self.state).last_log.clone()
    }

    /// Bitmask of slots currently down
    pub fn contact_attention(&self) -> u32 {
        lock(&self.state).tracker.attention()
    }

    /// Start gathering `count` reports with `code`
    pub fn begin_collection(&self, code: u8, count: usize) {
        lock(&self.state).collection = Some(Collection {
            code,
            wanted: count,
            reports: Vec::with_capacity(count),
        });
    }

    /// True once the running collection has all its reports
    pub fn collection_complete(&self) -> bool {
        lock(&self.state)
            .collection
            .as_ref()
            .is_some_and(Collection::is_complete)
    }

    /// Wait for the running collection to complete and end it
    ///
    /// Returns `None` on timeout; reports gathered so far are discarded.
    pub fn finish_collection(&self, timeout: Duration) -> Option<Vec<Vec<u8>>> {
        let state = lock(&self.state);
        let (mut state, _) = self
            .collected
            .wait_timeout_while(state, timeout, |s| {
                s.collection.as_ref().is_some_and(|c| !c.is_complete())
            })
            .unwrap_or_else(PoisonError::into_inner);
        match state.collection.take() {
            Some(c) if c.is_complete() => Some(c.reports),
            Some(c) => {
                log::warn!(
                    "tcm: timed out collecting reports ({} of {})",
                    c.reports.len(),
                    c.wanted
                );
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{report, status, Command};
    use crate::report::layout::codes;
    use std::sync::mpsc;
    use std::thread;

    fn identify_payload(mode: u8) -> Vec<u8> {
        let mut p = vec![0x02, mode];
        p.extend_from_slice(b"S3910\0\0\0\0\0\0\0\0\0\0\0");
        p.extend_from_slice(&[1, 0, 0, 0]);
        p.extend_from_slice(&[0x00, 0x01]);
        p
    }

    fn dispatcher() -> (Arc<CommandChannel>, ReportDispatcher) {
        let channel = Arc::new(CommandChannel::new());
        let program = LayoutProgram::from_ops(&[
            (codes::GESTURE_DOUBLE_TAP, 8),
            (codes::FOREACH_ACTIVE_OBJECT, 0),
            (codes::OBJECT_N_INDEX, 4),
            (codes::OBJECT_N_CLASSIFICATION, 4),
            (codes::FOREACH_END, 0),
            (codes::END, 0),
        ])
        .unwrap();
        let d = ReportDispatcher::new(Arc::clone(&channel), ReportDecoder::new(program, 10));
        (channel, d)
    }

    fn touch(payload: &[u8]) -> Frame {
        Frame {
            code: report::TOUCH,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_ignored_frames_do_nothing() {
        let (_, d) = dispatcher();
        let ev = d
            .dispatch(Frame {
                code: status::IDLE,
                payload: vec![],
            })
            .unwrap();
        assert_eq!(ev, DispatchEvent::Ignored);
        assert!(d.trigger_reason().is_empty());
    }

    #[test]
    fn test_touch_report_raises_touch_and_fingerprint() {
        let (_, d) = dispatcher();
        // gesture 0x80, object 1 finger
        let ev = d.dispatch(touch(&[0x80, 0x11])).unwrap();
        match ev {
            DispatchEvent::Touch { frame, changes } => {
                assert_eq!(frame.active_mask(), 0b10);
                assert_eq!(changes.down, 0b10);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            d.take_trigger_reason(),
            TriggerReason::TOUCH | TriggerReason::FINGERPRINT
        );
        assert!(d.take_trigger_reason().is_empty());
    }

    #[test]
    fn test_flags_accumulate_until_taken() {
        let (_, d) = dispatcher();
        d.dispatch(Frame {
            code: report::LOG,
            payload: vec![9, 9],
        })
        .unwrap();
        d.set_suspended(true);
        d.dispatch(touch(&[0x01, 0x00])).unwrap();
        assert_eq!(
            d.take_trigger_reason(),
            TriggerReason::FW_HEALTH | TriggerReason::GESTURE
        );
        assert_eq!(d.last_log_report(), Some(vec![9, 9]));
    }

    #[test]
    fn test_touch_dropped_while_reflashing() {
        let (_, d) = dispatcher();
        d.set_reflashing(true);
        assert_eq!(
            d.dispatch(touch(&[0, 0x11])).unwrap(),
            DispatchEvent::Dropped(report::TOUCH)
        );
        assert!(d.trigger_reason().is_empty());
    }

    #[test]
    fn test_decode_error_leaves_state_usable() {
        let (_, d) = dispatcher();
        // index 12 >= max objects
        let err = d.dispatch(touch(&[0, 0x1C])).unwrap_err();
        assert!(matches!(err, DecodeError::ObjectIndexOutOfRange { index: 12, .. }));
        assert!(d.dispatch(touch(&[0, 0x12])).is_ok());
    }

    #[test]
    fn test_response_goes_to_channel() {
        let (channel, d) = dispatcher();
        let ev = d
            .dispatch(Frame {
                code: status::OK,
                payload: vec![1],
            })
            .unwrap();
        assert_eq!(ev, DispatchEvent::Response { delivered: false });
        assert!(!channel.is_busy());
    }

    #[test]
    fn test_response_keeps_trigger_reason() {
        let (_, d) = dispatcher();
        d.dispatch(touch(&[0x00, 0x11])).unwrap();
        d.dispatch(Frame {
            code: status::OK,
            payload: vec![],
        })
        .unwrap();
        assert_eq!(d.take_trigger_reason(), TriggerReason::TOUCH);
    }

    #[test]
    fn test_identify_schedules_recovery_once() {
        let (channel, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        d.set_recovery_sender(tx);

        let boot = Frame {
            code: report::IDENTIFY,
            payload: identify_payload(FirmwareMode::BOOTLOADER),
        };
        let ev = d.dispatch(boot.clone()).unwrap();
        assert!(matches!(ev, DispatchEvent::Identify(ref i) if i.mode.is_bootloader()));
        d.dispatch(boot).unwrap();

        assert_eq!(rx.try_recv(), Ok(RecoveryRequest::RunApplicationFirmware));
        assert!(rx.try_recv().is_err());
        assert!(channel.recovery_scheduled());
        assert_eq!(d.identify_info().part_number(), "S3910");
    }

    #[test]
    fn test_no_recovery_while_resetting() {
        let (channel, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        d.set_recovery_sender(tx);
        let _reset = channel.lock_reset();
        d.dispatch(Frame {
            code: report::IDENTIFY,
            payload: identify_payload(FirmwareMode::BOOTLOADER),
        })
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unexpected_app_identify_reidentifies() {
        let (_, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        d.set_recovery_sender(tx);
        let app = Frame {
            code: report::IDENTIFY,
            payload: identify_payload(FirmwareMode::APPLICATION),
        };
        d.dispatch(app.clone()).unwrap();
        assert!(rx.try_recv().is_err());
        d.dispatch(app).unwrap();
        assert_eq!(rx.try_recv(), Ok(RecoveryRequest::Reidentify));
        assert!(d.take_trigger_reason().contains(TriggerReason::IGNORE));
    }

    #[test]
    fn test_identify_aborts_pending_command() {
        let (channel, d) = dispatcher();
        let d = Arc::new(d);
        let d2 = Arc::clone(&d);
        let c2 = Arc::clone(&channel);
        let t = thread::spawn(move || {
            while !c2.is_busy() {
                thread::sleep(Duration::from_millis(1));
            }
            d2.dispatch(Frame {
                code: report::IDENTIFY,
                payload: identify_payload(FirmwareMode::APPLICATION),
            })
            .unwrap();
        });
        let err = channel
            .issue(Command::GetDynamicConfig, Duration::from_secs(5), || Ok(()))
            .unwrap_err();
        t.join().unwrap();
        assert!(matches!(err, crate::error::CommandError::Aborted { .. }));
    }

    #[test]
    fn test_collection() {
        let (_, d) = dispatcher();
        d.begin_collection(report::DELTA, 2);
        let delta = Frame {
            code: report::DELTA,
            payload: vec![1, 2],
        };
        assert_eq!(d.dispatch(delta.clone()).unwrap(), DispatchEvent::Collected(report::DELTA));
        d.dispatch(delta.clone()).unwrap();
        assert_eq!(d.dispatch(delta).unwrap(), DispatchEvent::Report(report::DELTA));
        let reports = d.finish_collection(Duration::from_millis(10)).unwrap();
        assert_eq!(reports, vec![vec![1, 2], vec![1, 2]]);

        d.begin_collection(report::RAW, 1);
        assert_eq!(d.finish_collection(Duration::from_millis(10)), None);
    }
}
