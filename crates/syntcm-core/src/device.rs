//! Device facade
//!
//! `TcmDevice` owns the bus and ties the engine together. Commands are
//! written through the codec and answered through the command channel;
//! every frame read goes to the dispatcher. Reads are driven either by a
//! poller thread ([`TcmDevice::spawn_poller`]) or, without one, by the
//! thread waiting on a command.

use crate::bus::{HardwareControl, NoHardwareControl, SpiBus};
use crate::command::{lock, CommandChannel, ResponseTimeout};
use crate::config::TcmConfig;
use crate::dispatch::{DispatchEvent, ReportDispatcher, TriggerReason};
use crate::error::{CommandError, Error, LayoutError, ReflashError, Result};
use crate::info::{AppInfo, BootInfo, IdentifyInfo};
use crate::message::MessageCodec;
use crate::protocol::{app_status, report, Command};
use crate::recovery::{RecoveryRequest, RecoveryWorker};
use crate::reflash::{
    CommandIssuer, FlashGeometry, ReflashProgress, ReflashRegion, ReflashSequencer,
};
use crate::report::{LayoutProgram, ReportDecoder, TouchFrameResult};
use crate::transport::ChunkedTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POWERUP_TO_RESET_MS: u32 = 10;
const RESET_TO_NORMAL_MS: u32 = 80;
const APP_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(10);
const APP_STATUS_POLL_TIMEOUT: Duration = Duration::from_millis(1000);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A touch controller on a bus
pub struct TcmDevice<B, H = NoHardwareControl> {
    codec: Mutex<MessageCodec<B>>,
    hardware: Mutex<H>,
    channel: Arc<CommandChannel>,
    dispatcher: ReportDispatcher,
    config: TcmConfig,
    app_info: Mutex<AppInfo>,
    boot_info: Mutex<BootInfo>,
    /// Program the firmware came up with, captured by `initialize`
    default_program: Mutex<Option<LayoutProgram>>,
    poller_active: AtomicBool,
}

impl<B: SpiBus> TcmDevice<B> {
    /// Device without a reset line
    pub fn new(bus: B, config: TcmConfig) -> Result<Self> {
        Self::with_hardware(bus, NoHardwareControl, config)
    }
}

impl<B: SpiBus, H: HardwareControl> TcmDevice<B, H> {
    pub fn with_hardware(bus: B, hardware: H, config: TcmConfig) -> Result<Self> {
        config.validate()?;

        let transport =
            ChunkedTransport::new(bus, config.read_chunk_size, config.write_chunk_size);
        let codec = MessageCodec::new(transport)
            .with_initial_read_length(config.initial_read_length)
            .with_predictive_reading(config.predictive_reading);
        let channel = Arc::new(CommandChannel::new());
        let decoder = ReportDecoder::new(config.normal_program(), config.max_objects);
        let dispatcher = ReportDispatcher::new(Arc::clone(&channel), decoder);

        Ok(Self {
            codec: Mutex::new(codec),
            hardware: Mutex::new(hardware),
            channel,
            dispatcher,
            config,
            app_info: Mutex::new(AppInfo::default()),
            boot_info: Mutex::new(BootInfo::default()),
            default_program: Mutex::new(None),
            poller_active: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TcmConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &ReportDispatcher {
        &self.dispatcher
    }

    pub fn identify_info(&self) -> IdentifyInfo {
        self.dispatcher.identify_info()
    }

    /// Application info from the last query
    pub fn app_info(&self) -> AppInfo {
        lock(&self.app_info).clone()
    }

    /// Boot info from the last query
    pub fn boot_info(&self) -> BootInfo {
        lock(&self.boot_info).clone()
    }

    pub fn write_chunk_size(&self) -> usize {
        lock(&self.codec).transport().write_chunk_size()
    }

    /// Application firmware is running and reports an OK status
    pub fn app_running(&self) -> bool {
        self.identify_info().mode.is_application()
            && lock(&self.app_info).status == app_status::OK
    }

    /// Read one message and dispatch it
    ///
    /// A read failure fails the pending command right away instead of
    /// letting it run into its timeout.
    pub fn process_next(&self) -> Result<DispatchEvent> {
        let frame = {
            let mut codec = lock(&self.codec);
            let frame = match codec.read_message() {
                Ok(frame) => frame,
                Err(e) => {
                    if let Some(command) = self.channel.abort_pending() {
                        log::error!("tcm: failed to read message, aborting {}", command);
                    }
                    return Err(e);
                }
            };
            if frame.code == report::IDENTIFY {
                let info = IdentifyInfo::parse(&frame.payload);
                codec
                    .transport_mut()
                    .apply_max_write_size(info.max_write_size as usize);
            }
            frame
        };
        Ok(self.dispatcher.dispatch(frame)?)
    }

    fn poll_once(&self) {
        match self.process_next() {
            Ok(DispatchEvent::Ignored) => thread::sleep(IDLE_POLL_INTERVAL),
            Ok(_) => {}
            Err(e) => {
                log::debug!("tcm: poll failed: {}", e);
                thread::sleep(IDLE_POLL_INTERVAL);
            }
        }
    }

    /// Read one message, returning the decoded frame if it was a touch
    /// report
    pub fn decode_next_report(&self) -> Result<Option<TouchFrameResult>> {
        match self.process_next()? {
            DispatchEvent::Touch { frame, .. } => Ok(Some(frame)),
            _ => Ok(None),
        }
    }

    /// Send a command and wait for its response payload
    pub fn issue_command(
        &self,
        command: Command,
        payload: &[u8],
        timeout: ResponseTimeout,
    ) -> Result<Vec<u8>> {
        let timeout = self.config.timeouts.resolve(timeout);
        let send = || lock(&self.codec).write_message(command.opcode(), payload);
        let response = if self.poller_active.load(Ordering::Acquire) {
            self.channel.issue(command, timeout, send)
        } else {
            self.channel
                .issue_polling(command, timeout, send, || self.poll_once())
        }?;
        Ok(response)
    }

    /// Read `len` raw bytes, header included
    pub fn read_raw(&self, len: usize) -> Result<Vec<u8>> {
        lock(&self.codec).read_raw(len)
    }

    /// Write a command byte and data without a length field; no response
    /// is awaited
    pub fn write_raw(&self, command: u8, data: &[u8]) -> Result<()> {
        lock(&self.codec).write_raw(command, data)?;
        Ok(())
    }

    /// Identify the device and refresh the info block for its mode
    pub fn identify(&self) -> Result<IdentifyInfo> {
        let response = self.issue_command(Command::Identify, &[], ResponseTimeout::Default)?;
        let info = self.record_identify(&response);
        self.refresh_info(&info)?;
        Ok(info)
    }

    fn record_identify(&self, payload: &[u8]) -> IdentifyInfo {
        let info = IdentifyInfo::parse(payload);
        lock(&self.codec)
            .transport_mut()
            .apply_max_write_size(info.max_write_size as usize);
        log::info!(
            "tcm: {} in mode 0x{:02x}, build {}",
            info.part_number(),
            u8::from(info.mode),
            info.build_id
        );
        self.dispatcher.set_identify_info(info.clone());
        info
    }

    fn refresh_info(&self, info: &IdentifyInfo) -> Result<()> {
        if info.mode.is_application() {
            self.get_app_info()?;
        } else {
            self.get_boot_info()?;
        }
        Ok(())
    }

    /// Query application info, waiting out a booting or updating firmware
    pub fn get_app_info(&self) -> Result<AppInfo> {
        let start = Instant::now();
        loop {
            let response =
                self.issue_command(Command::GetApplicationInfo, &[], ResponseTimeout::Default)?;
            let info = AppInfo::parse(&response);
            *lock(&self.app_info) = info.clone();

            if !info.is_settling() {
                return Ok(info);
            }
            if start.elapsed() >= APP_STATUS_POLL_TIMEOUT {
                log::warn!(
                    "tcm: application firmware still settling (status 0x{:04x})",
                    info.status
                );
                return Ok(info);
            }
            thread::sleep(APP_STATUS_POLL_INTERVAL);
        }
    }

    pub fn get_boot_info(&self) -> Result<BootInfo> {
        let response = self.issue_command(Command::GetBootInfo, &[], ResponseTimeout::Default)?;
        let info = BootInfo::parse(&response);
        *lock(&self.boot_info) = info.clone();
        Ok(info)
    }

    /// Identify, make sure application firmware runs, capture the device's
    /// default touch report program and install the normal one
    pub fn initialize(&self) -> Result<IdentifyInfo> {
        let mut info = self.identify()?;
        if !info.mode.is_application() {
            info = self.run_application_firmware()?;
        }
        if self.app_running() {
            match self.get_touch_report_config() {
                Ok(program) => {
                    self.dispatcher.set_program(program.clone());
                    *lock(&self.default_program) = Some(program);
                }
                Err(e) => log::warn!("tcm: failed to read default touch report config: {}", e),
            }
            self.set_input_reporting(false)?;
        }
        Ok(info)
    }

    /// Reset the device and bring it back to application firmware
    ///
    /// Uses the reset line if there is one, the reset command otherwise.
    pub fn reset(&self) -> Result<IdentifyInfo> {
        let _reset = self.channel.lock_reset();

        let has_line = lock(&self.hardware).has_reset();
        let info = if has_line {
            self.hardware_reset()?
        } else {
            let response = self.issue_command(Command::Reset, &[], ResponseTimeout::Default)?;
            self.record_identify(&response)
        };
        self.refresh_info(&info)?;

        if info.mode.is_application() {
            Ok(info)
        } else {
            self.run_application_locked()
        }
    }

    fn hardware_reset(&self) -> Result<IdentifyInfo> {
        let seen = self.dispatcher.identify_count();
        {
            let mut hw = lock(&self.hardware);
            hw.set_reset(true);
            hw.delay_ms(POWERUP_TO_RESET_MS);
            hw.set_reset(false);
            hw.delay_ms(RESET_TO_NORMAL_MS);
        }
        self.wait_for_identify(seen)
    }

    fn wait_for_identify(&self, seen: u32) -> Result<IdentifyInfo> {
        let deadline = Instant::now() + self.config.timeouts.resolve(ResponseTimeout::Default);
        loop {
            if self.dispatcher.identify_count() != seen {
                return Ok(self.dispatcher.identify_info());
            }
            if Instant::now() >= deadline {
                log::error!("tcm: no identify report after reset");
                return Err(CommandError::Timeout {
                    command: Command::Reset,
                }
                .into());
            }
            if self.poller_active.load(Ordering::Acquire) {
                thread::sleep(IDLE_POLL_INTERVAL);
            } else {
                self.poll_once();
            }
        }
    }

    pub fn run_application_firmware(&self) -> Result<IdentifyInfo> {
        let _reset = self.channel.lock_reset();
        self.run_application_locked()
    }

    pub fn run_bootloader_firmware(&self) -> Result<IdentifyInfo> {
        let _reset = self.channel.lock_reset();
        self.run_bootloader_locked()
    }

    fn run_firmware_locked(&self, command: Command) -> Result<IdentifyInfo> {
        let response = self.issue_command(command, &[], ResponseTimeout::Default)?;
        let info = self.record_identify(&response);
        self.refresh_info(&info)?;
        Ok(info)
    }

    fn run_application_locked(&self) -> Result<IdentifyInfo> {
        for attempt in 1..=2 {
            let info = self.run_firmware_locked(Command::RunApplicationFirmware)?;
            if info.mode.is_application() {
                let status = lock(&self.app_info).status;
                if status != app_status::OK {
                    log::warn!("tcm: application firmware status 0x{:04x}", status);
                }
                return Ok(info);
            }
            log::warn!(
                "tcm: still in mode 0x{:02x} after run-application attempt {} (boot status 0x{:02x})",
                u8::from(info.mode),
                attempt,
                lock(&self.boot_info).status
            );
        }
        Err(CommandError::UnexpectedResponse {
            command: Command::RunApplicationFirmware,
            reason: "device did not enter application firmware",
        }
        .into())
    }

    fn run_bootloader_locked(&self) -> Result<IdentifyInfo> {
        let info = self.run_firmware_locked(Command::RunBootloaderFirmware)?;
        if info.mode.is_application() {
            return Err(CommandError::UnexpectedResponse {
                command: Command::RunBootloaderFirmware,
                reason: "device stayed in application firmware",
            }
            .into());
        }
        Ok(info)
    }

    pub fn get_dynamic_config(&self, id: u8) -> Result<u16> {
        let response =
            self.issue_command(Command::GetDynamicConfig, &[id], ResponseTimeout::Short)?;
        match response.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(CommandError::UnexpectedResponse {
                command: Command::GetDynamicConfig,
                reason: "response shorter than 2 bytes",
            }
            .into()),
        }
    }

    pub fn set_dynamic_config(&self, id: u8, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.issue_command(Command::SetDynamicConfig, &[id, lo, hi], ResponseTimeout::Short)?;
        log::debug!("tcm: dynamic config 0x{:02x} = 0x{:04x}", id, value);
        Ok(())
    }

    pub fn enable_report(&self, code: u8, enable: bool) -> Result<()> {
        let command = if enable {
            Command::EnableReport
        } else {
            Command::DisableReport
        };
        self.issue_command(command, &[code], ResponseTimeout::Default)?;
        Ok(())
    }

    /// Enter or leave deep sleep
    pub fn sleep(&self, enter: bool) -> Result<()> {
        let command = if enter {
            Command::EnterDeepSleep
        } else {
            Command::ExitDeepSleep
        };
        self.issue_command(command, &[], ResponseTimeout::Default)?;
        Ok(())
    }

    /// Run one production test item and return its result data
    pub fn production_test(&self, item: u8) -> Result<Vec<u8>> {
        if !self.app_running() {
            return Err(CommandError::NotInApplication {
                command: Command::ProductionTest,
            }
            .into());
        }
        self.issue_command(Command::ProductionTest, &[item], ResponseTimeout::Long)
    }

    /// Read the active touch report program from the device
    pub fn get_touch_report_config(&self) -> Result<LayoutProgram> {
        let response =
            self.issue_command(Command::GetTouchReportConfig, &[], ResponseTimeout::Default)?;
        Ok(LayoutProgram::parse_device_config(&response)?)
    }

    /// Write a touch report program, zero-padded to the size the firmware
    /// expects
    pub fn set_touch_report_config(&self, program: &LayoutProgram) -> Result<()> {
        let mut bytes = program.to_bytes();
        let max = lock(&self.app_info).max_touch_report_config_size as usize;
        if bytes.len() > max {
            return Err(LayoutError::TooLarge {
                size: bytes.len(),
                max,
            }
            .into());
        }
        bytes.resize(max, 0);
        self.issue_command(Command::SetTouchReportConfig, &bytes, ResponseTimeout::Default)?;
        Ok(())
    }

    /// Install the normal or gesture report program and decode with what
    /// the device then reports as active
    ///
    /// Does nothing unless application firmware is running. If the program
    /// cannot be written, decoding falls back to the default program and
    /// the write error is returned.
    pub fn set_input_reporting(&self, gesture: bool) -> Result<()> {
        if !self.app_running() {
            log::info!("tcm: application firmware not running, leaving report config");
            return Ok(());
        }

        let program = if gesture {
            self.config.gesture_program()
        } else {
            self.config.normal_program()
        };

        if let Err(e) = self.set_touch_report_config(&program) {
            log::error!("tcm: failed to set touch report config: {}", e);
            match lock(&self.default_program).clone() {
                Some(default) => self.dispatcher.set_program(default),
                None => log::warn!("tcm: no default touch report config to fall back to"),
            }
            return Err(e);
        }

        match self.get_touch_report_config() {
            Ok(active) => self.dispatcher.set_program(active),
            Err(e) => {
                log::warn!("tcm: failed to read back touch report config: {}", e);
                self.dispatcher.set_program(program);
            }
        }
        Ok(())
    }

    /// Switch to low-power gesture detection
    pub fn enter_gesture_mode(&self) -> Result<()> {
        let ids = &self.config.dynamic_config;
        self.sleep(false)?;
        self.set_input_reporting(true)?;
        self.set_dynamic_config(ids.gesture_mode, 1)?;
        self.set_dynamic_config(ids.gesture_mask, self.config.gesture_mask)?;
        self.enable_report(report::LOG, false)
    }

    /// Return to normal touch reporting
    pub fn enter_normal_mode(&self) -> Result<()> {
        self.set_input_reporting(false)?;
        self.set_dynamic_config(self.config.dynamic_config.gesture_mode, 0)?;
        self.enable_report(report::LOG, true)
    }

    /// Enable the configured gesture mask, or clear it
    pub fn set_gesture_mask(&self, enable: bool) -> Result<()> {
        let mask = if enable { self.config.gesture_mask } else { 0 };
        self.set_dynamic_config(self.config.dynamic_config.gesture_mask, mask)
    }

    /// Enable or disable touch-and-hold (fingerprint) detection
    pub fn enable_fingerprint(&self, enable: bool) -> Result<()> {
        let value = match (enable, self.dispatcher.is_suspended()) {
            (false, _) => 0,
            (true, true) => 1,
            (true, false) => 2,
        };
        self.set_dynamic_config(self.config.dynamic_config.touch_hold, value)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.dispatcher.set_suspended(suspended);
    }

    /// Take the accumulated trigger flags, clearing them
    pub fn take_trigger_reason(&self) -> TriggerReason {
        self.dispatcher.take_trigger_reason()
    }

    pub fn last_log_report(&self) -> Option<Vec<u8>> {
        self.dispatcher.last_log_report()
    }

    /// Enable report `code`, gather `count` of them and disable it again
    pub fn collect_reports(&self, code: u8, count: usize) -> Result<Vec<Vec<u8>>> {
        self.dispatcher.begin_collection(code, count);
        if let Err(e) = self.enable_report(code, true) {
            self.dispatcher.finish_collection(Duration::ZERO);
            return Err(e);
        }

        let wait = self
            .config
            .timeouts
            .report()
            .saturating_mul(u32::try_from(count).unwrap_or(u32::MAX));
        let reports = if self.poller_active.load(Ordering::Acquire) {
            self.dispatcher.finish_collection(wait)
        } else {
            let deadline = Instant::now() + wait;
            while !self.dispatcher.collection_complete() && Instant::now() < deadline {
                self.poll_once();
            }
            self.dispatcher.finish_collection(Duration::ZERO)
        };

        if let Err(e) = self.enable_report(code, false) {
            log::warn!("tcm: failed to disable report 0x{:02x}: {}", code, e);
        }
        reports.ok_or_else(|| {
            CommandError::Timeout {
                command: Command::EnableReport,
            }
            .into()
        })
    }

    /// Rewrite flash regions from the bootloader and return to application
    /// firmware
    pub fn reflash(
        &self,
        regions: &[ReflashRegion],
        progress: &mut dyn ReflashProgress,
    ) -> Result<()> {
        let info = self.identify()?;
        let _reset = self.channel.lock_reset();

        let info = if info.mode.is_application() {
            log::info!("tcm: switching to bootloader");
            match self.run_bootloader_locked() {
                Err(Error::Command(CommandError::UnexpectedResponse { .. })) => {
                    return Err(ReflashError::NotInBootloader.into())
                }
                other => other?,
            }
        } else {
            info
        };
        if !info.mode.is_bootloader() {
            return Err(ReflashError::NotInBootloader.into());
        }

        let geometry = FlashGeometry::from_boot_info(&self.boot_info())?;
        let write_chunk = self.write_chunk_size();

        self.dispatcher.set_reflashing(true);
        let result = self.flash_regions(geometry, write_chunk, regions, progress);
        self.dispatcher.set_reflashing(false);
        result?;

        log::info!("tcm: returning to application firmware");
        match self.run_application_locked() {
            Err(Error::Command(CommandError::UnexpectedResponse { .. })) => {
                return Err(ReflashError::NotInApplication.into())
            }
            other => other?,
        };
        progress.complete();
        Ok(())
    }

    fn flash_regions(
        &self,
        geometry: FlashGeometry,
        write_chunk: usize,
        regions: &[ReflashRegion],
        progress: &mut dyn ReflashProgress,
    ) -> Result<()> {
        let sequencer = ReflashSequencer::new(self, geometry, write_chunk)?;
        for region in regions {
            sequencer.flash_region(region, progress)?;
        }
        Ok(())
    }

    fn recover(&self, request: RecoveryRequest) -> Result<()> {
        match request {
            RecoveryRequest::RunApplicationFirmware => {
                self.run_application_firmware()?;
            }
            RecoveryRequest::Reidentify => {
                self.identify()?;
            }
        }
        // a reset drops the report program that was installed
        self.set_input_reporting(self.dispatcher.is_suspended())
    }

    /// Stop queueing recovery work; a running worker exits once its queue
    /// drains
    pub fn stop_recovery(&self) {
        self.dispatcher.clear_recovery_sender();
    }
}

impl<B: SpiBus, H: HardwareControl> CommandIssuer for TcmDevice<B, H> {
    fn issue_command(
        &self,
        command: Command,
        payload: &[u8],
        timeout: ResponseTimeout,
    ) -> Result<Vec<u8>> {
        TcmDevice::issue_command(self, command, payload, timeout)
    }
}

/// Handle to a running poller thread
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the poller and wait for it to exit
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            log::error!("tcm: poller thread panicked");
        }
    }
}

impl<B, H> TcmDevice<B, H>
where
    B: SpiBus + 'static,
    H: HardwareControl + 'static,
{
    /// Read and dispatch frames on a dedicated thread until stopped
    ///
    /// Every event other than an idle read is passed to `on_event`. While
    /// the poller runs, commands wait for the poller to deliver their
    /// response.
    pub fn spawn_poller<F>(self: &Arc<Self>, mut on_event: F) -> Result<PollerHandle>
    where
        F: FnMut(DispatchEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let device = Arc::clone(self);

        self.poller_active.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("tcm-poller".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    match device.process_next() {
                        Ok(DispatchEvent::Ignored) => thread::sleep(IDLE_POLL_INTERVAL),
                        Ok(event) => on_event(event),
                        Err(e) => {
                            log::warn!("tcm: {}", e);
                            thread::sleep(IDLE_POLL_INTERVAL);
                        }
                    }
                }
                device.poller_active.store(false, Ordering::Release);
            });

        match spawned {
            Ok(handle) => Ok(PollerHandle { stop, handle }),
            Err(source) => {
                self.poller_active.store(false, Ordering::Release);
                Err(Error::Thread {
                    name: "poller",
                    source,
                })
            }
        }
    }

    /// Start the worker that handles unexpected identify reports
    pub fn start_recovery(self: &Arc<Self>) -> Result<RecoveryWorker> {
        let weak = Arc::downgrade(self);
        let (tx, worker) = RecoveryWorker::spawn(Arc::clone(&self.channel), move |request| {
            match weak.upgrade() {
                Some(device) => device.recover(request),
                None => Ok(()),
            }
        })
        .map_err(|source| Error::Thread {
            name: "recovery",
            source,
        })?;
        self.dispatcher.set_recovery_sender(tx);
        Ok(worker)
    }
}
