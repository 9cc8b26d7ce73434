//! syntcm-dummy - Emulated TouchComm controller for testing
//!
//! This crate provides an in-memory touch controller that speaks the
//! TouchComm protocol over the [`SpiBus`] capability: it reassembles
//! chunked command writes, answers commands, streams responses and
//! reports back in continued-read chunks and keeps an emulated flash
//! array for reflash. It's useful for testing and for running the CLI
//! without hardware.
//!
//! A [`DummyController`] is a cheap handle; clones share one emulated
//! device, so a test can keep a handle to inject reports and inspect state
//! while the engine owns another.

pub mod report;

pub use report::{encode_touch_report, TouchContact, TouchInput};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syntcm_core::error::TransportError;
use syntcm_core::protocol::{opcodes, report as codes, status, Command, FirmwareMode};
use syntcm_core::protocol::{MESSAGE_MARKER, MESSAGE_PADDING};
use syntcm_core::report::LayoutProgram;
use syntcm_core::{HardwareControl, SpiBus};

/// Configuration for the emulated controller
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Part number reported by identify
    pub part_number: String,
    pub build_id: u32,
    /// Largest write transfer accepted; longer writes fail
    pub max_write_size: u16,
    /// Mode the controller comes up in after a reset
    pub boot_mode: FirmwareMode,
    pub write_block_size_words: u8,
    pub erase_page_size_words: u16,
    pub max_write_payload_size: u16,
    /// Flash size in bytes
    pub flash_size: usize,
    pub max_touch_report_config_size: u16,
    pub max_x: u16,
    pub max_y: u16,
    pub max_objects: u16,
    pub image_rows: u16,
    pub image_cols: u16,
    /// Image reports queued each time a delta or raw report is enabled
    pub image_burst: usize,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            part_number: "s3910".to_string(),
            build_id: 0x0031_0042,
            max_write_size: 256,
            boot_mode: FirmwareMode::Application,
            write_block_size_words: 8,
            erase_page_size_words: 2048,
            max_write_payload_size: 1024,
            flash_size: 128 * 1024,
            max_touch_report_config_size: 64,
            max_x: 1079,
            max_y: 2399,
            max_objects: 10,
            image_rows: 4,
            image_cols: 3,
            image_burst: 3,
        }
    }
}

impl DummyConfig {
    fn write_block_size(&self) -> usize {
        self.write_block_size_words as usize * 2
    }

    fn page_size(&self) -> usize {
        self.erase_page_size_words as usize * 2
    }
}

/// A command being assembled from write chunks
struct Incoming {
    opcode: u8,
    data: Vec<u8>,
}

struct State {
    config: DummyConfig,
    mode: FirmwareMode,
    app_status: u16,
    outgoing: VecDeque<Vec<u8>>,
    streaming: Option<(Vec<u8>, usize)>,
    incoming: Option<Incoming>,
    flash: Vec<u8>,
    dynamic_config: BTreeMap<u8, u16>,
    report_config: Vec<u8>,
    enabled_reports: BTreeSet<u8>,
    asleep: bool,
    held_in_reset: bool,
    silent: bool,
    corrupt_next_marker: bool,
    stuck_in_bootloader: bool,
    commands: Vec<(u8, Vec<u8>)>,
    write_lens: Vec<usize>,
}

/// Emulated touch controller
#[derive(Clone)]
pub struct DummyController {
    state: Arc<Mutex<State>>,
}

impl DummyController {
    /// Create a running controller
    ///
    /// The power-up identify report is taken as already consumed; later
    /// resets queue one.
    pub fn new(config: DummyConfig) -> Self {
        let flash = vec![0xFF; config.flash_size];
        let mode = config.boot_mode;
        let mut state = State {
            config,
            mode,
            app_status: 0,
            outgoing: VecDeque::new(),
            streaming: None,
            incoming: None,
            flash,
            dynamic_config: BTreeMap::new(),
            report_config: Vec::new(),
            enabled_reports: BTreeSet::new(),
            asleep: false,
            held_in_reset: false,
            silent: false,
            corrupt_next_marker: false,
            stuck_in_bootloader: false,
            commands: Vec::new(),
            write_lens: Vec::new(),
        };
        state.restart(mode);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a controller with the default configuration
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a report frame as if the firmware had raised it
    pub fn inject_report(&self, code: u8, payload: &[u8]) {
        self.state().queue(code, payload);
    }

    /// Queue a touch report encoded with the active report program
    pub fn inject_touch(&self, input: &TouchInput) {
        let mut state = self.state();
        let program = state.active_program();
        let payload =
            encode_touch_report(&program, input, state.config.max_objects as usize);
        state.queue(codes::TOUCH, &payload);
    }

    /// Reset on the controller's own initiative, coming up in `mode`
    pub fn trigger_reset(&self, mode: FirmwareMode) {
        self.state().reboot(mode);
    }

    /// Stop answering commands
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Send the next message with a broken header marker
    pub fn corrupt_next_marker(&self) {
        self.state().corrupt_next_marker = true;
    }

    /// Refuse to leave the bootloader, as with a missing or bad image
    pub fn set_stuck_in_bootloader(&self, stuck: bool) {
        self.state().stuck_in_bootloader = stuck;
    }

    pub fn set_app_status(&self, app_status: u16) {
        self.state().app_status = app_status;
    }

    pub fn mode(&self) -> FirmwareMode {
        self.state().mode
    }

    pub fn flash(&self) -> Vec<u8> {
        self.state().flash.clone()
    }

    /// Every command received, as `(opcode, payload)`
    pub fn commands(&self) -> Vec<(u8, Vec<u8>)> {
        self.state().commands.clone()
    }

    /// Length of every physical write received
    pub fn write_lens(&self) -> Vec<usize> {
        self.state().write_lens.clone()
    }

    pub fn dynamic_config(&self, id: u8) -> Option<u16> {
        self.state().dynamic_config.get(&id).copied()
    }

    /// Stored touch report program, padded as the firmware keeps it
    pub fn report_config(&self) -> Vec<u8> {
        self.state().report_config.clone()
    }

    pub fn report_enabled(&self, code: u8) -> bool {
        self.state().enabled_reports.contains(&code)
    }

    pub fn is_asleep(&self) -> bool {
        self.state().asleep
    }
}

impl State {
    fn queue(&mut self, code: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(MESSAGE_MARKER);
        frame.push(code);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.push(MESSAGE_PADDING);
        self.outgoing.push_back(frame);
    }

    fn ok(&mut self, payload: &[u8]) {
        self.queue(status::OK, payload);
    }

    fn error(&mut self, code: u8) {
        self.queue(status::ERROR, &[code]);
    }

    fn reboot(&mut self, mode: FirmwareMode) {
        log::debug!("dummy: reset into mode 0x{:02x}", u8::from(mode));
        self.restart(mode);
        let identify = self.identify_payload();
        self.queue(codes::IDENTIFY, &identify);
    }

    fn restart(&mut self, mode: FirmwareMode) {
        self.mode = mode;
        self.outgoing.clear();
        self.streaming = None;
        self.incoming = None;
        self.asleep = false;
        self.enabled_reports.clear();
        self.dynamic_config.clear();
        self.report_config = LayoutProgram::normal(1).to_bytes();
        self.report_config
            .resize(self.config.max_touch_report_config_size as usize, 0);
    }

    fn active_program(&self) -> LayoutProgram {
        LayoutProgram::parse_device_config(&self.report_config)
            .unwrap_or_else(|_| LayoutProgram::normal(1))
    }

    fn identify_payload(&self) -> Vec<u8> {
        let mut p = vec![0x02, u8::from(self.mode)];
        let mut part = [0u8; 16];
        let name = self.config.part_number.as_bytes();
        let n = name.len().min(16);
        part[..n].copy_from_slice(&name[..n]);
        p.extend_from_slice(&part);
        p.extend_from_slice(&self.config.build_id.to_le_bytes());
        p.extend_from_slice(&self.config.max_write_size.to_le_bytes());
        p
    }

    fn app_info_payload(&self) -> Vec<u8> {
        let c = &self.config;
        let mut p = Vec::with_capacity(46);
        for v in [
            1u16,
            self.app_status,
            0,
            0,
            0,
            0,
            c.max_touch_report_config_size,
            256,
        ] {
            p.extend_from_slice(&v.to_le_bytes());
        }
        let mut id = [0u8; 16];
        id[..6].copy_from_slice(b"dummy0");
        p.extend_from_slice(&id);
        for v in [c.max_x, c.max_y, c.max_objects, 0, c.image_rows, c.image_cols, 0] {
            p.extend_from_slice(&v.to_le_bytes());
        }
        p
    }

    fn boot_info_payload(&self) -> Vec<u8> {
        let c = &self.config;
        let mut p = vec![0x01, 0x00, 0x10, 0x39, c.write_block_size_words];
        p.extend_from_slice(&c.erase_page_size_words.to_le_bytes());
        p.extend_from_slice(&c.max_write_payload_size.to_le_bytes());
        p.extend_from_slice(&[0x00, 0x00, 0x00]);
        p
    }

    fn receive(&mut self, data: &[u8]) {
        let (lead, rest) = match data.split_first() {
            Some(split) => split,
            None => return,
        };
        match (&mut self.incoming, *lead) {
            (Some(incoming), opcodes::CONTINUE_WRITE) => incoming.data.extend_from_slice(rest),
            _ => {
                self.incoming = Some(Incoming {
                    opcode: *lead,
                    data: rest.to_vec(),
                })
            }
        }

        let complete = match &self.incoming {
            Some(i) if i.data.len() >= 2 => {
                let len = u16::from_le_bytes([i.data[0], i.data[1]]) as usize;
                i.data.len() >= len + 2
            }
            _ => false,
        };
        if complete {
            if let Some(mut i) = self.incoming.take() {
                let len = u16::from_le_bytes([i.data[0], i.data[1]]) as usize;
                i.data.truncate(len + 2);
                self.execute(i.opcode, &i.data[2..]);
            }
        }
    }

    fn execute(&mut self, opcode: u8, payload: &[u8]) {
        self.commands.push((opcode, payload.to_vec()));
        if self.silent {
            return;
        }

        let command = Command::from(opcode);
        log::debug!("dummy: {} ({} bytes)", command, payload.len());
        if self.asleep && !matches!(command, Command::ExitDeepSleep | Command::Reset) {
            return self.error(status::NOT_EXECUTED_IN_DEEP_SLEEP);
        }
        let app = self.mode.is_application();
        let boot = self.mode.is_bootloader();

        match command {
            Command::Identify => {
                let p = self.identify_payload();
                self.ok(&p);
            }
            Command::Reset => {
                let mode = self.config.boot_mode;
                self.reboot(mode);
            }
            Command::EnableReport | Command::DisableReport => match payload.first() {
                Some(&code) if command == Command::EnableReport => {
                    self.enabled_reports.insert(code);
                    self.ok(&[]);
                    if code == codes::DELTA || code == codes::RAW {
                        self.queue_images(code);
                    }
                }
                Some(code) => {
                    self.enabled_reports.remove(code);
                    self.ok(&[]);
                }
                None => self.error(status::RECEIVE_BUFFER_OVERFLOW),
            },
            Command::GetBootInfo => {
                let p = self.boot_info_payload();
                self.ok(&p);
            }
            Command::EraseFlash if boot => self.erase(payload),
            Command::WriteFlash if boot => self.write_flash(payload),
            Command::RunApplicationFirmware => {
                if !self.stuck_in_bootloader {
                    self.mode = FirmwareMode::Application;
                }
                let p = self.identify_payload();
                self.queue(codes::IDENTIFY, &p);
            }
            Command::RunBootloaderFirmware => {
                self.mode = FirmwareMode::Bootloader;
                let p = self.identify_payload();
                self.queue(codes::IDENTIFY, &p);
            }
            Command::GetApplicationInfo if app => {
                let p = self.app_info_payload();
                self.ok(&p);
            }
            Command::GetDynamicConfig if app => match payload.first() {
                Some(id) => {
                    let value = self.dynamic_config.get(id).copied().unwrap_or(0);
                    self.ok(&value.to_le_bytes());
                }
                None => self.error(status::RECEIVE_BUFFER_OVERFLOW),
            },
            Command::SetDynamicConfig if app => match payload {
                [id, lo, hi, ..] => {
                    self.dynamic_config
                        .insert(*id, u16::from_le_bytes([*lo, *hi]));
                    self.ok(&[]);
                }
                _ => self.error(status::RECEIVE_BUFFER_OVERFLOW),
            },
            Command::GetTouchReportConfig if app => {
                let p = self.report_config.clone();
                self.ok(&p);
            }
            Command::SetTouchReportConfig if app => {
                if payload.len() > self.config.max_touch_report_config_size as usize {
                    self.error(status::RECEIVE_BUFFER_OVERFLOW);
                } else {
                    self.report_config = payload.to_vec();
                    self.ok(&[]);
                }
            }
            Command::ProductionTest if app => {
                let item = payload.first().copied().unwrap_or(0);
                self.ok(&[item, 0x00, 0x01, 0x02]);
            }
            Command::EnterDeepSleep => {
                self.asleep = true;
                self.ok(&[]);
            }
            Command::ExitDeepSleep => {
                self.asleep = false;
                self.ok(&[]);
            }
            _ => self.error(status::NOT_IMPLEMENTED),
        }
    }

    fn queue_images(&mut self, code: u8) {
        let size = self.config.image_rows as usize * self.config.image_cols as usize * 2;
        for n in 0..self.config.image_burst {
            let image: Vec<u8> = (0..size).map(|i| (i + n) as u8).collect();
            self.queue(code, &image);
        }
    }

    fn erase(&mut self, payload: &[u8]) {
        let (start, count) = match payload {
            [start, count] => (*start as usize, *count as usize),
            [s0, s1, c0, c1] => (
                u16::from_le_bytes([*s0, *s1]) as usize,
                u16::from_le_bytes([*c0, *c1]) as usize,
            ),
            _ => return self.error(status::RECEIVE_BUFFER_OVERFLOW),
        };
        let page = self.config.page_size();
        let (from, to) = (start * page, (start + count) * page);
        if to > self.flash.len() {
            return self.error(status::RECEIVE_BUFFER_OVERFLOW);
        }
        self.flash[from..to].fill(0xFF);
        self.ok(&[]);
    }

    fn write_flash(&mut self, payload: &[u8]) {
        let (block, data) = match payload {
            [lo, hi, data @ ..] => (u16::from_le_bytes([*lo, *hi]) as usize, data),
            _ => return self.error(status::RECEIVE_BUFFER_OVERFLOW),
        };
        let addr = block * self.config.write_block_size();
        if data.len() > self.config.max_write_payload_size as usize
            || addr + data.len() > self.flash.len()
        {
            return self.error(status::RECEIVE_BUFFER_OVERFLOW);
        }
        // programming only clears bits
        for (dst, src) in self.flash[addr..addr + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        self.ok(&[]);
    }

    fn send(&mut self, buf: &mut [u8]) {
        buf.fill(0);
        if matches!(&self.streaming, Some((f, pos)) if f.len() - *pos <= 1) {
            self.streaming = None;
        }

        match self.streaming.take() {
            Some((frame, pos)) => {
                buf[0] = MESSAGE_MARKER;
                if buf.len() > 1 {
                    buf[1] = status::CONTINUED_READ;
                }
                let n = buf.len().saturating_sub(2).min(frame.len() - pos);
                if n > 0 {
                    buf[2..2 + n].copy_from_slice(&frame[pos..pos + n]);
                }
                if pos + n < frame.len() {
                    self.streaming = Some((frame, pos + n));
                }
            }
            None => match self.outgoing.pop_front() {
                Some(frame) => {
                    let n = buf.len().min(frame.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    if self.corrupt_next_marker {
                        self.corrupt_next_marker = false;
                        buf[0] = 0x00;
                    } else if n < frame.len() {
                        self.streaming = Some((frame, n));
                    }
                }
                None => {
                    buf[0] = MESSAGE_MARKER;
                    if buf.len() > 1 {
                        buf[1] = status::IDLE;
                    }
                }
            },
        }
    }
}

impl SpiBus for DummyController {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        state.write_lens.push(data.len());
        if data.is_empty() {
            return Err(TransportError::InvalidLength(0));
        }
        let limit = state.config.max_write_size as usize;
        if limit != 0 && data.len() > limit {
            return Err(TransportError::Bus(format!(
                "write of {} bytes exceeds device limit {}",
                data.len(),
                limit
            )));
        }
        if !state.held_in_reset {
            state.receive(data);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if buf.is_empty() {
            return Err(TransportError::InvalidLength(0));
        }
        let mut state = self.state();
        if state.held_in_reset {
            buf.fill(0);
            buf[0] = MESSAGE_MARKER;
            return Ok(());
        }
        state.send(buf);
        Ok(())
    }
}

impl HardwareControl for DummyController {
    fn set_reset(&mut self, asserted: bool) {
        let mut state = self.state();
        if asserted {
            state.held_in_reset = true;
        } else if state.held_in_reset {
            state.held_in_reset = false;
            let mode = state.config.boot_mode;
            state.reboot(mode);
        }
    }

    fn delay_ms(&mut self, _ms: u32) {
        // No delay needed for an in-memory device
    }
}
