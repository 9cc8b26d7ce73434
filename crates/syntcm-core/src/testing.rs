//! Test-only bus that plays the device side of the chunked read protocol

use crate::bus::SpiBus;
use crate::error::TransportError;
use crate::protocol::{status, MESSAGE_MARKER, MESSAGE_PADDING};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    frames: VecDeque<Vec<u8>>,
    current: Option<(Vec<u8>, usize)>,
    writes: Vec<Vec<u8>>,
    read_lens: Vec<usize>,
    fail_next_read: bool,
}

/// Device-side frame streamer
///
/// Queued frames are handed out the way the controller does: the first
/// read of a frame returns its leading bytes, each following read returns
/// a `[marker, CONTINUED_READ]` chunk header and the next bytes. With no
/// frame queued the bus reads as an idle header.
#[derive(Clone, Default)]
pub struct FrameBus {
    state: Arc<Mutex<State>>,
}

impl FrameBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, code: u8, payload: &[u8]) {
        let mut frame = vec![
            MESSAGE_MARKER,
            code,
            payload.len() as u8,
            (payload.len() >> 8) as u8,
        ];
        frame.extend_from_slice(payload);
        frame.push(MESSAGE_PADDING);
        self.push_raw(frame);
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().frames.push_back(bytes);
    }

    pub fn fail_next_read(&self) {
        self.state.lock().unwrap().fail_next_read = true;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn read_lens(&self) -> Vec<usize> {
        self.state.lock().unwrap().read_lens.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock().unwrap();
        state.writes.clear();
        state.read_lens.clear();
    }
}

impl SpiBus for FrameBus {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.state.lock().unwrap().writes.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.read_lens.push(buf.len());
        if state.fail_next_read {
            state.fail_next_read = false;
            return Err(TransportError::Bus("injected failure".into()));
        }
        buf.fill(0);

        // A frame whose last byte was never clocked out is complete.
        if matches!(&state.current, Some((f, pos)) if f.len() - *pos <= 1) {
            state.current = None;
        }

        match state.current.take() {
            Some((frame, pos)) => {
                buf[0] = MESSAGE_MARKER;
                if buf.len() > 1 {
                    buf[1] = status::CONTINUED_READ;
                }
                let n = buf.len().saturating_sub(2).min(frame.len() - pos);
                if buf.len() > 2 {
                    buf[2..2 + n].copy_from_slice(&frame[pos..pos + n]);
                }
                if pos + n < frame.len() {
                    state.current = Some((frame, pos + n));
                }
            }
            None => match state.frames.pop_front() {
                Some(frame) => {
                    let n = buf.len().min(frame.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    if n < frame.len() {
                        state.current = Some((frame, n));
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
        Ok(())
    }
}
