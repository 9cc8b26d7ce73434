//! Message framing on top of the chunked transport

use crate::bus::SpiBus;
use crate::error::{ProtocolError, Result, TransportError};
use crate::protocol::{
    FrameClass, MESSAGE_HEADER_SIZE, MESSAGE_MARKER, MESSAGE_PADDING, MIN_READ_LENGTH,
};
use crate::transport::{ensure_len, ChunkedTransport};

/// One complete device-to-host message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Status or report code
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    pub fn class(&self) -> FrameClass {
        FrameClass::of(self.code)
    }
}

/// Builds outgoing command messages and parses incoming ones
pub struct MessageCodec<B> {
    transport: ChunkedTransport<B>,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    initial_read_length: usize,
    read_length: usize,
    predictive: bool,
}

impl<B: SpiBus> MessageCodec<B> {
    pub fn new(transport: ChunkedTransport<B>) -> Self {
        Self {
            transport,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            initial_read_length: MESSAGE_HEADER_SIZE,
            read_length: MESSAGE_HEADER_SIZE,
            predictive: false,
        }
    }

    /// Length of the first physical read of every message
    ///
    /// Values below the header size are raised to it, and values above the
    /// read chunk size are capped to it.
    pub fn with_initial_read_length(mut self, len: usize) -> Self {
        let len = len.max(MESSAGE_HEADER_SIZE);
        let len = match self.transport.read_chunk_size() {
            0 => len,
            chunk => len.min(chunk),
        };
        self.initial_read_length = len;
        self.read_length = len;
        self
    }

    /// Size the next first read after the length of the last message
    pub fn with_predictive_reading(mut self, enabled: bool) -> Self {
        self.predictive = enabled;
        self
    }

    pub fn transport(&self) -> &ChunkedTransport<B> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut ChunkedTransport<B> {
        &mut self.transport
    }

    /// Current length of the first physical read
    pub fn read_length(&self) -> usize {
        self.read_length
    }

    /// Send `[command, len_lo, len_hi, payload...]`
    pub fn write_message(&mut self, command: u8, payload: &[u8]) -> std::result::Result<(), TransportError> {
        let len = u16::try_from(payload.len())
            .map_err(|_| TransportError::InvalidLength(payload.len()))?;

        ensure_len(&mut self.out_buf, payload.len() + 2)?;
        self.out_buf[..2].copy_from_slice(&len.to_le_bytes());
        self.out_buf[2..payload.len() + 2].copy_from_slice(payload);

        log::debug!("tcm: sending command 0x{:02x} ({} bytes)", command, payload.len());
        self.transport
            .write_chunked(command, &self.out_buf[..payload.len() + 2])
    }

    /// Send a command byte and data with no length field
    pub fn write_raw(&mut self, command: u8, data: &[u8]) -> std::result::Result<(), TransportError> {
        self.transport.write_chunked(command, data)
    }

    /// Read `len` raw bytes
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        self.transport.read_chunked(len)
    }

    /// Read one complete message
    ///
    /// Idle, busy and stray continued-read headers come back as frames with
    /// an empty payload; callers skip them. Every framing error resets the
    /// first read length, since the link is out of sync.
    pub fn read_message(&mut self) -> Result<Frame> {
        let result = self.read_message_inner();
        if result.is_err() {
            self.read_length = self.initial_read_length;
        }
        result
    }

    fn read_message_inner(&mut self) -> Result<Frame> {
        let first = self.read_length;
        ensure_len(&mut self.in_buf, first)?;
        self.transport.read_first(&mut self.in_buf[..first])?;

        let marker = self.in_buf[0];
        if marker != MESSAGE_MARKER {
            log::error!("tcm: incorrect header marker 0x{:02x}", marker);
            return Err(ProtocolError::WrongMarker(marker).into());
        }

        let code = self.in_buf[1];
        match FrameClass::of(code) {
            FrameClass::Ignored(_) => {
                log::trace!("tcm: header code 0x{:02x}, nothing to read", code);
                return Ok(Frame {
                    code,
                    payload: Vec::new(),
                });
            }
            FrameClass::Invalid(_) => {
                log::error!("tcm: incorrect header code 0x{:02x}", code);
                return Err(ProtocolError::UnexpectedStatus(code).into());
            }
            FrameClass::Response(_) | FrameClass::Report(_) => {}
        }

        let payload_length = u16::from_le_bytes([self.in_buf[2], self.in_buf[3]]) as usize;
        let total = MESSAGE_HEADER_SIZE + payload_length + 1;
        ensure_len(&mut self.in_buf, total)?;

        if total > first {
            self.transport
                .continued_read(&mut self.in_buf[first..total])?;
        }

        let padding = self.in_buf[total - 1];
        if padding != MESSAGE_PADDING {
            log::error!("tcm: incorrect message padding byte 0x{:02x}", padding);
            return Err(ProtocolError::PaddingMismatch(padding).into());
        }

        if self.predictive {
            self.read_length = match self.transport.read_chunk_size() {
                0 => total,
                chunk => total.max(MIN_READ_LENGTH).min(chunk),
            };
        }

        log::debug!(
            "tcm: received message code 0x{:02x} ({} bytes)",
            code,
            payload_length
        );

        Ok(Frame {
            code,
            payload: self.in_buf[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + payload_length]
                .to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::{report, status};
    use crate::testing::FrameBus;

    fn codec(bus: &FrameBus, read_chunk: usize, write_chunk: usize) -> MessageCodec<FrameBus> {
        MessageCodec::new(ChunkedTransport::new(bus.clone(), read_chunk, write_chunk))
    }

    #[test]
    fn test_write_message_frames_length() {
        let bus = FrameBus::new();
        let mut c = codec(&bus, 0, 6);
        c.write_message(0x24, &[0xD0, 0x34, 0x12, 0x99]).unwrap();
        assert_eq!(
            bus.writes(),
            vec![
                vec![0x24, 0x04, 0x00, 0xD0, 0x34, 0x12],
                vec![0x01, 0x99],
            ]
        );
    }

    #[test]
    fn test_write_message_then_parse_back() {
        let bus = FrameBus::new();
        let mut c = codec(&bus, 0, 5);
        let payload: Vec<u8> = (0..37).collect();
        c.write_message(0x26, &payload).unwrap();

        let writes = bus.writes();
        let mut body = Vec::new();
        for (i, w) in writes.iter().enumerate() {
            assert_eq!(w[0], if i == 0 { 0x26 } else { 0x01 });
            body.extend_from_slice(&w[1..]);
        }
        let len = u16::from_le_bytes([body[0], body[1]]) as usize;
        assert_eq!(len, payload.len());
        assert_eq!(&body[2..], &payload[..]);
    }

    #[test]
    fn test_read_message_extra_reads_follow_chunk_count() {
        for chunk in [3usize, 8, 16, 32] {
            for len in [1usize, 5, 6, 13, 29, 30, 64] {
                let bus = FrameBus::new();
                let payload: Vec<u8> = (0..len as u8).collect();
                bus.push_frame(report::TOUCH, &payload);
                let mut c = codec(&bus, chunk, 0);

                let frame = c.read_message().unwrap();
                assert_eq!(frame.code, report::TOUCH);
                assert_eq!(frame.payload, payload);

                let space = chunk - 2;
                let chunks = (len + 1).div_ceil(space);
                // a lone final padding byte is synthesized, not clocked out
                let synthesized = usize::from((len + 1) % space == 1 || space == 1);
                assert_eq!(bus.read_lens().len() - 1, chunks - synthesized);
            }
        }
    }

    #[test]
    fn test_read_message_empty_payload_needs_no_extra_read() {
        let bus = FrameBus::new();
        bus.push_frame(status::OK, &[]);
        let mut c = codec(&bus, 16, 0);
        let frame = c.read_message().unwrap();
        assert_eq!(frame.code, status::OK);
        assert!(frame.payload.is_empty());
        assert_eq!(bus.read_lens(), vec![4]);
    }

    #[test]
    fn test_read_message_idle_is_not_an_error() {
        let bus = FrameBus::new();
        let mut c = codec(&bus, 16, 0);
        let frame = c.read_message().unwrap();
        assert_eq!(frame.code, status::IDLE);
        assert_eq!(frame.payload_length(), 0);
    }

    #[test]
    fn test_read_message_wrong_marker() {
        let bus = FrameBus::new();
        bus.push_raw(vec![0x00, 0x11, 0x00, 0x00, 0x5A]);
        let mut c = codec(&bus, 16, 0);
        assert!(matches!(
            c.read_message(),
            Err(Error::Protocol(ProtocolError::WrongMarker(0x00)))
        ));
    }

    #[test]
    fn test_read_message_padding_mismatch() {
        let bus = FrameBus::new();
        bus.push_raw(vec![0xA5, 0x11, 0x02, 0x00, 0x01, 0x02, 0x00]);
        let mut c = codec(&bus, 16, 0);
        assert!(matches!(
            c.read_message(),
            Err(Error::Protocol(ProtocolError::PaddingMismatch(0x00)))
        ));
    }

    #[test]
    fn test_read_message_unexpected_status() {
        let bus = FrameBus::new();
        bus.push_frame(status::NOT_IMPLEMENTED, &[]);
        let mut c = codec(&bus, 16, 0);
        assert!(matches!(
            c.read_message(),
            Err(Error::Protocol(ProtocolError::UnexpectedStatus(0x0E)))
        ));
    }

    #[test]
    fn test_predictive_reading_sizes_next_read() {
        let bus = FrameBus::new();
        let payload = [0u8; 10];
        bus.push_frame(report::TOUCH, &payload);
        bus.push_frame(report::TOUCH, &payload);
        let mut c = codec(&bus, 64, 0).with_predictive_reading(true);

        c.read_message().unwrap();
        assert_eq!(c.read_length(), 15);
        let frame = c.read_message().unwrap();
        assert_eq!(frame.payload, payload);
        // second message arrived in one physical read
        assert_eq!(bus.read_lens(), vec![4, 13, 15]);
    }

    #[test]
    fn test_predictive_reading_capped_by_chunk() {
        let bus = FrameBus::new();
        bus.push_frame(report::TOUCH, &[0u8; 100]);
        let mut c = codec(&bus, 32, 0).with_predictive_reading(true);
        c.read_message().unwrap();
        assert_eq!(c.read_length(), 32);
    }

    #[test]
    fn test_error_resets_read_length() {
        let bus = FrameBus::new();
        bus.push_frame(report::TOUCH, &[0u8; 20]);
        bus.push_raw(vec![0x12, 0x34, 0x56, 0x78]);
        let mut c = codec(&bus, 64, 0).with_predictive_reading(true);
        c.read_message().unwrap();
        assert_eq!(c.read_length(), 25);
        assert!(c.read_message().is_err());
        assert_eq!(c.read_length(), 4);
    }

    #[test]
    fn test_bus_failure_propagates() {
        let bus = FrameBus::new();
        bus.fail_next_read();
        let mut c = codec(&bus, 16, 0);
        assert!(matches!(
            c.read_message(),
            Err(Error::Transport(TransportError::Bus(_)))
        ));
    }
}
