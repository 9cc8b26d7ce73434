//! Chunked transfers over a size-limited bus
//!
//! The controller only accepts transfers up to a fixed chunk size. Writes
//! longer than a chunk are split, with every chunk after the first led by
//! `CONTINUE_WRITE` instead of the command byte. Reads longer than a chunk
//! are continued: each further chunk comes back with its own
//! `[marker, CONTINUED_READ]` header, leaving `chunk_size - 2` data bytes.
//! A chunk size of 0 means the bus takes any length in one transfer.

use crate::bus::SpiBus;
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::protocol::{opcodes, status, CHUNK_HEADER_SIZE, MESSAGE_MARKER, MESSAGE_PADDING};

/// Grow `buf` to at least `len` bytes, reporting allocation failure
pub(crate) fn ensure_len(buf: &mut Vec<u8>, len: usize) -> std::result::Result<(), TransportError> {
    if buf.len() < len {
        buf.try_reserve(len - buf.len())
            .map_err(|_| TransportError::Allocation { requested: len })?;
        buf.resize(len, 0);
    }
    Ok(())
}

/// Splits and reassembles transfers in bus-chunk-sized pieces
pub struct ChunkedTransport<B> {
    bus: B,
    read_chunk_size: usize,
    write_chunk_size: usize,
    configured_write_chunk_size: usize,
    out_buf: Vec<u8>,
    chunk_buf: Vec<u8>,
}

impl<B: SpiBus> ChunkedTransport<B> {
    /// Wrap a bus with the given read and write chunk sizes (0 = unbounded)
    pub fn new(bus: B, read_chunk_size: usize, write_chunk_size: usize) -> Self {
        let read_chunk_size = match read_chunk_size {
            1..=CHUNK_HEADER_SIZE => {
                log::warn!(
                    "tcm: read chunk size {} leaves no room for data, using {}",
                    read_chunk_size,
                    CHUNK_HEADER_SIZE + 1
                );
                CHUNK_HEADER_SIZE + 1
            }
            n => n,
        };
        let write_chunk_size = if write_chunk_size == 1 { 2 } else { write_chunk_size };
        Self {
            bus,
            read_chunk_size,
            write_chunk_size,
            configured_write_chunk_size: write_chunk_size,
            out_buf: Vec::new(),
            chunk_buf: Vec::new(),
        }
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    pub fn write_chunk_size(&self) -> usize {
        self.write_chunk_size
    }

    /// Apply the maximum write size a device advertised in its identify info
    ///
    /// The write chunk becomes the smaller of the advertised and configured
    /// sizes; if that is 0 the advertised size is used as-is.
    pub fn apply_max_write_size(&mut self, max_write_size: usize) {
        let size = max_write_size.min(self.configured_write_chunk_size);
        let size = if size == 0 { max_write_size } else { size };
        if size != self.write_chunk_size {
            log::debug!("tcm: write chunk size {} -> {}", self.write_chunk_size, size);
        }
        self.write_chunk_size = size;
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Write `command` followed by `data`, split into chunks
    ///
    /// The first chunk is `[command, data...]`; every further chunk is
    /// `[CONTINUE_WRITE, data...]`. Each chunk carries at most
    /// `write_chunk_size - 1` data bytes.
    pub fn write_chunked(&mut self, command: u8, data: &[u8]) -> std::result::Result<(), TransportError> {
        let space = match self.write_chunk_size {
            0 => data.len().max(1),
            n => n - 1,
        };

        let mut remaining = data;
        let mut lead = command;
        loop {
            let xfer = remaining.len().min(space);
            ensure_len(&mut self.out_buf, xfer + 1)?;
            self.out_buf[0] = lead;
            self.out_buf[1..=xfer].copy_from_slice(&remaining[..xfer]);
            self.bus.write(&self.out_buf[..=xfer])?;

            remaining = &remaining[xfer..];
            if remaining.is_empty() {
                break;
            }
            lead = opcodes::CONTINUE_WRITE;
        }
        Ok(())
    }

    /// Read the first chunk of a message in a single physical transfer
    pub fn read_first(&mut self, buf: &mut [u8]) -> std::result::Result<(), TransportError> {
        self.bus.read(buf)
    }

    /// Fill `dest` from continued-read chunks
    ///
    /// A final chunk of a single byte is never clocked out: it can only be
    /// the message padding, so it is written in place.
    pub fn continued_read(&mut self, dest: &mut [u8]) -> Result<()> {
        let space = match self.read_chunk_size {
            0 => dest.len().max(1),
            n => n - CHUNK_HEADER_SIZE,
        };

        let mut offset = 0;
        let mut chunks = 0;
        while offset < dest.len() {
            let xfer = (dest.len() - offset).min(space);
            if xfer == 1 && offset + 1 == dest.len() {
                dest[offset] = MESSAGE_PADDING;
                offset += 1;
                continue;
            }

            let len = xfer + CHUNK_HEADER_SIZE;
            ensure_len(&mut self.chunk_buf, len)?;
            self.bus.read(&mut self.chunk_buf[..len])?;
            chunks += 1;

            if self.chunk_buf[0] != MESSAGE_MARKER {
                log::error!("tcm: incorrect continued-read marker 0x{:02x}", self.chunk_buf[0]);
                return Err(ProtocolError::WrongMarker(self.chunk_buf[0]).into());
            }
            if self.chunk_buf[1] != status::CONTINUED_READ {
                log::error!("tcm: incorrect continued-read code 0x{:02x}", self.chunk_buf[1]);
                return Err(ProtocolError::WrongContinuationCode(self.chunk_buf[1]).into());
            }

            dest[offset..offset + xfer].copy_from_slice(&self.chunk_buf[CHUNK_HEADER_SIZE..len]);
            offset += xfer;
        }

        log::trace!("tcm: continued read of {} bytes in {} chunks", dest.len(), chunks);
        Ok(())
    }

    /// Read exactly `total_len` raw bytes
    ///
    /// The first chunk is returned verbatim, header included; the rest is
    /// gathered with continued reads.
    pub fn read_chunked(&mut self, total_len: usize) -> Result<Vec<u8>> {
        if total_len < CHUNK_HEADER_SIZE {
            return Err(Error::Transport(TransportError::InvalidLength(total_len)));
        }

        let mut out = Vec::new();
        ensure_len(&mut out, total_len)?;

        let first = match self.read_chunk_size {
            0 => total_len,
            n => total_len.min(n),
        };
        self.bus.read(&mut out[..first])?;
        if first < total_len {
            self.continued_read(&mut out[first..])?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FrameBus;

    fn reassemble(chunks: &[Vec<u8>], command: u8) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let lead = if i == 0 { command } else { opcodes::CONTINUE_WRITE };
            assert_eq!(chunk[0], lead);
            out.extend_from_slice(&chunk[1..]);
        }
        out
    }

    #[test]
    fn test_write_chunked_splits_and_reassembles() {
        let data: Vec<u8> = (0..=200u8).collect();
        for chunk_size in [3usize, 4, 7, 16, 64, 202, 203, 512] {
            let bus = FrameBus::new();
            let mut t = ChunkedTransport::new(bus.clone(), 0, chunk_size);
            t.write_chunked(0x24, &data).unwrap();

            let writes = bus.writes();
            assert!(writes.iter().all(|w| w.len() <= chunk_size));
            assert_eq!(writes.len(), data.len().div_ceil(chunk_size - 1));
            assert_eq!(reassemble(&writes, 0x24), data);
        }
    }

    #[test]
    fn test_write_chunked_unbounded_and_empty() {
        let bus = FrameBus::new();
        let mut t = ChunkedTransport::new(bus.clone(), 0, 0);
        t.write_chunked(0x02, &[1, 2, 3, 4, 5]).unwrap();
        t.write_chunked(0x04, &[]).unwrap();
        assert_eq!(bus.writes(), vec![vec![0x02, 1, 2, 3, 4, 5], vec![0x04]]);
    }

    #[test]
    fn test_apply_max_write_size() {
        let mut t = ChunkedTransport::new(FrameBus::new(), 0, 256);
        t.apply_max_write_size(64);
        assert_eq!(t.write_chunk_size(), 64);
        t.apply_max_write_size(1024);
        assert_eq!(t.write_chunk_size(), 256);

        let mut t = ChunkedTransport::new(FrameBus::new(), 0, 0);
        t.apply_max_write_size(128);
        assert_eq!(t.write_chunk_size(), 128);
    }

    #[test]
    fn test_continued_read_synthesizes_final_padding() {
        let bus = FrameBus::new();
        let payload: Vec<u8> = (1..=8).collect();
        bus.push_frame(0x11, &payload);
        let mut t = ChunkedTransport::new(bus.clone(), 6, 0);

        let mut header = [0u8; 4];
        t.read_first(&mut header).unwrap();
        // 8 payload bytes + padding in 4-byte chunks: 4, 4, then a lone padding byte
        let mut rest = [0u8; 9];
        t.continued_read(&mut rest).unwrap();
        assert_eq!(&rest[..8], &payload[..]);
        assert_eq!(rest[8], MESSAGE_PADDING);
        assert_eq!(bus.read_lens(), vec![4, 6, 6]);
    }

    #[test]
    fn test_continued_read_rejects_wrong_code() {
        let bus = FrameBus::new();
        let mut t = ChunkedTransport::new(bus.clone(), 8, 0);
        // Nothing is being continued: the device answers with an idle header
        let mut rest = [0u8; 5];
        let err = t.continued_read(&mut rest).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::WrongContinuationCode(0x00))
        ));
    }

    #[test]
    fn test_read_chunked_keeps_first_header() {
        let bus = FrameBus::new();
        bus.push_raw(vec![0xA5, 0x01, 0x03, 0x00, 0x10, 0x20, 0x30, 0x5A]);
        let mut t = ChunkedTransport::new(bus.clone(), 4, 0);
        let bytes = t.read_chunked(8).unwrap();
        assert_eq!(bytes, vec![0xA5, 0x01, 0x03, 0x00, 0x10, 0x20, 0x30, 0x5A]);
        assert_eq!(bus.read_lens(), vec![4, 4, 4]);
    }

    #[test]
    fn test_read_chunked_rejects_short_length() {
        let mut t = ChunkedTransport::new(FrameBus::new(), 4, 0);
        assert!(matches!(
            t.read_chunked(1),
            Err(Error::Transport(TransportError::InvalidLength(1)))
        ));
    }
}
