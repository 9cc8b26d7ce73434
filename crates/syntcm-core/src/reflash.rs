//! Flash erase and write sequencing
//!
//! Erase and write are ordinary commands. Erase takes a page range, write
//! takes a block address followed by data. Block and page sizes come from
//! the bootloader's boot info; the largest block that fits one write chunk
//! bounds each write command.

use crate::command::ResponseTimeout;
use crate::error::{ReflashError, Result};
use crate::info::BootInfo;
use crate::protocol::{Command, WRITE_FLASH_OVERHEAD};

/// Anything that can run a command and return its response
pub trait CommandIssuer {
    fn issue_command(
        &self,
        command: Command,
        payload: &[u8],
        timeout: ResponseTimeout,
    ) -> Result<Vec<u8>>;
}

/// Callback for progress reporting during a reflash
pub trait ReflashProgress {
    /// Called before a region's pages are erased
    fn erasing(&mut self, address: u32, pages: u32);

    /// Called when starting to write a region
    fn writing(&mut self, address: u32, total_bytes: usize);

    /// Called after each block, with the bytes written so far in the region
    fn write_progress(&mut self, bytes_written: usize);

    /// Called when the device is back in application firmware
    fn complete(&mut self);
}

/// A no-op progress reporter
pub struct NoProgress;

impl ReflashProgress for NoProgress {
    fn erasing(&mut self, _address: u32, _pages: u32) {}
    fn writing(&mut self, _address: u32, _total_bytes: usize) {}
    fn write_progress(&mut self, _bytes_written: usize) {}
    fn complete(&mut self) {}
}

/// One contiguous piece of flash to rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflashRegion {
    pub address: u32,
    pub data: Vec<u8>,
}

impl ReflashRegion {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }
}

/// Flash geometry reported by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    pub write_block_size: usize,
    pub page_size: usize,
    pub max_write_payload_size: usize,
}

impl FlashGeometry {
    pub fn from_boot_info(info: &BootInfo) -> std::result::Result<Self, ReflashError> {
        let geometry = Self {
            write_block_size: info.write_block_size(),
            page_size: info.erase_page_size(),
            max_write_payload_size: info.max_write_payload_size as usize,
        };
        if geometry.write_block_size == 0 {
            return Err(ReflashError::InvalidGeometry("write block size is 0"));
        }
        if geometry.page_size == 0 {
            return Err(ReflashError::InvalidGeometry("erase page size is 0"));
        }
        Ok(geometry)
    }

    /// Bytes of data carried by each write command
    ///
    /// A write chunk of 0 is unbounded, leaving the payload limit alone.
    pub fn block_size(&self, write_chunk_size: usize) -> std::result::Result<usize, ReflashError> {
        let room = match write_chunk_size {
            0 => self.max_write_payload_size,
            n => n.saturating_sub(WRITE_FLASH_OVERHEAD),
        };
        if self.write_block_size > room {
            return Err(ReflashError::BlockSizeExceedsChunk {
                block: self.write_block_size,
                chunk: write_chunk_size,
            });
        }
        let size = (room / self.write_block_size * self.write_block_size).min(self.max_write_payload_size);
        if size == 0 {
            return Err(ReflashError::InvalidGeometry("max write payload size is 0"));
        }
        Ok(size)
    }

    /// First page and page count covering `len` bytes at `address`
    pub fn page_range(&self, address: u32, len: usize) -> (u32, u32) {
        let start = address / self.page_size as u32;
        let count = len.div_ceil(self.page_size) as u32;
        (start, count)
    }
}

/// Erase command payload
///
/// Both fields are one byte unless either needs more, then both take two.
pub fn encode_erase(page_start: u32, page_count: u32) -> Vec<u8> {
    if page_start > 0xFF || page_count > 0xFF {
        let start = (page_start as u16).to_le_bytes();
        let count = (page_count as u16).to_le_bytes();
        vec![start[0], start[1], count[0], count[1]]
    } else {
        vec![page_start as u8, page_count as u8]
    }
}

/// Write command payload: little-endian block address, then data
pub fn encode_write_block(block_address: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.extend_from_slice(&block_address.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Runs erase and write sequences against a device in bootloader mode
pub struct ReflashSequencer<'a, C: CommandIssuer + ?Sized> {
    issuer: &'a C,
    geometry: FlashGeometry,
    block_size: usize,
}

impl<'a, C: CommandIssuer + ?Sized> ReflashSequencer<'a, C> {
    pub fn new(
        issuer: &'a C,
        geometry: FlashGeometry,
        write_chunk_size: usize,
    ) -> std::result::Result<Self, ReflashError> {
        let block_size = geometry.block_size(write_chunk_size)?;
        log::info!(
            "tcm: write block size {}, page size {}, payload size {}, {} bytes per write",
            geometry.write_block_size,
            geometry.page_size,
            geometry.max_write_payload_size,
            block_size
        );
        Ok(Self {
            issuer,
            geometry,
            block_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn erase(&self, page_start: u32, page_count: u32) -> Result<()> {
        log::info!("tcm: erasing {} pages from page {}", page_count, page_start);
        self.issuer
            .issue_command(
                Command::EraseFlash,
                &encode_erase(page_start, page_count),
                ResponseTimeout::Flash,
            )
            .map_err(|e| ReflashError::Erase {
                start: page_start,
                end: page_start + page_count,
                source: Box::new(e),
            })?;
        Ok(())
    }

    /// Write `data` starting at `base_address`, one block per command
    ///
    /// `progress` is called with the bytes written so far after each block.
    /// The first failing block aborts the region.
    pub fn write_region(
        &self,
        base_address: u32,
        data: &[u8],
        mut progress: impl FnMut(usize),
    ) -> Result<()> {
        let mut offset = 0usize;
        for block in data.chunks(self.block_size) {
            let address = base_address + offset as u32;
            let block_address = u16::try_from(address as usize / self.geometry.write_block_size)
                .map_err(|_| ReflashError::InvalidGeometry("address beyond 16-bit block range"))?;
            self.issuer
                .issue_command(
                    Command::WriteFlash,
                    &encode_write_block(block_address, block),
                    ResponseTimeout::Flash,
                )
                .map_err(|e| {
                    log::error!(
                        "tcm: failed to write {} bytes at 0x{:08x}",
                        block.len(),
                        address
                    );
                    ReflashError::Write {
                        address,
                        source: Box::new(e),
                    }
                })?;
            offset += block.len();
            progress(offset);
        }
        Ok(())
    }

    /// Erase the pages a region covers and write it
    pub fn flash_region(
        &self,
        region: &ReflashRegion,
        progress: &mut dyn ReflashProgress,
    ) -> Result<()> {
        if region.data.is_empty() {
            return Err(ReflashError::EmptyRegion(region.address).into());
        }
        if region.address as usize % self.geometry.page_size != 0 {
            return Err(ReflashError::UnalignedRegion {
                address: region.address,
                page_size: self.geometry.page_size,
            }
            .into());
        }

        let (start, count) = self.geometry.page_range(region.address, region.data.len());
        progress.erasing(region.address, count);
        self.erase(start, count)?;

        progress.writing(region.address, region.data.len());
        self.write_region(region.address, &region.data, |n| progress.write_progress(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommandError, Error};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        sent: RefCell<Vec<(Command, Vec<u8>)>>,
        fail_at: Option<usize>,
    }

    impl CommandIssuer for Recorder {
        fn issue_command(
            &self,
            command: Command,
            payload: &[u8],
            timeout: ResponseTimeout,
        ) -> Result<Vec<u8>> {
            assert_eq!(timeout, ResponseTimeout::Flash);
            let mut sent = self.sent.borrow_mut();
            sent.push((command, payload.to_vec()));
            if self.fail_at == Some(sent.len() - 1) {
                return Err(CommandError::DeviceError { command, code: Some(1) }.into());
            }
            Ok(Vec::new())
        }
    }

    fn geometry() -> FlashGeometry {
        FlashGeometry {
            write_block_size: 16,
            page_size: 0x1000,
            max_write_payload_size: 1024,
        }
    }

    #[test]
    fn test_geometry_from_boot_info_is_in_bytes() {
        let info = BootInfo::parse(&[1, 0, 0, 0, 8, 0x00, 0x08, 0x00, 0x04, 0, 0, 0]);
        let g = FlashGeometry::from_boot_info(&info).unwrap();
        assert_eq!(g.write_block_size, 16);
        assert_eq!(g.page_size, 0x1000);
        assert_eq!(g.max_write_payload_size, 1024);
        assert!(FlashGeometry::from_boot_info(&BootInfo::default()).is_err());
    }

    #[test]
    fn test_block_size() {
        let g = geometry();
        // (256 - 5) rounded down to 16
        assert_eq!(g.block_size(256).unwrap(), 240);
        assert_eq!(g.block_size(0).unwrap(), 1024);
        assert_eq!(g.block_size(4096).unwrap(), 1024);
        assert!(matches!(
            g.block_size(20),
            Err(ReflashError::BlockSizeExceedsChunk { block: 16, chunk: 20 })
        ));
        assert_eq!(g.block_size(21).unwrap(), 16);
    }

    #[test]
    fn test_erase_encoding() {
        assert_eq!(encode_erase(0x10, 0x20), vec![0x10, 0x20]);
        assert_eq!(encode_erase(0xFF, 0xFF), vec![0xFF, 0xFF]);
        assert_eq!(encode_erase(0x100, 0x01), vec![0x00, 0x01, 0x01, 0x00]);
        assert_eq!(encode_erase(0x02, 0x1FF), vec![0x02, 0x00, 0xFF, 0x01]);
    }

    #[test]
    fn test_page_range_rounds_up() {
        let g = geometry();
        assert_eq!(g.page_range(0x2000, 1), (2, 1));
        assert_eq!(g.page_range(0x2000, 0x1000), (2, 1));
        assert_eq!(g.page_range(0x2000, 0x1001), (2, 2));
    }

    #[test]
    fn test_flash_region_sequence() {
        let rec = Recorder::default();
        let seq = ReflashSequencer::new(&rec, geometry(), 256).unwrap();
        let data: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        seq.flash_region(&ReflashRegion::new(0x1000, data.clone()), &mut NoProgress)
            .unwrap();

        let sent = rec.sent.borrow();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], (Command::EraseFlash, vec![0x01, 0x01]));
        // 0x1000 / 16 = 0x100
        assert_eq!(sent[1].0, Command::WriteFlash);
        assert_eq!(&sent[1].1[..2], &[0x00, 0x01]);
        assert_eq!(&sent[1].1[2..], &data[..240]);
        // 0x1000 + 240 = 0x10F0, / 16 = 0x10F
        assert_eq!(&sent[2].1[..2], &[0x0F, 0x01]);
        assert_eq!(sent[3].1.len(), 2 + 20);

        let written: Vec<u8> = sent[1..].iter().flat_map(|(_, p)| p[2..].to_vec()).collect();
        assert_eq!(written, data);
    }

    #[test]
    fn test_failure_aborts_region() {
        let rec = Recorder {
            fail_at: Some(2),
            ..Default::default()
        };
        let seq = ReflashSequencer::new(&rec, geometry(), 256).unwrap();
        let err = seq
            .flash_region(&ReflashRegion::new(0, vec![0xAA; 1000]), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Reflash(ReflashError::Write { address: 240, .. })
        ));
        assert_eq!(rec.sent.borrow().len(), 3);
    }

    #[test]
    fn test_rejects_bad_regions() {
        let rec = Recorder::default();
        let seq = ReflashSequencer::new(&rec, geometry(), 256).unwrap();
        assert!(matches!(
            seq.flash_region(&ReflashRegion::new(0, vec![]), &mut NoProgress),
            Err(Error::Reflash(ReflashError::EmptyRegion(0)))
        ));
        assert!(matches!(
            seq.flash_region(&ReflashRegion::new(0x10, vec![1]), &mut NoProgress),
            Err(Error::Reflash(ReflashError::UnalignedRegion { .. }))
        ));
        assert!(rec.sent.borrow().is_empty());
    }

    #[test]
    fn test_progress_reports_bytes() {
        struct Count(Vec<usize>);
        impl ReflashProgress for Count {
            fn erasing(&mut self, _: u32, _: u32) {}
            fn writing(&mut self, _: u32, total: usize) {
                assert_eq!(total, 300);
            }
            fn write_progress(&mut self, n: usize) {
                self.0.push(n);
            }
            fn complete(&mut self) {}
        }
        let rec = Recorder::default();
        let seq = ReflashSequencer::new(&rec, geometry(), 256).unwrap();
        let mut p = Count(Vec::new());
        seq.flash_region(&ReflashRegion::new(0, vec![0; 300]), &mut p)
            .unwrap();
        assert_eq!(p.0, vec![240, 300]);
    }
}
