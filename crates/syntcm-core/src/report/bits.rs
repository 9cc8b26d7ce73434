//! Bit-level field extraction from touch reports
//!
//! Fields are packed LSB-first: bit `n` of the report is bit `n % 8` of
//! byte `n / 8`, and the first extracted bit becomes bit 0 of the value.

/// Extract a field of 1 to 32 bits starting `bit_offset` bits into `report`
///
/// A field that reaches past the end of the report reads as 0; shorter
/// reports from newer firmware decode with the missing fields zeroed. A
/// zero-width field also reads as 0; the decoder does not store those.
pub fn extract_bits(report: &[u8], bit_offset: usize, bit_count: usize) -> u32 {
    debug_assert!(bit_count <= 32);
    if bit_count == 0 || bit_offset + bit_count > report.len() * 8 {
        return 0;
    }

    let mut byte_offset = bit_offset / 8;
    let mut shift = bit_offset % 8;
    let mut remaining = bit_count;
    let mut value = 0u32;

    while remaining > 0 {
        let available = 8 - shift;
        let take = available.min(remaining);
        let mask = 0xFFu8 >> (8 - take);
        let bits = (report[byte_offset] >> shift) & mask;
        value |= (bits as u32) << (bit_count - remaining);

        shift = 0;
        byte_offset += 1;
        remaining -= take;
    }
    value
}

/// Copy a field wider than 32 bits as whole bytes
///
/// Wide fields are taken as `bit_count / 8` bytes starting at the byte that
/// holds `bit_offset`; the sub-byte part of the offset is ignored. Bytes
/// past the end of the report read as 0.
pub fn extract_wide(report: &[u8], bit_offset: usize, bit_count: usize) -> Vec<u8> {
    let start = bit_offset / 8;
    let len = bit_count / 8;
    let mut out = vec![0u8; len];
    if start < report.len() {
        let n = len.min(report.len() - start);
        out[..n].copy_from_slice(&report[start..start + n]);
    }
    if bit_offset % 8 != 0 {
        log::debug!(
            "tcm: wide field at bit {} is not byte aligned, copying from byte {}",
            bit_offset,
            start
        );
    }
    out
}

/// A field extracted by the width rules of the report format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldBits {
    /// Up to 32 bits, bit-exact
    Scalar(u32),
    /// Over 32 bits, raw bytes
    Wide(Vec<u8>),
}

impl FieldBits {
    pub fn extract(report: &[u8], bit_offset: usize, bit_count: usize) -> Self {
        if bit_count > 32 {
            FieldBits::Wide(extract_wide(report, bit_offset, bit_count))
        } else {
            FieldBits::Scalar(extract_bits(report, bit_offset, bit_count))
        }
    }

    /// Value as an integer; wide fields give their first four bytes
    pub fn value(&self) -> u32 {
        match self {
            FieldBits::Scalar(v) => *v,
            FieldBits::Wide(bytes) => {
                let mut le = [0u8; 4];
                let n = bytes.len().min(4);
                le[..n].copy_from_slice(&bytes[..n]);
                u32::from_le_bytes(le)
            }
        }
    }

    /// Value as little-endian bytes, `bit_count` rounded up to whole bytes
    pub fn into_bytes(self, bit_count: usize) -> Vec<u8> {
        match self {
            FieldBits::Scalar(v) => v.to_le_bytes()[..bit_count.div_ceil(8)].to_vec(),
            FieldBits::Wide(bytes) => bytes,
        }
    }
}
