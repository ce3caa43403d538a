//! Bit-mask of BPM ids (C2).
//!
//! A `FilterMask` selects which of the `FA_ENTRY_COUNT` beam position
//! monitors participate in archiving or in a live readout. It is a fixed
//! 256-bit set represented as eight little-endian `u32` words, mirroring the
//! `filter_mask_t` array used throughout the original archiver.

use std::fmt;
use std::io::{self, Write};

use crate::error::{Error, Result};

/// Paired (x, y) int32 entries per frame.
pub const FA_ENTRY_COUNT: usize = 256;
/// Bytes per (x, y) entry.
pub const FA_ENTRY_SIZE: usize = 8;
/// Bytes in one complete frame.
pub const FA_FRAME_SIZE: usize = FA_ENTRY_COUNT * FA_ENTRY_SIZE;

const WORDS: usize = FA_ENTRY_COUNT / 32;
const RAW_NIBBLES: usize = FA_ENTRY_COUNT / 4;
const WRITE_BUFFER_SIZE: usize = 1 << 16;

/// A fixed-width set of BPM ids.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterMask([u32; WORDS]);

impl FilterMask {
    pub fn new() -> Self {
        FilterMask([0; WORDS])
    }

    pub fn set_bit(&mut self, bit: usize) {
        debug_assert!(bit < FA_ENTRY_COUNT);
        self.0[bit >> 5] |= 1 << (bit & 0x1f);
    }

    pub fn test_bit(&self, bit: usize) -> bool {
        debug_assert!(bit < FA_ENTRY_COUNT);
        self.0[bit >> 5] & (1 << (bit & 0x1f)) != 0
    }

    /// Number of bits set (the `archive_mask_count` of the on-disk header).
    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn words(&self) -> &[u32; WORDS] {
        &self.0
    }

    /// Parses `id[-id](,id[-id])*`, ids in `[0, FA_ENTRY_COUNT)`, `a <= b` in
    /// ranges. Ids may repeat; repeated ids simply union into the same bit.
    pub fn parse(s: &str) -> Result<Self> {
        let mut mask = FilterMask::new();
        for range in s.split(',') {
            let (lo, hi) = match range.split_once('-') {
                Some((lo, hi)) => (parse_id(lo)?, parse_id(hi)?),
                None => {
                    let id = parse_id(range)?;
                    (id, id)
                }
            };
            if lo > hi {
                return Err(Error::Mask(format!("range {lo}-{hi} is empty")));
            }
            for id in lo..=hi {
                mask.set_bit(id);
            }
        }
        Ok(mask)
    }

    /// Parses exactly `FA_ENTRY_COUNT/4` hex nibbles `[0-9A-F]`. Nibble `i`
    /// (0 = first character read) maps to the top nibble of word
    /// `(count-1-i)/8` at position `4 * ((count-1-i) % 8)`.
    pub fn parse_raw(s: &str) -> Result<Self> {
        let chars: Vec<char> = s.chars().collect();
        if chars.len() < RAW_NIBBLES {
            return Err(Error::Mask(format!(
                "raw mask too short: expected {RAW_NIBBLES} hex nibbles, got {}",
                chars.len()
            )));
        }

        let mut mask = FilterMask::new();
        for i in 0..RAW_NIBBLES {
            let ch = chars[i];
            let nibble = ch
                .to_digit(16)
                .filter(|_| ch.is_ascii_digit() || ch.is_ascii_uppercase())
                .ok_or_else(|| Error::Mask("unexpected character in mask".to_string()))?;

            let j = RAW_NIBBLES - 1 - i;
            mask.0[j / 8] |= nibble << (4 * (j % 8));
        }
        Ok(mask)
    }

    /// Formats the mask as `FA_ENTRY_COUNT/4` uppercase hex nibbles, the
    /// exact inverse of [`FilterMask::parse_raw`].
    pub fn format_raw(&self) -> String {
        let mut buf = String::with_capacity(RAW_NIBBLES);
        for i in 0..RAW_NIBBLES {
            let j = RAW_NIBBLES - 1 - i;
            let nibble = (self.0[j / 8] >> (4 * (j % 8))) & 0xf;
            buf.push(std::char::from_digit(nibble, 16).unwrap().to_ascii_uppercase());
        }
        buf
    }

    /// Copies the `(x,y)` pairs selected by this mask from a complete frame
    /// into `to`, in ascending id order. Returns the number of bytes
    /// written (`8 * count()`).
    pub fn copy_frame(&self, to: &mut [u8], from: &[u8]) -> usize {
        assert!(from.len() >= FA_FRAME_SIZE);
        let mut written = 0;
        for id in 0..FA_ENTRY_COUNT {
            if self.test_bit(id) {
                let src = &from[id * FA_ENTRY_SIZE..(id + 1) * FA_ENTRY_SIZE];
                to[written..written + FA_ENTRY_SIZE].copy_from_slice(src);
                written += FA_ENTRY_SIZE;
            }
        }
        written
    }

    /// Buffers up to 64 KiB of masked frames before issuing each `write`,
    /// retrying on short writes.
    pub fn write_frames<W: Write>(&self, mut file: W, frames: &[u8]) -> io::Result<()> {
        let out_frame_size = self.count() as usize * FA_ENTRY_SIZE;
        if out_frame_size == 0 {
            return Ok(());
        }

        let mut buffer = vec![0u8; WRITE_BUFFER_SIZE];
        let mut frame_count = frames.len() / FA_FRAME_SIZE;
        let mut frame_offset = 0;

        while frame_count > 0 {
            let mut buffered = 0;
            while frame_count > 0 && buffered + out_frame_size <= WRITE_BUFFER_SIZE {
                let frame = &frames[frame_offset..frame_offset + FA_FRAME_SIZE];
                self.copy_frame(&mut buffer[buffered..], frame);
                buffered += out_frame_size;
                frame_offset += FA_FRAME_SIZE;
                frame_count -= 1;
            }

            let mut written = 0;
            while written < buffered {
                let n = file.write(&buffer[written..buffered])?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
                }
                written += n;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FilterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterMask({})", self.format_raw())
    }
}

fn parse_id(s: &str) -> Result<usize> {
    let id: i64 = s
        .trim()
        .parse()
        .map_err(|_| Error::Mask(format!("not a number: {s:?}")))?;
    if id < 0 || id as usize >= FA_ENTRY_COUNT {
        return Err(Error::Mask(format!("id {id} out of range")));
    }
    Ok(id as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::any;

    #[test]
    fn parse_single_ids() {
        let mask = FilterMask::parse("1,3,5").unwrap();
        assert_eq!(mask.count(), 3);
        assert!(mask.test_bit(1) && mask.test_bit(3) && mask.test_bit(5));
        assert!(!mask.test_bit(2));
    }

    #[test]
    fn parse_ranges_and_union() {
        let mask = FilterMask::parse("0-3,2-5").unwrap();
        assert_eq!(mask.count(), 6);
        for id in 0..=5 {
            assert!(mask.test_bit(id));
        }
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(FilterMask::parse("256").is_err());
        assert!(FilterMask::parse("5-2").is_err());
    }

    #[test]
    fn raw_round_trip_full_mask() {
        let mut mask = FilterMask::new();
        for id in 0..FA_ENTRY_COUNT {
            mask.set_bit(id);
        }
        let raw = mask.format_raw();
        assert_eq!(raw.len(), RAW_NIBBLES);
        assert_eq!(FilterMask::parse_raw(&raw).unwrap(), mask);
    }

    #[test]
    fn raw_round_trip_sparse_mask() {
        let mask = FilterMask::parse("0,31,32,255").unwrap();
        let raw = mask.format_raw();
        assert_eq!(FilterMask::parse_raw(&raw).unwrap(), mask);
    }

    #[test]
    fn raw_round_trip_empty_mask() {
        let mask = FilterMask::new();
        let raw = mask.format_raw();
        assert_eq!(raw, "0".repeat(RAW_NIBBLES));
        assert_eq!(FilterMask::parse_raw(&raw).unwrap(), mask);
    }

    #[test]
    fn copy_frame_preserves_order_and_length() {
        let mut frame = vec![0u8; FA_FRAME_SIZE];
        for id in 0..FA_ENTRY_COUNT {
            let x = id as i32;
            let y = -(id as i32);
            frame[id * FA_ENTRY_SIZE..id * FA_ENTRY_SIZE + 4].copy_from_slice(&x.to_ne_bytes());
            frame[id * FA_ENTRY_SIZE + 4..id * FA_ENTRY_SIZE + 8].copy_from_slice(&y.to_ne_bytes());
        }

        let mask = FilterMask::parse("1,3,200").unwrap();
        let mut out = vec![0u8; mask.count() as usize * FA_ENTRY_SIZE];
        let written = mask.copy_frame(&mut out, &frame);
        assert_eq!(written, 24);

        let expect_ids = [1usize, 3, 200];
        for (slot, &id) in expect_ids.iter().enumerate() {
            let x = i32::from_ne_bytes(out[slot * 8..slot * 8 + 4].try_into().unwrap());
            let y = i32::from_ne_bytes(out[slot * 8 + 4..slot * 8 + 8].try_into().unwrap());
            assert_eq!(x, id as i32);
            assert_eq!(y, -(id as i32));
        }
    }

    proptest::proptest! {
        #[test]
        fn raw_round_trip_arbitrary(bits in proptest::collection::vec(any::<bool>(), FA_ENTRY_COUNT)) {
            let mut mask = FilterMask::new();
            for (id, set) in bits.into_iter().enumerate() {
                if set {
                    mask.set_bit(id);
                }
            }
            let raw = mask.format_raw();
            proptest::prop_assert_eq!(FilterMask::parse_raw(&raw).unwrap(), mask);
        }
    }
}
