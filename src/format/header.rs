//! Scalar metadata of a saved-info file: the leading header, the trailing
//! duplicate, and the byte layout they imply.
//!
//! # Header (v2.0)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 28 | `"SyncFolders Saved Info v2.0"` + `0x1A` |
//! | 28 | 8 | modification time, ticks (100 ns since 0001-01-01 UTC) |
//! | 36 | 8 | original file length |
//! | 44 | 8 | checksum count |
//! | 52 | 8 | row count (0–2) |
//! | 60 | 8 × rows | blocks per row |
//!
//! # Trailer (84 bytes, last in the file)
//!
//! | Size | Field |
//! |------|-------|
//! | 8 | blocks in row 1 (0 if absent) |
//! | 8 | blocks in row 2 (0 if absent) |
//! | 28 | signature |
//! | 8 | ticks |
//! | 8 | file length |
//! | 8 | checksum count |
//! | 8 | row count |
//! | 8 | reserved, 0 |
//!
//! All integers are big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::block::BLOCK_SIZE;
use crate::checksum::{BLOCK_CHECKSUM_LEN, METADATA_CHECKSUM_LEN};
use crate::sizing::blocks_for_length;

pub const SIGNATURE_V2: &[u8; 28] = b"SyncFolders Saved Info v2.0\x1a";
/// First byte of a version 0 record.
pub const LEGACY_MARKER: u8 = 0x00;
pub const MAX_ROWS: usize = 2;
pub const FIXED_HEADER_LEN: u64 = SIGNATURE_V2.len() as u64 + 4 * 8;
pub const TRAILER_LEN: u64 = 2 * 8 + SIGNATURE_V2.len() as u64 + 5 * 8;

/// Ticks at 1970-01-01T00:00:00Z.
pub const TICKS_AT_UNIX_EPOCH: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Signature does not match a saved-info record")]
    BadSignature,
    #[error("Unsupported layout: {0}")]
    UnsupportedLayout(String),
    #[error("Size mismatch: metadata implies {expected} bytes, stream has {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Implausible metadata: {0}")]
    Implausible(String),
    #[error("Record has unreadable slots and cannot be written")]
    IncompleteRecord,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Ticks ─────────────────────────────────────────────────────────────────────

pub fn to_ticks(t: DateTime<Utc>) -> i64 {
    t.timestamp() * TICKS_PER_SECOND + i64::from(t.timestamp_subsec_nanos() / 100) + TICKS_AT_UNIX_EPOCH
}

pub fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(TICKS_AT_UNIX_EPOCH)?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

// ── Header ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub timestamp_ticks: i64,
    pub file_length:     i64,
    pub checksum_count:  i64,
    pub row_lengths:     Vec<i64>,
}

impl Header {
    /// Bytes the header occupies on disk.
    pub fn len(&self) -> u64 {
        FIXED_HEADER_LEN + 8 * self.row_lengths.len() as u64
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(SIGNATURE_V2)?;
        writer.write_i64::<BigEndian>(self.timestamp_ticks)?;
        writer.write_i64::<BigEndian>(self.file_length)?;
        writer.write_i64::<BigEndian>(self.checksum_count)?;
        writer.write_i64::<BigEndian>(self.row_lengths.len() as i64)?;
        for &n in &self.row_lengths {
            writer.write_i64::<BigEndian>(n)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, FormatError> {
        let mut sig = [0u8; 28];
        reader.read_exact(&mut sig)?;
        if &sig != SIGNATURE_V2 {
            return Err(FormatError::BadSignature);
        }
        let timestamp_ticks = reader.read_i64::<BigEndian>()?;
        let file_length = reader.read_i64::<BigEndian>()?;
        let checksum_count = reader.read_i64::<BigEndian>()?;
        let row_count = reader.read_i64::<BigEndian>()?;
        if !(0..=MAX_ROWS as i64).contains(&row_count) {
            return Err(FormatError::UnsupportedLayout(format!("{row_count} rows")));
        }
        let mut row_lengths = Vec::with_capacity(row_count as usize);
        for _ in 0..row_count {
            row_lengths.push(reader.read_i64::<BigEndian>()?);
        }
        Ok(Self { timestamp_ticks, file_length, checksum_count, row_lengths })
    }

    /// Range checks that do not need the stream.
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.file_length < 0 {
            return Err(FormatError::Implausible(format!("file length {}", self.file_length)));
        }
        if from_ticks(self.timestamp_ticks).is_none() {
            return Err(FormatError::Implausible(format!("timestamp {}", self.timestamp_ticks)));
        }
        let blocks = blocks_for_length(self.file_length as u64);
        if self.checksum_count < 0 || self.checksum_count as u64 > blocks {
            return Err(FormatError::Implausible(format!(
                "{} checksums for {} blocks",
                self.checksum_count, blocks
            )));
        }
        if self.row_lengths.iter().any(|&n| n <= 0) {
            return Err(FormatError::Implausible(format!("row lengths {:?}", self.row_lengths)));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<Layout, FormatError> {
        self.validate()?;
        Layout::v2(
            self.row_lengths.iter().map(|&n| n as u64).collect(),
            self.checksum_count as u64,
        )
    }
}

// ── Trailer ───────────────────────────────────────────────────────────────────

/// The duplicate of the header scalars kept at the very end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub header: Header,
}

impl Trailer {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let h = &self.header;
        writer.write_i64::<BigEndian>(h.row_lengths.first().copied().unwrap_or(0))?;
        writer.write_i64::<BigEndian>(h.row_lengths.get(1).copied().unwrap_or(0))?;
        writer.write_all(SIGNATURE_V2)?;
        writer.write_i64::<BigEndian>(h.timestamp_ticks)?;
        writer.write_i64::<BigEndian>(h.file_length)?;
        writer.write_i64::<BigEndian>(h.checksum_count)?;
        writer.write_i64::<BigEndian>(h.row_lengths.len() as i64)?;
        writer.write_i64::<BigEndian>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, FormatError> {
        let row1 = reader.read_i64::<BigEndian>()?;
        let row2 = reader.read_i64::<BigEndian>()?;
        let mut sig = [0u8; 28];
        reader.read_exact(&mut sig)?;
        if &sig != SIGNATURE_V2 {
            return Err(FormatError::BadSignature);
        }
        let timestamp_ticks = reader.read_i64::<BigEndian>()?;
        let file_length = reader.read_i64::<BigEndian>()?;
        let checksum_count = reader.read_i64::<BigEndian>()?;
        let row_count = reader.read_i64::<BigEndian>()?;
        let reserved = reader.read_i64::<BigEndian>()?;
        if reserved != 0 {
            return Err(FormatError::Implausible(format!("reserved trailer field {reserved}")));
        }
        let row_lengths = match row_count {
            0 => vec![],
            1 => vec![row1],
            2 => vec![row1, row2],
            n => return Err(FormatError::UnsupportedLayout(format!("{n} rows"))),
        };
        Ok(Self { header: Header { timestamp_ticks, file_length, checksum_count, row_lengths } })
    }
}

// ── Layout ────────────────────────────────────────────────────────────────────

/// Byte positions of everything after the header.
///
/// Rows are stored back to back as one flat sequence of blocks.  Block 0 of
/// row 1 is split so that every other block starts on a `BLOCK_SIZE`
/// boundary: its last `BLOCK_SIZE - header_len` bytes follow the header and
/// its first `header_len` bytes follow the last block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub header_len:     u64,
    pub row_lengths:    Vec<u64>,
    pub checksum_count: u64,
    /// Offset of flat block 1; flat block `f >= 1` sits at `first + (f-1)·BLOCK_SIZE`.
    first_aligned:      u64,
    split_first:        bool,
    total_len:          u64,
}

impl Layout {
    pub fn v2(row_lengths: Vec<u64>, checksum_count: u64) -> Result<Self, FormatError> {
        let header_len = FIXED_HEADER_LEN + 8 * row_lengths.len() as u64;
        let split_first = !row_lengths.is_empty();
        let first_aligned = if split_first { BLOCK_SIZE as u64 } else { header_len };
        Self::build(header_len, row_lengths, checksum_count, first_aligned, split_first, TRAILER_LEN)
    }

    /// Version 0: blocks follow the header unsplit, no trailer.
    pub fn legacy(header_len: u64, row_lengths: Vec<u64>, checksum_count: u64) -> Result<Self, FormatError> {
        Self::build(header_len, row_lengths, checksum_count, header_len + BLOCK_SIZE as u64, false, 0)
    }

    fn build(
        header_len:     u64,
        row_lengths:    Vec<u64>,
        checksum_count: u64,
        first_aligned:  u64,
        split_first:    bool,
        trailer_len:    u64,
    ) -> Result<Self, FormatError> {
        let overflow = || FormatError::Implausible("layout overflows".into());
        let blocks = row_lengths.iter().try_fold(0u64, |acc, &n| acc.checked_add(n)).ok_or_else(overflow)?;
        let block_bytes = blocks.checked_mul(BLOCK_SIZE as u64).ok_or_else(overflow)?;
        let table = checksum_count.checked_mul(BLOCK_CHECKSUM_LEN as u64).ok_or_else(overflow)?;
        let total_len = [block_bytes, 8, table, METADATA_CHECKSUM_LEN as u64, trailer_len]
            .into_iter()
            .try_fold(header_len, |acc, n| acc.checked_add(n))
            .ok_or_else(overflow)?;
        Ok(Self { header_len, row_lengths, checksum_count, first_aligned, split_first, total_len })
    }

    pub fn total_blocks(&self) -> u64 {
        self.row_lengths.iter().sum()
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn is_split(&self) -> bool {
        self.split_first
    }

    /// Flat index of slot `slot` in row `row`.
    pub fn flat_index(&self, row: usize, slot: u64) -> u64 {
        self.row_lengths[..row].iter().sum::<u64>() + slot
    }

    /// Offset of a whole (unsplit) block.
    pub fn block_offset(&self, flat: u64) -> u64 {
        if flat == 0 {
            self.header_len
        } else {
            self.first_aligned + (flat - 1) * BLOCK_SIZE as u64
        }
    }

    /// Length of the tail part of the split block, stored right after the header.
    pub fn split_tail_len(&self) -> usize {
        BLOCK_SIZE - self.header_len as usize
    }

    /// Offset of the head part of the split block, right after the last
    /// aligned block.
    pub fn split_head_offset(&self) -> u64 {
        self.total_blocks() * BLOCK_SIZE as u64
    }

    /// Offset of the repeated checksum count.
    pub fn checksum_section_offset(&self) -> u64 {
        self.header_len + self.total_blocks() * BLOCK_SIZE as u64
    }

    pub fn trailer_offset(&self) -> u64 {
        self.checksum_section_offset()
            + 8
            + self.checksum_count * BLOCK_CHECKSUM_LEN as u64
            + METADATA_CHECKSUM_LEN as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header(rows: Vec<i64>) -> Header {
        Header { timestamp_ticks: 638_000_000_000_000_000, file_length: 1 << 20, checksum_count: 256, row_lengths: rows }
    }

    #[test]
    fn signature_is_27_chars_plus_eof_marker() {
        assert_eq!(&SIGNATURE_V2[..27], b"SyncFolders Saved Info v2.0");
        assert_eq!(SIGNATURE_V2[27], 0x1A);
    }

    #[test]
    fn header_bytes_are_big_endian() {
        let mut out = Vec::new();
        header(vec![16, 33]).write(&mut out).unwrap();
        assert_eq!(out.len() as u64, header(vec![16, 33]).len());
        assert_eq!(out.len(), 76);
        assert_eq!(&out[36..44], &(1i64 << 20).to_be_bytes());
        assert_eq!(&out[68..76], &33i64.to_be_bytes());
    }

    #[test]
    fn header_and_trailer_carry_the_same_scalars() {
        let h = header(vec![16, 33]);
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(Header::read(Cursor::new(&buf)).unwrap(), h);

        let mut buf = Vec::new();
        Trailer { header: h.clone() }.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, TRAILER_LEN);
        assert_eq!(Trailer::read(Cursor::new(&buf)).unwrap().header, h);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut buf = Vec::new();
        header(vec![16]).write(&mut buf).unwrap();
        buf[3] = b'x';
        assert!(matches!(Header::read(Cursor::new(&buf)), Err(FormatError::BadSignature)));
    }

    #[test]
    fn ticks_round_trip_through_chrono() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_700).unwrap();
        assert_eq!(from_ticks(to_ticks(t)), Some(t));
        assert_eq!(to_ticks(DateTime::from_timestamp(0, 0).unwrap()), TICKS_AT_UNIX_EPOCH);
    }

    #[test]
    fn split_layout_aligns_every_other_block() {
        let l = header(vec![16, 33]).layout().unwrap();
        assert_eq!(l.header_len, 76);
        assert_eq!(l.split_tail_len(), BLOCK_SIZE - 76);
        assert_eq!(l.block_offset(1), BLOCK_SIZE as u64);
        assert_eq!(l.block_offset(l.flat_index(1, 0)), 16 * BLOCK_SIZE as u64);
        assert_eq!(l.split_head_offset(), 49 * BLOCK_SIZE as u64);
        assert_eq!(l.checksum_section_offset(), 49 * BLOCK_SIZE as u64 + 76);
        assert_eq!(l.total_len(), l.trailer_offset() + TRAILER_LEN);
    }

    #[test]
    fn absurd_counts_do_not_overflow() {
        assert!(Layout::v2(vec![u64::MAX / 2, u64::MAX / 2], 3).is_err());
        let mut h = header(vec![16]);
        h.checksum_count = 1 << 40;
        assert!(h.layout().is_err());
    }
}
