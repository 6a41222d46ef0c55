//! Version 0 records, read-only.
//!
//! ```text
//! 0x00 | max_version u8 | ticks i64 | file length i64 | row 1 blocks i64 |
//! row 2 blocks i64 | blocks... | checksum count i64 | checksums | guard (31 B)
//! ```
//!
//! Blocks are stored unsplit and there is no trailer, so a damaged header
//! cannot be recovered.  Everything after the header is read as tolerantly as
//! in version 2.0.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, warn};

use super::header::{FormatError, Header, Layout, LEGACY_MARKER};
use super::{model_from, read_checksum_table, read_rows};
use crate::block::BlockPool;
use crate::checksum::{BLOCK_CHECKSUM_LEN, METADATA_CHECKSUM_LEN};
use crate::model::RedundancyModel;
use crate::stream::read_full_at;

pub const HEADER_LEN: u64 = 2 + 4 * 8;

pub fn decode<R: Read + Seek>(
    reader: &mut R,
    actual: u64,
    pool:   &dyn BlockPool,
) -> Result<RedundancyModel, FormatError> {
    reader.seek(SeekFrom::Start(0))?;
    if reader.read_u8()? != LEGACY_MARKER {
        return Err(FormatError::BadSignature);
    }
    let max_version = reader.read_u8()?;
    let timestamp_ticks = reader.read_i64::<BigEndian>()?;
    let file_length = reader.read_i64::<BigEndian>()?;
    let row1 = reader.read_i64::<BigEndian>()?;
    let row2 = reader.read_i64::<BigEndian>()?;
    debug!(max_version, "version 0 saved info");

    let row_lengths = match (row1, row2) {
        (0, 0) => vec![],
        (n, 0) => vec![n],
        (0, _) => return Err(FormatError::UnsupportedLayout("second row without first".into())),
        (n, m) => vec![n, m],
    };
    let mut header = Header { timestamp_ticks, file_length, checksum_count: 0, row_lengths };
    header.validate()?;
    let rows: Vec<u64> = header.row_lengths.iter().map(|&n| n as u64).collect();

    let section = Layout::legacy(HEADER_LEN, rows.clone(), 0)?.checksum_section_offset();
    if section > actual {
        return Err(FormatError::SizeMismatch { expected: section, actual });
    }
    let mut count = [0u8; 8];
    let count_readable = read_full_at(reader, section, &mut count).is_complete(8);
    header.checksum_count = if count_readable {
        BigEndian::read_i64(&count)
    } else {
        // Infer the table size from what is left of the stream.
        let rest = actual.saturating_sub(section + 8 + METADATA_CHECKSUM_LEN as u64);
        warn!("version 0 checksum count unreadable, inferring from size");
        (rest / BLOCK_CHECKSUM_LEN as u64) as i64
    };
    header.validate()?;

    let layout = Layout::legacy(HEADER_LEN, rows, header.checksum_count as u64)?;
    if layout.total_len() != actual {
        return Err(FormatError::SizeMismatch { expected: layout.total_len(), actual });
    }

    let rows = read_rows(reader, &layout, false, pool);
    let checksums = if count_readable {
        read_checksum_table(reader, section, layout.checksum_count, timestamp_ticks, file_length)
    } else {
        None
    };
    let damaged = checksums.is_none();
    model_from(&header, rows, checksums.unwrap_or_default(), damaged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, HeapPool, BLOCK_SIZE};
    use crate::checksum::{block_checksum, metadata_checksum};
    use crate::format::decode;
    use byteorder::WriteBytesExt;
    use std::io::{Cursor, Write};

    /// Lay out a version 0 record by hand.
    fn legacy_bytes(blocks: &[Block], rows: (i64, i64), file_length: i64) -> (Vec<u8>, Vec<[u8; 3]>) {
        let ticks = 637_000_000_000_000_000i64;
        let n_blocks = (file_length as usize).div_ceil(BLOCK_SIZE);
        let sums: Vec<[u8; 3]> = (0..n_blocks).map(|i| block_checksum(&[i as u8; 16], 16)).collect();

        let mut out = Vec::new();
        out.write_u8(0).unwrap();
        out.write_u8(1).unwrap();
        out.write_i64::<BigEndian>(ticks).unwrap();
        out.write_i64::<BigEndian>(file_length).unwrap();
        out.write_i64::<BigEndian>(rows.0).unwrap();
        out.write_i64::<BigEndian>(rows.1).unwrap();
        for b in blocks {
            out.write_all(b).unwrap();
        }
        out.write_i64::<BigEndian>(sums.len() as i64).unwrap();
        for s in &sums {
            out.write_all(s).unwrap();
        }
        out.write_all(&metadata_checksum(ticks, file_length, &sums)).unwrap();
        (out, sums)
    }

    fn blocks(n: u8) -> Vec<Block> {
        (1..=n).map(|i| Block::from_slice(&[i; 40])).collect()
    }

    #[test]
    fn two_row_record_is_read() {
        let bl = blocks(5);
        let (bytes, sums) = legacy_bytes(&bl, (2, 3), 10 * BLOCK_SIZE as i64);
        let m = decode(&mut Cursor::new(bytes), &HeapPool).unwrap();
        assert_eq!(m.rows().len(), 2);
        assert_eq!(m.primary_row().unwrap().get(1), Some(&bl[1]));
        assert_eq!(m.secondary_row().unwrap().get(0), Some(&bl[2]));
        assert_eq!(m.checksums(), &sums[..]);
        assert_eq!(m.file_length(), 10 * BLOCK_SIZE as u64);
    }

    #[test]
    fn single_row_record_is_read() {
        let bl = blocks(3);
        let (bytes, _) = legacy_bytes(&bl, (3, 0), 3 * BLOCK_SIZE as i64);
        let m = decode(&mut Cursor::new(bytes), &HeapPool).unwrap();
        assert_eq!(m.rows().len(), 1);
        assert!(m.secondary_row().is_none());
    }

    #[test]
    fn wrong_size_is_rejected() {
        let (mut bytes, _) = legacy_bytes(&blocks(3), (3, 0), 3 * BLOCK_SIZE as i64);
        bytes.push(0);
        assert!(decode(&mut Cursor::new(bytes), &HeapPool).is_err());
    }

    #[test]
    fn bad_guard_drops_checksums_only() {
        let (mut bytes, _) = legacy_bytes(&blocks(3), (3, 0), 3 * BLOCK_SIZE as i64);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let m = decode(&mut Cursor::new(bytes), &HeapPool).unwrap();
        assert!(m.checksums().is_empty());
        assert_eq!(m.rows()[0].len(), 3);
        assert!(m.metadata_damaged());
        assert!(!m.has_unreadable_slots());
    }
}
