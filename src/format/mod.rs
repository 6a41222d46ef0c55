//! Saved-info file format: writing version 2.0 records and tolerant reading
//! of versions 2.0 and 0.
//!
//! # Reading
//! Damage to the record itself is expected and handled at three levels:
//!
//! 1. Header and trailer carry the same scalars and both are read.  If the
//!    header does not parse, or implies a size other than the stream's, the
//!    trailer is used and block 0 of row 1 is marked unreadable, since its
//!    tail sits right after the damaged header.  If both parse but disagree,
//!    the copy whose values satisfy the metadata guard wins, the trailer on
//!    a tie.  Either way the record is flagged for rebuild.
//! 2. A block whose read fails becomes an unreadable (`None`) slot; reading
//!    continues with the next block at its computed offset.
//! 3. A checksum table that cannot be read, whose repeated count disagrees,
//!    or whose guard checksum does not match, is dropped entirely and the
//!    record is flagged for rebuild.  The rows still allow structural
//!    recovery without per-block verification.
//!
//! Only when neither header nor trailer yields a consistent layout is the
//! record rejected; [`decode_or_empty`] turns that into an empty record.

pub mod header;
pub mod legacy;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::{debug, warn};

use crate::block::{Block, BlockPool, BLOCK_SIZE};
use crate::checksum::{metadata_checksum, BLOCK_CHECKSUM_LEN, METADATA_CHECKSUM_LEN};
use crate::model::{Checksum, RedundancyModel, Row};
use crate::stream::{read_full, read_full_at, stream_len, ReadOutcome};

pub use header::{FormatError, Header, Layout, Trailer, LEGACY_MARKER, SIGNATURE_V2, TRAILER_LEN};

// ── Write ─────────────────────────────────────────────────────────────────────

/// Write `model` as a version 2.0 record.
pub fn encode<W: Write>(model: &RedundancyModel, mut writer: W) -> Result<(), FormatError> {
    if model.has_unreadable_slots() {
        return Err(FormatError::IncompleteRecord);
    }

    let header = header_of(model);
    let layout = header.layout()?;
    header.write(&mut writer)?;

    let blocks: Vec<&Block> = model.rows().iter().flat_map(|r| r.slots().iter().flatten()).collect();
    if let Some((first, rest)) = blocks.split_first() {
        first.write_last(&mut writer, layout.split_tail_len())?;
        for b in rest {
            b.write_all_to(&mut writer)?;
        }
        first.write_first(&mut writer, layout.header_len as usize)?;
    }

    let checksums = model.checksums();
    writer.write_i64::<BigEndian>(checksums.len() as i64)?;
    for sum in checksums {
        writer.write_all(sum)?;
    }
    writer.write_all(&metadata_checksum(header.timestamp_ticks, header.file_length, checksums))?;

    Trailer { header }.write(&mut writer)?;
    writer.flush()?;
    Ok(())
}

fn header_of(model: &RedundancyModel) -> Header {
    Header {
        timestamp_ticks: header::to_ticks(model.timestamp()),
        file_length:     model.file_length() as i64,
        checksum_count:  model.checksums().len() as i64,
        row_lengths:     model.rows().iter().map(|r| r.len() as i64).collect(),
    }
}

// ── Read ──────────────────────────────────────────────────────────────────────

/// Read a record of any supported version.
pub fn decode<R: Read + Seek>(reader: &mut R, pool: &dyn BlockPool) -> Result<RedundancyModel, FormatError> {
    let actual = stream_len(reader)?;
    reader.seek(SeekFrom::Start(0))?;

    let mut first = [0u8; 1];
    if let ReadOutcome::Data(1) = read_full(reader, &mut first) {
        if first[0] == LEGACY_MARKER {
            match legacy::decode(reader, actual, pool) {
                Ok(model) => return Ok(model),
                // A zeroed v2 header looks like a legacy marker too.
                Err(e) => debug!(error = %e, "not a version 0 record"),
            }
        }
    }

    let chosen = choose_scalars(reader, actual)?;
    let rows = read_rows(reader, &chosen.layout, chosen.skip_first, pool);
    let damaged = chosen.damaged || chosen.checksums.is_none();
    model_from(&chosen.header, rows, chosen.checksums.unwrap_or_default(), damaged)
}

/// The header copy a record is read with.
struct Chosen {
    header:     Header,
    layout:     Layout,
    /// Block 0 of row 1 overlaps the unusable leading header.
    skip_first: bool,
    damaged:    bool,
    checksums:  Option<Vec<Checksum>>,
}

fn choose_scalars<R: Read + Seek>(reader: &mut R, actual: u64) -> Result<Chosen, FormatError> {
    let leading = read_leading_header(reader, actual);
    let trailing = read_trailing_header(reader, actual);

    let chosen = match (leading, trailing) {
        (Ok((header, layout)), Ok((trailer, _))) if header == trailer => {
            let checksums = checksums_for(reader, &header, &layout);
            Chosen { header, layout, skip_first: false, damaged: false, checksums }
        }
        (Ok((header, layout)), Ok((trailer, trailer_layout))) => {
            warn!(?header, ?trailer, "saved-info header and trailer disagree");
            let from_header = checksums_for(reader, &header, &layout);
            let from_trailer = checksums_for(reader, &trailer, &trailer_layout);
            if from_header.is_some() && from_trailer.is_none() {
                Chosen { header, layout, skip_first: false, damaged: true, checksums: from_header }
            } else {
                debug!(guard_holds = from_trailer.is_some(), "keeping trailer scalars");
                Chosen {
                    header:     trailer,
                    layout:     trailer_layout,
                    skip_first: false,
                    damaged:    true,
                    checksums:  from_trailer,
                }
            }
        }
        (Ok((header, layout)), Err(e)) => {
            warn!(error = %e, "saved-info trailer unusable, using header");
            let checksums = checksums_for(reader, &header, &layout);
            Chosen { header, layout, skip_first: false, damaged: true, checksums }
        }
        (Err(e), Ok((trailer, layout))) => {
            warn!(error = %e, "saved-info header unusable, using trailer");
            let checksums = checksums_for(reader, &trailer, &layout);
            Chosen { header: trailer, layout, skip_first: true, damaged: true, checksums }
        }
        (Err(_), Err(e)) => return Err(e),
    };
    Ok(chosen)
}

fn checksums_for<R: Read + Seek>(reader: &mut R, header: &Header, layout: &Layout) -> Option<Vec<Checksum>> {
    read_checksum_table(
        reader,
        layout.checksum_section_offset(),
        layout.checksum_count,
        header.timestamp_ticks,
        header.file_length,
    )
}

/// [`decode`], with every failure collapsed into an empty record.
pub fn decode_or_empty<R: Read + Seek>(reader: &mut R, pool: &dyn BlockPool) -> RedundancyModel {
    decode(reader, pool).unwrap_or_else(|e| {
        warn!(error = %e, "saved info unreadable, treating as absent");
        RedundancyModel::empty()
    })
}

fn read_leading_header<R: Read + Seek>(reader: &mut R, actual: u64) -> Result<(Header, Layout), FormatError> {
    reader.seek(SeekFrom::Start(0))?;
    let header = Header::read(&mut *reader)?;
    let layout = header.layout()?;
    check_size(&layout, actual)?;
    Ok((header, layout))
}

fn read_trailing_header<R: Read + Seek>(reader: &mut R, actual: u64) -> Result<(Header, Layout), FormatError> {
    if actual < TRAILER_LEN {
        return Err(FormatError::SizeMismatch { expected: TRAILER_LEN, actual });
    }
    reader.seek(SeekFrom::Start(actual - TRAILER_LEN))?;
    let header = Trailer::read(&mut *reader)?.header;
    let layout = header.layout()?;
    check_size(&layout, actual)?;
    debug!(rows = ?header.row_lengths, "layout recovered from trailer");
    Ok((header, layout))
}

fn check_size(layout: &Layout, actual: u64) -> Result<(), FormatError> {
    if layout.total_len() != actual {
        return Err(FormatError::SizeMismatch { expected: layout.total_len(), actual });
    }
    Ok(())
}

pub(crate) fn model_from(
    header:    &Header,
    rows:      Vec<Row>,
    checksums: Vec<Checksum>,
    damaged:   bool,
) -> Result<RedundancyModel, FormatError> {
    let timestamp = header::from_ticks(header.timestamp_ticks)
        .ok_or_else(|| FormatError::Implausible(format!("timestamp {}", header.timestamp_ticks)))?;
    let mut model = RedundancyModel::from_parts(header.file_length as u64, timestamp, rows, checksums);
    if damaged {
        model.mark_metadata_damaged();
    }
    Ok(model)
}

/// Read every row; unreadable blocks become `None` slots.
pub(crate) fn read_rows<R: Read + Seek>(
    reader:      &mut R,
    layout:      &Layout,
    skip_first:  bool,
    pool:        &dyn BlockPool,
) -> Vec<Row> {
    let mut rows = Vec::with_capacity(layout.row_lengths.len());
    let mut flat = 0u64;
    for (r, &len) in layout.row_lengths.iter().enumerate() {
        let mut slots = Vec::with_capacity(len as usize);
        for slot in 0..len {
            let block = if flat == 0 && skip_first {
                None
            } else if flat == 0 && layout.is_split() {
                read_split_block(reader, layout, pool)
            } else {
                read_block_at(reader, layout.block_offset(flat), pool)
            };
            if block.is_none() {
                warn!(row = r + 1, slot, "saved-info block unreadable");
            }
            slots.push(block);
            flat += 1;
        }
        rows.push(Row::from_slots(slots));
    }
    rows
}

fn read_block_at<R: Read + Seek>(reader: &mut R, offset: u64, pool: &dyn BlockPool) -> Option<Block> {
    let mut b = pool.acquire();
    match read_full_at(reader, offset, &mut b[..]) {
        o if o.is_complete(BLOCK_SIZE) => Some(b),
        o => {
            debug!(offset, outcome = ?o, "block read failed");
            pool.release(b);
            None
        }
    }
}

fn read_split_block<R: Read + Seek>(reader: &mut R, layout: &Layout, pool: &dyn BlockPool) -> Option<Block> {
    let tail_len = layout.split_tail_len();
    let head_len = layout.header_len as usize;
    let mut b = pool.acquire();
    let tail_ok = read_full_at(reader, layout.header_len, b.last_mut(tail_len)).is_complete(tail_len);
    let head_ok = tail_ok
        && read_full_at(reader, layout.split_head_offset(), b.first_mut(head_len)).is_complete(head_len);
    if head_ok {
        Some(b)
    } else {
        pool.release(b);
        None
    }
}

/// Read and verify the checksum table; `None` on any inconsistency.
pub(crate) fn read_checksum_table<R: Read + Seek>(
    reader:          &mut R,
    offset:          u64,
    expected_count:  u64,
    timestamp_ticks: i64,
    file_length:     i64,
) -> Option<Vec<Checksum>> {
    let mut count = [0u8; 8];
    if !read_full_at(reader, offset, &mut count).is_complete(8) {
        warn!("checksum count unreadable, ignoring checksums");
        return None;
    }
    let stored = BigEndian::read_i64(&count);
    if stored < 0 || stored as u64 != expected_count {
        warn!(stored, expected_count, "checksum count disagrees with header, ignoring checksums");
        return None;
    }

    let table_len = expected_count as usize * BLOCK_CHECKSUM_LEN;
    let mut raw = vec![0u8; table_len + METADATA_CHECKSUM_LEN];
    if !read_full(reader, &mut raw).is_complete(raw.len()) {
        warn!("checksum table unreadable, ignoring checksums");
        return None;
    }

    let (table, guard) = raw.split_at(table_len);
    let checksums: Vec<Checksum> = table
        .chunks_exact(BLOCK_CHECKSUM_LEN)
        .map(|c| [c[0], c[1], c[2]])
        .collect();
    if metadata_checksum(timestamp_ticks, file_length, &checksums)[..] != guard[..] {
        warn!("checksum table fails its guard checksum, ignoring checksums");
        return None;
    }
    Some(checksums)
}

// ── Convenience ───────────────────────────────────────────────────────────────

impl RedundancyModel {
    /// See [`encode`].
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), FormatError> {
        encode(self, writer)
    }

    /// See [`decode`].
    pub fn read_from<R: Read + Seek>(reader: &mut R, pool: &dyn BlockPool) -> Result<Self, FormatError> {
        decode(reader, pool)
    }
}
