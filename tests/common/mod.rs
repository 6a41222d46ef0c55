#![allow(dead_code)]

use chrono::{DateTime, Utc};
use savedinfo::{Block, HeapPool, RedundancyModel, RowSizing, BLOCK_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

/// A `Read + Seek` stream over memory that fails any read touching one of
/// the `bad` byte ranges, like a disk with unreadable sectors.
pub struct FaultyReader {
    inner: Cursor<Vec<u8>>,
    bad:   Vec<Range<u64>>,
    pub failed_reads: usize,
}

impl FaultyReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { inner: Cursor::new(data), bad: Vec::new(), failed_reads: 0 }
    }

    /// Make block `index` unreadable.
    pub fn bad_block(mut self, index: u64) -> Self {
        let start = index * BLOCK_SIZE as u64;
        self.bad.push(start + 1..start + 2);
        self
    }

    /// Make every read overlapping `range` fail.
    pub fn bad_range(mut self, range: Range<u64>) -> Self {
        self.bad.push(range);
        self
    }
}

impl Read for FaultyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.inner.position();
        let end = pos + buf.len() as u64;
        if self.bad.iter().any(|r| r.start < end && pos < r.end) {
            self.failed_reads += 1;
            return Err(io::Error::new(io::ErrorKind::Other, "simulated bad sector"));
        }
        self.inner.read(buf)
    }
}

impl Seek for FaultyReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Deterministic, non-repeating test content.
pub fn content(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

pub fn fixed_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_650_000_000, 123_400_000).unwrap()
}

pub fn encode_with(data: &[u8], sizing: RowSizing) -> RedundancyModel {
    let mut m = RedundancyModel::with_sizing(data.len() as u64, fixed_time(), sizing, &HeapPool);
    for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        m.observe_for_encoding(&Block::from_slice(chunk), i as u64);
    }
    m
}

/// Offer every block of `data` except those in `missing`.
pub fn observe_all_but(model: &mut RedundancyModel, data: &[u8], missing: &[u64]) {
    model.start_restore();
    for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        if !missing.contains(&(i as u64)) {
            assert!(model.observe_for_test_or_restore(&Block::from_slice(chunk), i as u64));
        }
    }
}

pub fn block_of(data: &[u8], index: u64) -> &[u8] {
    let start = index as usize * BLOCK_SIZE;
    &data[start..(start + BLOCK_SIZE).min(data.len())]
}

/// Overwrite bytes of `path` in place without changing its modification time.
pub fn damage_in_place(path: &Path, offset: u64, bytes: &[u8]) {
    let modified = fs::metadata(path).unwrap().modified().unwrap();
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
    f.set_modified(modified).unwrap();
}

/// Flip every byte of `path` in `range`.
pub fn flip_bytes(path: &Path, range: Range<usize>) {
    let mut data = fs::read(path).unwrap();
    for b in &mut data[range] {
        *b ^= 0xA5;
    }
    let modified = fs::metadata(path).unwrap().modified().unwrap();
    fs::write(path, &data).unwrap();
    File::options().write(true).open(path).unwrap().set_modified(modified).unwrap();
}
