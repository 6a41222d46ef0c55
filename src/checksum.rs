//! Rotating XOR checksums.
//!
//! Both kinds fold every input byte into `buffer[pos]` and advance `pos`
//! modulo the buffer length.  They are integrity signals, not
//! authentication: collisions are possible and accepted.

/// Length of a per-block checksum.
pub const BLOCK_CHECKSUM_LEN: usize = 3;
/// Length of the checksum guarding the stored metadata and checksum table.
pub const METADATA_CHECKSUM_LEN: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatingXor<const N: usize> {
    buffer: [u8; N],
    pos:    usize,
}

impl<const N: usize> RotatingXor<N> {
    pub fn new() -> Self {
        Self { buffer: [0u8; N], pos: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            self.buffer[self.pos] ^= b;
            self.pos += 1;
            if self.pos == N {
                self.pos = 0;
            }
        }
    }

    pub fn finalize(&self) -> [u8; N] {
        self.buffer
    }
}

impl<const N: usize> Default for RotatingXor<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub type BlockChecksum    = RotatingXor<BLOCK_CHECKSUM_LEN>;
pub type MetadataChecksum = RotatingXor<METADATA_CHECKSUM_LEN>;

/// Checksum of the first `len` bytes of `data`.
pub fn block_checksum(data: &[u8], len: usize) -> [u8; BLOCK_CHECKSUM_LEN] {
    let mut c = BlockChecksum::new();
    c.update(&data[..len.min(data.len())]);
    c.finalize()
}

/// Checksum stored next to the checksum table.
///
/// Fed with the record's identity values and the raw table, so a record whose
/// scalars were recovered from the trailer still validates.
pub fn metadata_checksum(
    timestamp_ticks: i64,
    file_length:     i64,
    checksums:       &[[u8; BLOCK_CHECKSUM_LEN]],
) -> [u8; METADATA_CHECKSUM_LEN] {
    let mut c = MetadataChecksum::new();
    c.update(&timestamp_ticks.to_be_bytes());
    c.update(&file_length.to_be_bytes());
    c.update(&(checksums.len() as i64).to_be_bytes());
    for sum in checksums {
        c.update(sum);
    }
    c.finalize()
}
