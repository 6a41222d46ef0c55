//! Fixed-size blocks and the pool they are drawn from.
//!
//! A [`Block`] is the unit of I/O and of XOR arithmetic.  Every original file
//! block, every row slot and every piece of restore data is one `Block`.
//! Blocks are always `BLOCK_SIZE` bytes; a short final file block is carried
//! zero-padded and only its valid prefix is ever XORed or checksummed.

use std::io::{self, Write};
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Size of one block in bytes.
pub const BLOCK_SIZE: usize = 4096;

// ── Block ─────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    data: Box<[u8; BLOCK_SIZE]>,
}

impl Block {
    /// A zero-filled block.
    pub fn new() -> Self {
        Self { data: Box::new([0u8; BLOCK_SIZE]) }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut b = Self::new();
        let n = bytes.len().min(BLOCK_SIZE);
        b.data[..n].copy_from_slice(&bytes[..n]);
        b
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// XOR `other` into `self`, byte for byte.
    pub fn xor_with(&mut self, other: &Block) {
        self.xor_prefix(other, BLOCK_SIZE);
    }

    /// XOR only the first `len` bytes of `other` into `self`.
    pub fn xor_prefix(&mut self, other: &Block, len: usize) {
        let len = len.min(BLOCK_SIZE);
        for (dst, src) in self.data[..len].iter_mut().zip(other.data[..len].iter()) {
            *dst ^= *src;
        }
    }

    /// Zero every byte from `len` to the end.
    pub fn truncate_to(&mut self, len: usize) {
        if len < BLOCK_SIZE {
            self.data[len..].fill(0);
        }
    }

    pub fn copy_from(&mut self, other: &Block) {
        self.data.copy_from_slice(&other.data[..]);
    }

    pub fn write_all_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.data[..])
    }

    /// Write the first `n` bytes.
    pub fn write_first<W: Write>(&self, mut writer: W, n: usize) -> io::Result<()> {
        writer.write_all(&self.data[..n.min(BLOCK_SIZE)])
    }

    /// Write the last `n` bytes.
    pub fn write_last<W: Write>(&self, mut writer: W, n: usize) -> io::Result<()> {
        let n = n.min(BLOCK_SIZE);
        writer.write_all(&self.data[BLOCK_SIZE - n..])
    }

    /// Mutable view of the first `n` bytes, for filling from a stream.
    pub fn first_mut(&mut self, n: usize) -> &mut [u8] {
        &mut self.data[..n.min(BLOCK_SIZE)]
    }

    /// Mutable view of the last `n` bytes.
    pub fn last_mut(&mut self, n: usize) -> &mut [u8] {
        let n = n.min(BLOCK_SIZE);
        &mut self.data[BLOCK_SIZE - n..]
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Block {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data[..]
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nonzero = self.data.iter().filter(|&&b| b != 0).count();
        write!(f, "Block({} non-zero, head {})", nonzero, hex::encode(&self.data[..8]))
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Source of zeroed blocks.
///
/// Implementations must be safe to share across threads; the redundancy
/// model itself is single-threaded but many models may draw from one pool.
pub trait BlockPool: Send + Sync {
    /// A zero-filled block.
    fn acquire(&self) -> Block;
    /// Hand a block back for reuse.
    fn release(&self, block: Block);
}

/// No pooling: every `acquire` allocates, every `release` drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapPool;

impl BlockPool for HeapPool {
    fn acquire(&self) -> Block {
        Block::new()
    }
    fn release(&self, _block: Block) {}
}

/// Bounded free-list of blocks behind a mutex.
pub struct SharedBlockPool {
    free:     Mutex<Vec<Block>>,
    capacity: usize,
}

impl SharedBlockPool {
    pub fn new(capacity: usize) -> Self {
        Self { free: Mutex::new(Vec::with_capacity(capacity)), capacity }
    }

    /// Number of blocks currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl BlockPool for SharedBlockPool {
    fn acquire(&self) -> Block {
        match self.free.lock().pop() {
            Some(mut b) => {
                b.clear();
                b
            }
            None => Block::new(),
        }
    }

    fn release(&self, block: Block) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(block);
        }
    }
}
