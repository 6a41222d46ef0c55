//! Read outcomes that keep end-of-stream apart from I/O failure.
//!
//! The codec and the restore pass branch on the difference: a failed read
//! marks one block unreadable and the pass carries on, while end of stream
//! means a legitimately short final block.

use std::io::{self, Read, Seek, SeekFrom};

#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read; fewer than requested only at end of stream.
    Data(usize),
    /// Nothing left to read.
    Eof,
    /// The underlying device reported an error.
    Failed(io::Error),
}

impl ReadOutcome {
    /// True when exactly `want` bytes arrived.
    pub fn is_complete(&self, want: usize) -> bool {
        matches!(self, ReadOutcome::Data(n) if *n == want)
    }
}

/// Fill `buf` as far as the stream allows.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
    if filled == 0 && !buf.is_empty() {
        ReadOutcome::Eof
    } else {
        ReadOutcome::Data(filled)
    }
}

/// Seek to `offset` and fill `buf`.  A failed seek counts as a failed read.
pub fn read_full_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf:    &mut [u8],
) -> ReadOutcome {
    if let Err(e) = reader.seek(SeekFrom::Start(offset)) {
        return ReadOutcome::Failed(e);
    }
    read_full(reader, buf)
}

/// Total length of a seekable stream; leaves the position at the end.
pub fn stream_len<S: Seek + ?Sized>(stream: &mut S) -> io::Result<u64> {
    stream.seek(SeekFrom::End(0))
}
