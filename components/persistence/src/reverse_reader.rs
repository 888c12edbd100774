//! Read the lines of an append-only text resource from the last to the first.
//!
//! The reader keeps a single chunk of at most `buffer_size` bytes in memory, whatever the size of the
//! resource. Chunks are fetched backward with byte range reads, so only the tail of a large journal is
//! transferred when the caller stops after the most recent entries.

use bytes::{Bytes, BytesMut};
use log::trace;

use crate::error::PersistenceError;
use crate::RangeRead;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

pub struct ReverseLineReader<R> {
    source: R,

    buffer_size: usize,

    /// Number of bytes, counted from the start of the resource, not fetched yet.
    remaining: u64,

    /// Most recently fetched chunk.
    buffer: Bytes,

    /// `buffer[..cursor]` is not scanned yet. `None` once the whole buffer is consumed.
    cursor: Option<usize>,

    /// Whether the chunk holding the last byte of the resource has been fetched.
    tail_fetched: bool,
}

/// Outcome of scanning the current chunk for a line delimiter.
enum Scan {
    /// A delimiter was found, the fragment starts right after it.
    Delimited(Bytes),

    /// The start of the chunk was reached; the line may continue in the previous chunk.
    Exhausted(Bytes),
}

impl<R> ReverseLineReader<R>
where
    R: RangeRead,
{
    /// Create a reader over the first `length` bytes of `source`.
    ///
    /// `length` is the snapshot of the resource size the reader works on; bytes appended later are not seen.
    pub fn new(source: R, length: u64) -> Self {
        Self::with_buffer_size(source, length, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(source: R, length: u64, buffer_size: usize) -> Self {
        Self {
            source,
            buffer_size: buffer_size.max(1),
            remaining: length,
            buffer: Bytes::new(),
            cursor: None,
            tail_fetched: false,
        }
    }

    /// Return the previous line, or `None` once the start of the resource has been passed.
    ///
    /// A trailing line feed at the very end of the resource terminates the last line and does not yield an
    /// empty line of its own.
    pub async fn read_line(&mut self) -> Result<Option<String>, PersistenceError> {
        if self.cursor.is_none() && self.remaining == 0 {
            return Ok(None);
        }

        // Fragments in discovery order: from the end of the line towards its start.
        let mut fragments = Vec::with_capacity(1);
        loop {
            if self.cursor.is_none() {
                if self.remaining == 0 {
                    // Reached the beginning of the resource.
                    break;
                }
                self.read_block().await?;
            }

            match self.scan() {
                Scan::Delimited(fragment) => {
                    fragments.push(fragment);
                    break;
                }
                Scan::Exhausted(fragment) => fragments.push(fragment),
            }
        }

        let line = if fragments.len() == 1 {
            fragments.pop().unwrap_or_default()
        } else {
            let length = fragments.iter().map(Bytes::len).sum();
            let mut line = BytesMut::with_capacity(length);
            fragments
                .iter()
                .rev()
                .for_each(|fragment| line.extend_from_slice(fragment));
            line.freeze()
        };

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| PersistenceError::DataCorrupted(format!("journal line is not UTF-8: {e}")))
    }

    async fn read_block(&mut self) -> Result<(), PersistenceError> {
        let length = self.remaining.min(self.buffer_size as u64) as usize;
        self.remaining -= length as u64;
        trace!(
            "Fetching {} bytes at offset {} of a reversely read resource",
            length,
            self.remaining
        );
        let buffer = self.source.read_range(self.remaining, length).await?;
        if buffer.len() != length {
            return Err(PersistenceError::DataCorrupted(format!(
                "range read at {} returned {} bytes, {} expected",
                self.remaining,
                buffer.len(),
                length
            )));
        }
        self.buffer = buffer;

        let mut cursor = self.buffer.len();
        if !self.tail_fetched {
            self.tail_fetched = true;
            if self.buffer.last() == Some(&b'\n') {
                cursor -= 1;
            }
        }
        self.cursor = Some(cursor);
        Ok(())
    }

    fn scan(&mut self) -> Scan {
        let stop = match self.cursor {
            Some(stop) => stop,
            None => return Scan::Exhausted(Bytes::new()),
        };
        match self.buffer[..stop].iter().rposition(|b| *b == b'\n') {
            Some(position) => {
                self.cursor = Some(position);
                Scan::Delimited(self.buffer.slice(position + 1..stop))
            }
            None => {
                self.cursor = None;
                Scan::Exhausted(self.buffer.slice(..stop))
            }
        }
    }
}
