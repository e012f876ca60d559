//! The pack controller: sequences encoded entries into a byte stream (C4).
//!
//! [`Builder`] wraps any [`Write`]r. Each entry is added with
//! [`Builder::add_entry`], which writes the header block(s) immediately and
//! hands back an [`EntrySink`] the caller must fill with exactly
//! `header.size` bytes and then [`EntrySink::finish`]. [`Builder::finalize`]
//! appends the end-of-archive marker.

use std::io::{self, Write};

use tracing::{debug, trace};

use crate::block::{padding_len, BLOCK_SIZE};
use crate::error::{Result, TarError};
use crate::header::{encode_header, EntryHeader, EntryType};

/// Sequences header/body pairs into a valid tar byte stream.
///
/// Only one [`EntrySink`] may be open at a time; starting a new entry
/// before the previous one is [`EntrySink::finish`]ed is an
/// [`TarError::OverlappingEntry`].
pub struct Builder<W: Write> {
    writer: W,
    sink_open: bool,
    finished: bool,
}

impl<W: Write> Builder<W> {
    pub fn new(writer: W) -> Self {
        Builder {
            writer,
            sink_open: false,
            finished: false,
        }
    }

    /// Begin a new entry. Directories, symlinks, and hardlinks always have
    /// a zero-byte body regardless of what `header.size` said (spec §4.4);
    /// the header written to the stream reflects that.
    pub fn add_entry(&mut self, mut header: EntryHeader) -> Result<EntrySink<'_, W>> {
        if self.sink_open {
            return Err(TarError::OverlappingEntry);
        }
        if self.finished {
            return Err(TarError::Io(io::Error::new(
                io::ErrorKind::Other,
                "builder already finalized",
            )));
        }

        let bodyless = matches!(
            header.entry_type,
            EntryType::Directory | EntryType::Symlink | EntryType::Hardlink
        );
        if bodyless {
            header.size = 0;
        }

        trace!(name = %header.name, size = header.size, "writing entry header");
        let bytes = encode_header(&header)?;
        self.writer.write_all(&bytes)?;
        self.sink_open = true;

        Ok(EntrySink {
            builder: self,
            declared: header.size,
            written: 0,
        })
    }

    /// Append the two all-zero end-of-archive blocks and return the
    /// underlying writer.
    pub fn finalize(mut self) -> Result<W> {
        if self.sink_open {
            return Err(TarError::OverlappingEntry);
        }
        debug!("writing end-of-archive marker");
        self.writer.write_all(&[0u8; BLOCK_SIZE])?;
        self.writer.write_all(&[0u8; BLOCK_SIZE])?;
        self.finished = true;
        Ok(self.writer)
    }

    /// Abandon the archive in an error state, per spec's `error(reason)`.
    /// Returns the underlying writer so the caller can dispose of it (e.g.
    /// delete a partially-written file).
    pub fn abort(self, reason: impl Into<String>) -> W {
        debug!(reason = %reason.into(), "pack controller aborted");
        self.writer
    }
}

/// A writable sink for one entry's body, returned by [`Builder::add_entry`].
pub struct EntrySink<'a, W: Write> {
    builder: &'a mut Builder<W>,
    declared: u64,
    written: u64,
}

impl<'a, W: Write> EntrySink<'a, W> {
    /// Bytes still expected before [`finish`](EntrySink::finish) can
    /// succeed.
    pub fn remaining(&self) -> u64 {
        self.declared - self.written
    }

    /// Close the entry: if fewer bytes than declared were written, this is
    /// a [`TarError::SizeUnderflow`]; on success, pads the body to the next
    /// block boundary.
    pub fn finish(self) -> Result<()> {
        if self.written != self.declared {
            return Err(TarError::SizeUnderflow);
        }
        let pad = padding_len(self.declared);
        if pad > 0 {
            self.builder.writer.write_all(&vec![0u8; pad as usize])?;
        }
        self.builder.sink_open = false;
        Ok(())
    }
}

impl<'a, W: Write> Write for EntrySink<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.declared {
            return Err(io::Error::new(io::ErrorKind::Other, TarError::SizeOverflow));
        }
        self.builder.writer.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.builder.writer.flush()
    }
}

/// Encode a finite, in-memory sequence of `(header, body)` pairs into a
/// complete archive (the `encode_all` operation in spec §6).
pub fn encode_all<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (EntryHeader, &'a [u8])>,
{
    let mut builder = Builder::new(Vec::new());
    for (header, body) in entries {
        let mut sink = builder.add_entry(header)?;
        sink.write_all(body)?;
        sink.finish()?;
    }
    builder.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Archive;

    #[test]
    fn single_file_round_trip() {
        let entries = vec![(
            EntryHeader::new_file("hello.txt", 12),
            b"hello world\n".as_slice(),
        )];
        let bytes = encode_all(entries).unwrap();
        assert_eq!(bytes.len() % BLOCK_SIZE, 0);

        let mut archive = Archive::new(std::io::Cursor::new(bytes));
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let mut data = Vec::new();
            std::io::copy(&mut entry, &mut data).unwrap();
            found.push((entry.header().name.clone(), data));
        }
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "hello.txt");
        assert_eq!(found[0].1, b"hello world\n");
    }

    #[test]
    fn overlapping_entry_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        let _sink = builder.add_entry(EntryHeader::new_file("a", 1)).unwrap();
        let err = builder.add_entry(EntryHeader::new_file("b", 1));
        assert!(matches!(err, Err(TarError::OverlappingEntry)));
    }

    #[test]
    fn underflow_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        let mut sink = builder.add_entry(EntryHeader::new_file("a", 5)).unwrap();
        sink.write_all(b"ab").unwrap();
        let err = sink.finish();
        assert!(matches!(err, Err(TarError::SizeUnderflow)));
    }

    #[test]
    fn overflow_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        let mut sink = builder.add_entry(EntryHeader::new_file("a", 2)).unwrap();
        let err = sink.write_all(b"abc");
        assert!(err.is_err());
    }
}
