//! The streaming decoder state machine (C5) and the ergonomic `Read`-based
//! wrapper built on top of it.
//!
//! [`Decoder`] is the "central state machine" spec §9 describes: a single
//! plain struct carrying `global_overrides`, `pending_overrides`, and a mode
//! enum, driven by pushing byte chunks in and polling events out. It never
//! needs a full archive (or even a full entry) resident in memory, and body
//! bytes are handed back as borrows of its own internal buffer rather than
//! fresh copies.
//!
//! [`Archive`]/[`Entries`]/[`Entry`] adapt a [`std::io::Read`] source onto
//! the decoder for the common synchronous case, the same shape
//! `alexcrichton/tar-rs` exposes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::rc::Rc;

use tracing::trace;

use crate::block::{self, is_zero_block, padding_len, round_up_to_block, Block, BLOCK_SIZE};
use crate::error::{Result, TarError};
use crate::header::{EntryHeader, RawType};
use crate::pax::{self, PaxRecords};

/// Toggles the strict/lenient error behaviors spec §4.5 and §7 describe.
/// Default is lenient (`strict: false`), matching spec §9's documented
/// default for the single-zero-block question.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    pub strict: bool,
}

/// One event produced by [`Decoder::poll`]. `Body` borrows the decoder's
/// internal buffer directly — no extra copy is made to produce it.
#[derive(Debug)]
pub enum Event<'a> {
    /// A regular entry's header. Its body (if `size > 0`) follows as zero
    /// or more `Body` events, terminated by `BodyEnd`.
    Entry(EntryHeader),
    /// A slice of the current entry's body.
    Body(&'a [u8]),
    /// The current entry's body is fully delivered.
    BodyEnd,
    /// Two consecutive all-zero blocks (or, leniently, one at end of
    /// input) were seen; no further entries follow.
    EndOfArchive,
}

#[derive(Debug, Clone, Copy)]
enum State {
    ExpectHeader,
    ReadBody { remaining: u64, padding: u64 },
    ReadPadding { remaining: u64 },
    EndOfArchive,
}

/// The push-based tar decoder state machine.
pub struct Decoder {
    strict: bool,
    buf: Vec<u8>,
    pos: usize,
    input_closed: bool,
    state: State,
    global_overrides: PaxRecords,
    pending_overrides: PaxRecords,
    saw_end_marker: bool,
}

impl Decoder {
    pub fn new(options: DecodeOptions) -> Self {
        Decoder {
            strict: options.strict,
            buf: Vec::new(),
            pos: 0,
            input_closed: false,
            state: State::ExpectHeader,
            global_overrides: PaxRecords::new(),
            pending_overrides: PaxRecords::new(),
            saw_end_marker: false,
        }
    }

    /// Append more input. Compacts already-consumed bytes first so the
    /// buffer does not grow without bound across a long archive.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(0..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Signal that no more input is coming. Subsequent `poll` calls apply
    /// the flush semantics of spec §4.5 ("Flush (input closed)").
    pub fn close(&mut self) {
        self.input_closed = true;
    }

    /// True once the canonical two-zero-block end-of-archive marker was
    /// actually observed, as opposed to the stream simply running out
    /// mid-`ExpectHeader` (which lenient mode also treats as the end).
    pub fn saw_end_marker(&self) -> bool {
        self.saw_end_marker
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn peek(&self, len: usize) -> Option<&[u8]> {
        if self.available() < len {
            None
        } else {
            Some(&self.buf[self.pos..self.pos + len])
        }
    }

    /// Drive the state machine forward and return the next event, or
    /// `Ok(None)` if more input is needed before progress can be made.
    pub fn poll(&mut self) -> Result<Option<Event<'_>>> {
        loop {
            match self.state {
                State::EndOfArchive => return Ok(None),

                State::ExpectHeader => match self.poll_expect_header()? {
                    HeaderOutcome::NeedMore => return Ok(None),
                    HeaderOutcome::ConsumedMeta => continue,
                    HeaderOutcome::Entry(header, size) => {
                        if size == 0 {
                            self.state = State::ExpectHeader;
                        } else {
                            self.state = State::ReadBody {
                                remaining: size,
                                padding: padding_len(size),
                            };
                        }
                        return Ok(Some(Event::Entry(header)));
                    }
                    HeaderOutcome::EndOfArchive => {
                        self.state = State::EndOfArchive;
                        return Ok(Some(Event::EndOfArchive));
                    }
                },

                State::ReadBody { remaining, padding } => {
                    if remaining == 0 {
                        self.state = State::ReadPadding { remaining: padding };
                        return Ok(Some(Event::BodyEnd));
                    }
                    if self.available() == 0 {
                        if self.input_closed {
                            if self.strict {
                                return Err(TarError::Truncated);
                            }
                            self.state = State::EndOfArchive;
                            return Ok(Some(Event::BodyEnd));
                        }
                        return Ok(None);
                    }
                    let n = self.available().min(remaining as usize);
                    let start = self.pos;
                    self.pos += n;
                    self.state = State::ReadBody {
                        remaining: remaining - n as u64,
                        padding,
                    };
                    return Ok(Some(Event::Body(&self.buf[start..start + n])));
                }

                State::ReadPadding { remaining } => {
                    if remaining == 0 {
                        self.state = State::ExpectHeader;
                        continue;
                    }
                    if self.available() == 0 {
                        if self.input_closed {
                            // Missing padding at end of input is tolerated;
                            // the body itself was already fully delivered.
                            self.state = State::ExpectHeader;
                            continue;
                        }
                        return Ok(None);
                    }
                    let n = self.available().min(remaining as usize);
                    self.pos += n;
                    self.state = State::ReadPadding {
                        remaining: remaining - n as u64,
                    };
                    continue;
                }
            }
        }
    }

    fn poll_expect_header(&mut self) -> Result<HeaderOutcome> {
        let Some(block) = self.peek(BLOCK_SIZE) else {
            if self.input_closed {
                if self.available() == 0 {
                    return Ok(HeaderOutcome::EndOfArchive);
                }
                return if self.strict {
                    Err(TarError::Truncated)
                } else {
                    Ok(HeaderOutcome::EndOfArchive)
                };
            }
            return Ok(HeaderOutcome::NeedMore);
        };
        let block: Block = block.try_into().unwrap();

        if is_zero_block(&block) {
            return self.poll_zero_block();
        }

        if self.strict && !block::verify_checksum(&block) {
            return Err(TarError::BadChecksum);
        }

        let raw = crate::header::parse_raw_header(&block)?;

        if raw.typeflag.is_meta() {
            let rsize = round_up_to_block(raw.size) as usize;
            if self.available() < BLOCK_SIZE + rsize {
                if self.input_closed {
                    return Err(TarError::Truncated);
                }
                return Ok(HeaderOutcome::NeedMore);
            }
            self.pos += BLOCK_SIZE;
            let payload = &self.buf[self.pos..self.pos + raw.size as usize];
            self.apply_meta(raw.typeflag, payload)?;
            self.pos += rsize;
            return Ok(HeaderOutcome::ConsumedMeta);
        }

        self.pos += BLOCK_SIZE;
        let header = self.compose_header(raw)?;
        let size = header.size;
        self.pending_overrides = PaxRecords::new();
        Ok(HeaderOutcome::Entry(header, size))
    }

    fn poll_zero_block(&mut self) -> Result<HeaderOutcome> {
        match self.peek(BLOCK_SIZE * 2) {
            Some(two_blocks) => {
                if is_zero_block(&two_blocks[BLOCK_SIZE..]) {
                    self.pos += BLOCK_SIZE * 2;
                    Ok(HeaderOutcome::EndOfArchive)
                } else if self.strict {
                    Err(TarError::InvalidZeroBlock)
                } else {
                    trace!("skipping lone zero block in lenient mode");
                    self.pos += BLOCK_SIZE;
                    Ok(HeaderOutcome::ConsumedMeta)
                }
            }
            None => {
                if self.input_closed {
                    if self.strict {
                        return Err(TarError::InvalidZeroBlock);
                    }
                    self.pos += BLOCK_SIZE;
                    Ok(HeaderOutcome::EndOfArchive)
                } else {
                    Ok(HeaderOutcome::NeedMore)
                }
            }
        }
    }

    fn apply_meta(&mut self, typeflag: RawType, payload: &[u8]) -> Result<()> {
        match typeflag {
            RawType::PaxGlobal => {
                let records = pax::decode_records(payload)?;
                for (k, v) in records.iter() {
                    self.global_overrides.insert(k.to_string(), v.to_string());
                }
            }
            RawType::PaxLocal => {
                let records = pax::decode_records(payload)?;
                for (k, v) in records.iter() {
                    self.pending_overrides.insert(k.to_string(), v.to_string());
                }
            }
            RawType::GnuLongName => {
                let name = nul_trimmed_utf8(payload);
                self.pending_overrides.insert("path", name);
            }
            RawType::GnuLongLink => {
                let name = nul_trimmed_utf8(payload);
                self.pending_overrides.insert("linkpath", name);
            }
            _ => unreachable!("apply_meta called on non-meta typeflag"),
        }
        Ok(())
    }

    fn compose_header(&self, raw: crate::header::RawHeader) -> Result<EntryHeader> {
        let entry_type = raw
            .typeflag
            .to_entry_type()
            .ok_or(TarError::UnsupportedType)?;

        let lookup = |key: &str| -> Option<String> {
            self.pending_overrides
                .get(key)
                .or_else(|| self.global_overrides.get(key))
                .map(str::to_string)
        };

        let name = match lookup("path") {
            Some(p) => p,
            None if raw.magic_is_ustar && !raw.prefix.is_empty() => {
                format!("{}/{}", raw.prefix, raw.name)
            }
            None => raw.name.clone(),
        };

        let linkname = lookup("linkpath").or_else(|| {
            if raw.linkname.is_empty() {
                None
            } else {
                Some(raw.linkname.clone())
            }
        });

        let size = match lookup("size") {
            Some(s) => s
                .parse::<u64>()
                .map_err(|_| TarError::BadPaxRecord(format!("bad size override {s:?}")))?,
            None => raw.size,
        };

        let uid = match lookup("uid") {
            Some(s) => s
                .parse::<u64>()
                .map_err(|_| TarError::BadPaxRecord(format!("bad uid override {s:?}")))?,
            None => raw.uid,
        };
        let gid = match lookup("gid") {
            Some(s) => s
                .parse::<u64>()
                .map_err(|_| TarError::BadPaxRecord(format!("bad gid override {s:?}")))?,
            None => raw.gid,
        };

        let mtime = match lookup("mtime") {
            Some(s) => s
                .parse::<f64>()
                .map_err(|_| TarError::BadPaxRecord(format!("bad mtime override {s:?}")))?,
            None => raw.mtime as f64,
        };

        let uname = lookup("uname").or_else(|| {
            if raw.uname.is_empty() {
                None
            } else {
                Some(raw.uname.clone())
            }
        });
        let gname = lookup("gname").or_else(|| {
            if raw.gname.is_empty() {
                None
            } else {
                Some(raw.gname.clone())
            }
        });

        let mut pax_map: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in self.global_overrides.iter() {
            pax_map.insert(k.to_string(), v.to_string());
        }
        for (k, v) in self.pending_overrides.iter() {
            pax_map.insert(k.to_string(), v.to_string());
        }

        Ok(EntryHeader {
            name,
            size,
            mode: Some(raw.mode),
            mtime: Some(mtime),
            entry_type,
            linkname,
            uid,
            gid,
            uname,
            gname,
            pax: pax_map,
        })
    }
}

fn nul_trimmed_utf8(buf: &[u8]) -> String {
    let end = memchr::memchr(0, buf).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

enum HeaderOutcome {
    NeedMore,
    ConsumedMeta,
    Entry(EntryHeader, u64),
    EndOfArchive,
}

// ---------------------------------------------------------------------
// Read-based adapter
// ---------------------------------------------------------------------

const CHUNK_SIZE: usize = 64 * 1024;

struct Shared<R> {
    reader: R,
    decoder: Decoder,
    /// Set once an entry has been emitted and not yet fully drained, so a
    /// new call to `next()` can first discard whatever is left (spec §3:
    /// "consumers must fully drain or discard it before the next pair
    /// appears" — the archive enforces the discard on their behalf).
    active_entry_open: bool,
    reader_eof: bool,
}

/// A tar byte stream being decoded. Wraps any [`Read`]er.
pub struct Archive<R: Read> {
    shared: Rc<RefCell<Shared<R>>>,
}

impl<R: Read> Archive<R> {
    pub fn new(reader: R) -> Self {
        Self::with_options(reader, DecodeOptions::default())
    }

    pub fn with_options(reader: R, options: DecodeOptions) -> Self {
        Archive {
            shared: Rc::new(RefCell::new(Shared {
                reader,
                decoder: Decoder::new(options),
                active_entry_open: false,
                reader_eof: false,
            })),
        }
    }

    /// Iterate the entries of this archive in order. Each [`Entry`] must be
    /// read to completion (or dropped — the next call to `next()` discards
    /// any unread bytes automatically) before advancing.
    pub fn entries(&mut self) -> Result<Entries<R>> {
        Ok(Entries {
            shared: self.shared.clone(),
            done: false,
        })
    }
}

fn pump_reader<R: Read>(shared: &mut Shared<R>) -> io::Result<()> {
    if shared.reader_eof {
        shared.decoder.close();
        return Ok(());
    }
    let mut buf = [0u8; CHUNK_SIZE];
    let n = shared.reader.read(&mut buf)?;
    if n == 0 {
        shared.reader_eof = true;
        shared.decoder.close();
    } else {
        shared.decoder.feed(&buf[..n]);
    }
    Ok(())
}

/// Discards whatever remains of the currently open entry's body by polling
/// `Body`/`BodyEnd` events without surfacing them.
fn drain_active_entry<R: Read>(shared: &mut Shared<R>) -> Result<()> {
    loop {
        let event = loop {
            match shared.decoder.poll()? {
                Some(ev) => break ev,
                None => pump_reader(shared)?,
            }
        };
        match event {
            Event::Body(_) => continue,
            Event::BodyEnd => {
                shared.active_entry_open = false;
                return Ok(());
            }
            Event::Entry(_) | Event::EndOfArchive => {
                unreachable!("drain_active_entry stopped scanning past BodyEnd")
            }
        }
    }
}

/// Iterator over the entries of an [`Archive`].
pub struct Entries<R: Read> {
    shared: Rc<RefCell<Shared<R>>>,
    done: bool,
}

impl<R: Read> Iterator for Entries<R> {
    type Item = Result<Entry<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut shared = self.shared.borrow_mut();
        if shared.active_entry_open {
            if let Err(e) = drain_active_entry(&mut shared) {
                self.done = true;
                return Some(Err(e));
            }
        }
        loop {
            match shared.decoder.poll() {
                Ok(Some(Event::Entry(header))) => {
                    shared.active_entry_open = header.size > 0;
                    if header.size == 0 {
                        // Zero-size entries never produce Body/BodyEnd
                        // events (spec §4.5 step 6); nothing to drain.
                    }
                    drop(shared);
                    return Some(Ok(Entry {
                        shared: self.shared.clone(),
                        header,
                        finished: false,
                        leftover: Vec::new(),
                        leftover_pos: 0,
                    }));
                }
                Ok(Some(Event::EndOfArchive)) => {
                    self.done = true;
                    return None;
                }
                Ok(Some(Event::Body(_))) | Ok(Some(Event::BodyEnd)) => {
                    // Only reachable if a previous entry's body wasn't
                    // drained before calling next(), which the guard above
                    // prevents; treat defensively as "keep polling".
                    continue;
                }
                Ok(None) => {
                    if let Err(e) = pump_reader(&mut shared) {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// One decoded entry: its header, and a [`Read`] implementation over
/// exactly `header.size` bytes of body.
pub struct Entry<R: Read> {
    shared: Rc<RefCell<Shared<R>>>,
    header: EntryHeader,
    finished: bool,
    /// Holds the tail of a decoder body chunk the caller's buffer was too
    /// small to take in one `read` call. The decoder's own slice can't
    /// outlive the `poll()` call that produced it, so anything not handed
    /// to the caller immediately has to be copied out here.
    leftover: Vec<u8>,
    leftover_pos: usize,
}

impl<R: Read> Entry<R> {
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    /// Overwrite this entry's header, e.g. after a strip/filter/map
    /// transform rewrites its name. Does not affect body delivery.
    pub(crate) fn set_header(&mut self, header: EntryHeader) {
        self.header = header;
    }
}

impl<R: Read> Read for Entry<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.finished || out.is_empty() {
            return Ok(0);
        }
        if self.leftover_pos < self.leftover.len() {
            let n = (self.leftover.len() - self.leftover_pos).min(out.len());
            out[..n].copy_from_slice(&self.leftover[self.leftover_pos..self.leftover_pos + n]);
            self.leftover_pos += n;
            if self.leftover_pos == self.leftover.len() {
                self.leftover.clear();
                self.leftover_pos = 0;
            }
            return Ok(n);
        }
        let mut shared = self.shared.borrow_mut();
        loop {
            match shared.decoder.poll().map_err(to_io_error)? {
                Some(Event::Body(bytes)) => {
                    let n = bytes.len().min(out.len());
                    out[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.leftover.clear();
                        self.leftover.extend_from_slice(&bytes[n..]);
                        self.leftover_pos = 0;
                    }
                    return Ok(n);
                }
                Some(Event::BodyEnd) => {
                    self.finished = true;
                    shared.active_entry_open = false;
                    return Ok(0);
                }
                Some(Event::Entry(_)) | Some(Event::EndOfArchive) => {
                    unreachable!("archive emitted a new entry while one was still open")
                }
                None => pump_reader(&mut shared)?,
            }
        }
    }
}

fn to_io_error(e: TarError) -> io::Error {
    match e {
        TarError::Io(io_err) => io_err,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
