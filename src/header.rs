//! Logical entry descriptor and the USTAR header block layout (data model +
//! C2).
//!
//! [`EntryHeader`] is what callers of `pack` provide and what `decode`
//! emits. [`RawHeader`] is the fixed-offset view of one 512-byte USTAR block
//! used internally by the encoder and decoder; consumers never see it.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{
    self, round_up_to_block, write_checksum_field, Block, BLOCK_SIZE,
};
use crate::error::{Result, TarError};
use crate::pax::{self, PaxRecords};

// Fixed byte offsets of the POSIX ustar header, identical to the on-disk
// layout described in spec §4.1.
const NAME: std::ops::Range<usize> = 0..100;
const MODE: std::ops::Range<usize> = 100..108;
const UID: std::ops::Range<usize> = 108..116;
const GID: std::ops::Range<usize> = 116..124;
const SIZE: std::ops::Range<usize> = 124..136;
const MTIME: std::ops::Range<usize> = 136..148;
const CHKSUM: std::ops::Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const LINKNAME: std::ops::Range<usize> = 157..257;
const MAGIC: std::ops::Range<usize> = 257..263;
const VERSION: std::ops::Range<usize> = 263..265;
const UNAME: std::ops::Range<usize> = 265..297;
const GNAME: std::ops::Range<usize> = 297..329;
const PREFIX: std::ops::Range<usize> = 345..500;

const USTAR_MAGIC: &[u8] = b"ustar\0";
const USTAR_VERSION: &[u8] = b"00";

/// A regular, consumer-visible entry type. Meta-entries (PAX/GNU-longname
/// preambles) are never exposed; see [`crate::decode`] for how they're
/// absorbed into the following entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    Hardlink,
    /// A typeflag this crate does not materialize (character/block device,
    /// FIFO, contiguous-file, vendor-specific). Decoded like any other
    /// regular entry but the secure extractor silently skips it rather than
    /// writing anything to disk (spec §4.6 step 7). Not a constructible
    /// target for `pack`: encoding one is a caller error.
    Unsupported,
}

impl EntryType {
    fn default_mode(self) -> u32 {
        match self {
            EntryType::Directory => 0o755,
            _ => 0o644,
        }
    }
}

/// The logical description of one archive member (spec §3).
#[derive(Debug, Clone)]
pub struct EntryHeader {
    /// Forward-slash separated logical path.
    pub name: String,
    /// Byte length of the payload. Zero for non-regular entries.
    pub size: u64,
    /// POSIX permission bits. `None` means "use the type default".
    pub mode: Option<u32>,
    /// Modification time, seconds since the epoch. PAX allows fractional
    /// seconds; USTAR truncates to whole seconds.
    pub mtime: Option<f64>,
    pub entry_type: EntryType,
    /// Target path for symlink/hardlink entries.
    pub linkname: Option<String>,
    pub uid: u64,
    pub gid: u64,
    pub uname: Option<String>,
    pub gname: Option<String>,
    /// Extension records as seen (or to be emitted) on the wire, keyed by
    /// PAX key, for round-tripping unrecognized keys.
    pub pax: BTreeMap<String, String>,
}

impl EntryHeader {
    /// Construct a regular-file header with only the fields spec §8's
    /// literal scenarios exercise; everything else defaults.
    pub fn new_file(name: impl Into<String>, size: u64) -> Self {
        EntryHeader {
            name: name.into(),
            size,
            mode: None,
            mtime: None,
            entry_type: EntryType::File,
            linkname: None,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            pax: BTreeMap::new(),
        }
    }

    /// Construct a directory header. `name` need not carry the trailing
    /// `/`; it is added if missing (spec §3 invariant).
    pub fn new_directory(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        EntryHeader {
            name,
            size: 0,
            mode: None,
            mtime: None,
            entry_type: EntryType::Directory,
            linkname: None,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            pax: BTreeMap::new(),
        }
    }

    /// Construct a symlink header.
    pub fn new_symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        EntryHeader {
            name: name.into(),
            size: 0,
            mode: None,
            mtime: None,
            entry_type: EntryType::Symlink,
            linkname: Some(target.into()),
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            pax: BTreeMap::new(),
        }
    }

    /// Construct a hardlink header.
    pub fn new_hardlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        EntryHeader {
            name: name.into(),
            size: 0,
            mode: None,
            mtime: None,
            entry_type: EntryType::Hardlink,
            linkname: Some(target.into()),
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            pax: BTreeMap::new(),
        }
    }
}

/// The raw typeflag of a tar block, including meta-entry kinds the decoder
/// consumes internally and never surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawType {
    File,
    Hardlink,
    Symlink,
    Directory,
    PaxLocal,
    PaxGlobal,
    GnuLongName,
    GnuLongLink,
    /// Anything else (device, fifo, contiguous-file, vendor-specific).
    /// Reachable only as a regular (non-meta) entry; decodes to
    /// [`EntryType::Unsupported`], which the extractor silently skips
    /// rather than materializing.
    Other(u8),
}

impl RawType {
    pub(crate) fn from_flag(b: u8) -> RawType {
        match b {
            b'0' | 0 => RawType::File,
            b'1' => RawType::Hardlink,
            b'2' => RawType::Symlink,
            b'5' => RawType::Directory,
            b'x' => RawType::PaxLocal,
            b'g' => RawType::PaxGlobal,
            b'L' => RawType::GnuLongName,
            b'K' => RawType::GnuLongLink,
            other => RawType::Other(other),
        }
    }

    pub(crate) fn to_flag(self) -> u8 {
        match self {
            RawType::File => b'0',
            RawType::Hardlink => b'1',
            RawType::Symlink => b'2',
            RawType::Directory => b'5',
            RawType::PaxLocal => b'x',
            RawType::PaxGlobal => b'g',
            RawType::GnuLongName => b'L',
            RawType::GnuLongLink => b'K',
            RawType::Other(b) => b,
        }
    }

    pub(crate) fn is_meta(self) -> bool {
        matches!(
            self,
            RawType::PaxLocal
                | RawType::PaxGlobal
                | RawType::GnuLongName
                | RawType::GnuLongLink
        )
    }

    pub(crate) fn to_entry_type(self) -> Option<EntryType> {
        match self {
            RawType::File => Some(EntryType::File),
            RawType::Hardlink => Some(EntryType::Hardlink),
            RawType::Symlink => Some(EntryType::Symlink),
            RawType::Directory => Some(EntryType::Directory),
            RawType::Other(_) => Some(EntryType::Unsupported),
            RawType::PaxLocal
            | RawType::PaxGlobal
            | RawType::GnuLongName
            | RawType::GnuLongLink => None,
        }
    }
}

/// The fields of one parsed 512-byte header block, before PAX/GNU overrides
/// are applied. Internal to `decode`/`header`.
#[derive(Debug, Clone)]
pub(crate) struct RawHeader {
    pub name: String,
    pub prefix: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub typeflag: RawType,
    pub linkname: String,
    pub magic_is_ustar: bool,
    pub uname: String,
    pub gname: String,
}

/// Parse the fixed-offset fields of a raw 512-byte block. Does not validate
/// the checksum (callers do that separately so strict/lenient policy lives
/// in one place, the decoder).
pub(crate) fn parse_raw_header(block: &Block) -> Result<RawHeader> {
    let name = String::from_utf8_lossy(block::read_string(&block[NAME])).into_owned();
    let prefix =
        String::from_utf8_lossy(block::read_string(&block[PREFIX])).into_owned();
    let mode = block::read_numeric(&block[MODE])? as u32;
    let uid = block::read_numeric(&block[UID])?;
    let gid = block::read_numeric(&block[GID])?;
    let size = block::read_numeric(&block[SIZE])?;
    let mtime = block::read_numeric(&block[MTIME])?;
    let typeflag = RawType::from_flag(block[TYPEFLAG]);
    let linkname =
        String::from_utf8_lossy(block::read_string(&block[LINKNAME])).into_owned();
    let magic_is_ustar = &block[MAGIC] == USTAR_MAGIC;
    let uname = String::from_utf8_lossy(block::read_string(&block[UNAME])).into_owned();
    let gname = String::from_utf8_lossy(block::read_string(&block[GNAME])).into_owned();

    Ok(RawHeader {
        name,
        prefix,
        mode,
        uid,
        gid,
        size,
        mtime,
        typeflag,
        linkname,
        magic_is_ustar,
        uname,
        gname,
    })
}

/// Split `name` at the rightmost `/` such that the prefix fits in 155 bytes
/// and the suffix fits in 100 bytes (spec §4.2 step 1). Returns `None` if no
/// such split exists.
fn split_ustar_name(name: &str) -> Option<(&str, &str)> {
    if name.len() <= 100 {
        return None;
    }
    let bytes = name.as_bytes();
    let mut idx = bytes.len();
    while let Some(pos) = bytes[..idx].iter().rposition(|&b| b == b'/') {
        let prefix = &name[..pos];
        let suffix = &name[pos + 1..];
        if prefix.len() <= 155 && suffix.len() <= 100 && !suffix.is_empty() {
            return Some((prefix, suffix));
        }
        idx = pos;
        if idx == 0 {
            break;
        }
    }
    None
}

fn current_unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Build a synthetic PAX header block (and its payload, padded) for
/// `typeflag` `'x'` or `'g'` preceding a regular entry, per spec §4.2.
fn encode_pax_preamble(typeflag: RawType, name_hint: &str, records: &PaxRecords) -> Vec<u8> {
    let payload = pax::encode_records(records);
    let mut out = Vec::with_capacity(BLOCK_SIZE + payload.len());

    let synthetic_name = match typeflag {
        RawType::PaxGlobal => "pax_global_header".to_string(),
        _ => {
            let truncated: String = name_hint.chars().take(100).collect();
            format!("PaxHeader/{truncated}")
        }
    };

    let mut block = [0u8; BLOCK_SIZE];
    // A truncated synthetic name longer than 100 bytes still needs to fit;
    // fall back to plain truncation at the byte level.
    let name_bytes = synthetic_name.as_bytes();
    let name_bytes = &name_bytes[..name_bytes.len().min(100)];
    block::write_string(&mut block[NAME], name_bytes);
    block::write_octal(&mut block[MODE], 0o644);
    block::write_octal(&mut block[UID], 0);
    block::write_octal(&mut block[GID], 0);
    block::write_octal(&mut block[SIZE], payload.len() as u64)
        .expect("pax payload length fits in size field");
    block::write_octal(&mut block[MTIME], current_unix_time() as u64);
    block[TYPEFLAG] = typeflag.to_flag();
    block[MAGIC].copy_from_slice(USTAR_MAGIC);
    block[VERSION].copy_from_slice(USTAR_VERSION);
    let checksum = block::compute_checksum(&block);
    write_checksum_field(
        <&mut [u8; 8]>::try_from(&mut block[CHKSUM]).unwrap(),
        checksum,
    );

    out.extend_from_slice(&block);
    out.extend_from_slice(&payload);
    let pad = crate::block::padding_len(payload.len() as u64);
    out.resize(out.len() + pad as usize, 0);
    out
}

/// Encode one [`EntryHeader`] into the block(s) that precede its body: an
/// optional PAX local-header preamble, then the USTAR header block itself
/// (spec §4.2).
pub fn encode_header(header: &EntryHeader) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pax_records = PaxRecords::new();

    // Step 1: name placement.
    let mut ustar_name = header.name.clone();
    let mut ustar_prefix = String::new();
    if header.name.len() > 100 {
        if let Some((prefix, suffix)) = split_ustar_name(&header.name) {
            ustar_prefix = prefix.to_string();
            ustar_name = suffix.to_string();
        } else {
            pax_records.insert("path", header.name.clone());
            ustar_name = header.name.chars().take(100).collect();
        }
    }

    // Step 2: long linkname.
    let mut ustar_linkname = header.linkname.clone().unwrap_or_default();
    if ustar_linkname.len() > 100 {
        pax_records.insert("linkpath", ustar_linkname.clone());
        ustar_linkname = ustar_linkname.chars().take(100).collect();
    }

    // Step 3: overlong uname/gname/uid/gid/size.
    let uname = header.uname.clone().unwrap_or_default();
    if uname.len() > 32 {
        pax_records.insert("uname", uname.clone());
    }
    let gname = header.gname.clone().unwrap_or_default();
    if gname.len() > 32 {
        pax_records.insert("gname", gname.clone());
    }
    if header.uid > 0o7_777_777 {
        pax_records.insert("uid", header.uid.to_string());
    }
    if header.gid > 0o7_777_777 {
        pax_records.insert("gid", header.gid.to_string());
    }
    if header.size > 0o77_777_777_777 {
        pax_records.insert("size", header.size.to_string());
    }

    // Step 4: defaults.
    let mtime = header.mtime.unwrap_or_else(current_unix_time);
    if let Some(explicit) = header.mtime {
        // Sub-second precision only survives through a PAX record; USTAR is
        // whole-seconds. A defaulted (current-time) mtime is never given
        // this treatment: spec §4.2 step 4 lists the default under "Fill
        // defaults", not as a PAX-extension trigger.
        if explicit.fract() != 0.0 {
            pax_records.insert("mtime", format!("{explicit:.9}"));
        }
    }
    let mode = header.mode.unwrap_or_else(|| header.entry_type.default_mode());

    // Caller-supplied unrecognized PAX keys are echoed verbatim, and any
    // recognized key the caller set explicitly takes precedence over what
    // we'd otherwise compute (round-trip fidelity, spec §3).
    for (k, v) in &header.pax {
        pax_records.insert(k.clone(), v.clone());
    }

    // Step 5/6: typeflag, magic, checksum.
    let raw_type = match header.entry_type {
        EntryType::File => RawType::File,
        EntryType::Hardlink => RawType::Hardlink,
        EntryType::Symlink => RawType::Symlink,
        EntryType::Directory => RawType::Directory,
        // Only the decoder ever produces this entry type; there is no wire
        // representation for a caller to ask `pack` to emit one.
        EntryType::Unsupported => return Err(TarError::UnsupportedType),
    };

    if !pax_records.is_empty() {
        out.extend(encode_pax_preamble(RawType::PaxLocal, &header.name, &pax_records));
    }

    let mut block = [0u8; BLOCK_SIZE];
    block::write_string(&mut block[NAME], ustar_name.as_bytes())
        .ok_or_else(|| TarError::BadPaxRecord("name field overflow".into()))?;
    block::write_octal(&mut block[MODE], mode as u64)
        .ok_or_else(|| TarError::BadPaxRecord("mode field overflow".into()))?;
    // uid/gid that overflow octal still get *some* on-disk value for tools
    // that ignore the PAX record; truncate to what fits.
    block::write_octal(&mut block[UID], header.uid & 0o7_777_777);
    block::write_octal(&mut block[GID], header.gid & 0o7_777_777);
    block::write_octal(&mut block[SIZE], header.size.min(0o77_777_777_777));
    block::write_octal(&mut block[MTIME], mtime as u64);
    block[TYPEFLAG] = raw_type.to_flag();
    block::write_string(&mut block[LINKNAME], ustar_linkname.as_bytes())
        .ok_or_else(|| TarError::BadPaxRecord("linkname field overflow".into()))?;
    block[MAGIC].copy_from_slice(USTAR_MAGIC);
    block[VERSION].copy_from_slice(USTAR_VERSION);
    block::write_string(&mut block[UNAME], uname.as_bytes());
    block::write_string(&mut block[GNAME], gname.as_bytes());
    if !ustar_prefix.is_empty() {
        block::write_string(&mut block[PREFIX], ustar_prefix.as_bytes());
    }

    let checksum = block::compute_checksum(&block);
    write_checksum_field(
        <&mut [u8; 8]>::try_from(&mut block[CHKSUM]).unwrap(),
        checksum,
    );

    out.extend_from_slice(&block);
    Ok(out)
}

/// Total encoded size of the header block(s) plus the padded body for
/// `header`, useful for callers precomputing archive sizes.
pub fn encoded_entry_len(header: &EntryHeader) -> Result<u64> {
    let head = encode_header(header)?;
    Ok(head.len() as u64 + round_up_to_block(header.size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_needs_no_extension() {
        let h = EntryHeader::new_file("hello.txt", 12);
        let bytes = encode_header(&h).unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        let raw = parse_raw_header(<&Block>::try_from(bytes.as_slice()).unwrap()).unwrap();
        assert_eq!(raw.name, "hello.txt");
        assert!(raw.prefix.is_empty());
    }

    #[test]
    fn splittable_long_name_uses_prefix() {
        let mut name = "a".repeat(119);
        name.push('/');
        name.push_str(&"b".repeat(8));
        assert_eq!(name.len(), 128);
        let h = EntryHeader::new_file(name.clone(), 1);
        let bytes = encode_header(&h).unwrap();
        // No PAX preamble: exactly one block.
        assert_eq!(bytes.len(), BLOCK_SIZE);
        let raw = parse_raw_header(<&Block>::try_from(bytes.as_slice()).unwrap()).unwrap();
        let (prefix, suffix) = split_ustar_name(&name).unwrap();
        assert_eq!(raw.name, suffix);
        assert_eq!(raw.prefix, prefix);
    }

    #[test]
    fn unsplittable_long_name_uses_pax() {
        let name = "x".repeat(200);
        let h = EntryHeader::new_file(name.clone(), 1);
        let bytes = encode_header(&h).unwrap();
        assert!(bytes.len() > BLOCK_SIZE);
        assert_eq!(bytes[156], b'x');
    }

    #[test]
    fn directory_gets_trailing_slash() {
        let h = EntryHeader::new_directory("foo");
        assert_eq!(h.name, "foo/");
    }

    #[test]
    fn size_just_under_8gib_encodes_in_octal() {
        // 8 GiB - 1, the largest value the 12-byte octal SIZE field holds.
        let size = 8 * 1024 * 1024 * 1024 - 1;
        let h = EntryHeader::new_file("big.bin", size);
        let bytes = encode_header(&h).unwrap();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        let raw = parse_raw_header(<&Block>::try_from(bytes.as_slice()).unwrap()).unwrap();
        assert_eq!(raw.size, size);
    }

    #[test]
    fn size_over_8gib_falls_back_to_pax() {
        let size = 8 * 1024 * 1024 * 1024 + 1;
        let h = EntryHeader::new_file("huge.bin", size);
        let bytes = encode_header(&h).unwrap();
        assert!(bytes.len() > BLOCK_SIZE);
        assert_eq!(bytes[156], b'x');
        let pax_payload_len_field = &bytes[124..136];
        let payload_len = block::read_octal(pax_payload_len_field).unwrap() as usize;
        let payload_start = BLOCK_SIZE;
        let payload = &bytes[payload_start..payload_start + payload_len];
        let records = pax::decode_records(payload).unwrap();
        assert_eq!(records.get("size").unwrap(), size.to_string());
    }
}
