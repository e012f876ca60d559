//! PAX extended-header record encoding/decoding (C3).
//!
//! Each record is `"<len> <key>=<value>\n"` where `<len>` is the decimal
//! byte length of the *entire* record, itself included (spec §4.3).

use std::collections::BTreeMap;

use crate::error::{Result, TarError};

/// An ordered set of PAX key/value records. Keys are restricted to ASCII;
/// unknown keys round-trip verbatim in [`crate::header::EntryHeader::pax`].
#[derive(Debug, Clone, Default)]
pub struct PaxRecords {
    // BTreeMap gives deterministic encode order, which the spec does not
    // require but makes output reproducible and tests simpler to write.
    records: BTreeMap<String, String>,
}

impl PaxRecords {
    pub fn new() -> Self {
        PaxRecords::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.records.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.records.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.records
    }
}

/// Compute the length prefix for one `key=value` record. Because the
/// length field includes the byte length of its own digits, this is a
/// small fixed point: start from a guess and grow until stable (spec
/// §4.3).
fn record_len(key: &str, value: &str) -> usize {
    // space + '=' + '\n'
    let inner = key.len() + value.len() + 3;
    let mut digits = inner.to_string().len();
    loop {
        let total = digits + inner;
        let needed = total.to_string().len();
        if needed == digits {
            return total;
        }
        digits = needed;
    }
}

/// Encode a full set of records into the on-wire PAX payload.
pub fn encode_records(records: &PaxRecords) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in records.iter() {
        let len = record_len(key, value);
        out.extend_from_slice(format!("{len} {key}={value}\n").as_bytes());
    }
    out
}

/// Decode a PAX payload into a record set. Unknown keys are preserved
/// as-is; the caller (decoder) applies recognized keys to header fields.
pub fn decode_records(payload: &[u8]) -> Result<PaxRecords> {
    let mut records = PaxRecords::new();
    let mut offset = 0usize;

    while offset < payload.len() {
        // Trailing NUL padding (from block rounding) ends parsing.
        if payload[offset] == 0 {
            break;
        }

        let space_pos = memchr::memchr(b' ', &payload[offset..]).ok_or_else(|| {
            TarError::BadPaxRecord("missing length/key separator".into())
        })?;
        let len_str = std::str::from_utf8(&payload[offset..offset + space_pos])
            .map_err(|_| TarError::BadPaxRecord("non-UTF8 length prefix".into()))?;
        let len: usize = len_str
            .parse()
            .map_err(|_| TarError::BadPaxRecord(format!("bad length prefix {len_str:?}")))?;

        if len == 0 || offset + len > payload.len() {
            return Err(TarError::BadPaxRecord(format!(
                "record length {len} exceeds remaining payload"
            )));
        }

        let record = &payload[offset..offset + len];
        // record = "<len> <key>=<value>\n"
        let after_len = &record[space_pos + 1..];
        let eq_pos = memchr::memchr(b'=', after_len)
            .ok_or_else(|| TarError::BadPaxRecord("missing '=' in record".into()))?;
        let key = std::str::from_utf8(&after_len[..eq_pos])
            .map_err(|_| TarError::BadPaxRecord("non-UTF8 key".into()))?;
        let value_bytes = &after_len[eq_pos + 1..after_len.len() - 1];
        let value = String::from_utf8_lossy(value_bytes).into_owned();

        records.insert(key.to_string(), value);
        offset += len;
    }

    Ok(records)
}
