//! A streaming USTAR/PAX/GNU-extended tar codec and a filesystem extractor
//! hardened against path-traversal, symlink-redirection,
//! hardlink-through-symlink, and Unicode-normalization cache-poisoning
//! attacks.
//!
//! The six components mirror a standard encode/decode/extract pipeline:
//! [`block`] and [`header`] encode one archive member's header, [`pax`]
//! carries overlong fields as extended records, [`pack`] sequences members
//! into a byte stream, [`decode`] parses that stream back into a push/pull
//! state machine, [`transform`] layers `strip`/`filter`/`map` on top of it,
//! and [`extract`] materializes the result under a destination directory
//! without ever writing outside it.

pub mod block;
pub mod decode;
pub mod error;
pub mod header;
pub mod pack;
pub mod pax;
pub mod transform;
pub mod extract;

pub use decode::{Archive, DecodeOptions, Entries, Entry};
pub use error::{Result, TarError};
pub use extract::{ExtractConfig, Extractor};
pub use header::{EntryHeader, EntryType};
pub use pack::{Builder, EntrySink};
pub use transform::{Transform, TransformOptions};

use std::io::Read;

/// Encode a finite, in-memory sequence of `(header, body)` pairs into a
/// complete archive.
pub fn encode_all<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (EntryHeader, &'a [u8])>,
{
    pack::encode_all(entries)
}

/// Decode a complete in-memory archive, applying `options`, into a list of
/// `(header, data)` pairs.
pub fn decode_all(bytes: &[u8], options: DecodeOptions) -> Result<Vec<(EntryHeader, Vec<u8>)>> {
    let mut archive = Archive::with_options(std::io::Cursor::new(bytes), options);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header().clone();
        let mut data = Vec::new();
        std::io::copy(&mut entry, &mut data)?;
        out.push((header, data));
    }
    Ok(out)
}

/// Start a new archive: a [`Builder`] writing into an in-memory byte buffer,
/// the pack controller spec §6 calls `pack_stream()`.
pub fn pack_stream() -> Builder<Vec<u8>> {
    Builder::new(Vec::new())
}

/// Wrap a byte source as a streaming archive, decoding lazily as entries are
/// consumed.
pub fn decode_stream<R: Read>(reader: R, options: DecodeOptions) -> Archive<R> {
    Archive::with_options(reader, options)
}

/// Layer `strip`/`filter`/`map` on top of a decoded entry stream.
pub fn transform_options<R: Read>(entries: Entries<R>, options: TransformOptions) -> Transform<R> {
    Transform::new(entries, options)
}

/// Materialize a stream of decoded entries under `config.destination`,
/// enforcing every bound the secure extractor checks.
pub fn extract_to_dir<R, I>(entries: I, config: ExtractConfig) -> Result<()>
where
    R: Read,
    I: IntoIterator<Item = Result<Entry<R>>>,
{
    let mut extractor = Extractor::new(config);
    extractor.extract_all(entries)
}
