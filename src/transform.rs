//! The `strip`/`filter`/`map` entry transform layer (spec §4.5), layered on
//! top of the decoder for higher-level callers that don't want to deal with
//! raw headers.

use std::io::{self, Read};

use crate::decode::{Entries, Entry};
use crate::error::{Result, TarError};
use crate::header::EntryHeader;

/// Split `name` on `/`, discard empty components (collapsing `//` and a
/// leading `/`), and drop the first `n` of what remains. Returns `None` if
/// the result is empty — the caller drops the entry (spec §4.5).
fn strip_components(name: &str, n: i64) -> Result<Option<String>> {
    if n < 0 {
        return Err(TarError::InvalidStrip);
    }
    let components: Vec<&str> = name.split('/').filter(|c| !c.is_empty()).collect();
    let stripped = if (n as usize) >= components.len() {
        &components[components.len()..]
    } else {
        &components[n as usize..]
    };
    if stripped.is_empty() {
        Ok(None)
    } else {
        Ok(Some(stripped.join("/")))
    }
}

/// Strip a symlink/hardlink target in lockstep with its entry's name, per
/// spec §4.5: only applies when the target is itself absolute, and a fully
/// stripped target becomes `/`.
fn strip_linkname(linkname: &str, n: i64) -> Result<String> {
    if !linkname.starts_with('/') {
        return Ok(linkname.to_string());
    }
    match strip_components(linkname, n)? {
        Some(rest) => Ok(format!("/{rest}")),
        None => Ok("/".to_string()),
    }
}

/// Configures the transform stage. `filter` runs after `strip`; `map` runs
/// last (spec §4.5: `strip → filter → map`).
#[derive(Default)]
pub struct TransformOptions {
    pub strip: i64,
    pub filter: Option<Box<dyn FnMut(&EntryHeader) -> bool>>,
    pub map: Option<Box<dyn FnMut(EntryHeader) -> EntryHeader>>,
}

impl TransformOptions {
    pub fn new() -> Self {
        TransformOptions::default()
    }

    pub fn with_strip(mut self, strip: i64) -> Self {
        self.strip = strip;
        self
    }

    pub fn with_filter(mut self, filter: impl FnMut(&EntryHeader) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn with_map(mut self, map: impl FnMut(EntryHeader) -> EntryHeader + 'static) -> Self {
        self.map = Some(Box::new(map));
        self
    }
}

/// Applies `strip → filter → map` to an entry stream, skipping (draining)
/// any entry dropped along the way.
pub struct Transform<R: Read> {
    entries: Entries<R>,
    options: TransformOptions,
}

impl<R: Read> Transform<R> {
    pub fn new(entries: Entries<R>, options: TransformOptions) -> Self {
        Transform { entries, options }
    }

    fn apply(&mut self, mut entry: Entry<R>) -> Result<Option<Entry<R>>> {
        let mut header = entry.header().clone();

        match strip_components(&header.name, self.options.strip)? {
            None => {
                io::copy(&mut entry, &mut io::sink())?;
                return Ok(None);
            }
            Some(mut rest) => {
                if header.name.ends_with('/') {
                    rest.push('/');
                }
                header.name = rest;
            }
        }
        if let Some(linkname) = &header.linkname {
            header.linkname = Some(strip_linkname(linkname, self.options.strip)?);
        }

        if let Some(filter) = self.options.filter.as_mut() {
            if !filter(&header) {
                io::copy(&mut entry, &mut io::sink())?;
                return Ok(None);
            }
        }

        if let Some(map) = self.options.map.as_mut() {
            header = map(header);
        }

        entry.set_header(header);
        Ok(Some(entry))
    }
}

impl<R: Read> Iterator for Transform<R> {
    type Item = Result<Entry<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            match self.apply(entry) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
