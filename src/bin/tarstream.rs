//! Command-line front end for the `tarstream` codec and secure extractor.
//!
//! # Packing a directory
//! ```bash
//! $ tarstream pack src/ out.tar
//! wrote out.tar, 12 entries
//! ```
//!
//! # Listing an archive
//! ```bash
//! $ tarstream list out.tar
//! src/lib.rs, size = 2048 bytes
//! src/main.rs, size = 512 bytes
//! ```
//!
//! # Unpacking an archive
//! ```bash
//! $ tarstream unpack out.tar dest/
//! extracted dest/, 12 entries
//! ```

use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tarstream::decode::Archive;
use tarstream::extract::{ExtractConfig, Extractor};
use tarstream::header::EntryHeader;
use tarstream::pack::Builder;

/// Streaming tar codec and secure extractor.
#[doc(hidden)]
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose (`debug`) tracing output. `RUST_LOG` takes precedence.
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[doc(hidden)]
#[derive(Subcommand)]
enum Commands {
    /// Create an archive from a directory tree.
    Pack {
        /// Directory to archive.
        #[clap(value_parser, name = "source", required = true)]
        source: String,

        /// Output archive path.
        #[clap(value_parser, name = "archive", required = true)]
        archive: String,
    },

    /// List the entries of an archive.
    List {
        /// Archive to read.
        #[clap(value_parser, name = "archive", required = true)]
        archive: String,

        /// Reject malformed checksums and truncated streams instead of
        /// tolerating them.
        #[clap(long)]
        strict: bool,
    },

    /// Extract an archive into a destination directory.
    Unpack {
        /// Archive to read.
        #[clap(value_parser, name = "archive", required = true)]
        archive: String,

        /// Destination directory; created if missing.
        #[clap(value_parser, name = "destination", required = true)]
        destination: String,

        /// Reject malformed checksums and truncated streams instead of
        /// tolerating them.
        #[clap(long)]
        strict: bool,

        /// Maximum path depth an entry name may have. `0` means unlimited.
        #[clap(long, default_value_t = 1024)]
        max_depth: usize,
    },
}

#[doc(hidden)]
fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Pack { source, archive } => pack(source, archive),
        Commands::List { archive, strict } => list(archive, *strict),
        Commands::Unpack {
            archive,
            destination,
            strict,
            max_depth,
        } => unpack(archive, destination, *strict, *max_depth),
    }
}

fn pack(source: &str, archive: &str) -> Result<()> {
    let source_path = Path::new(source);
    let out =
        File::create(archive).with_context(|| format!("{archive}: failed to create archive"))?;
    let mut builder = Builder::new(out);

    let mut count = 0usize;
    walk_and_add(source_path, source_path, &mut builder, &mut count)
        .with_context(|| format!("{source}: failed to walk directory"))?;
    builder
        .finalize()
        .with_context(|| format!("{archive}: failed to finalize archive"))?;

    println!("wrote {archive}, {count} entries");
    Ok(())
}

/// Thin glue recursively walking `dir` and adding each file/directory under
/// `root` to `builder`; the core archive format logic lives in the library.
fn walk_and_add(
    root: &Path,
    dir: &Path,
    builder: &mut Builder<File>,
    count: &mut usize,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)?
            .to_string_lossy()
            .replace('\\', "/");
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            let header = EntryHeader::new_directory(rel);
            builder.add_entry(header)?.finish()?;
            *count += 1;
            walk_and_add(root, &path, builder, count)?;
        } else if metadata.is_file() {
            let header = EntryHeader::new_file(rel, metadata.len());
            let mut sink = builder.add_entry(header)?;
            let mut f = File::open(&path)?;
            std::io::copy(&mut f, &mut sink)?;
            sink.finish()?;
            *count += 1;
        }
        // Symlinks in the source tree are skipped by this CLI's walker; the
        // library itself has no such restriction (see EntryHeader::new_symlink).
    }
    Ok(())
}

fn list(archive: &str, strict: bool) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("{archive}: failed to open"))?;
    let options = tarstream::DecodeOptions { strict };
    let mut archive_reader = Archive::with_options(file, options);
    for entry in archive_reader
        .entries()
        .with_context(|| format!("{archive}: failed to read entries"))?
    {
        let entry = entry.with_context(|| format!("{archive}: malformed entry"))?;
        let header = entry.header();
        println!("{}, size = {} bytes", header.name, header.size);
    }
    Ok(())
}

fn unpack(archive: &str, destination: &str, strict: bool, max_depth: usize) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("{archive}: failed to open"))?;
    let options = tarstream::DecodeOptions { strict };
    let mut archive_reader = Archive::with_options(file, options);

    fs::create_dir_all(destination).with_context(|| format!("{destination}: failed to create"))?;
    let dest = fs::canonicalize(destination)
        .with_context(|| format!("{destination}: failed to resolve absolute path"))?;

    let mut config = ExtractConfig::new(dest.clone());
    config.max_depth = if max_depth == 0 { None } else { Some(max_depth) };
    let mut extractor = Extractor::new(config);

    let mut count = 0usize;
    for entry in archive_reader
        .entries()
        .with_context(|| format!("{archive}: failed to read entries"))?
    {
        let mut entry = entry.with_context(|| format!("{archive}: malformed entry"))?;
        let header = entry.header().clone();
        extractor
            .extract_entry(&header, &mut entry)
            .with_context(|| format!("{}: failed to extract", header.name))?;
        count += 1;
    }

    println!("extracted {destination}, {count} entries");
    Ok(())
}
