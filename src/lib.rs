//! A library for reading and writing ustar archives in an async fashion.
//!
//! This library provides utilities necessary to manage [TAR archives][1] in
//! the POSIX ustar format, abstracted over byte streams. Great strides are
//! taken to ensure that neither an archive nor any single file in it is ever
//! required to be fully resident in memory.
//!
//! * [`Packer`] turns a lazy sequence of [`PackEntry`] values into archive
//!   bytes.
//! * [`Archive`] turns archive bytes into a lazy sequence of [`Entry`]
//!   values whose content is read, at most once, through a
//!   [`ContentAccessor`].
//! * [`Compression`] optionally frames either direction with gzip.
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> { async_std::task::block_on(async {
//! use async_std::prelude::*;
//! use async_ustar::{Archive, EntryMetadata, PackEntry, Packer};
//!
//! let mut bytes = Vec::new();
//! Packer::from_entries(vec![PackEntry::file(EntryMetadata::file("hello.txt"), "Hello, world!")])
//!     .write_to(&mut bytes)
//!     .await?;
//!
//! let mut entries = Archive::new(async_std::io::Cursor::new(bytes)).entries();
//! while let Some(entry) = entries.next().await {
//!     let entry = entry?;
//!     if let Some(content) = entry.content() {
//!         println!("{}: {}", entry.path(), content.text().await?);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(()) }) }
//! ```
//!
//! [1]: http://en.wikipedia.org/wiki/Tar_%28computing%29

// More docs about the detailed tar format can also be found here:
// http://www.freebsd.org/cgi/man.cgi?query=tar&sektion=5&manpath=FreeBSD+8-current

#![deny(missing_docs)]
#![deny(clippy::all)]

pub use crate::{
    abort::AbortSignal,
    archive::{Archive, ArchiveBuilder, Entries},
    compression::Compression,
    cursor::{ByteCursor, ChunkStream, ReaderChunks, CHUNK_SIZE},
    entry::{ContentAccessor, ContentMode, ContentStream, Entry, ExtractedContent},
    entry_type::EntryKind,
    error::{Error, Result},
    fs::{entries_from_dir, entry_from_path, HeaderMode},
    metadata::EntryMetadata,
    pack::{Content, EntryIter, PackEntry, Packer},
};

mod abort;
mod archive;
mod compression;
mod cursor;
mod entry;
mod entry_type;
mod error;
mod fs;
pub mod header;
mod metadata;
mod pack;

#[cfg(test)]
#[macro_use]
extern crate static_assertions;
