//! An example of listing the entries of an archive.
//!
//! Takes a tarball on stdin and prints out all of the entries inside. Pass
//! `--gzip` for a gzip-compressed tarball.

use async_std::{io::stdin, prelude::*};

use async_ustar::{ArchiveBuilder, Compression};

fn main() {
    async_std::task::block_on(async {
        let compression = if std::env::args().any(|arg| arg == "--gzip") {
            Compression::Gzip
        } else {
            Compression::None
        };
        let mut entries = ArchiveBuilder::new(stdin())
            .set_compression(compression)
            .build()
            .entries();
        while let Some(entry) = entries.next().await {
            let entry = entry.unwrap();
            println!("{:?} {:>10} {}", entry.kind(), entry.size(), entry.path());
        }
    });
}
