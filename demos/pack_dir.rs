//! An example of packing a directory.
//!
//! Archives the directory named by the first argument into the file named by
//! the second, compressing it when that name ends in `.gz` or `.tgz`.

use std::env::args_os;

use async_std::{fs::File, prelude::*};

use async_ustar::{entries_from_dir, Compression, HeaderMode, Packer};

fn main() {
    async_std::task::block_on(async {
        let mut args = args_os().skip(1);
        let root = args.next().unwrap();
        let target = args.next().unwrap();

        let packer = Packer::new(entries_from_dir(&root, HeaderMode::Deterministic));
        let mut bytes = packer.compressed(Compression::from_path(&target));
        let mut file = File::create(&target).await.unwrap();
        while let Some(chunk) = bytes.next().await {
            file.write_all(&chunk.unwrap()).await.unwrap();
        }
        file.flush().await.unwrap();
    });
}
