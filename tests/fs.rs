use std::fs;
use std::io;
use std::time::UNIX_EPOCH;

use async_std::io::Cursor;
use async_std::prelude::*;
use async_std::path::Path;
use tempfile::TempDir;

use async_ustar::{
    entries_from_dir, Archive, ArchiveBuilder, Compression, EntryMetadata, Error, HeaderMode,
    PackEntry, Packer,
};

fn path(p: &std::path::Path) -> &Path {
    Path::new(p.as_os_str())
}

fn populate(root: &std::path::Path) -> io::Result<()> {
    fs::create_dir_all(root.join("src/bin"))?;
    fs::write(root.join("Cargo.toml"), b"[package]\n")?;
    fs::write(root.join("src/lib.rs"), b"pub fn f() {}\n")?;
    fs::write(root.join("src/bin/main.rs"), vec![b'x'; 100_000])
}

#[async_std::test]
async fn directory_round_trip_through_gzip() -> io::Result<()> {
    let src = TempDir::new()?;
    populate(src.path())?;

    let packer = Packer::new(entries_from_dir(path(src.path()), HeaderMode::Complete));
    let mut compressed = Vec::new();
    let mut stream = packer.compressed(Compression::Gzip);
    while let Some(chunk) = stream.next().await {
        compressed.extend_from_slice(&chunk?);
    }

    let dst = TempDir::new()?;
    ArchiveBuilder::new(Cursor::new(compressed))
        .set_compression(Compression::Gzip)
        .build()
        .unpack(path(dst.path()))
        .await?;

    for file in ["Cargo.toml", "src/lib.rs", "src/bin/main.rs"] {
        assert_eq!(
            fs::read(dst.path().join(file))?,
            fs::read(src.path().join(file))?,
            "{}",
            file
        );
    }
    assert!(dst.path().join("src/bin").is_dir());

    let secs = |path: std::path::PathBuf| {
        let modified = fs::metadata(path).unwrap().modified().unwrap();
        modified.duration_since(UNIX_EPOCH).unwrap().as_secs()
    };
    assert_eq!(
        secs(src.path().join("src/lib.rs")),
        secs(dst.path().join("src/lib.rs"))
    );
    Ok(())
}

#[async_std::test]
async fn parent_components_are_skipped() -> io::Result<()> {
    let mut bytes = Vec::new();
    Packer::from_entries(vec![
        PackEntry::file(EntryMetadata::file("../escape"), "nope"),
        PackEntry::file(EntryMetadata::file("./inside/ok"), "yes"),
        PackEntry::file(EntryMetadata::file("/abs"), "root"),
    ])
    .write_to(&mut bytes)
    .await?;

    let outer = TempDir::new()?;
    let dst = outer.path().join("dst");
    fs::create_dir(&dst)?;

    let mut entries = Archive::new(Cursor::new(bytes)).entries();
    let mut unpacked = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        unpacked.push(entry.unpack_in(path(&dst)).await?);
    }
    assert_eq!(unpacked, [false, true, true]);
    assert!(!outer.path().join("escape").exists());
    assert_eq!(fs::read(dst.join("inside/ok"))?, b"yes");
    assert_eq!(fs::read(dst.join("abs"))?, b"root");
    Ok(())
}

#[async_std::test]
async fn unpacking_needs_unread_content() -> io::Result<()> {
    let mut bytes = Vec::new();
    Packer::from_entries(vec![PackEntry::file(EntryMetadata::file("f"), "data")])
        .write_to(&mut bytes)
        .await?;

    let dst = TempDir::new()?;
    let mut entries = Archive::new(Cursor::new(bytes)).entries();
    let entry = entries.next_entry().await?.unwrap();
    assert_eq!(entry.content().unwrap().text().await?, "data");
    assert!(matches!(
        entry.unpack_in(path(dst.path())).await,
        Err(Error::ContentAlreadyConsumed)
    ));
    Ok(())
}

#[cfg(unix)]
#[async_std::test]
async fn permissions_follow_the_header() -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut bytes = Vec::new();
    Packer::from_entries(vec![
        PackEntry::file(EntryMetadata::file("script").with_mode(0o4755), "#!/bin/sh\n"),
        PackEntry::file(EntryMetadata::file("plain").with_mode(0o600), "x"),
    ])
    .write_to(&mut bytes)
    .await?;

    let dst = TempDir::new()?;
    ArchiveBuilder::new(Cursor::new(bytes))
        .set_preserve_mtime(false)
        .build()
        .unpack(path(dst.path()))
        .await?;

    let mode = |name: &str| fs::metadata(dst.path().join(name)).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode("script"), 0o755);
    assert_eq!(mode("plain"), 0o600);
    Ok(())
}
