//! Glue between archives and the local filesystem: building [`PackEntry`]
//! values out of files on disk and materializing extracted [`Entry`] values
//! under a destination directory.

use async_std::fs::{self, OpenOptions};
use async_std::io::{ErrorKind, WriteExt};
use async_std::path::{Component, Path, PathBuf};
use filetime::FileTime;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::{Content, Entry, EntryKind, EntryMetadata, PackEntry};

/// Modification time recorded by [`HeaderMode::Deterministic`]
/// (2006-07-01T00:00:00Z).
const DETERMINISTIC_TIMESTAMP: u64 = 1_151_712_000;

/// How much of the on-disk metadata makes it into an archive header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderMode {
    /// All supported metadata, including mode, owner ids and modification
    /// time. Owner names are left empty.
    Complete,
    /// Only what is needed to reproduce the tree: owner 0, no names, a fixed
    /// modification time and mode `0o755` for directories and executables,
    /// `0o644` otherwise.
    Deterministic,
}

/// Build the entry for the file or directory at `path`, stored in the archive
/// as `name`. Files are read lazily while the packer consumes them.
pub async fn entry_from_path<P, N>(path: P, name: N, mode: HeaderMode) -> Result<PackEntry>
where
    P: AsRef<Path>,
    N: Into<String>,
{
    let path = path.as_ref();
    let meta = fs::metadata(path)
        .await
        .map_err(|e| Error::filesystem(format!("failed to stat `{}`", path.display()), e))?;
    let metadata = metadata_for(&meta, name.into(), mode);

    if metadata.kind.is_dir() {
        return Ok(PackEntry::directory(metadata));
    }
    let file = fs::File::open(path)
        .await
        .map_err(|e| Error::filesystem(format!("failed to open `{}`", path.display()), e))?;
    Ok(PackEntry::file(metadata, Content::from_reader(meta.len(), file)))
}

fn metadata_for(meta: &fs::Metadata, path: String, mode: HeaderMode) -> EntryMetadata {
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let base = EntryMetadata {
        kind,
        path,
        mode: 0,
        uid: 0,
        gid: 0,
        uname: String::new(),
        gname: String::new(),
        mtime: DETERMINISTIC_TIMESTAMP,
    };
    match mode {
        HeaderMode::Deterministic => {
            let executable = kind.is_dir() || permission_bits(meta) & 0o100 == 0o100;
            base.with_mode(if executable { 0o755 } else { 0o644 })
        }
        HeaderMode::Complete => {
            let mtime = FileTime::from_last_modification_time(meta).unix_seconds();
            let (uid, gid) = owner_ids(meta);
            base.with_mode(permission_bits(meta))
                .with_owner(uid, gid)
                .with_mtime(mtime.max(0) as u64)
        }
    }
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

#[cfg(unix)]
fn owner_ids(meta: &fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn owner_ids(_: &fs::Metadata) -> (u32, u32) {
    (0, 0)
}

struct Walk {
    root: PathBuf,
    mode: HeaderMode,
    pending: Option<Vec<String>>,
}

/// Walk the tree under `root` lazily, yielding one entry per file and
/// directory with paths relative to `root`.
///
/// The walk is depth first with names sorted bytewise, and every directory
/// comes before its contents. `root` itself is not included. Symbolic links
/// are skipped.
pub fn entries_from_dir<P>(root: P, mode: HeaderMode) -> BoxStream<'static, Result<PackEntry>>
where
    P: AsRef<Path>,
{
    let walk = Walk {
        root: root.as_ref().to_path_buf(),
        mode,
        pending: None,
    };
    stream::try_unfold(walk, |mut walk| async move {
        if walk.pending.is_none() {
            walk.pending = Some(list_dir(&walk.root, "").await?);
        }
        loop {
            let name = match walk.pending.as_mut().and_then(Vec::pop) {
                Some(name) => name,
                None => return Ok::<_, Error>(None),
            };
            let path = walk.root.join(&name);
            let link = fs::symlink_metadata(&path)
                .await
                .map_err(|e| Error::filesystem(format!("failed to stat `{}`", path.display()), e))?;
            if link.file_type().is_symlink() {
                debug!(target: "tar", "skipping symlink {}", path.display());
                continue;
            }

            let entry = entry_from_path(&path, name.clone(), walk.mode).await?;
            if entry.metadata().kind.is_dir() {
                let children = list_dir(&walk.root, &name).await?;
                if let Some(pending) = walk.pending.as_mut() {
                    pending.extend(children);
                }
            }
            return Ok(Some((entry, walk)));
        }
    })
    .boxed()
}

/// Archive names of the children of `root/dir`, in reverse order so they can
/// be popped off a stack.
async fn list_dir(root: &Path, dir: &str) -> Result<Vec<String>> {
    let path = root.join(dir);
    let mut read_dir = fs::read_dir(&path)
        .await
        .map_err(|e| Error::filesystem(format!("failed to read `{}`", path.display()), e))?;
    let mut names = Vec::new();
    while let Some(child) = read_dir.next().await {
        let child =
            child.map_err(|e| Error::filesystem(format!("failed to read `{}`", path.display()), e))?;
        let name = child.file_name().to_string_lossy().into_owned();
        names.push(if dir.is_empty() {
            name
        } else {
            format!("{}/{}", dir, name)
        });
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names)
}

impl Entry {
    /// Extracts this entry into the `dst` directory.
    ///
    /// Entries with a `..` component in their path are skipped and `false`
    /// is returned; anything else is written below `dst`, creating missing
    /// parent directories. File content is streamed through the content
    /// accessor, so it must not have been read already.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> { async_std::task::block_on(async {
    /// #
    /// use async_std::fs::File;
    /// use async_std::prelude::*;
    /// use async_ustar::Archive;
    ///
    /// let mut entries = Archive::new(File::open("foo.tar").await?).entries();
    /// while let Some(entry) = entries.next().await {
    ///     entry?.unpack_in("target").await?;
    /// }
    /// #
    /// # Ok(()) }) }
    /// ```
    pub async fn unpack_in<P: AsRef<Path>>(&self, dst: P) -> Result<bool> {
        let dst = dst.as_ref();
        let mut file_dst = dst.to_path_buf();
        for part in Path::new(self.path()).components() {
            match part {
                // Leading '/' characters, root paths, and '.' components are
                // treated as empty.
                Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,
                Component::ParentDir => return Ok(false),
                Component::Normal(part) => file_dst.push(part),
            }
        }

        // Only slashes or '.' parts were seen, an effectively empty name.
        if *dst == *file_dst {
            return Ok(true);
        }

        let parent = match file_dst.parent() {
            Some(p) => p,
            None => return Ok(false),
        };
        if parent.symlink_metadata().await.is_err() {
            fs::create_dir_all(&parent).await.map_err(|e| {
                Error::filesystem(format!("failed to create `{}`", parent.display()), e)
            })?;
        }
        validate_inside_dst(dst, parent).await?;

        match self.kind() {
            EntryKind::Directory => self.unpack_dir(&file_dst).await?,
            EntryKind::File => self.unpack_file(&file_dst).await?,
        }
        debug!(target: "tar", "unpacked {} to {}", self.path(), file_dst.display());

        set_perms(&file_dst, self.metadata().mode, self.options.preserve_permissions).await?;
        Ok(true)
    }

    async fn unpack_dir(&self, dst: &Path) -> Result<()> {
        // If the directory already exists just let it slide
        match fs::create_dir(dst).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && dst.is_dir().await => Ok(()),
            Err(err) => Err(Error::filesystem(
                format!("failed to create dir `{}`", dst.display()),
                err,
            )),
        }
    }

    async fn unpack_file(&self, dst: &Path) -> Result<()> {
        let accessor = match self.content() {
            Some(accessor) => accessor,
            None => return Err(Error::ContentAlreadyConsumed),
        };
        let mut content = accessor.stream().await?;

        // Write a new file rather than overwriting in place; unlink any
        // existing one first.
        if dst.symlink_metadata().await.is_ok() {
            fs::remove_file(dst).await.map_err(|e| {
                Error::filesystem(format!("failed to replace `{}`", dst.display()), e)
            })?;
        }
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst)
            .await
            .map_err(|e| Error::filesystem(format!("failed to create `{}`", dst.display()), e))?;

        let write_err = |e| Error::filesystem(format!("failed to write `{}`", dst.display()), e);
        while let Some(chunk) = content.next().await {
            f.write_all(&chunk?).await.map_err(write_err)?;
        }
        f.flush().await.map_err(write_err)?;
        drop(f);

        if self.options.preserve_mtime {
            let mtime = FileTime::from_unix_time(self.metadata().mtime as i64, 0);
            filetime::set_file_times(dst, mtime, mtime).map_err(|e| {
                Error::filesystem(format!("failed to set mtime for `{}`", dst.display()), e)
            })?;
        }
        Ok(())
    }
}

/// Refuse to write through a parent that resolves outside of `dst`, for
/// example through a symlink created by an earlier entry.
async fn validate_inside_dst(dst: &Path, parent: &Path) -> Result<()> {
    let canon_parent = parent.canonicalize().await.map_err(|e| {
        Error::filesystem(format!("failed to canonicalize `{}`", parent.display()), e)
    })?;
    let canon_dst = dst.canonicalize().await.map_err(|e| {
        Error::filesystem(format!("failed to canonicalize `{}`", dst.display()), e)
    })?;
    if !canon_parent.starts_with(&canon_dst) {
        return Err(Error::filesystem(
            format!(
                "trying to unpack outside of destination path: {}",
                canon_dst.display()
            ),
            std::io::Error::new(ErrorKind::InvalidInput, "invalid argument"),
        ));
    }
    Ok(())
}

async fn set_perms(dst: &Path, mode: u32, preserve: bool) -> Result<()> {
    _set_perms(dst, mode, preserve).await.map_err(|e| {
        Error::filesystem(
            format!("failed to set permissions to {:o} for `{}`", mode, dst.display()),
            e,
        )
    })
}

#[cfg(unix)]
async fn _set_perms(dst: &Path, mode: u32, preserve: bool) -> std::io::Result<()> {
    use std::os::unix::prelude::*;

    let mode = if preserve { mode } else { mode & 0o777 };
    fs::set_permissions(dst, fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn _set_perms(dst: &Path, mode: u32, _preserve: bool) -> std::io::Result<()> {
    if mode & 0o200 == 0o200 {
        return Ok(());
    }
    let mut perm = fs::metadata(dst).await?.permissions();
    perm.set_readonly(true);
    fs::set_permissions(dst, perm).await
}
