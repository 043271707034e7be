use crate::EntryKind;

/// Metadata shared by entries being packed and entries being extracted.
///
/// `path` is archive-relative and `/`-separated. Directories are stored with
/// a trailing slash on disk but are always exposed without one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMetadata {
    /// File or directory.
    pub kind: EntryKind,
    /// Archive-relative path.
    pub path: String,
    /// Permission bits; only the low 12 bits are stored.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Owner user name, at most 32 bytes are stored.
    pub uname: String,
    /// Owner group name, at most 32 bytes are stored.
    pub gname: String,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: u64,
}

impl EntryMetadata {
    /// Metadata for a regular file with mode `0o644`, owned by root and
    /// dated at the epoch.
    pub fn file<P: Into<String>>(path: P) -> EntryMetadata {
        EntryMetadata::new(EntryKind::File, path.into(), 0o644)
    }

    /// Metadata for a directory with mode `0o755`, owned by root and dated
    /// at the epoch.
    pub fn directory<P: Into<String>>(path: P) -> EntryMetadata {
        EntryMetadata::new(EntryKind::Directory, path.into(), 0o755)
    }

    fn new(kind: EntryKind, path: String, mode: u32) -> EntryMetadata {
        EntryMetadata {
            kind,
            path,
            mode,
            uid: 0,
            gid: 0,
            uname: String::new(),
            gname: String::new(),
            mtime: 0,
        }
    }

    /// Replace the permission bits.
    pub fn with_mode(mut self, mode: u32) -> EntryMetadata {
        self.mode = mode;
        self
    }

    /// Replace the numeric owner.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> EntryMetadata {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Replace the owner names.
    pub fn with_names<U: Into<String>, G: Into<String>>(mut self, uname: U, gname: G) -> EntryMetadata {
        self.uname = uname.into();
        self.gname = gname.into();
        self
    }

    /// Replace the modification time.
    pub fn with_mtime(mut self, mtime: u64) -> EntryMetadata {
        self.mtime = mtime;
        self
    }
}
