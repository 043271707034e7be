/// The kind of an archive entry.
///
/// Only regular files and directories are represented. When decoding, any
/// type flag other than the directory flag is treated as a regular file, which
/// is what POSIX asks of readers that meet an unknown type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file, type flag `'0'`.
    File,
    /// A directory, type flag `'5'`.
    Directory,
}

impl EntryKind {
    /// Returns the type flag byte written into a header for this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            EntryKind::File => b'0',
            EntryKind::Directory => b'5',
        }
    }

    /// Classifies a header type flag byte.
    pub fn from_byte(byte: u8) -> EntryKind {
        match byte {
            b'5' => EntryKind::Directory,
            _ => EntryKind::File,
        }
    }

    /// Returns whether this is a regular file.
    pub fn is_file(self) -> bool {
        self == EntryKind::File
    }

    /// Returns whether this is a directory.
    pub fn is_dir(self) -> bool {
        self == EntryKind::Directory
    }
}
