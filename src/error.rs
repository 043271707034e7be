use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while packing or extracting an archive.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream is not a well-formed ustar archive: bad magic,
    /// malformed terminator, truncated header or an unparsable field.
    #[error("invalid archive format: {0}")]
    InvalidFormat(String),

    /// A header block failed checksum verification. `stored` is `None` when
    /// the checksum field itself could not be parsed.
    #[error("archive header checksum mismatch (stored {stored:?}, computed {computed:o})")]
    InvalidChecksum {
        /// Value found in the header, if it was readable.
        stored: Option<u32>,
        /// Value computed over the header block.
        computed: u32,
    },

    /// The byte stream ended in the middle of entry content or padding.
    #[error("unexpected end of archive stream")]
    UnexpectedEndOfStream,

    /// The content of an entry was already read, or was skipped because
    /// iteration moved past it.
    #[error("entry content has already been consumed")]
    ContentAlreadyConsumed,

    /// The operation observed a raised [`AbortSignal`](crate::AbortSignal).
    #[error("operation aborted")]
    Aborted,

    /// A metadata value does not fit into its fixed-width header field.
    #[error("{field} value {value} does not fit in a ustar header")]
    FieldTooLarge {
        /// Name of the header field.
        field: &'static str,
        /// Rejected value.
        value: u64,
    },

    /// Content requested as text is not valid UTF-8.
    #[error("entry content is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A filesystem operation of the packing or unpacking helpers failed.
    #[error("{desc}")]
    Filesystem {
        /// What was being done.
        desc: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// I/O failure of an underlying source or sink.
    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    pub(crate) fn invalid_format<S: Into<String>>(msg: S) -> Error {
        Error::InvalidFormat(msg.into())
    }

    pub(crate) fn filesystem(desc: String, source: io::Error) -> Error {
        Error::Filesystem { desc, source }
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            Error::InvalidFormat(_) | Error::InvalidChecksum { .. } | Error::InvalidUtf8(_) => {
                io::ErrorKind::InvalidData
            }
            Error::UnexpectedEndOfStream => io::ErrorKind::UnexpectedEof,
            Error::Aborted => io::ErrorKind::Interrupted,
            Error::FieldTooLarge { .. } => io::ErrorKind::InvalidInput,
            Error::Filesystem { source, .. } => source.kind(),
            Error::Io(err) => err.kind(),
            Error::ContentAlreadyConsumed => io::ErrorKind::Other,
        }
    }
}

// Byte streams carry `io::Error`; a crate error wrapped on the way in is
// unwrapped again here so callers see the original variant.
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(inner)) => Error::Io(io::Error::other(inner)),
            None => Error::Io(io::Error::other("empty error")),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(err) => err,
            err => io::Error::new(err.kind(), err),
        }
    }
}
