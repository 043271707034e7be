use std::path::Path;

use async_compression::futures::bufread::{GzipDecoder, GzipEncoder};
use async_std::io::{BufReader, Read};
use futures::TryStreamExt;

use crate::cursor::{ChunkStream, ReaderChunks};

/// Byte-stream framing applied around a whole archive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    #[default]
    None,
    /// The archive is the payload of a gzip stream.
    Gzip,
}

impl Compression {
    /// Guess the framing from a file name: `.gz` and `.tgz` (in any case)
    /// select gzip.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Compression {
        let name = path.as_ref().to_string_lossy();
        if ends_with_ignore_case(&name, ".gz") || ends_with_ignore_case(&name, ".tgz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// Apply the framing to an archive byte stream.
    pub fn encode(self, input: ChunkStream) -> ChunkStream {
        match self {
            Compression::None => input,
            Compression::Gzip => Box::pin(ReaderChunks::new(GzipEncoder::new(input.into_async_read()))),
        }
    }

    /// Remove the framing from an archive byte stream.
    pub fn decode(self, input: ChunkStream) -> ChunkStream {
        match self {
            Compression::None => input,
            Compression::Gzip => Box::pin(ReaderChunks::new(GzipDecoder::new(input.into_async_read()))),
        }
    }

    /// Remove the framing from an archive read out of `reader`.
    pub fn decode_reader<R>(self, reader: R) -> ChunkStream
    where
        R: Read + Send + 'static,
    {
        match self {
            Compression::None => Box::pin(ReaderChunks::new(reader)),
            Compression::Gzip => Box::pin(ReaderChunks::new(GzipDecoder::new(BufReader::new(reader)))),
        }
    }
}

fn ends_with_ignore_case(name: &str, suffix: &str) -> bool {
    name.len() >= suffix.len()
        && name.as_bytes()[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
}
