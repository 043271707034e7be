use std::cmp;
use std::pin::Pin;

use async_std::io::{self, Read};
use async_std::stream::Stream;
use async_std::task::{Context, Poll};
use futures::StreamExt;
use pin_project::pin_project;

use crate::error::{Error, Result};
use crate::header::padding_for;
use crate::AbortSignal;

/// Size of the chunks read out of an [`io::Read`] source.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A boxed source of byte chunks of arbitrary length.
pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;

/// Adapts an async reader into a stream of byte chunks of at most
/// [`CHUNK_SIZE`] bytes.
#[pin_project]
pub struct ReaderChunks<R> {
    #[pin]
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> ReaderChunks<R> {
    /// Wrap `reader`.
    pub fn new(reader: R) -> ReaderChunks<R> {
        ReaderChunks::with_capacity(CHUNK_SIZE, reader)
    }

    /// Wrap `reader`, reading at most `capacity` bytes per chunk.
    pub fn with_capacity(capacity: usize, reader: R) -> ReaderChunks<R> {
        ReaderChunks {
            reader,
            buf: vec![0; cmp::max(capacity, 1)],
            done: false,
        }
    }
}

impl<R: Read> Stream for ReaderChunks<R> {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        match async_std::task::ready!(this.reader.poll_read(cx, &mut this.buf[..])) {
            Ok(0) => {
                *this.done = true;
                Poll::Ready(None)
            }
            Ok(n) => Poll::Ready(Some(Ok(this.buf[..n].to_vec()))),
            Err(err) => {
                *this.done = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

/// Exact-size reads over a chunked byte source.
///
/// Chunks rarely line up with the 512-byte structure of an archive, so any
/// bytes pulled beyond what a read asked for are put back and served first by
/// the next read. At most one such remainder is ever pending.
///
/// Every pull checks the abort signal first, even when the next bytes are
/// already buffered.
pub struct ByteCursor {
    source: ChunkStream,
    putback: Option<Vec<u8>>,
    abort: AbortSignal,
    position: u64,
}

impl ByteCursor {
    /// Create a cursor over `source` observing `abort`.
    pub fn new(source: ChunkStream, abort: AbortSignal) -> ByteCursor {
        ByteCursor {
            source,
            putback: None,
            abort,
            position: 0,
        }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Pull the next non-empty chunk, put-back bytes first. `None` marks the
    /// end of the source.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.abort.check()?;
        let chunk = match self.putback.take() {
            Some(chunk) => chunk,
            None => loop {
                match self.source.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => break chunk,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(None),
                }
            },
        };
        self.position += chunk.len() as u64;
        Ok(Some(chunk))
    }

    /// Pull the next chunk, limited to `max` bytes. Any excess is put back.
    pub async fn read_chunk(&mut self, max: u64) -> Result<Option<Vec<u8>>> {
        let mut chunk = match self.next_chunk().await? {
            Some(chunk) => chunk,
            None => return Ok(None),
        };
        if chunk.len() as u64 > max {
            let rest = chunk.split_off(max as usize);
            self.put_back(rest);
        }
        Ok(Some(chunk))
    }

    /// Return `bytes` to the front of the source.
    ///
    /// Only the remainder of the chunk most recently pulled may be put back.
    pub fn put_back(&mut self, mut bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        debug_assert!(self.putback.is_none(), "put-back slot already occupied");
        self.position -= bytes.len() as u64;
        if let Some(pending) = self.putback.take() {
            bytes.extend_from_slice(&pending);
        }
        self.putback = Some(bytes);
    }

    /// Read exactly `n` bytes.
    ///
    /// Returns `None` if the source was already exhausted, and fails with
    /// [`Error::UnexpectedEndOfStream`] if it ended after some but not all of
    /// the requested bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Option<Vec<u8>>> {
        let mut buf: Vec<u8> = Vec::new();
        while buf.len() < n {
            let want = (n - buf.len()) as u64;
            match self.read_chunk(want).await? {
                Some(chunk) if buf.is_empty() => buf = chunk,
                Some(chunk) => buf.extend_from_slice(&chunk),
                None if buf.is_empty() => return Ok(None),
                None => return Err(Error::UnexpectedEndOfStream),
            }
        }
        tracing::trace!(target: "tar", "cursor.read_exact: n={} position={}", n, self.position);
        Ok(Some(buf))
    }

    /// Consume and discard exactly `n` bytes.
    pub async fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            match self.read_chunk(n).await? {
                Some(chunk) => n -= chunk.len() as u64,
                None => return Err(Error::UnexpectedEndOfStream),
            }
        }
        Ok(())
    }

    /// Discard the zero padding that follows `content_size` bytes of entry
    /// content.
    pub async fn skip_padding(&mut self, content_size: u64) -> Result<()> {
        self.skip(padding_for(content_size)).await
    }
}
