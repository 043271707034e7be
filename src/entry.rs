use std::fmt;
use std::pin::Pin;

use async_std::stream::Stream;
use async_std::task::{Context, Poll};
use futures::stream::{self, BoxStream};
use futures::TryStreamExt;
use tracing::trace;

use crate::archive::{ContentState, SharedInner, UnpackOptions};
use crate::error::{Error, Result};
use crate::{EntryKind, EntryMetadata};

/// A read-only view into an entry of an archive.
///
/// Directories carry no content. Files carry a [`ContentAccessor`] through
/// which their bytes can be read once, until the entry stream that yielded
/// them is polled again.
pub struct Entry {
    metadata: EntryMetadata,
    size: u64,
    content: Option<ContentAccessor>,
    pub(crate) options: UnpackOptions,
}

impl Entry {
    pub(crate) fn new(
        metadata: EntryMetadata,
        size: u64,
        content: Option<ContentAccessor>,
        options: UnpackOptions,
    ) -> Entry {
        Entry {
            metadata,
            size,
            content,
            options,
        }
    }

    /// Returns the metadata decoded from the entry header.
    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// Returns the archive path of this entry, without a trailing `/`.
    pub fn path(&self) -> &str {
        &self.metadata.path
    }

    /// Returns whether this is a file or a directory.
    pub fn kind(&self) -> EntryKind {
        self.metadata.kind
    }

    /// Returns the content size recorded in the header, `0` for directories.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the content accessor of a file entry.
    pub fn content(&self) -> Option<&ContentAccessor> {
        self.content.as_ref()
    }

    /// Indicate whether extended permissions (like suid on Unix) are preserved
    /// when unpacking this entry.
    ///
    /// This flag is disabled by default and is currently only implemented on
    /// Unix.
    pub fn set_preserve_permissions(&mut self, preserve: bool) {
        self.options.preserve_permissions = preserve;
    }

    /// Indicate whether modification time information is preserved when
    /// unpacking this entry.
    ///
    /// This flag is enabled by default.
    pub fn set_preserve_mtime(&mut self, preserve: bool) {
        self.options.preserve_mtime = preserve;
    }

    /// Split the entry into its metadata and content accessor.
    pub fn into_parts(self) -> (EntryMetadata, Option<ContentAccessor>) {
        (self.metadata, self.content)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("metadata", &self.metadata)
            .field("size", &self.size)
            .finish()
    }
}

/// The materialization requested from a [`ContentAccessor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentMode {
    /// The whole content decoded as UTF-8.
    Text,
    /// The whole content in memory.
    Bytes,
    /// The content as a lazily read stream of chunks.
    Stream,
}

/// Content returned by [`ContentAccessor::get`].
#[derive(Debug)]
pub enum ExtractedContent {
    /// See [`ContentMode::Text`].
    Text(String),
    /// See [`ContentMode::Bytes`].
    Bytes(Vec<u8>),
    /// See [`ContentMode::Stream`].
    Stream(ContentStream),
}

/// One-shot access to the content of a file entry.
///
/// Exactly one call to [`get`](ContentAccessor::get) or one of its shorthands
/// succeeds, and only while the entry is the most recent one yielded. Any
/// later call fails with [`Error::ContentAlreadyConsumed`], as does any call
/// once the entry stream has moved on and skipped the content.
pub struct ContentAccessor {
    inner: SharedInner,
    index: u64,
    size: u64,
}

impl ContentAccessor {
    pub(crate) fn new(inner: SharedInner, index: u64, size: u64) -> ContentAccessor {
        ContentAccessor { inner, index, size }
    }

    /// Number of content bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the content in the requested `mode`.
    pub async fn get(&self, mode: ContentMode) -> Result<ExtractedContent> {
        Ok(match mode {
            ContentMode::Text => ExtractedContent::Text(self.text().await?),
            ContentMode::Bytes => ExtractedContent::Bytes(self.bytes().await?),
            ContentMode::Stream => ExtractedContent::Stream(self.stream().await?),
        })
    }

    /// Read the whole content as UTF-8 text.
    pub async fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.bytes().await?)?)
    }

    /// Read the whole content into memory.
    pub async fn bytes(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.size)
            .map_err(|_| Error::invalid_format("entry too large to hold in memory"))?;
        let mut inner = self.inner.lock().await;
        inner.claim(self.index, ContentState::Consumed)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let data = inner
            .cursor
            .read_exact(len)
            .await?
            .ok_or(Error::UnexpectedEndOfStream)?;
        inner.cursor.skip_padding(self.size).await?;
        Ok(data)
    }

    /// Read the content as a stream of chunks.
    ///
    /// The stream shares the archive input with the entry stream: drain it
    /// before asking for the next entry. Asking earlier skips whatever the
    /// stream has not read yet, and the stream then fails with
    /// [`Error::ContentAlreadyConsumed`].
    pub async fn stream(&self) -> Result<ContentStream> {
        let mut inner = self.inner.lock().await;
        let state = if self.size == 0 {
            ContentState::Consumed
        } else {
            ContentState::Streaming {
                remaining: self.size,
            }
        };
        inner.claim(self.index, state)?;
        Ok(ContentStream::new(self.inner.clone(), self.index, self.size))
    }
}

impl fmt::Debug for ContentAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentAccessor")
            .field("index", &self.index)
            .field("size", &self.size)
            .finish()
    }
}

/// The content of a file entry, read lazily in chunks.
pub struct ContentStream {
    chunks: BoxStream<'static, Result<Vec<u8>>>,
    size: u64,
}

impl ContentStream {
    fn new(inner: SharedInner, index: u64, size: u64) -> ContentStream {
        let chunks = stream::try_unfold((inner, size == 0), move |(inner, done)| async move {
            if done {
                return Ok::<_, Error>(None);
            }
            let (chunk, done) = next_content_chunk(&inner, index).await?;
            Ok(Some((chunk, (inner, done))))
        });
        ContentStream {
            chunks: Box::pin(chunks),
            size,
        }
    }

    /// Total number of bytes the stream yields.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the rest of the stream into memory.
    pub async fn read_to_end(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.try_for_each(|chunk| {
            buf.extend_from_slice(&chunk);
            futures::future::ready(Ok(()))
        })
        .await?;
        Ok(buf)
    }
}

/// Read the next chunk of file `index`. The flag is set on the final chunk,
/// by which time the padding has been skipped too.
async fn next_content_chunk(inner: &SharedInner, index: u64) -> Result<(Vec<u8>, bool)> {
    let mut inner = inner.lock().await;
    let (size, remaining) = match inner.current.as_ref() {
        Some(current) if current.index == index => match current.state {
            ContentState::Streaming { remaining } => (current.size, remaining),
            ContentState::Unread | ContentState::Consumed => {
                return Err(Error::ContentAlreadyConsumed)
            }
        },
        _ => return Err(Error::ContentAlreadyConsumed),
    };

    let chunk = inner
        .cursor
        .read_chunk(remaining)
        .await?
        .ok_or(Error::UnexpectedEndOfStream)?;
    let remaining = remaining - chunk.len() as u64;
    trace!(target: "tar", "content chunk of {} bytes, {} remaining", chunk.len(), remaining);

    let state = if remaining == 0 {
        inner.cursor.skip_padding(size).await?;
        ContentState::Consumed
    } else {
        ContentState::Streaming { remaining }
    };
    if let Some(current) = inner.current.as_mut() {
        current.state = state;
    }
    Ok((chunk, remaining == 0))
}

impl Stream for ContentStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("size", &self.size)
            .finish()
    }
}
