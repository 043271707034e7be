use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use async_std::channel::{self, Receiver, Sender};
use async_std::io::{self, Read, ReadExt, Write, WriteExt};
use async_std::stream::Stream;
use async_std::task::{ready, Context, Poll};
use futures::{stream, StreamExt};
use pin_project::pin_project;
use tracing::{debug, trace, warn};

use crate::cursor::{ChunkStream, ReaderChunks};
use crate::error::Result;
use crate::header::{self, padding_for, BLOCK_SIZE};
use crate::{AbortSignal, Compression, EntryKind, EntryMetadata};

/// Number of chunks a push source buffers before its sender has to wait for
/// the packer to catch up.
const PUSH_CAPACITY: usize = 8;

/// The content of a file entry handed to a [`Packer`].
///
/// Sized sources must produce exactly the number of bytes they declare. The
/// header is written before any content is seen, so a source that produces
/// more or fewer bytes leaves a corrupt archive behind.
pub enum Content {
    /// Content held in memory.
    Bytes(Vec<u8>),
    /// A source the packer pulls chunks from as it goes.
    Pull {
        /// Declared number of bytes.
        size: u64,
        /// The chunks, in order.
        chunks: ChunkStream,
    },
    /// A source fed from elsewhere through the [`Sender`] returned by
    /// [`Content::push`]. Dropping the sender ends the content.
    Push {
        /// Declared number of bytes.
        size: u64,
        /// Receiving half of the feeding channel.
        receiver: Receiver<io::Result<Vec<u8>>>,
    },
}

impl Content {
    /// A sized source pulling chunks from `chunks`.
    pub fn pull<S>(size: u64, chunks: S) -> Content
    where
        S: Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        Content::Pull {
            size,
            chunks: Box::pin(chunks),
        }
    }

    /// A sized source reading `size` bytes out of `reader`. Anything the
    /// reader holds past `size` is left unread.
    pub fn from_reader<R>(size: u64, reader: R) -> Content
    where
        R: Read + Send + 'static,
    {
        Content::pull(size, ReaderChunks::new(reader.take(size)))
    }

    /// A sized source fed through the returned sender.
    ///
    /// The sender must be driven concurrently with the packer, for example
    /// from a spawned task; it waits while the packer is busy elsewhere.
    pub fn push(size: u64) -> (Content, Sender<io::Result<Vec<u8>>>) {
        let (sender, receiver) = channel::bounded(PUSH_CAPACITY);
        (Content::Push { size, receiver }, sender)
    }

    /// The number of bytes this content announces in its header.
    pub fn size(&self) -> u64 {
        match self {
            Content::Bytes(data) => data.len() as u64,
            Content::Pull { size, .. } | Content::Push { size, .. } => *size,
        }
    }
}

impl From<Vec<u8>> for Content {
    fn from(data: Vec<u8>) -> Content {
        Content::Bytes(data)
    }
}

impl From<&[u8]> for Content {
    fn from(data: &[u8]) -> Content {
        Content::Bytes(data.to_vec())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Content {
        Content::Bytes(text.into_bytes())
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Content {
        Content::Bytes(text.as_bytes().to_vec())
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Content::Pull { size, .. } => f.debug_struct("Pull").field("size", size).finish(),
            Content::Push { size, .. } => f.debug_struct("Push").field("size", size).finish(),
        }
    }
}

/// One entry to be packed: its metadata and, for files, its content.
#[derive(Debug)]
pub struct PackEntry {
    metadata: EntryMetadata,
    content: Option<Content>,
}

impl PackEntry {
    /// A file entry. The kind in `metadata` is forced to [`EntryKind::File`].
    pub fn file<C: Into<Content>>(mut metadata: EntryMetadata, content: C) -> PackEntry {
        metadata.kind = EntryKind::File;
        PackEntry {
            metadata,
            content: Some(content.into()),
        }
    }

    /// A directory entry. The kind in `metadata` is forced to
    /// [`EntryKind::Directory`].
    pub fn directory(mut metadata: EntryMetadata) -> PackEntry {
        metadata.kind = EntryKind::Directory;
        PackEntry {
            metadata,
            content: None,
        }
    }

    /// The entry metadata.
    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// The content size announced in the header, `0` for directories.
    pub fn size(&self) -> u64 {
        self.content.as_ref().map_or(0, Content::size)
    }
}

enum State {
    /// Waiting for the next entry of the input sequence.
    Next,
    /// Forwarding the chunks of a sized source.
    Content {
        source: ChunkStream,
        path: String,
        declared: u64,
        forwarded: u64,
    },
    /// The terminator has been queued.
    Finished,
    /// An error has been yielded; nothing else will be.
    Failed,
}

/// Turns a sequence of [`PackEntry`] values into the bytes of a ustar
/// archive.
///
/// The packer is a [`Stream`] of byte chunks: each entry yields its header
/// block, then its content and zero padding up to the next block boundary.
/// Once the entry sequence ends, two zero blocks close the archive.
///
/// If the entry sequence or a content source fails, the error is yielded and
/// the stream ends without a terminator. Chunks already yielded stay valid,
/// so a consumer writing them out is left with a truncated archive.
///
/// ```
/// # fn main() -> Result<(), Box<dyn std::error::Error>> { async_std::task::block_on(async {
/// use async_ustar::{EntryMetadata, PackEntry, Packer};
///
/// let packer = Packer::from_entries(vec![
///     PackEntry::file(EntryMetadata::file("hello.txt"), "Hello, world!"),
///     PackEntry::directory(EntryMetadata::directory("mydir")),
/// ]);
/// let mut archive = Vec::new();
/// packer.write_to(&mut archive).await?;
/// assert_eq!(archive.len(), 2560);
/// # Ok::<(), Box<dyn std::error::Error>>(()) }) }
/// ```
#[pin_project]
pub struct Packer<S> {
    #[pin]
    entries: S,
    queue: VecDeque<Vec<u8>>,
    state: State,
    abort: AbortSignal,
    emitted: u64,
}

/// The entry stream of a [`Packer`] built with [`Packer::from_entries`].
pub type EntryIter<I> = stream::Iter<std::iter::Map<I, fn(PackEntry) -> Result<PackEntry>>>;

impl<S> Packer<S>
where
    S: Stream<Item = Result<PackEntry>>,
{
    /// Create a packer over a lazy sequence of entries.
    pub fn new(entries: S) -> Packer<S> {
        Packer {
            entries,
            queue: VecDeque::new(),
            state: State::Next,
            abort: AbortSignal::new(),
            emitted: 0,
        }
    }

    /// Observe `abort` before every entry and every content chunk.
    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Packer<S> {
        self.abort = abort;
        self
    }

    /// Number of archive bytes yielded so far.
    pub fn bytes_emitted(&self) -> u64 {
        self.emitted
    }

    /// Turn the packer into a byte stream framed by `compression`.
    pub fn compressed(self, compression: Compression) -> ChunkStream
    where
        S: Send + 'static,
    {
        compression.encode(Box::pin(self))
    }

    /// Drain the whole archive into `writer`, returning the number of bytes
    /// written.
    pub async fn write_to<W>(self, writer: &mut W) -> Result<u64>
    where
        W: Write + Unpin + ?Sized,
    {
        let packer = self;
        futures::pin_mut!(packer);
        let mut written = 0;
        while let Some(chunk) = packer.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }
}

impl<I> Packer<EntryIter<I>>
where
    I: Iterator<Item = PackEntry>,
{
    /// Create a packer over entries that are all known up front.
    pub fn from_entries<T>(entries: T) -> Packer<EntryIter<I>>
    where
        T: IntoIterator<Item = PackEntry, IntoIter = I>,
    {
        let ok: fn(PackEntry) -> Result<PackEntry> = Ok;
        Packer::new(stream::iter(entries.into_iter().map(ok)))
    }
}

/// Queue the header of `entry` and, for in-memory content, the content and its
/// padding. Sized sources are returned as the state that forwards them.
fn start_entry(entry: PackEntry, queue: &mut VecDeque<Vec<u8>>) -> Result<Option<State>> {
    let size = entry.size();
    let PackEntry { metadata, content } = entry;
    header::check_encodable(&metadata, size)?;
    queue.push_back(header::encode(&metadata, size).to_vec());
    debug!(target: "tar", "packing {:?} {} ({} bytes)", metadata.kind, metadata.path, size);

    let (source, declared) = match content {
        None => return Ok(None),
        Some(Content::Bytes(data)) => {
            if !data.is_empty() {
                queue.push_back(data);
            }
            queue_padding(queue, size);
            return Ok(None);
        }
        Some(Content::Pull { size, chunks }) => (chunks, size),
        Some(Content::Push { size, receiver }) => (Box::pin(receiver) as ChunkStream, size),
    };
    Ok(Some(State::Content {
        source,
        path: metadata.path,
        declared,
        forwarded: 0,
    }))
}

fn queue_padding(queue: &mut VecDeque<Vec<u8>>, size: u64) {
    let padding = padding_for(size) as usize;
    if padding > 0 {
        queue.push_back(vec![0; padding]);
    }
}

impl<S> Stream for Packer<S>
where
    S: Stream<Item = Result<PackEntry>>,
{
    type Item = io::Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(chunk) = this.queue.pop_front() {
                *this.emitted += chunk.len() as u64;
                return Poll::Ready(Some(Ok(chunk)));
            }

            match this.state {
                State::Finished | State::Failed => return Poll::Ready(None),
                State::Next => {
                    if let Err(err) = this.abort.check() {
                        *this.state = State::Failed;
                        return Poll::Ready(Some(Err(err.into())));
                    }
                    let started = match ready!(this.entries.as_mut().poll_next(cx)) {
                        Some(Ok(entry)) => start_entry(entry, this.queue),
                        Some(Err(err)) => Err(err),
                        None => {
                            debug!(target: "tar", "entries exhausted after {} bytes, writing terminator", this.emitted);
                            this.queue.push_back(vec![0; 2 * BLOCK_SIZE]);
                            *this.state = State::Finished;
                            continue;
                        }
                    };
                    match started {
                        Ok(Some(state)) => *this.state = state,
                        Ok(None) => {}
                        Err(err) => {
                            *this.state = State::Failed;
                            return Poll::Ready(Some(Err(err.into())));
                        }
                    }
                }
                State::Content {
                    source,
                    path,
                    declared,
                    forwarded,
                } => {
                    if let Err(err) = this.abort.check() {
                        *this.state = State::Failed;
                        return Poll::Ready(Some(Err(err.into())));
                    }
                    match ready!(source.as_mut().poll_next(cx)) {
                        Some(Ok(chunk)) => {
                            trace!(target: "tar", "forwarding {} bytes of {}", chunk.len(), path);
                            *forwarded += chunk.len() as u64;
                            if !chunk.is_empty() {
                                this.queue.push_back(chunk);
                            }
                        }
                        Some(Err(err)) => {
                            *this.state = State::Failed;
                            return Poll::Ready(Some(Err(err)));
                        }
                        None => {
                            if *forwarded != *declared {
                                warn!(
                                    target: "tar",
                                    "content of {} declared {} bytes but produced {}; archive is corrupt",
                                    path, declared, forwarded
                                );
                            }
                            queue_padding(this.queue, *declared);
                            *this.state = State::Next;
                        }
                    }
                }
            }
        }
    }
}
