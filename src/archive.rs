use std::pin::Pin;
use std::sync::Arc;

use async_std::io::Read;
use async_std::path::Path;
use async_std::stream::Stream;
use async_std::sync::Mutex;
use async_std::task::{Context, Poll};
use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{debug, trace};

use crate::cursor::{ByteCursor, ChunkStream};
use crate::entry::{ContentAccessor, Entry};
use crate::error::{Error, Result};
use crate::header::{self, Block, DecodedHeader, HeaderBlock, BLOCK_SIZE};
use crate::{AbortSignal, Compression};

pub(crate) type SharedInner = Arc<Mutex<ArchiveInner>>;

/// A top-level representation of an archive byte stream.
///
/// The archive is read strictly front to back; see [`Archive::entries`].
#[derive(Debug)]
pub struct Archive {
    inner: SharedInner,
    abort: AbortSignal,
    options: UnpackOptions,
}

/// How entries are materialized on disk by [`Entry::unpack_in`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct UnpackOptions {
    pub(crate) preserve_permissions: bool,
    pub(crate) preserve_mtime: bool,
}

/// Reading state shared between the entry stream and the content accessors
/// it hands out.
pub(crate) struct ArchiveInner {
    pub(crate) cursor: ByteCursor,
    pub(crate) current: Option<CurrentFile>,
    next_index: u64,
}

impl std::fmt::Debug for ArchiveInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveInner")
            .field("position", &self.cursor.position())
            .field("current", &self.current)
            .finish()
    }
}

/// The file entry most recently yielded, identified by its position in the
/// sequence of yielded files.
#[derive(Debug)]
pub(crate) struct CurrentFile {
    pub(crate) index: u64,
    pub(crate) size: u64,
    pub(crate) state: ContentState,
}

/// Who owns the content bytes of the current file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContentState {
    /// Nobody has asked for the content yet.
    Unread,
    /// A content stream is draining it; `remaining` bytes are still ahead.
    Streaming { remaining: u64 },
    /// The content and its padding are behind the cursor.
    Consumed,
}

enum Input {
    Reader(Pin<Box<dyn Read + Send>>),
    Chunks(ChunkStream),
}

/// Configure the archive.
pub struct ArchiveBuilder {
    input: Input,
    compression: Compression,
    abort: AbortSignal,
    preserve_permissions: bool,
    preserve_mtime: bool,
}

impl ArchiveBuilder {
    /// Create a new builder reading the archive out of `reader`.
    pub fn new<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        ArchiveBuilder::with_input(Input::Reader(Box::pin(reader)))
    }

    /// Create a new builder reading the archive out of a stream of byte
    /// chunks of any size.
    pub fn from_chunks<S>(chunks: S) -> Self
    where
        S: Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static,
    {
        ArchiveBuilder::with_input(Input::Chunks(Box::pin(chunks)))
    }

    fn with_input(input: Input) -> Self {
        ArchiveBuilder {
            input,
            compression: Compression::None,
            abort: AbortSignal::new(),
            preserve_permissions: false,
            preserve_mtime: true,
        }
    }

    /// Set the framing to strip off the input before it is parsed.
    ///
    /// Defaults to [`Compression::None`].
    pub fn set_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Observe `abort` at every read of the input.
    pub fn set_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Indicate whether extended permissions (like suid on Unix) are preserved
    /// when unpacking entries.
    ///
    /// This flag is disabled by default and is currently only implemented on
    /// Unix.
    pub fn set_preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = preserve;
        self
    }

    /// Indicate whether modification times are preserved when unpacking
    /// entries.
    ///
    /// This flag is enabled by default.
    pub fn set_preserve_mtime(mut self, preserve: bool) -> Self {
        self.preserve_mtime = preserve;
        self
    }

    /// Construct the archive, ready to yield entries.
    pub fn build(self) -> Archive {
        let Self {
            input,
            compression,
            abort,
            preserve_permissions,
            preserve_mtime,
        } = self;

        let source = match input {
            Input::Reader(reader) => compression.decode_reader(reader),
            Input::Chunks(chunks) => compression.decode(chunks),
        };

        Archive {
            inner: Arc::new(Mutex::new(ArchiveInner {
                cursor: ByteCursor::new(source, abort.clone()),
                current: None,
                next_index: 0,
            })),
            abort,
            options: UnpackOptions {
                preserve_permissions,
                preserve_mtime,
            },
        }
    }
}

impl Archive {
    /// Create a new archive with the underlying object as the reader.
    pub fn new<R>(reader: R) -> Archive
    where
        R: Read + Send + 'static,
    {
        ArchiveBuilder::new(reader).build()
    }

    /// Create a new archive over a stream of byte chunks.
    pub fn from_chunks<S>(chunks: S) -> Archive
    where
        S: Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static,
    {
        ArchiveBuilder::from_chunks(chunks).build()
    }

    /// Construct a stream over the entries in this archive.
    ///
    /// Entries come out in archive order. A file entry carries a
    /// [`ContentAccessor`] that stays usable until the stream is polled
    /// again; content that has not been read by then is skipped and can no
    /// longer be read. A content stream must not be drained concurrently
    /// with polling this stream.
    pub fn entries(self) -> Entries {
        Entries {
            inner: self.inner,
            abort: self.abort,
            options: self.options,
            state: EntriesState::Idle,
        }
    }

    /// Unpacks the contents tarball into the specified `dst`.
    ///
    /// This function will iterate over the entire contents of this tarball,
    /// extracting each file in turn to the location specified by the entry's
    /// path name.
    ///
    /// This operation is relatively sensitive in that it will not write files
    /// outside of the path specified by `dst`. Files in the archive which have
    /// a '..' in their path are skipped during the unpacking process.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> { async_std::task::block_on(async {
    /// #
    /// use async_std::fs::File;
    /// use async_ustar::Archive;
    ///
    /// let ar = Archive::new(File::open("foo.tar").await?);
    /// ar.unpack("foo").await?;
    /// #
    /// # Ok(()) }) }
    /// ```
    pub async fn unpack<P: AsRef<Path>>(self, dst: P) -> Result<()> {
        let dst = dst.as_ref();
        let mut entries = self.entries();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if !entry.unpack_in(dst).await? {
                debug!(target: "tar", "skipped unsafe path {}", entry.path());
            }
        }
        Ok(())
    }
}

enum EntriesState {
    Idle,
    Reading(BoxFuture<'static, Result<Option<Entry>>>),
    Done,
}

/// Stream of [`Entry`]s.
///
/// The stream ends after the end-of-archive marker or after the first error.
pub struct Entries {
    inner: SharedInner,
    abort: AbortSignal,
    options: UnpackOptions,
    state: EntriesState,
}

impl Entries {
    /// Read the next entry. Equivalent to `StreamExt::next`, with the error
    /// lifted out of the option.
    pub async fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.next().await.transpose()
    }
}

impl Stream for Entries {
    type Item = Result<Entry>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                EntriesState::Done => return Poll::Ready(None),
                EntriesState::Idle => {
                    let fut = read_entry(this.inner.clone(), this.abort.clone(), this.options);
                    this.state = EntriesState::Reading(Box::pin(fut));
                }
                EntriesState::Reading(fut) => {
                    let res = async_std::task::ready!(fut.as_mut().poll(cx));
                    let (state, item) = match res {
                        Ok(Some(entry)) => (EntriesState::Idle, Some(Ok(entry))),
                        Ok(None) => (EntriesState::Done, None),
                        Err(err) => (EntriesState::Done, Some(Err(err))),
                    };
                    this.state = state;
                    return Poll::Ready(item);
                }
            }
        }
    }
}

/// One step of the iteration: move past whatever is left of the previous
/// file, then read and decode the next header.
async fn read_entry(
    shared: SharedInner,
    abort: AbortSignal,
    options: UnpackOptions,
) -> Result<Option<Entry>> {
    abort.check()?;
    let mut inner = shared.lock().await;
    inner.skip_current().await?;

    let block = match inner.read_block().await? {
        Some(block) => block,
        None => {
            debug!(target: "tar", "archive ended without an end-of-archive marker");
            return Ok(None);
        }
    };

    let DecodedHeader { metadata, size, .. } = match header::decode(&block)? {
        Block::Entry(header) => header,
        Block::Terminator => {
            inner.read_second_terminator().await?;
            debug!(target: "tar", "end of archive at offset {}", inner.cursor.position());
            return Ok(None);
        }
    };
    debug!(target: "tar", "entry {:?} {} ({} bytes)", metadata.kind, metadata.path, size);

    if metadata.kind.is_dir() {
        return Ok(Some(Entry::new(metadata, 0, None, options)));
    }

    let index = inner.next_index;
    inner.next_index += 1;
    inner.current = Some(CurrentFile {
        index,
        size,
        state: ContentState::Unread,
    });
    let accessor = ContentAccessor::new(shared.clone(), index, size);
    Ok(Some(Entry::new(metadata, size, Some(accessor), options)))
}

impl ArchiveInner {
    /// Move the cursor to the end of the current file's padding unless its
    /// content was fully read. Either way the current file can no longer be
    /// read afterwards.
    async fn skip_current(&mut self) -> Result<()> {
        let current = match self.current.take() {
            Some(current) => current,
            None => return Ok(()),
        };
        let remaining = match current.state {
            ContentState::Consumed => return Ok(()),
            ContentState::Unread => current.size,
            ContentState::Streaming { remaining } => remaining,
        };
        debug!(target: "tar", "skipping {} unread content bytes", remaining);
        self.cursor.skip(remaining).await?;
        self.cursor.skip_padding(current.size).await
    }

    /// Read one header block. A partial block is a malformed header, not a
    /// truncated entry.
    async fn read_block(&mut self) -> Result<Option<HeaderBlock>> {
        let bytes = match self.cursor.read_exact(BLOCK_SIZE).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(Error::UnexpectedEndOfStream) => {
                return Err(Error::invalid_format("incomplete header"))
            }
            Err(err) => return Err(err),
        };
        trace!(target: "tar", "header block ending at offset {}", self.cursor.position());
        let block = HeaderBlock::try_from(bytes.as_slice())
            .map_err(|_| Error::invalid_format("incomplete header"))?;
        Ok(Some(block))
    }

    async fn read_second_terminator(&mut self) -> Result<()> {
        match self.cursor.read_exact(BLOCK_SIZE).await {
            Ok(None) => Ok(()),
            Ok(Some(block)) if block.iter().all(|b| *b == 0) => Ok(()),
            Ok(Some(_)) | Err(Error::UnexpectedEndOfStream) => {
                Err(Error::invalid_format("expected terminator block"))
            }
            Err(err) => Err(err),
        }
    }

    /// Hand the content of file `index` over to a reader, moving it to
    /// `next`. Only unread content of the current file can be claimed.
    pub(crate) fn claim(&mut self, index: u64, next: ContentState) -> Result<()> {
        match self.current.as_mut() {
            Some(current) if current.index == index && current.state == ContentState::Unread => {
                current.state = next;
                Ok(())
            }
            _ => Err(Error::ContentAlreadyConsumed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryMetadata, PackEntry, Packer};

    assert_impl_all!(Archive: Send, Sync);
    assert_impl_all!(Entries: Send);
    assert_impl_all!(Entry: Send, Sync);

    async fn archive_of(entries: Vec<PackEntry>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        Packer::from_entries(entries).write_to(&mut out).await?;
        Ok(out)
    }

    #[async_std::test]
    async fn skipped_content_is_released() -> Result<()> {
        let data = archive_of(vec![
            PackEntry::file(EntryMetadata::file("a"), vec![b'a'; 700]),
            PackEntry::file(EntryMetadata::file("b"), "b"),
        ])
        .await?;
        let mut entries = Archive::new(async_std::io::Cursor::new(data)).entries();

        let a = entries.next_entry().await?.unwrap();
        let inner = entries.inner.clone();
        assert_eq!(inner.lock().await.current.as_ref().map(|c| c.index), Some(0));

        let b = entries.next_entry().await?.unwrap();
        assert_eq!(b.path(), "b");
        {
            let guard = inner.lock().await;
            let current = guard.current.as_ref().unwrap();
            assert_eq!((current.index, current.size), (1, 1));
            assert_eq!(current.state, ContentState::Unread);
            assert_eq!(guard.cursor.position(), 512 + 1024 + 512);
        }
        assert!(matches!(
            a.content().unwrap().bytes().await,
            Err(Error::ContentAlreadyConsumed)
        ));
        Ok(())
    }

    #[async_std::test]
    async fn iteration_is_fused_after_errors() -> Result<()> {
        let mut data = archive_of(vec![PackEntry::file(EntryMetadata::file("a"), "a")]).await?;
        data[257] = b'x';
        let mut entries = Archive::new(async_std::io::Cursor::new(data)).entries();
        assert!(matches!(
            entries.next_entry().await,
            Err(Error::InvalidFormat(_))
        ));
        assert!(entries.next_entry().await?.is_none());
        Ok(())
    }

    #[async_std::test]
    async fn garbage_after_first_terminator_block() -> Result<()> {
        let mut data = vec![0u8; BLOCK_SIZE];
        data.extend_from_slice(&[1u8; BLOCK_SIZE]);
        let mut entries = Archive::new(async_std::io::Cursor::new(data)).entries();
        match entries.next_entry().await {
            Err(Error::InvalidFormat(msg)) => assert_eq!(msg, "expected terminator block"),
            other => panic!("unexpected {:?}", other),
        }

        // A lone end block is tolerated.
        let data = vec![0u8; BLOCK_SIZE];
        let mut entries = Archive::new(async_std::io::Cursor::new(data)).entries();
        assert!(entries.next_entry().await?.is_none());
        Ok(())
    }
}
