//! An ordered, lazily materialized, optionally open-ended sequence of
//! input chunks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type LazyChunks = Box<dyn Iterator<Item = Result<Option<Chunk>>> + Send>;

/// One element of an input sequence.
///
/// Byte chunks are written as-is; a reader is drained in 8 KiB slices;
/// a nested source, a lazy iterator or a whole supervisor is expanded
/// depth-first, one chunk at a time, only once everything before it has
/// been fully written.
pub enum Chunk {
    Bytes(Vec<u8>),
    Reader(BoxReader),
    Source(InputSource),
    Iter(LazyChunks),
    Process(Box<Supervisor>),
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Chunk::Reader(_) => f.write_str("Reader"),
            Chunk::Source(s) => f.debug_tuple("Source").field(s).finish(),
            Chunk::Iter(_) => f.write_str("Iter"),
            Chunk::Process(_) => f.write_str("Process"),
        }
    }
}

/// Conversion into an input chunk.
///
/// This is the stringify capability of the input layer: scalar values
/// are written in their decimal/text form, byte containers verbatim.
/// `None` converts to nothing at all, so writing an absent value is a
/// no-op.
pub trait IntoChunk {
    fn into_chunk(self) -> Result<Option<Chunk>>;
}

impl IntoChunk for Chunk {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(self))
    }
}

impl IntoChunk for Vec<u8> {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(Chunk::Bytes(self)))
    }
}

impl IntoChunk for &[u8] {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(Chunk::Bytes(self.to_vec())))
    }
}

impl IntoChunk for String {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(Chunk::Bytes(self.into_bytes())))
    }
}

impl IntoChunk for &str {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(Chunk::Bytes(self.as_bytes().to_vec())))
    }
}

impl IntoChunk for InputSource {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(Chunk::Source(self)))
    }
}

impl<T: IntoChunk> IntoChunk for Option<T> {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        match self {
            Some(value) => value.into_chunk(),
            None => Ok(None),
        }
    }
}

macro_rules! stringify_into_chunk {
    ($($ty:ty),* $(,)?) => {$(
        impl IntoChunk for $ty {
            fn into_chunk(self) -> Result<Option<Chunk>> {
                Ok(Some(Chunk::Bytes(self.to_string().into_bytes())))
            }
        }
    )*};
}

stringify_into_chunk!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char,
);

#[derive(Debug, Default)]
struct SourceState {
    queue: VecDeque<Chunk>,
    closed: bool,
}

/// An append-only input sequence shared between the caller and the
/// pump.
///
/// The caller may keep a clone of the handle and append chunks while
/// the child is already consuming earlier ones; `close` seals the
/// sequence, after which exhaustion becomes reachable and the child's
/// stdin will be closed once the last byte has been written.
#[derive(Clone, Default)]
pub struct InputSource {
    inner: Arc<Mutex<SourceState>>,
}

impl InputSource {
    /// A new, open source with no pending chunks.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a value. Fails with the `Logic` kind once the source is
    /// closed; `None` values are accepted and ignored.
    pub fn write(&self, value: impl IntoChunk) -> Result<()> {
        let Some(chunk) = value.into_chunk()? else {
            return Ok(());
        };
        self.push(chunk)
    }

    /// Append a readable byte stream. Ownership transfers to the pump,
    /// which drains and drops it at end of stream.
    pub fn write_reader<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.push(Chunk::Reader(Box::new(reader)))
    }

    /// Append a nested source, expanded in place once reached.
    pub fn write_source(&self, source: InputSource) -> Result<()> {
        self.push(Chunk::Source(source))
    }

    /// Append a lazy sequence of values. Elements are converted one by
    /// one, each only after the previous chunk has been fully written.
    pub fn write_iter<I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: IntoChunk + 'static,
    {
        let lazy: LazyChunks = Box::new(values.into_iter().map(IntoChunk::into_chunk));
        self.push(Chunk::Iter(lazy))
    }

    /// Append a whole supervised process; its standard output becomes
    /// part of this sequence.
    pub fn write_process(&self, process: Supervisor) -> Result<()> {
        self.push(Chunk::Process(Box::new(process)))
    }

    fn push(&self, chunk: Chunk) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::logic(
                "cannot append to an input source that has already been closed",
            ));
        }
        state.queue.push_back(chunk);
        Ok(())
    }

    /// Seal the source. Further writes fail; the pump may now reach
    /// exhaustion.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once the source is sealed and fully consumed. An open
    /// source is never at end, even with nothing pending.
    pub fn at_end(&self) -> bool {
        let state = self.lock();
        state.closed && state.queue.is_empty()
    }

    pub(crate) fn pop(&self) -> Option<Chunk> {
        self.lock().queue.pop_front()
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InputSource")
            .field("pending", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn bytes_of(chunk: Chunk) -> Vec<u8> {
        match chunk {
            Chunk::Bytes(b) => b,
            other => panic!("expected a byte chunk, got {other:?}"),
        }
    }

    #[test]
    fn scalars_are_stringified() {
        let source = InputSource::new();
        source.write("text").unwrap();
        source.write(42u32).unwrap();
        source.write(-7i64).unwrap();
        source.write(1.5f64).unwrap();
        source.close();
        assert_eq!(bytes_of(source.pop().unwrap()), b"text");
        assert_eq!(bytes_of(source.pop().unwrap()), b"42");
        assert_eq!(bytes_of(source.pop().unwrap()), b"-7");
        assert_eq!(bytes_of(source.pop().unwrap()), b"1.5");
        assert!(source.at_end());
    }

    #[test]
    fn absent_writes_are_no_ops() {
        let source = InputSource::new();
        source.write(Option::<&str>::None).unwrap();
        source.close();
        assert!(source.at_end());
    }

    #[test]
    fn writing_to_a_closed_source_fails() {
        let source = InputSource::new();
        source.close();
        let err = source.write("late").unwrap_err();
        assert!(matches!(err, Error::Logic(_)));
    }

    #[test]
    fn open_source_is_not_at_end() {
        let source = InputSource::new();
        assert!(!source.at_end());
        source.write("pending").unwrap();
        source.close();
        assert!(!source.at_end());
        source.pop();
        assert!(source.at_end());
    }

    #[test]
    fn clones_share_state() {
        let source = InputSource::new();
        let writer = source.clone();
        writer.write("shared").unwrap();
        writer.close();
        assert_eq!(bytes_of(source.pop().unwrap()), b"shared");
        assert!(source.is_closed());
    }
}
