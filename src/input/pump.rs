//! The stateful adaptor that drains an [`InputSource`] into the child's
//! stdin without ever blocking the multiplexing loop.

use std::future::Future;
use std::io;
use std::pin::Pin;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::iter::IterFlags;
use crate::pipes::{CHUNK_SIZE, Channel};

use super::source::{BoxReader, Chunk, InputSource, LazyChunks};

/// The writable end of the child's stdin, as the pump sees it.
pub(crate) enum StdinSink {
    /// An anonymous pipe straight into the child.
    Pipe(ChildStdin),
    /// A bounded channel drained by the pseudo-terminal writer.
    Channel(mpsc::Sender<Vec<u8>>),
    #[cfg(test)]
    Fixed {
        accepted: Vec<u8>,
        caps: Vec<usize>,
        next: usize,
    },
}

impl StdinSink {
    /// One non-blocking write attempt. `Ok(0)` means the sink would
    /// block; anything accepted is never lost.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            StdinSink::Pipe(pipe) => match pipe.write(data).now_or_never() {
                Some(result) => result,
                None => Ok(0),
            },
            StdinSink::Channel(tx) => match tx.try_send(data.to_vec()) {
                Ok(()) => Ok(data.len()),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(0),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "the stdin writer is gone",
                )),
            },
            #[cfg(test)]
            StdinSink::Fixed { accepted, caps, next } => {
                let cap = if caps.is_empty() {
                    data.len()
                } else {
                    let cap = caps[*next % caps.len()];
                    *next += 1;
                    cap
                };
                let n = data.len().min(cap);
                accepted.extend_from_slice(&data[..n]);
                Ok(n)
            }
        }
    }
}

/// Outcome of one pump tick.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PumpProgress {
    /// `0..` bytes were accepted; more may be pending.
    Wrote(usize),
    /// Nothing writable right now, but the flow is not over.
    Idle,
    /// Every byte has been written and the source is exhausted. The
    /// sink may be closed; reported exactly once.
    EndOfFlow,
}

enum Frame {
    Source(InputSource),
    Iter(LazyChunks),
    Process(ProcessFrame),
}

struct ProcessFrame {
    process: Box<crate::supervisor::Supervisor>,
    saved_flags: IterFlags,
}

struct ActiveReader {
    reader: BoxReader,
    /// Bytes consumed from the reader so far; bookkeeping for short
    /// writes, since the pump owns the reader's cursor.
    consumed: u64,
}

enum RawPull {
    Chunk(Chunk),
    FrameDone,
    RootDone,
}

enum Pull {
    Chunk(Chunk),
    Pending,
    Exhausted,
}

/// Drains the input sequence into a [`StdinSink`], preserving residual
/// bytes across short writes and flattening nested producers
/// depth-first, left to right, lazily.
pub(crate) struct InputPump {
    root: Option<InputSource>,
    stack: Vec<Frame>,
    residual: Vec<u8>,
    residual_pos: usize,
    active: Option<ActiveReader>,
    eof_signaled: bool,
}

impl InputPump {
    pub(crate) fn new(source: Option<InputSource>) -> Self {
        InputPump {
            root: source,
            stack: Vec::new(),
            residual: Vec::new(),
            residual_pos: 0,
            active: None,
            eof_signaled: false,
        }
    }

    /// Residual bytes awaiting a writable sink, if any.
    pub(crate) fn pending(&self) -> Option<&[u8]> {
        (self.residual_pos < self.residual.len()).then(|| &self.residual[self.residual_pos..])
    }

    /// Record that `n` pending bytes were written externally (by the
    /// readiness loop).
    pub(crate) fn consume(&mut self, n: usize) {
        self.residual_pos = (self.residual_pos + n).min(self.residual.len());
        if self.residual_pos >= self.residual.len() {
            self.residual.clear();
            self.residual_pos = 0;
        }
    }

    /// One pump pass: flush the residual, feed from the active reader,
    /// then pull new chunks, until the sink pushes back or the source
    /// runs dry.
    pub(crate) async fn tick(&mut self, sink: &mut StdinSink) -> Result<PumpProgress> {
        let mut wrote = 0usize;
        loop {
            if let Some(pending) = self.pending() {
                let n = sink
                    .try_write(pending)
                    .map_err(|err| Error::runtime_io("failed to write to the child's stdin", err))?;
                if n == 0 {
                    return Ok(PumpProgress::Wrote(wrote));
                }
                self.consume(n);
                wrote += n;
                continue;
            }

            if let Some(active) = self.active.as_mut() {
                let mut buf = vec![0u8; CHUNK_SIZE];
                match active.reader.read(&mut buf).now_or_never() {
                    None => {
                        return Ok(if wrote > 0 {
                            PumpProgress::Wrote(wrote)
                        } else {
                            PumpProgress::Idle
                        });
                    }
                    Some(Ok(0)) => {
                        if let Some(done) = self.active.take() {
                            tracing::trace!(bytes = done.consumed, "input stream drained");
                        }
                        continue;
                    }
                    Some(Ok(n)) => {
                        active.consumed += n as u64;
                        buf.truncate(n);
                        self.residual = buf;
                        self.residual_pos = 0;
                        continue;
                    }
                    Some(Err(err)) if err.kind() == io::ErrorKind::Interrupted => {
                        return Ok(PumpProgress::Idle);
                    }
                    Some(Err(err)) => {
                        return Err(Error::runtime_io("failed to read an input stream", err));
                    }
                }
            }

            match self.pull().await? {
                Pull::Chunk(Chunk::Bytes(bytes)) => {
                    if !bytes.is_empty() {
                        self.residual = bytes;
                        self.residual_pos = 0;
                    }
                }
                Pull::Chunk(Chunk::Reader(reader)) => {
                    self.active = Some(ActiveReader {
                        reader,
                        consumed: 0,
                    });
                }
                Pull::Chunk(_) => unreachable!("containers are expanded by pull()"),
                Pull::Pending => {
                    return Ok(if wrote > 0 {
                        PumpProgress::Wrote(wrote)
                    } else {
                        PumpProgress::Idle
                    });
                }
                Pull::Exhausted => {
                    if self.eof_signaled {
                        return Ok(PumpProgress::Idle);
                    }
                    self.eof_signaled = true;
                    return Ok(PumpProgress::EndOfFlow);
                }
            }
        }
    }

    /// Next leaf chunk in depth-first order. Containers are pushed on
    /// the work stack; a container's next element is only requested
    /// once everything it produced before has been fully written.
    async fn pull(&mut self) -> Result<Pull> {
        loop {
            let raw = match self.stack.last_mut() {
                Some(Frame::Source(source)) => match source.pop() {
                    Some(chunk) => RawPull::Chunk(chunk),
                    None if source.at_end() => RawPull::FrameDone,
                    None => return Ok(Pull::Pending),
                },
                Some(Frame::Iter(iter)) => match iter.next() {
                    Some(Ok(Some(chunk))) => RawPull::Chunk(chunk),
                    Some(Ok(None)) => continue,
                    Some(Err(err)) => return Err(err),
                    None => RawPull::FrameDone,
                },
                Some(Frame::Process(frame)) => {
                    // Boxed to cut the async cycle between the pump and
                    // the nested supervisor's own transfer loop.
                    let next: Pin<
                        Box<dyn Future<Output = Result<Option<(Channel, Vec<u8>)>>> + Send + '_>,
                    > = Box::pin(frame.process.next_output_chunk());
                    match next.await? {
                        Some((_, bytes)) => RawPull::Chunk(Chunk::Bytes(bytes)),
                        None => RawPull::FrameDone,
                    }
                }
                None => match self.root.as_ref() {
                    Some(root) => match root.pop() {
                        Some(chunk) => RawPull::Chunk(chunk),
                        None if root.at_end() => RawPull::RootDone,
                        None => return Ok(Pull::Pending),
                    },
                    None => return Ok(Pull::Exhausted),
                },
            };

            match raw {
                RawPull::Chunk(chunk) => match chunk {
                    leaf @ (Chunk::Bytes(_) | Chunk::Reader(_)) => return Ok(Pull::Chunk(leaf)),
                    Chunk::Source(source) => self.stack.push(Frame::Source(source)),
                    Chunk::Iter(iter) => self.stack.push(Frame::Iter(iter)),
                    Chunk::Process(mut process) => {
                        let saved = process.set_iter_flags(IterFlags {
                            skip_err: true,
                            ..IterFlags::default()
                        });
                        self.stack.push(Frame::Process(ProcessFrame {
                            process,
                            saved_flags: saved,
                        }));
                    }
                },
                RawPull::FrameDone => {
                    if let Some(Frame::Process(mut frame)) = self.stack.pop() {
                        frame.process.set_iter_flags(frame.saved_flags);
                    }
                }
                RawPull::RootDone => {
                    self.root = None;
                }
            }
        }
    }
}
