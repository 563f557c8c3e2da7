//! Pull-based iteration over a live child's output.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::pipes::{CHUNK_SIZE, Channel};
use crate::supervisor::{State, Supervisor};

/// Behaviour flags for output iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterFlags {
    /// Yield an empty chunk instead of parking when no data has arrived
    /// yet.
    pub non_blocking: bool,
    /// Exclude the stdout channel.
    pub skip_out: bool,
    /// Exclude the stderr channel.
    pub skip_err: bool,
}

/// Iteration cursors and cache, owned by the supervisor so nested
/// consumers (one supervisor feeding another) can install temporary
/// flags and restore them afterwards.
#[derive(Debug, Default)]
pub(crate) struct IterState {
    pub(crate) flags: IterFlags,
    cache: VecDeque<(Channel, Vec<u8>)>,
    out_offset: u64,
    err_offset: u64,
}

impl IterState {
    pub(crate) fn rewind(&mut self) {
        self.cache.clear();
        self.out_offset = 0;
        self.err_offset = 0;
    }

    pub(crate) fn reset_channel(&mut self, channel: Channel) {
        match channel {
            Channel::Out => self.out_offset = 0,
            Channel::Err => self.err_offset = 0,
        }
        self.cache.retain(|(c, _)| *c != channel);
    }
}

impl Supervisor {
    /// Iterate over the child's output as `(channel, chunk)` pairs.
    /// The first pull starts a `Ready` child automatically.
    pub fn iter_output(&mut self, flags: IterFlags) -> OutputIter<'_> {
        self.iter.flags = flags;
        OutputIter { sup: self }
    }

    /// Reset the iteration cache and both read offsets, replaying the
    /// buffered history from the top. The child is not restarted.
    pub fn rewind_output(&mut self) {
        self.iter.rewind();
    }

    /// Install new iteration flags, returning the previous ones so a
    /// nested consumer can restore them when its sub-iteration ends.
    pub(crate) fn set_iter_flags(&mut self, flags: IterFlags) -> IterFlags {
        std::mem::replace(&mut self.iter.flags, flags)
    }

    /// The iteration step shared by the facade and the input pump.
    ///
    /// Cached chunks drain first; then the status is refreshed and each
    /// non-skipped channel is read at its cursor. A terminated child
    /// with an empty cache ends the sequence. In non-blocking mode an
    /// empty pass yields a synthetic empty stdout chunk; otherwise the
    /// pass parks in one blocking status update and tries again.
    pub(crate) fn next_output_chunk(
        &mut self,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Option<(Channel, Vec<u8>)>>> + Send + '_>,
    > {
        Box::pin(async move {
            if !self.config().output_enabled() {
                return Err(Error::logic("Output has been disabled."));
            }
            loop {
                if let Some(item) = self.iter.cache.pop_front() {
                    return Ok(Some(item));
                }
                if self.state() == State::Ready {
                    self.start().await?;
                }
                self.update_status(false).await?;
                self.fill_cache()?;
                if !self.iter.cache.is_empty() {
                    continue;
                }
                if self.state() == State::Terminated {
                    return Ok(None);
                }
                if self.iter.flags.non_blocking {
                    return Ok(Some((Channel::Out, Vec::new())));
                }
                self.check_timeout().await?;
                self.update_status(true).await?;
            }
        })
    }

    fn fill_cache(&mut self) -> Result<()> {
        if !self.iter.flags.skip_out {
            let offset = self.iter.out_offset;
            let data = self.read_output_at(Channel::Out, offset, CHUNK_SIZE)?;
            if !data.is_empty() {
                self.iter.out_offset += data.len() as u64;
                self.iter.cache.push_back((Channel::Out, data));
            }
        }
        if !self.iter.flags.skip_err {
            let offset = self.iter.err_offset;
            let data = self.read_output_at(Channel::Err, offset, CHUNK_SIZE)?;
            if !data.is_empty() {
                self.iter.err_offset += data.len() as u64;
                self.iter.cache.push_back((Channel::Err, data));
            }
        }
        Ok(())
    }
}

/// Borrowing facade over [`Supervisor::next_output_chunk`].
pub struct OutputIter<'a> {
    sup: &'a mut Supervisor,
}

impl OutputIter<'_> {
    /// The next `(channel, chunk)` pair, or `None` once the child has
    /// terminated and the buffered history is fully replayed.
    pub async fn next(&mut self) -> Result<Option<(Channel, Vec<u8>)>> {
        self.sup.next_output_chunk().await
    }

    /// Replay from the top of the buffered history.
    pub fn rewind(&mut self) {
        self.sup.rewind_output();
    }

    pub fn flags(&self) -> IterFlags {
        self.sup.iter.flags
    }

    /// The supervisor driving this iteration.
    pub fn supervisor(&mut self) -> &mut Supervisor {
        self.sup
    }
}
