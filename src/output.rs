//! Spooled capture of the child's output channels.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::pipes::Channel;

/// Bytes kept in memory per channel before spilling to a temp file.
pub(crate) const SPILL_THRESHOLD: usize = 1024 * 1024;

/// Two append-only byte stores, one per output channel, with a
/// monotonic append cursor each. Small captures stay in memory; past
/// [`SPILL_THRESHOLD`] the store moves to an anonymous temp file that
/// the OS reclaims on drop. Readers address the stores by absolute
/// offset, so the same bytes can be re-read any number of times.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    stdout: SpoolStore,
    stderr: SpoolStore,
}

impl OutputBuffer {
    pub(crate) fn new() -> Self {
        Self::with_threshold(SPILL_THRESHOLD)
    }

    pub(crate) fn with_threshold(threshold: usize) -> Self {
        OutputBuffer {
            stdout: SpoolStore::new(threshold),
            stderr: SpoolStore::new(threshold),
        }
    }

    pub(crate) fn add(&mut self, channel: Channel, bytes: &[u8]) -> io::Result<()> {
        self.store_mut(channel).append(bytes)
    }

    pub(crate) fn len(&self, channel: Channel) -> u64 {
        self.store(channel).len
    }

    /// All bytes captured so far on `channel`.
    pub(crate) fn bytes(&mut self, channel: Channel) -> io::Result<Vec<u8>> {
        let store = self.store_mut(channel);
        let len = store.len;
        store.read_at(0, len as usize)
    }

    /// Up to `max` bytes starting at the absolute `offset`.
    pub(crate) fn read_at(&mut self, channel: Channel, offset: u64, max: usize) -> io::Result<Vec<u8>> {
        self.store_mut(channel).read_at(offset, max)
    }

    pub(crate) fn clear(&mut self, channel: Channel) {
        self.store_mut(channel).clear();
    }

    fn store(&self, channel: Channel) -> &SpoolStore {
        match channel {
            Channel::Out => &self.stdout,
            Channel::Err => &self.stderr,
        }
    }

    fn store_mut(&mut self, channel: Channel) -> &mut SpoolStore {
        match channel {
            Channel::Out => &mut self.stdout,
            Channel::Err => &mut self.stderr,
        }
    }
}

#[derive(Debug)]
struct SpoolStore {
    mem: Vec<u8>,
    spill: Option<File>,
    len: u64,
    threshold: usize,
}

impl SpoolStore {
    fn new(threshold: usize) -> Self {
        SpoolStore {
            mem: Vec::new(),
            spill: None,
            len: 0,
            threshold,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(file) = self.spill.as_mut() {
            file.seek(SeekFrom::End(0))?;
            file.write_all(bytes)?;
        } else if self.mem.len() + bytes.len() > self.threshold {
            let mut file = tempfile::tempfile()?;
            file.write_all(&self.mem)?;
            file.write_all(bytes)?;
            self.mem = Vec::new();
            self.spill = Some(file);
        } else {
            self.mem.extend_from_slice(bytes);
        }
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, max: usize) -> io::Result<Vec<u8>> {
        if offset >= self.len || max == 0 {
            return Ok(Vec::new());
        }
        let available = usize::try_from(self.len - offset).unwrap_or(usize::MAX);
        let want = available.min(max);
        match self.spill.as_mut() {
            Some(file) => {
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; want];
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            None => {
                let start = offset as usize;
                Ok(self.mem[start..start + want].to_vec())
            }
        }
    }

    fn clear(&mut self) {
        self.mem = Vec::new();
        self.spill = None;
        self.len = 0;
    }
}
