use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{Pid, pipe2, read, write};

/// Sentinel elapsed value: the child was reaped before its timer
/// registration became visible.
pub const ELAPSED_UNKNOWN: i64 = -1;

/// Encoded size of one record on the pipe. Far below the 512-byte POSIX
/// floor for atomic pipe writes, so records can never interleave.
pub const RECORD_SIZE: usize = 16;

const FLAG_BACKGROUND: u8 = 1 << 0;
const FLAG_SIGNALED: u8 = 1 << 1;

/// One job-completion message, reaper to loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub pid: i32,
    pub elapsed_millis: i64,
    pub background: bool,
    pub signaled: bool,
}

impl CompletionRecord {
    /// Fixed layout: pid (i32 LE), elapsed (i64 LE), flag byte, padding.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..12].copy_from_slice(&self.elapsed_millis.to_le_bytes());
        let mut flags = 0u8;
        if self.background {
            flags |= FLAG_BACKGROUND;
        }
        if self.signaled {
            flags |= FLAG_SIGNALED;
        }
        buf[12] = flags;
        buf
    }

    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[..4]);
        let mut elapsed = [0u8; 8];
        elapsed.copy_from_slice(&buf[4..12]);
        Self {
            pid: i32::from_le_bytes(pid),
            elapsed_millis: i64::from_le_bytes(elapsed),
            background: buf[12] & FLAG_BACKGROUND != 0,
            signaled: buf[12] & FLAG_SIGNALED != 0,
        }
    }
}

/// Build the completion pipe. Both ends are non-blocking: the producer
/// must fail fast rather than stall inside a signal handler, and the
/// consumer's drain must never block the prompt. CLOEXEC keeps the fds
/// out of exec'd children.
pub fn channel() -> Result<(CompletionSender, CompletionReceiver)> {
    let (read_end, write_end) =
        pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("completion pipe creation failed")?;
    Ok((
        CompletionSender { fd: write_end },
        CompletionReceiver {
            fd: read_end,
            queued: VecDeque::new(),
            carry: Vec::new(),
        },
    ))
}

/// Producer end. `send` is confined to the async-signal-safe subset: a
/// stack encode and a `write` loop, nothing else.
pub struct CompletionSender {
    fd: OwnedFd,
}

impl CompletionSender {
    pub fn send(&self, record: &CompletionRecord) -> nix::Result<()> {
        let buf = record.encode();
        loop {
            match write(self.fd.as_fd(), &buf) {
                Ok(n) if n == RECORD_SIZE => return Ok(()),
                // Short writes cannot happen below PIPE_BUF on a pipe.
                Ok(_) => return Err(Errno::EIO),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Consumer end: decodes records in arrival order. Reads can split a
/// record across calls even though writes cannot, so a partial tail is
/// carried between reads.
pub struct CompletionReceiver {
    fd: OwnedFd,
    queued: VecDeque<CompletionRecord>,
    carry: Vec<u8>,
}

impl CompletionReceiver {
    /// Pop the next record without blocking. `Ok(None)` means the channel
    /// is currently empty.
    pub fn try_next(&mut self) -> Result<Option<CompletionRecord>> {
        if let Some(record) = self.queued.pop_front() {
            return Ok(Some(record));
        }
        self.fill(false)?;
        Ok(self.queued.pop_front())
    }

    /// Block until a record for `pid` has been queued. Records for other
    /// pids are queued in arrival order, never discarded, so the loop's
    /// next drain still reports them.
    pub fn wait_for(&mut self, pid: Pid) -> Result<()> {
        let raw = pid.as_raw();
        loop {
            if self.queued.iter().any(|record| record.pid == raw) {
                return Ok(());
            }
            self.fill(true)?;
        }
    }

    /// One poll-then-read pass. With `wait` set, blocks until the pipe is
    /// readable, retrying EINTR: SIGCHLD interrupts the poll and is
    /// exactly what makes it readable.
    fn fill(&mut self, wait: bool) -> Result<()> {
        let timeout = if wait {
            PollTimeout::NONE
        } else {
            PollTimeout::ZERO
        };
        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(()),
                Ok(_) => break,
                Err(Errno::EINTR) if wait => continue,
                Err(Errno::EINTR) => return Ok(()),
                Err(err) => return Err(err).context("completion channel poll failed"),
            }
        }
        let mut buf = [0u8; RECORD_SIZE * 16];
        loop {
            // nix 0.29 read still takes a raw fd, unlike its write.
            match read(self.fd.as_raw_fd(), &mut buf) {
                Ok(0) => bail!("completion channel closed"),
                Ok(n) => {
                    self.decode_bytes(&buf[..n]);
                    if n < buf.len() {
                        return Ok(());
                    }
                    // Filled the buffer: more may be pending.
                }
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("completion channel read failed"),
            }
        }
    }

    fn decode_bytes(&mut self, mut bytes: &[u8]) {
        if !self.carry.is_empty() {
            let need = RECORD_SIZE - self.carry.len();
            let grab = need.min(bytes.len());
            self.carry.extend_from_slice(&bytes[..grab]);
            bytes = &bytes[grab..];
            if self.carry.len() == RECORD_SIZE {
                let mut whole = [0u8; RECORD_SIZE];
                whole.copy_from_slice(&self.carry);
                self.queued.push_back(CompletionRecord::decode(&whole));
                self.carry.clear();
            }
        }
        let mut chunks = bytes.chunks_exact(RECORD_SIZE);
        for chunk in &mut chunks {
            let mut whole = [0u8; RECORD_SIZE];
            whole.copy_from_slice(chunk);
            self.queued.push_back(CompletionRecord::decode(&whole));
        }
        self.carry.extend_from_slice(chunks.remainder());
    }
}
