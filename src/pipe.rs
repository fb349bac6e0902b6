//! Buffered byte pipe between the receive loop and a channel reader.
//!
//! Single producer, single consumer. The producer never blocks; the
//! consumer blocks until bytes arrive, the write side closes, or its read
//! deadline expires. No byte is lost across `close_write`: readers drain
//! the buffer before seeing EOF.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;

/// Pipe errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe closed for writing")]
    Closed,
    #[error("read deadline exceeded")]
    Timeout,
}

#[derive(Debug)]
struct PipeState {
    buf: VecDeque<u8>,
    write_closed: bool,
    read_deadline: Option<Instant>,
}

/// A FIFO byte buffer with half-close signalling and a read deadline.
#[derive(Debug)]
pub struct BufferedPipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl BufferedPipe {
    pub fn new() -> Self {
        BufferedPipe {
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                write_closed: false,
                read_deadline: None,
            }),
            readable: Condvar::new(),
        }
    }

    /// Append bytes and wake readers. Fails once `close_write` has been
    /// called.
    pub fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        let mut st = self.state.lock().unwrap();
        if st.write_closed {
            return Err(PipeError::Closed);
        }
        st.buf.extend(data);
        self.readable.notify_all();
        Ok(data.len())
    }

    /// Block until at least one byte is available, the pipe is closed, or
    /// the read deadline expires. Returns `Ok(0)` only when the pipe is
    /// closed and fully drained.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut st = self.state.lock().unwrap();
        loop {
            if !st.buf.is_empty() {
                return Ok(drain(&mut st.buf, buf));
            }
            if st.write_closed {
                return Ok(0);
            }
            match st.read_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Err(PipeError::Timeout);
                    }
                    let (guard, _) = self.readable.wait_timeout(st, deadline - now).unwrap();
                    st = guard;
                }
                None => st = self.readable.wait(st).unwrap(),
            }
        }
    }

    /// Idempotent. Wakes blocked readers; subsequent writes fail.
    pub fn close_write(&self) {
        let mut st = self.state.lock().unwrap();
        st.write_closed = true;
        self.readable.notify_all();
    }

    /// Absolute deadline for subsequent (and currently blocked) reads.
    /// `None` disables.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut st = self.state.lock().unwrap();
        st.read_deadline = deadline;
        // Wake blocked readers so they re-arm against the new deadline.
        self.readable.notify_all();
    }
}

impl Default for BufferedPipe {
    fn default() -> Self {
        Self::new()
    }
}

fn drain(src: &mut VecDeque<u8>, dst: &mut [u8]) -> usize {
    let (s1, s2) = src.as_slices();
    let n1 = dst.len().min(s1.len());
    dst[..n1].copy_from_slice(&s1[..n1]);

    let n2 = dst.len().saturating_sub(n1).min(s2.len());
    if n2 > 0 {
        dst[n1..n1 + n2].copy_from_slice(&s2[..n2]);
    }

    let total = n1 + n2;
    src.drain(..total);
    total
}
