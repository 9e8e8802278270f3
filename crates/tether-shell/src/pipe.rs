//! In-memory byte pipe for wiring channel streams.
//!
//! Transports that already have `Read`/`Write` endpoints don't need this. It
//! exists for hosts that move bytes between threads themselves, and for
//! tests. The pipe is bounded: a writer blocks while the buffer is full,
//! which pushes back on whatever produces the bytes.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Bytes a pipe buffers before writers block.
pub const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

struct Shared {
    state: Mutex<PipeState>,
    capacity: usize,
    readable: Condvar,
    writable: Condvar,
}

impl Shared {
    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, PipeState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))
    }
}

/// Create a connected reader/writer pair holding up to [`PIPE_CAPACITY`]
/// bytes.
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(PIPE_CAPACITY)
}

/// Like [`pipe`] with an explicit buffer size. A capacity of zero is
/// treated as one byte.
pub fn pipe_with_capacity(capacity: usize) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState::default()),
        capacity: capacity.max(1),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

/// Reading half. Blocks until bytes arrive; EOF once the writer is gone.
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Read whatever arrives within `timeout`. Returns `Ok(0)` on timeout as
    /// well as on EOF; use [`PipeReader::is_closed`] to tell them apart.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let state = self.shared.lock()?;
        let (mut state, _) = self
            .shared
            .readable
            .wait_timeout_while(state, timeout, |s| s.buf.is_empty() && !s.writer_closed)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))?;
        let n = drain_into(&mut state, buf);
        self.shared.writable.notify_all();
        Ok(n)
    }

    /// Bytes written but not yet read.
    pub fn buffered(&self) -> usize {
        self.shared.lock().map(|s| s.buf.len()).unwrap_or(0)
    }

    /// `true` once the writer is dropped and every byte has been read.
    pub fn is_closed(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.writer_closed && s.buf.is_empty())
            .unwrap_or(true)
    }
}

fn drain_into(state: &mut PipeState, buf: &mut [u8]) -> usize {
    let n = buf.len().min(state.buf.len());
    for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
        *dst = src;
    }
    n
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.shared.lock()?;
        let mut state = self
            .shared
            .readable
            .wait_while(state, |s| s.buf.is_empty() && !s.writer_closed)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))?;
        let n = drain_into(&mut state, buf);
        self.shared.writable.notify_all();
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            state.reader_closed = true;
            state.buf.clear();
        }
        self.shared.writable.notify_all();
    }
}

/// Writing half. Blocks while the pipe is full; writes fail with
/// `BrokenPipe` once the reader is gone.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let capacity = self.shared.capacity;
        let state = self.shared.lock()?;
        let mut state = self
            .shared
            .writable
            .wait_while(state, |s| s.buf.len() >= capacity && !s.reader_closed)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))?;
        if state.reader_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"));
        }
        let n = data.len().min(capacity - state.buf.len());
        state.buf.extend(&data[..n]);
        self.shared.readable.notify_all();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            state.writer_closed = true;
        }
        self.shared.readable.notify_all();
    }
}
